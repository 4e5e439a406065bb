//! Plot extraction reports.

use crate::codec::cdr::{Decoder, Encoder};
use crate::messages::header::{Header, NativeMessage, Timestamp};
use anyhow::Result;
use std::any::Any;
use std::sync::Arc;

/// One extracted plot: a position estimate in range/azimuth/elevation space
/// stamped with the detection time.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Extraction {
    pub when: Timestamp,
    pub range: f64,
    pub azimuth: f64,
    pub elevation: f64,
}

/// A batch of plots extracted from one scan sector.
#[derive(Debug, Clone)]
pub struct Extractions {
    header: Header,
    entries: Vec<Extraction>,
}

impl Extractions {
    pub const TYPE_KEY: u16 = 3;
    pub const TYPE_NAME: &'static str = "Extractions";

    pub fn new(producer: &str, sequence: u32, entries: Vec<Extraction>) -> Self {
        Self {
            header: Header::new(producer, Self::TYPE_KEY, sequence),
            entries,
        }
    }

    pub fn derived(producer: &str, basis: Arc<dyn NativeMessage>, entries: Vec<Extraction>) -> Self {
        Self {
            header: Header::derived(producer, Self::TYPE_KEY, basis),
            entries,
        }
    }

    pub fn entries(&self) -> &[Extraction] {
        &self.entries
    }

    pub fn decode(dec: &mut Decoder, header: Header) -> Result<Arc<dyn NativeMessage>> {
        let count = dec.get_u32()? as usize;
        let mut entries = Vec::with_capacity(count);
        for _ in 0..count {
            let secs = dec.get_i32()?;
            let micros = dec.get_i32()?;
            entries.push(Extraction {
                when: Timestamp { secs, micros },
                range: dec.get_f64()?,
                azimuth: dec.get_f64()?,
                elevation: dec.get_f64()?,
            });
        }
        Ok(Arc::new(Self { header, entries }))
    }
}

impl NativeMessage for Extractions {
    fn header(&self) -> &Header {
        &self.header
    }

    fn size(&self) -> usize {
        4 + self.entries.len() * (8 + 3 * 8)
    }

    fn encode_payload(&self, enc: &mut Encoder) {
        enc.put_u32(self.entries.len() as u32);
        for entry in &self.entries {
            enc.put_i32(entry.when.secs);
            enc.put_i32(entry.when.micros);
            enc.put_f64(entry.range);
            enc.put_f64(entry.azimuth);
            enc.put_f64(entry.elevation);
        }
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::frame;
    use crate::messages::catalog;

    #[test]
    fn extractions_round_trip() {
        let batch = Extractions::new(
            "extractor",
            8,
            vec![
                Extraction {
                    when: Timestamp { secs: 100, micros: 250 },
                    range: 12_500.0,
                    azimuth: 45.5,
                    elevation: 2.0,
                },
                Extraction {
                    when: Timestamp { secs: 100, micros: 900 },
                    range: 9_000.0,
                    azimuth: 46.0,
                    elevation: 0.0,
                },
            ],
        );

        let encoded = frame::encode_message(&batch, None).unwrap();
        let decoded = catalog::decode_message(&encoded).unwrap();
        let back = decoded.as_any().downcast_ref::<Extractions>().unwrap();
        assert_eq!(back.entries(), batch.entries());
    }
}
