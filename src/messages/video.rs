//! Raw and thresholded radar video messages.
//!
//! A `Video` message is one radial of PRI sample data: the antenna azimuth at
//! which it was collected, the range extent of the samples, and the samples
//! themselves. `BinaryVideo` carries the same geometry with one detection
//! flag per range cell, as produced by a thresholding stage.

use crate::codec::cdr::{Decoder, Encoder};
use crate::messages::header::{Header, NativeMessage};
use anyhow::Result;
use std::any::Any;
use std::sync::Arc;

#[derive(Debug, Clone)]
pub struct Video {
    header: Header,
    azimuth: f64,
    range_min: f64,
    range_factor: f64,
    samples: Vec<i16>,
}

impl Video {
    pub const TYPE_KEY: u16 = 1;
    pub const TYPE_NAME: &'static str = "Video";

    pub fn new(
        producer: &str,
        sequence: u32,
        azimuth: f64,
        range_min: f64,
        range_factor: f64,
        samples: Vec<i16>,
    ) -> Self {
        Self {
            header: Header::new(producer, Self::TYPE_KEY, sequence),
            azimuth,
            range_min,
            range_factor,
            samples,
        }
    }

    pub fn with_samples(producer: &str, sequence: u32, azimuth: f64, samples: Vec<i16>) -> Self {
        Self::new(producer, sequence, azimuth, 0.0, 1.0, samples)
    }

    /// Build a derived message that keeps the geometry of `basis` but carries
    /// new sample values.
    pub fn derived(producer: &str, basis: Arc<dyn NativeMessage>, samples: Vec<i16>) -> Result<Self> {
        let source = basis
            .as_any()
            .downcast_ref::<Video>()
            .ok_or_else(|| anyhow::anyhow!("basis message is not Video"))?;
        let azimuth = source.azimuth;
        let range_min = source.range_min;
        let range_factor = source.range_factor;
        Ok(Self {
            header: Header::derived(producer, Self::TYPE_KEY, basis),
            azimuth,
            range_min,
            range_factor,
            samples,
        })
    }

    pub fn azimuth(&self) -> f64 {
        self.azimuth
    }

    pub fn range_min(&self) -> f64 {
        self.range_min
    }

    pub fn range_factor(&self) -> f64 {
        self.range_factor
    }

    pub fn samples(&self) -> &[i16] {
        &self.samples
    }

    pub fn decode(dec: &mut Decoder, header: Header) -> Result<Arc<dyn NativeMessage>> {
        let azimuth = dec.get_f64()?;
        let range_min = dec.get_f64()?;
        let range_factor = dec.get_f64()?;
        let samples = dec.get_i16_vec()?;
        Ok(Arc::new(Self {
            header,
            azimuth,
            range_min,
            range_factor,
            samples,
        }))
    }
}

impl NativeMessage for Video {
    fn header(&self) -> &Header {
        &self.header
    }

    fn size(&self) -> usize {
        3 * 8 + 4 + self.samples.len() * 2
    }

    fn encode_payload(&self, enc: &mut Encoder) {
        enc.put_f64(self.azimuth);
        enc.put_f64(self.range_min);
        enc.put_f64(self.range_factor);
        enc.put_i16_slice(&self.samples);
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

#[derive(Debug, Clone)]
pub struct BinaryVideo {
    header: Header,
    azimuth: f64,
    range_min: f64,
    range_factor: f64,
    detections: Vec<u8>,
}

impl BinaryVideo {
    pub const TYPE_KEY: u16 = 2;
    pub const TYPE_NAME: &'static str = "BinaryVideo";

    pub fn derived(
        producer: &str,
        basis: Arc<dyn NativeMessage>,
        detections: Vec<u8>,
    ) -> Result<Self> {
        let source = basis
            .as_any()
            .downcast_ref::<Video>()
            .ok_or_else(|| anyhow::anyhow!("basis message is not Video"))?;
        let azimuth = source.azimuth();
        let range_min = source.range_min();
        let range_factor = source.range_factor();
        Ok(Self {
            header: Header::derived(producer, Self::TYPE_KEY, basis),
            azimuth,
            range_min,
            range_factor,
            detections,
        })
    }

    pub fn azimuth(&self) -> f64 {
        self.azimuth
    }

    pub fn detections(&self) -> &[u8] {
        &self.detections
    }

    pub fn decode(dec: &mut Decoder, header: Header) -> Result<Arc<dyn NativeMessage>> {
        let azimuth = dec.get_f64()?;
        let range_min = dec.get_f64()?;
        let range_factor = dec.get_f64()?;
        let detections = dec.get_u8_vec()?;
        Ok(Arc::new(Self {
            header,
            azimuth,
            range_min,
            range_factor,
            detections,
        }))
    }
}

impl NativeMessage for BinaryVideo {
    fn header(&self) -> &Header {
        &self.header
    }

    fn size(&self) -> usize {
        3 * 8 + 4 + self.detections.len()
    }

    fn encode_payload(&self, enc: &mut Encoder) {
        enc.put_f64(self.azimuth);
        enc.put_f64(self.range_min);
        enc.put_f64(self.range_factor);
        enc.put_u8_slice(&self.detections);
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
    fn video_round_trips_through_the_catalog() {
        let video = Video::new("pri-source", 17, 182.5, 150.0, 7.5, vec![4, -9, 0, 32767]);
        let encoded = frame::encode_message(&video, None).unwrap();
        let decoded = catalog::decode_message(&encoded).unwrap();

        let back = decoded.as_any().downcast_ref::<Video>().unwrap();
        assert_eq!(back.header().producer(), "pri-source");
        assert_eq!(back.header().sequence(), 17);
        assert_eq!(back.azimuth(), 182.5);
        assert_eq!(back.range_min(), 150.0);
        assert_eq!(back.range_factor(), 7.5);
        assert_eq!(back.samples(), video.samples());
    }

    #[test]
    fn derived_video_keeps_geometry_and_basis() {
        let source: Arc<dyn NativeMessage> =
            Arc::new(Video::new("src", 3, 90.0, 10.0, 2.0, vec![5, 5]));
        let derived = Video::derived("stage", source.clone(), vec![6, 6]).unwrap();

        assert_eq!(derived.azimuth(), 90.0);
        assert_eq!(derived.header().sequence(), 3);
        let root = derived.header().root_basis().unwrap();
        assert_eq!(root.header().producer(), "src");
    }
}
