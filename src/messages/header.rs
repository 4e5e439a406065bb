//! Common header carried by every native message.

use crate::codec::cdr::{Decoder, Encoder};
use anyhow::Result;
use serde::Serialize;
use std::any::Any;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};
use uuid::Uuid;

/// Wire header version.
pub const HEADER_VERSION: u16 = 1;
/// Version of the producer/sequence identity block.
pub const GUID_VERSION: u16 = 2;

/// Second/microsecond timestamp, as stored on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
pub struct Timestamp {
    pub secs: i32,
    pub micros: i32,
}

impl Timestamp {
    pub fn now() -> Self {
        let since = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default();
        Self {
            secs: since.as_secs() as i32,
            micros: since.subsec_micros() as i32,
        }
    }

    pub const fn zero() -> Self {
        Self { secs: 0, micros: 0 }
    }
}

/// Metadata common to all decoded messages: who produced it, where it sits in
/// the producer's sequence, what type it is, and when it came to be. The
/// `basis` link points at the upstream message this one was derived from and
/// is used for timestamp lineage; derivation only ever points upstream, so
/// chains are acyclic and end at an acquisition message.
#[derive(Debug, Clone)]
pub struct Header {
    producer: String,
    guid: Uuid,
    sequence: u32,
    type_key: u16,
    representation: String,
    created: Timestamp,
    emitted: Timestamp,
    basis: Option<Arc<dyn NativeMessage>>,
}

impl Header {
    pub fn new(producer: &str, type_key: u16, sequence: u32) -> Self {
        Self {
            producer: producer.to_string(),
            guid: Uuid::new_v4(),
            sequence,
            type_key,
            representation: String::new(),
            created: Timestamp::now(),
            emitted: Timestamp::zero(),
            basis: None,
        }
    }

    /// Header for a message derived from `basis`.
    pub fn derived(producer: &str, type_key: u16, basis: Arc<dyn NativeMessage>) -> Self {
        let sequence = basis.header().sequence;
        let mut header = Self::new(producer, type_key, sequence);
        header.basis = Some(basis);
        header
    }

    pub fn producer(&self) -> &str {
        &self.producer
    }

    pub fn guid(&self) -> Uuid {
        self.guid
    }

    pub fn sequence(&self) -> u32 {
        self.sequence
    }

    pub fn type_key(&self) -> u16 {
        self.type_key
    }

    pub fn created(&self) -> Timestamp {
        self.created
    }

    pub fn emitted(&self) -> Timestamp {
        self.emitted
    }

    pub fn set_emitted(&mut self, when: Timestamp) {
        self.emitted = when;
    }

    pub fn basis(&self) -> Option<&Arc<dyn NativeMessage>> {
        self.basis.as_ref()
    }

    /// Walk the basis chain to its deepest entry.
    pub fn root_basis(&self) -> Option<Arc<dyn NativeMessage>> {
        let mut current = self.basis.clone()?;
        while let Some(next) = current.header().basis().cloned() {
            current = next;
        }
        Some(current)
    }

    /// Number of bytes the header itself occupies on the wire.
    pub fn wire_size(&self) -> usize {
        // versions + strings (u32 length prefix each) + key + sequence + stamp
        2 + 2 + 4 + self.producer.len() + 2 + 4 + 4 + self.representation.len() + 4 + 4
    }

    /// Encode with the header's own creation timestamp.
    pub fn encode(&self, enc: &mut Encoder) {
        self.encode_with(enc, self.created);
    }

    /// Encode, substituting `created` for the stored creation timestamp. Used
    /// by writers configured to stamp output with source time.
    pub fn encode_with(&self, enc: &mut Encoder, created: Timestamp) {
        enc.put_u16(HEADER_VERSION);
        enc.put_u16(GUID_VERSION);
        enc.put_string(&self.producer);
        enc.put_u16(self.type_key);
        enc.put_u32(self.sequence);
        enc.put_string(&self.representation);
        enc.put_i32(created.secs);
        enc.put_i32(created.micros);
    }

    pub fn decode(dec: &mut Decoder) -> Result<Self> {
        let version = dec.get_u16()?;
        if version != HEADER_VERSION {
            anyhow::bail!("unsupported header version {}", version);
        }
        let guid_version = dec.get_u16()?;
        if guid_version != GUID_VERSION {
            anyhow::bail!("unsupported guid version {}", guid_version);
        }
        let producer = dec.get_string()?;
        let type_key = dec.get_u16()?;
        let sequence = dec.get_u32()?;
        let representation = dec.get_string()?;
        let secs = dec.get_i32()?;
        let micros = dec.get_i32()?;
        Ok(Self {
            producer,
            guid: Uuid::new_v4(),
            sequence,
            type_key,
            representation,
            created: Timestamp { secs, micros },
            emitted: Timestamp::zero(),
            basis: None,
        })
    }
}

/// A decoded message. Implementations pair a [`Header`] with type-specific
/// payload fields and know how to put those fields back on the wire.
pub trait NativeMessage: Send + Sync + std::fmt::Debug {
    fn header(&self) -> &Header;

    /// Byte count reported to channel statistics.
    fn size(&self) -> usize;

    fn encode_payload(&self, enc: &mut Encoder);

    fn as_any(&self) -> &dyn Any;
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::BytesMut;

    #[test]
    fn header_round_trips() {
        let header = Header::new("segmenter", 7, 42);
        let mut buf = BytesMut::new();
        header.encode(&mut Encoder::new(&mut buf));

        let mut dec = Decoder::new(buf.freeze(), false);
        let back = Header::decode(&mut dec).unwrap();
        assert_eq!(back.producer(), "segmenter");
        assert_eq!(back.type_key(), 7);
        assert_eq!(back.sequence(), 42);
        assert_eq!(back.created(), header.created());
    }

    #[test]
    fn root_basis_walks_the_chain() {
        #[derive(Debug)]
        struct Probe(Header);
        impl NativeMessage for Probe {
            fn header(&self) -> &Header {
                &self.0
            }
            fn size(&self) -> usize {
                0
            }
            fn encode_payload(&self, _enc: &mut Encoder) {}
            fn as_any(&self) -> &dyn Any {
                self
            }
        }

        let source: Arc<dyn NativeMessage> = Arc::new(Probe(Header::new("source", 1, 9)));
        let middle: Arc<dyn NativeMessage> =
            Arc::new(Probe(Header::derived("middle", 1, source.clone())));
        let tail = Probe(Header::derived("tail", 1, middle));

        let root = tail.0.root_basis().unwrap();
        assert_eq!(root.header().producer(), "source");
        assert_eq!(root.header().sequence(), 9);
    }
}
