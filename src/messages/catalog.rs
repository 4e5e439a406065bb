//! Registry of known message types.
//!
//! Maps a wire type key and a type name to the decoder for that message kind.
//! Channels match on type names; the wire carries keys. Built-in types are
//! registered on first use; additional types can be registered at any time
//! before streams are built.

use crate::codec::cdr::Decoder;
use crate::codec::frame::{Preamble, PREAMBLE_SIZE};
use crate::messages::extractions::Extractions;
use crate::messages::header::{Header, NativeMessage};
use crate::messages::video::{BinaryVideo, Video};
use anyhow::{anyhow, Result};
use bytes::Bytes;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, OnceLock};

pub type DecodeFn = fn(&mut Decoder, Header) -> Result<Arc<dyn NativeMessage>>;

/// Description of one registered message type.
#[derive(Clone)]
pub struct MetaType {
    pub key: u16,
    pub name: &'static str,
    pub decode: DecodeFn,
}

struct Catalog {
    by_key: HashMap<u16, MetaType>,
    by_name: HashMap<&'static str, u16>,
}

static CATALOG: OnceLock<Mutex<Catalog>> = OnceLock::new();

fn catalog() -> &'static Mutex<Catalog> {
    CATALOG.get_or_init(|| {
        Mutex::new(Catalog {
            by_key: HashMap::new(),
            by_name: HashMap::new(),
        })
    })
}

fn ensure_builtin() {
    static INITIALIZED: OnceLock<()> = OnceLock::new();
    INITIALIZED.get_or_init(|| {
        register(MetaType {
            key: Video::TYPE_KEY,
            name: Video::TYPE_NAME,
            decode: Video::decode,
        });
        register(MetaType {
            key: BinaryVideo::TYPE_KEY,
            name: BinaryVideo::TYPE_NAME,
            decode: BinaryVideo::decode,
        });
        register(MetaType {
            key: Extractions::TYPE_KEY,
            name: Extractions::TYPE_NAME,
            decode: Extractions::decode,
        });
    });
}

/// Register a message type. Replaces any previous registration with the same
/// key.
pub fn register(meta: MetaType) {
    let mut catalog = catalog().lock().expect("catalog mutex poisoned");
    catalog.by_name.insert(meta.name, meta.key);
    catalog.by_key.insert(meta.key, meta);
}

pub fn lookup_key(key: u16) -> Option<MetaType> {
    ensure_builtin();
    catalog()
        .lock()
        .expect("catalog mutex poisoned")
        .by_key
        .get(&key)
        .cloned()
}

pub fn lookup_name(name: &str) -> Option<MetaType> {
    ensure_builtin();
    let catalog = catalog().lock().expect("catalog mutex poisoned");
    catalog
        .by_name
        .get(name)
        .and_then(|key| catalog.by_key.get(key))
        .cloned()
}

/// Determine whether `name` identifies a registered message type.
pub fn type_exists(name: &str) -> bool {
    lookup_name(name).is_some()
}

/// Decode a complete frame (preamble included) into a native message.
pub fn decode_message(frame: &Bytes) -> Result<Arc<dyn NativeMessage>> {
    let preamble = Preamble::parse(frame)?;
    if preamble.size as usize != frame.len() {
        return Err(anyhow!(
            "frame holds {} bytes but preamble claims {}",
            frame.len(),
            preamble.size
        ));
    }

    let payload = frame.slice(PREAMBLE_SIZE..);
    let mut dec = Decoder::new(payload, preamble.swapped());
    let header = Header::decode(&mut dec)?;
    let meta = lookup_key(header.type_key())
        .ok_or_else(|| anyhow!("unknown message type key {}", header.type_key()))?;
    (meta.decode)(&mut dec, header)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builtin_types_are_registered() {
        assert!(type_exists("Video"));
        assert!(type_exists("BinaryVideo"));
        assert!(type_exists("Extractions"));
        assert!(!type_exists("Tracks"));

        let meta = lookup_name("Video").unwrap();
        assert_eq!(meta.key, Video::TYPE_KEY);
        assert_eq!(lookup_key(meta.key).unwrap().name, "Video");
    }

    #[test]
    fn unknown_key_is_rejected() {
        let video = Video::with_samples("t", 1, 0.0, vec![1]);
        let mut raw = crate::codec::frame::encode_message(&video, None)
            .unwrap()
            .to_vec();
        // Corrupt the type key inside the header: it sits after the two
        // version words and the producer string.
        let key_at = PREAMBLE_SIZE + 2 + 2 + 4 + 1;
        raw[key_at] = 0xEE;
        raw[key_at + 1] = 0xEE;
        assert!(decode_message(&Bytes::from(raw)).is_err());
    }
}
