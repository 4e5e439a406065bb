//! The universal transport unit.
//!
//! An envelope wraps either opaque device bytes, a data message (native
//! object, encoded frame, or both), or a control request. Cloning an envelope
//! is cheap: clones share the underlying byte block and native reference, so
//! fan-out duplicates the envelope but never the payload. The missing
//! representation of a data envelope is produced lazily and cached; the
//! native reference, once installed, is never replaced.

use crate::codec::frame;
use crate::core::control::{ControlMessage, KIND_CONTROL, KIND_DATA, KIND_RAW};
use crate::messages::catalog;
use crate::messages::header::NativeMessage;
use anyhow::{anyhow, Result};
use bytes::Bytes;
use std::sync::{Arc, OnceLock};

#[derive(Debug)]
enum Repr {
    Raw(Bytes),
    Data(DataBlock),
    Control(ControlMessage),
}

#[derive(Debug)]
struct DataBlock {
    native: OnceLock<Arc<dyn NativeMessage>>,
    encoded: OnceLock<Bytes>,
    size: usize,
}

#[derive(Debug, Clone)]
pub struct Envelope {
    inner: Arc<Repr>,
}

impl Envelope {
    /// Wrap an already-encoded frame fetched from a device. The native object
    /// is decoded on first request.
    pub fn wrap_encoded(frame: Bytes) -> Self {
        let size = frame.len();
        let encoded = OnceLock::new();
        let _ = encoded.set(frame);
        Self {
            inner: Arc::new(Repr::Data(DataBlock {
                native: OnceLock::new(),
                encoded,
                size,
            })),
        }
    }

    /// Wrap a native message. The encoded frame is produced on first request.
    pub fn wrap_native(msg: Arc<dyn NativeMessage>) -> Self {
        let size = msg.header().wire_size() + msg.size();
        let native = OnceLock::new();
        let _ = native.set(msg);
        Self {
            inner: Arc::new(Repr::Data(DataBlock {
                native,
                encoded: OnceLock::new(),
                size,
            })),
        }
    }

    /// Wrap opaque bytes from a device whose native type is not decoded here.
    pub fn wrap_raw(bytes: Bytes) -> Self {
        Self {
            inner: Arc::new(Repr::Raw(bytes)),
        }
    }

    pub fn control(msg: ControlMessage) -> Self {
        Self {
            inner: Arc::new(Repr::Control(msg)),
        }
    }

    /// O(1) copy sharing the same bytes and native reference.
    pub fn duplicate(&self) -> Self {
        self.clone()
    }

    pub fn kind_code(&self) -> u32 {
        match &*self.inner {
            Repr::Raw(_) => KIND_RAW,
            Repr::Data(_) => KIND_DATA,
            Repr::Control(msg) => msg.kind_code(),
        }
    }

    pub fn is_raw(&self) -> bool {
        matches!(&*self.inner, Repr::Raw(_))
    }

    pub fn is_data(&self) -> bool {
        matches!(&*self.inner, Repr::Data(_))
    }

    pub fn is_control(&self) -> bool {
        self.kind_code() >= KIND_CONTROL
    }

    pub fn as_control(&self) -> Option<&ControlMessage> {
        match &*self.inner {
            Repr::Control(msg) => Some(msg),
            _ => None,
        }
    }

    /// Bytes this envelope represents: the block length for raw and encoded
    /// envelopes, the native-reported size otherwise.
    pub fn size(&self) -> usize {
        match &*self.inner {
            Repr::Raw(bytes) => bytes.len(),
            Repr::Data(block) => block.size,
            Repr::Control(_) => 0,
        }
    }

    pub fn raw_bytes(&self) -> Option<&Bytes> {
        match &*self.inner {
            Repr::Raw(bytes) => Some(bytes),
            _ => None,
        }
    }

    /// Obtain the encoded frame, serialising the native reference if needed.
    /// The result is cached; repeated calls encode once.
    pub fn encoded(&self) -> Result<Bytes> {
        match &*self.inner {
            Repr::Raw(bytes) => Ok(bytes.clone()),
            Repr::Control(_) => Err(anyhow!("control envelopes have no encoded form")),
            Repr::Data(block) => {
                if let Some(bytes) = block.encoded.get() {
                    return Ok(bytes.clone());
                }
                let native = block
                    .native
                    .get()
                    .expect("data envelope with neither native nor encoded form");
                let bytes = frame::encode_message(native.as_ref(), None)?;
                // A concurrent encode may have won the race; either result is
                // equivalent, keep the stored one.
                let _ = block.encoded.set(bytes);
                Ok(block.encoded.get().expect("encode cache empty").clone())
            }
        }
    }

    /// Obtain the native message, decoding the stored frame if needed.
    pub fn native(&self) -> Result<Arc<dyn NativeMessage>> {
        match &*self.inner {
            Repr::Raw(_) => Err(anyhow!("raw envelopes have no native form")),
            Repr::Control(_) => Err(anyhow!("control envelopes have no native form")),
            Repr::Data(block) => {
                if let Some(native) = block.native.get() {
                    return Ok(native.clone());
                }
                let encoded = block
                    .encoded
                    .get()
                    .expect("data envelope with neither native nor encoded form");
                let native = catalog::decode_message(encoded)?;
                let _ = block.native.set(native);
                Ok(block.native.get().expect("decode cache empty").clone())
            }
        }
    }

    /// Obtain the native message as a concrete type. Fails with a
    /// type-mismatch error when the stored message is something else.
    pub fn native_as<T: NativeMessage + 'static>(&self) -> Result<Arc<dyn NativeMessage>> {
        let native = self.native()?;
        if native.as_any().downcast_ref::<T>().is_none() {
            return Err(anyhow!(
                "message type mismatch: wanted {}",
                std::any::type_name::<T>()
            ));
        }
        Ok(native)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::messages::extractions::Extractions;
    use crate::messages::video::Video;

    fn video_arc(seq: u32) -> Arc<dyn NativeMessage> {
        Arc::new(Video::with_samples("test", seq, 0.0, vec![1, 2, 3]))
    }

    #[test]
    fn native_envelope_encodes_lazily_and_caches() {
        let env = Envelope::wrap_native(video_arc(1));
        assert!(env.is_data());
        assert!(env.size() > 0);

        let first = env.encoded().unwrap();
        let second = env.encoded().unwrap();
        // Cached: same underlying block, not a re-encode.
        assert_eq!(first.as_ptr(), second.as_ptr());
    }

    #[test]
    fn encoded_envelope_decodes_lazily() {
        let frame = frame::encode_message(video_arc(7).as_ref(), None).unwrap();
        let env = Envelope::wrap_encoded(frame.clone());
        assert_eq!(env.size(), frame.len());

        let native = env.native().unwrap();
        assert_eq!(native.header().sequence(), 7);
        // Second access returns the cached decode.
        let again = env.native().unwrap();
        assert!(Arc::ptr_eq(&native, &again));
    }

    #[test]
    fn duplicates_share_payload() {
        let env = Envelope::wrap_native(video_arc(3));
        let dup = env.duplicate();
        let a = env.encoded().unwrap();
        let b = dup.encoded().unwrap();
        assert_eq!(a.as_ptr(), b.as_ptr());
    }

    #[test]
    fn typed_access_checks_the_stored_type() {
        let env = Envelope::wrap_native(video_arc(4));
        assert!(env.native_as::<Video>().is_ok());
        assert!(env.native_as::<Extractions>().is_err());
    }

    #[test]
    fn raw_envelopes_refuse_native_access() {
        let env = Envelope::wrap_raw(Bytes::from_static(&[1, 2, 3]));
        assert!(env.is_raw());
        assert_eq!(env.size(), 3);
        assert!(env.native().is_err());
        assert_eq!(env.encoded().unwrap(), Bytes::from_static(&[1, 2, 3]));
    }

    #[test]
    fn classification_codes() {
        let data = Envelope::wrap_native(video_arc(5));
        let raw = Envelope::wrap_raw(Bytes::new());
        let ctrl = Envelope::control(ControlMessage::Shutdown);

        assert_eq!(data.kind_code(), KIND_DATA);
        assert_eq!(raw.kind_code(), KIND_RAW);
        assert!(ctrl.is_control());
        assert_eq!(ctrl.kind_code() - KIND_CONTROL, 3);
        assert!(!data.is_control());
        assert!(!raw.is_control());
    }
}
