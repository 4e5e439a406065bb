//! Length-prefixed message framing.
//!
//! Every encoded message begins with an 8-byte preamble: a magic marker, a
//! byte-order flag, and the total frame size including the preamble itself.
//! Stream transports (file, TCP) concatenate frames back to back; the decoder
//! keeps partial-read state so a short read never drops data, and resyncs
//! byte-by-byte after a corrupt or truncated write. Datagram transports carry
//! exactly one frame per datagram.

use crate::codec::cdr::Encoder;
use crate::core::pool;
use crate::messages::header::{NativeMessage, Timestamp};
use anyhow::{anyhow, Result};
use bytes::{BufMut, Bytes, BytesMut};

pub const MAGIC: u16 = 0xAAAA;
pub const BYTE_ORDER_NETWORK: u16 = 0x0000;
pub const BYTE_ORDER_SWAPPED: u16 = 0xFFFF;
pub const PREAMBLE_SIZE: usize = 8;

/// The fixed frame prefix.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Preamble {
    pub byte_order: u16,
    /// Total frame size, preamble included.
    pub size: u32,
}

impl Preamble {
    pub fn swapped(&self) -> bool {
        self.byte_order == BYTE_ORDER_SWAPPED
    }

    /// Parse a preamble from the first 8 bytes of `raw`.
    pub fn parse(raw: &[u8]) -> Result<Self> {
        if raw.len() < PREAMBLE_SIZE {
            return Err(anyhow!("preamble needs {} bytes", PREAMBLE_SIZE));
        }
        let magic = u16::from_be_bytes([raw[0], raw[1]]);
        if magic != MAGIC {
            return Err(anyhow!("bad frame magic {:#06x}", magic));
        }
        let byte_order = u16::from_be_bytes([raw[2], raw[3]]);
        if byte_order != BYTE_ORDER_NETWORK && byte_order != BYTE_ORDER_SWAPPED {
            return Err(anyhow!("bad byte-order marker {:#06x}", byte_order));
        }
        let mut size = u32::from_be_bytes([raw[4], raw[5], raw[6], raw[7]]);
        if byte_order == BYTE_ORDER_SWAPPED {
            size = size.swap_bytes();
        }
        if (size as usize) < PREAMBLE_SIZE || size as usize > pool::MAX_MESSAGE_SIZE {
            return Err(anyhow!("unreasonable frame size {}", size));
        }
        Ok(Self { byte_order, size })
    }
}

/// Incremental decoder for framed byte streams.
///
/// Feed it whatever the device produced; collect completed frames with
/// [`StreamFramer::next_frame`]. After a magic mismatch the framer discards
/// one byte at a time until a plausible preamble reappears.
pub struct StreamFramer {
    pending: BytesMut,
    /// Total size of the frame currently being assembled, if its preamble has
    /// been parsed.
    needed: Option<usize>,
    resyncing: bool,
    resync_skipped: u64,
}

impl StreamFramer {
    pub fn new() -> Self {
        Self {
            pending: BytesMut::new(),
            needed: None,
            resyncing: false,
            resync_skipped: 0,
        }
    }

    pub fn extend(&mut self, chunk: &[u8]) {
        self.pending.extend_from_slice(chunk);
    }

    /// Bytes discarded while searching for a frame boundary.
    pub fn resync_skipped(&self) -> u64 {
        self.resync_skipped
    }

    /// Extract the next complete frame, if one has been assembled.
    pub fn next_frame(&mut self) -> Option<Bytes> {
        loop {
            if self.needed.is_none() {
                if self.pending.len() < PREAMBLE_SIZE {
                    return None;
                }
                match Preamble::parse(&self.pending) {
                    Ok(preamble) => {
                        if self.resyncing {
                            tracing::warn!(
                                skipped = self.resync_skipped,
                                "stream resynchronised on frame boundary"
                            );
                            self.resyncing = false;
                        }
                        self.needed = Some(preamble.size as usize);
                    }
                    Err(_) => {
                        // Slide one byte and retry until a valid preamble
                        // lines up.
                        if !self.resyncing {
                            tracing::warn!("lost frame sync, scanning for magic");
                            self.resyncing = true;
                        }
                        let _ = self.pending.split_to(1);
                        self.resync_skipped += 1;
                        continue;
                    }
                }
            }

            let needed = self.needed.unwrap();
            if self.pending.len() < needed {
                return None;
            }
            self.needed = None;
            return Some(self.pending.split_to(needed).freeze());
        }
    }
}

impl Default for StreamFramer {
    fn default() -> Self {
        Self::new()
    }
}

/// Validate a datagram as a single complete frame. Inconsistent datagrams are
/// rejected; the caller logs and drops them.
pub fn frame_from_datagram(datagram: &[u8]) -> Result<Bytes> {
    let preamble = Preamble::parse(datagram)?;
    if preamble.size as usize != datagram.len() {
        return Err(anyhow!(
            "datagram holds {} bytes but frame claims {}",
            datagram.len(),
            preamble.size
        ));
    }
    Ok(Bytes::copy_from_slice(datagram))
}

/// Encode a native message into a complete frame, preamble included. When
/// `created` is given it replaces the header's stored creation timestamp.
pub fn encode_message(
    msg: &dyn NativeMessage,
    created: Option<Timestamp>,
) -> Result<Bytes> {
    let estimate = PREAMBLE_SIZE + msg.header().wire_size() + msg.size();
    let mut buf = pool::encode_pool().acquire(estimate)?;

    buf.put_u16(MAGIC);
    buf.put_u16(BYTE_ORDER_NETWORK);
    buf.put_u32(0); // patched below

    {
        let mut enc = Encoder::new(&mut buf);
        match created {
            Some(stamp) => msg.header().encode_with(&mut enc, stamp),
            None => msg.header().encode(&mut enc),
        }
        msg.encode_payload(&mut enc);
    }

    let total = buf.len() as u32;
    buf[4..8].copy_from_slice(&total.to_be_bytes());
    Ok(buf.freeze())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::messages::video::Video;

    fn sample_frame(seq: u32) -> Bytes {
        let video = Video::with_samples("t", seq, 0.0, vec![1, 2, 3]);
        encode_message(&video, None).unwrap()
    }

    #[test]
    fn framer_yields_back_to_back_frames() {
        let a = sample_frame(1);
        let b = sample_frame(2);

        let mut framer = StreamFramer::new();
        framer.extend(&a);
        framer.extend(&b);

        assert_eq!(framer.next_frame().unwrap(), a);
        assert_eq!(framer.next_frame().unwrap(), b);
        assert!(framer.next_frame().is_none());
    }

    #[test]
    fn framer_survives_short_reads() {
        let frame = sample_frame(3);
        let mut framer = StreamFramer::new();
        for chunk in frame.chunks(3) {
            framer.extend(chunk);
        }
        assert_eq!(framer.next_frame().unwrap(), frame);
    }

    #[test]
    fn framer_resyncs_after_garbage() {
        let frame = sample_frame(4);
        let mut framer = StreamFramer::new();
        framer.extend(&[0xDE, 0xAD, 0xBE, 0xEF, 0x00]);
        framer.extend(&frame);

        assert_eq!(framer.next_frame().unwrap(), frame);
        assert_eq!(framer.resync_skipped(), 5);
    }

    #[test]
    fn datagram_must_hold_exactly_one_frame() {
        let frame = sample_frame(5);
        assert!(frame_from_datagram(&frame).is_ok());

        let mut long = frame.to_vec();
        long.push(0);
        assert!(frame_from_datagram(&long).is_err());
        assert!(frame_from_datagram(&frame[..frame.len() - 1]).is_err());
        assert!(frame_from_datagram(&[0x55, 0x55, 0, 0, 0, 0, 0, 8]).is_err());
    }
}
