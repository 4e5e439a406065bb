//! Primitive encode/decode for the common data representation.
//!
//! All multi-byte values are written in network (big-endian) order. A decoder
//! honours the byte-order marker found in the frame preamble and swaps on the
//! fly when the producer wrote host-swapped data. Strings are a `u32` length
//! followed by that many bytes of UTF-8.

use anyhow::{anyhow, Result};
use bytes::{BufMut, Bytes, BytesMut};

/// Serialises primitives into a caller-supplied buffer.
pub struct Encoder<'a> {
    buf: &'a mut BytesMut,
}

impl<'a> Encoder<'a> {
    pub fn new(buf: &'a mut BytesMut) -> Self {
        Self { buf }
    }

    pub fn put_u16(&mut self, value: u16) {
        self.buf.put_u16(value);
    }

    pub fn put_u32(&mut self, value: u32) {
        self.buf.put_u32(value);
    }

    pub fn put_i16(&mut self, value: i16) {
        self.buf.put_i16(value);
    }

    pub fn put_i32(&mut self, value: i32) {
        self.buf.put_i32(value);
    }

    pub fn put_f64(&mut self, value: f64) {
        self.buf.put_f64(value);
    }

    pub fn put_u8(&mut self, value: u8) {
        self.buf.put_u8(value);
    }

    pub fn put_string(&mut self, value: &str) {
        self.buf.put_u32(value.len() as u32);
        self.buf.put_slice(value.as_bytes());
    }

    pub fn put_i16_slice(&mut self, values: &[i16]) {
        self.buf.put_u32(values.len() as u32);
        for v in values {
            self.buf.put_i16(*v);
        }
    }

    pub fn put_u8_slice(&mut self, values: &[u8]) {
        self.buf.put_u32(values.len() as u32);
        self.buf.put_slice(values);
    }
}

/// Reads primitives back out of a frame payload.
pub struct Decoder {
    data: Bytes,
    pos: usize,
    swapped: bool,
}

impl Decoder {
    /// Create a decoder over `data`. When `swapped` is true the producer wrote
    /// host-swapped values and every read reverses the byte order.
    pub fn new(data: Bytes, swapped: bool) -> Self {
        Self {
            data,
            pos: 0,
            swapped,
        }
    }

    pub fn remaining(&self) -> usize {
        self.data.len() - self.pos
    }

    fn take(&mut self, count: usize) -> Result<&[u8]> {
        if self.remaining() < count {
            return Err(anyhow!(
                "truncated message: wanted {} bytes, {} remain",
                count,
                self.remaining()
            ));
        }
        let slice = &self.data[self.pos..self.pos + count];
        self.pos += count;
        Ok(slice)
    }

    pub fn get_u16(&mut self) -> Result<u16> {
        let raw: [u8; 2] = self.take(2)?.try_into().unwrap();
        let v = u16::from_be_bytes(raw);
        Ok(if self.swapped { v.swap_bytes() } else { v })
    }

    pub fn get_u32(&mut self) -> Result<u32> {
        let raw: [u8; 4] = self.take(4)?.try_into().unwrap();
        let v = u32::from_be_bytes(raw);
        Ok(if self.swapped { v.swap_bytes() } else { v })
    }

    pub fn get_i16(&mut self) -> Result<i16> {
        Ok(self.get_u16()? as i16)
    }

    pub fn get_i32(&mut self) -> Result<i32> {
        Ok(self.get_u32()? as i32)
    }

    pub fn get_u8(&mut self) -> Result<u8> {
        Ok(self.take(1)?[0])
    }

    pub fn get_f64(&mut self) -> Result<f64> {
        let raw: [u8; 8] = self.take(8)?.try_into().unwrap();
        let bits = u64::from_be_bytes(raw);
        let bits = if self.swapped { bits.swap_bytes() } else { bits };
        Ok(f64::from_bits(bits))
    }

    pub fn get_string(&mut self) -> Result<String> {
        let len = self.get_u32()? as usize;
        let raw = self.take(len)?;
        Ok(String::from_utf8(raw.to_vec())
            .map_err(|_| anyhow!("string field is not valid UTF-8"))?)
    }

    pub fn get_i16_vec(&mut self) -> Result<Vec<i16>> {
        let len = self.get_u32()? as usize;
        if len * 2 > self.remaining() {
            return Err(anyhow!("sample vector length {} exceeds payload", len));
        }
        let mut out = Vec::with_capacity(len);
        for _ in 0..len {
            out.push(self.get_i16()?);
        }
        Ok(out)
    }

    pub fn get_u8_vec(&mut self) -> Result<Vec<u8>> {
        let len = self.get_u32()? as usize;
        Ok(self.take(len)?.to_vec())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn primitives_round_trip() {
        let mut buf = BytesMut::new();
        let mut enc = Encoder::new(&mut buf);
        enc.put_u16(0xAA55);
        enc.put_u32(123_456_789);
        enc.put_i32(-42);
        enc.put_f64(359.75);
        enc.put_string("radar-a");
        enc.put_i16_slice(&[1, -2, 3]);

        let mut dec = Decoder::new(buf.freeze(), false);
        assert_eq!(dec.get_u16().unwrap(), 0xAA55);
        assert_eq!(dec.get_u32().unwrap(), 123_456_789);
        assert_eq!(dec.get_i32().unwrap(), -42);
        assert_eq!(dec.get_f64().unwrap(), 359.75);
        assert_eq!(dec.get_string().unwrap(), "radar-a");
        assert_eq!(dec.get_i16_vec().unwrap(), vec![1, -2, 3]);
        assert_eq!(dec.remaining(), 0);
    }

    #[test]
    fn swapped_decoding_reverses_values() {
        let mut buf = BytesMut::new();
        // 0x1234 written little-endian by a swapped producer looks like
        // big-endian 0x3412 on the wire.
        buf.put_u16(0x3412);
        let mut dec = Decoder::new(buf.freeze(), true);
        assert_eq!(dec.get_u16().unwrap(), 0x1234);
    }

    #[test]
    fn truncated_reads_error() {
        let mut dec = Decoder::new(Bytes::from_static(&[0, 0, 0]), false);
        assert!(dec.get_u32().is_err());
    }
}
