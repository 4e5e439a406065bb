//! Batched scattered writes.
//!
//! A gather-writer accumulates encoded frames and hands them to the device in
//! one vectored write once a size or count limit is reached. With both limits
//! at zero every frame is written as it arrives. The first write failure
//! latches: callers poll [`GatherWriter::is_ok`] and stop feeding it.

use bytes::Bytes;
use std::io::{self, IoSlice, Write};

/// A device that accepts vectored writes. The return is the number of bytes
/// consumed, which may be short; the gather-writer loops until everything is
/// on its way.
pub trait GatherDevice: Send {
    fn writev(&mut self, bufs: &[IoSlice<'_>]) -> io::Result<usize>;

    /// Final synchronisation before close (flush, fsync). Default no-op.
    fn done(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl GatherDevice for std::fs::File {
    fn writev(&mut self, bufs: &[IoSlice<'_>]) -> io::Result<usize> {
        self.write_vectored(bufs)
    }

    fn done(&mut self) -> io::Result<()> {
        self.flush()?;
        self.sync_all()
    }
}

impl GatherDevice for std::net::TcpStream {
    fn writev(&mut self, bufs: &[IoSlice<'_>]) -> io::Result<usize> {
        self.write_vectored(bufs)
    }
}

pub struct GatherWriter<D: GatherDevice> {
    device: D,
    size_limit: usize,
    count_limit: usize,
    held: Vec<Bytes>,
    held_bytes: usize,
    ok: bool,
}

impl<D: GatherDevice> GatherWriter<D> {
    pub fn new(device: D) -> Self {
        Self {
            device,
            size_limit: 0,
            count_limit: 0,
            held: Vec::new(),
            held_bytes: 0,
            ok: true,
        }
    }

    pub fn with_size_limit(mut self, limit: usize) -> Self {
        self.size_limit = limit;
        self
    }

    pub fn with_count_limit(mut self, limit: usize) -> Self {
        self.count_limit = limit;
        self
    }

    pub fn is_ok(&self) -> bool {
        self.ok
    }

    pub fn held_count(&self) -> usize {
        self.held.len()
    }

    pub fn held_size(&self) -> usize {
        self.held_bytes
    }

    pub fn device_mut(&mut self) -> &mut D {
        &mut self.device
    }

    fn need_flush(&self) -> bool {
        if self.size_limit == 0 && self.count_limit == 0 {
            return true;
        }
        (self.size_limit > 0 && self.held_bytes >= self.size_limit)
            || (self.count_limit > 0 && self.held.len() >= self.count_limit)
    }

    /// Queue one encoded frame, flushing if a limit is reached.
    pub fn add(&mut self, frame: Bytes) -> bool {
        if !self.ok {
            return false;
        }
        self.held_bytes += frame.len();
        self.held.push(frame);
        if self.need_flush() {
            self.flush();
        }
        self.ok
    }

    /// Write out everything held, looping over short writes.
    pub fn flush(&mut self) {
        if !self.ok || self.held.is_empty() {
            return;
        }

        let mut offset = 0usize; // into the first unwritten buffer
        let mut index = 0usize;
        while index < self.held.len() {
            let mut slices = Vec::with_capacity(self.held.len() - index);
            slices.push(IoSlice::new(&self.held[index][offset..]));
            for buf in &self.held[index + 1..] {
                slices.push(IoSlice::new(buf));
            }

            let written = match self.device.writev(&slices) {
                Ok(0) => {
                    tracing::error!("device accepted no bytes");
                    self.ok = false;
                    break;
                }
                Ok(n) => n,
                Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
                Err(err) => {
                    tracing::error!(error = %err, "gather write failed");
                    self.ok = false;
                    break;
                }
            };

            // Advance through the held buffers by the amount consumed.
            let mut remaining = written;
            while index < self.held.len() {
                let available = self.held[index].len() - offset;
                if remaining < available {
                    offset += remaining;
                    break;
                }
                remaining -= available;
                offset = 0;
                index += 1;
            }
        }

        self.held.clear();
        self.held_bytes = 0;
    }

    /// Flush and synchronise the device. Used on orderly shutdown.
    pub fn finish(&mut self) {
        self.flush();
        if self.ok {
            if let Err(err) = self.device.done() {
                tracing::error!(error = %err, "device sync failed");
                self.ok = false;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    /// Device that records write calls, optionally consuming short.
    #[derive(Clone)]
    struct Recorder {
        written: Arc<Mutex<Vec<u8>>>,
        calls: Arc<Mutex<usize>>,
        short_by: usize,
    }

    impl Recorder {
        fn new(short_by: usize) -> Self {
            Self {
                written: Arc::new(Mutex::new(Vec::new())),
                calls: Arc::new(Mutex::new(0)),
                short_by,
            }
        }

        fn bytes(&self) -> Vec<u8> {
            self.written.lock().unwrap().clone()
        }

        fn calls(&self) -> usize {
            *self.calls.lock().unwrap()
        }
    }

    impl GatherDevice for Recorder {
        fn writev(&mut self, bufs: &[IoSlice<'_>]) -> io::Result<usize> {
            *self.calls.lock().unwrap() += 1;
            let total: usize = bufs.iter().map(|b| b.len()).sum();
            let take = total.saturating_sub(self.short_by).max(1);
            let mut remaining = take;
            let mut sink = self.written.lock().unwrap();
            for buf in bufs {
                let n = remaining.min(buf.len());
                sink.extend_from_slice(&buf[..n]);
                remaining -= n;
                if remaining == 0 {
                    break;
                }
            }
            Ok(take)
        }
    }

    #[test]
    fn count_limit_batches_writes() {
        let device = Recorder::new(0);
        let probe = device.clone();
        let mut writer = GatherWriter::new(device).with_count_limit(3);

        writer.add(Bytes::from_static(b"aa"));
        writer.add(Bytes::from_static(b"bb"));
        assert_eq!(probe.calls(), 0);
        writer.add(Bytes::from_static(b"cc"));
        assert_eq!(probe.calls(), 1);
        assert_eq!(probe.bytes(), b"aabbcc");
    }

    #[test]
    fn size_limit_batches_writes() {
        let device = Recorder::new(0);
        let probe = device.clone();
        let mut writer = GatherWriter::new(device).with_size_limit(4);

        writer.add(Bytes::from_static(b"abc"));
        assert_eq!(probe.calls(), 0);
        writer.add(Bytes::from_static(b"de"));
        assert_eq!(probe.calls(), 1);
        assert_eq!(probe.bytes(), b"abcde");
    }

    #[test]
    fn no_limits_means_write_through() {
        let device = Recorder::new(0);
        let probe = device.clone();
        let mut writer = GatherWriter::new(device);
        writer.add(Bytes::from_static(b"x"));
        writer.add(Bytes::from_static(b"y"));
        assert_eq!(probe.calls(), 2);
        assert_eq!(probe.bytes(), b"xy");
    }

    #[test]
    fn short_writes_lose_nothing() {
        let device = Recorder::new(3);
        let probe = device.clone();
        let mut writer = GatherWriter::new(device).with_count_limit(2);
        writer.add(Bytes::from_static(b"hello "));
        writer.add(Bytes::from_static(b"world"));
        assert_eq!(probe.bytes(), b"hello world");
        assert!(probe.calls() > 1);
        assert!(writer.is_ok());
    }

    struct Broken;
    impl GatherDevice for Broken {
        fn writev(&mut self, _bufs: &[IoSlice<'_>]) -> io::Result<usize> {
            Err(io::Error::new(io::ErrorKind::Other, "gone"))
        }
    }

    #[test]
    fn failure_latches() {
        let mut writer = GatherWriter::new(Broken);
        assert!(!writer.add(Bytes::from_static(b"data")));
        assert!(!writer.is_ok());
        assert!(!writer.add(Bytes::from_static(b"more")));
    }
}
