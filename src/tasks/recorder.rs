//! Recording writers.
//!
//! A controller that has been told to record allocates one recorder per
//! output channel. Each recorder owns its file, its queue, and a dedicated
//! writer thread; stopping it drains the queue, flushes the gather-writer,
//! and syncs the file. A recording path that already exists is an error:
//! recordings are never overwritten, and there is no retry.

use crate::core::envelope::Envelope;
use crate::io::gather::GatherWriter;
use anyhow::{Context, Result};
use std::fs::OpenOptions;
use std::path::PathBuf;

const RECORD_BATCH_BYTES: usize = 32 * 1024;

enum RecorderItem {
    Envelope(Envelope),
    Stop,
}

pub struct Recorder {
    tx: flume::Sender<RecorderItem>,
    thread: Option<std::thread::JoinHandle<()>>,
    path: PathBuf,
}

impl Recorder {
    /// Open the recording file and start the writer thread.
    pub fn start(owner: &str, path: PathBuf) -> Result<Self> {
        let file = OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&path)
            .with_context(|| format!("opening recording file {}", path.display()))?;

        let (tx, rx) = flume::unbounded();
        let thread_name = format!("{owner}-recorder");
        let thread = std::thread::Builder::new()
            .name(thread_name)
            .spawn(move || record_loop(rx, file))
            .context("spawning recorder thread")?;

        tracing::info!(owner, path = %path.display(), "recording started");
        Ok(Self {
            tx,
            thread: Some(thread),
            path,
        })
    }

    pub fn path(&self) -> &PathBuf {
        &self.path
    }

    pub fn put(&self, envelope: Envelope) -> bool {
        self.tx.send(RecorderItem::Envelope(envelope)).is_ok()
    }

    pub fn queue_len(&self) -> usize {
        self.tx.len()
    }

    /// Drain, flush, sync, and join the writer thread.
    pub fn stop(&mut self) {
        let _ = self.tx.send(RecorderItem::Stop);
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                tracing::error!(path = %self.path.display(), "recorder thread panicked");
            }
        }
    }
}

impl Drop for Recorder {
    fn drop(&mut self) {
        if self.thread.is_some() {
            self.stop();
        }
    }
}

fn record_loop(rx: flume::Receiver<RecorderItem>, file: std::fs::File) {
    let mut writer = GatherWriter::new(file).with_size_limit(RECORD_BATCH_BYTES);

    while let Ok(item) = rx.recv() {
        match item {
            RecorderItem::Envelope(envelope) => match envelope.encoded() {
                Ok(frame) => {
                    if !writer.add(frame) {
                        // Probably out of space; stop consuming so the
                        // producer notices.
                        break;
                    }
                }
                Err(err) => tracing::error!(error = %err, "cannot encode for recording"),
            },
            RecorderItem::Stop => break,
        }
    }

    if writer.is_ok() {
        // Stop raced with in-flight puts; write out whatever is left.
        while let Ok(RecorderItem::Envelope(envelope)) = rx.try_recv() {
            if let Ok(frame) = envelope.encoded() {
                writer.add(frame);
            }
        }
        writer.finish();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::messages::catalog;
    use crate::messages::video::Video;
    use std::sync::Arc;

    fn scratch_path(tag: &str) -> PathBuf {
        std::env::temp_dir().join(format!("{}-{}.pri", tag, uuid::Uuid::new_v4()))
    }

    #[test]
    fn records_envelopes_and_flushes_on_stop() {
        let path = scratch_path("recorder");
        let mut recorder = Recorder::start("test", path.clone()).unwrap();

        for seq in 1..=5u32 {
            let video = Arc::new(Video::with_samples("rec", seq, 0.0, vec![seq as i16]));
            assert!(recorder.put(Envelope::wrap_native(video)));
        }
        recorder.stop();

        let raw = std::fs::read(&path).unwrap();
        let mut framer = crate::codec::frame::StreamFramer::new();
        framer.extend(&raw);
        let mut sequences = Vec::new();
        while let Some(frame) = framer.next_frame() {
            sequences.push(catalog::decode_message(&frame).unwrap().header().sequence());
        }
        assert_eq!(sequences, vec![1, 2, 3, 4, 5]);
        std::fs::remove_file(&path).ok();
    }

    #[test]
    fn existing_file_is_an_error() {
        let path = scratch_path("collision");
        std::fs::write(&path, b"already here").unwrap();
        assert!(Recorder::start("test", path.clone()).is_err());
        std::fs::remove_file(&path).ok();
    }
}
