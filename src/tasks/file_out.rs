//! File writer task.
//!
//! Consumes data envelopes on a dedicated thread and appends their encoded
//! frames to a file through the gather-writer. Optionally rewrites each
//! message's creation timestamp to that of the deepest basis message, so
//! recordings made downstream of a processing chain stay aligned with
//! source time.

use crate::core::envelope::Envelope;
use crate::core::task::{TaskCore, TaskUnit};
use crate::io::gather::GatherWriter;
use crate::messages::catalog;
use crate::codec::frame;
use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use std::fs::OpenOptions;
use std::path::PathBuf;

const WRITE_BATCH_BYTES: usize = 32 * 1024;

pub struct FileOutTask {
    core: TaskCore,
    path: PathBuf,
    type_key: u16,
    acquire_basis_timestamps: bool,
    writer: Option<GatherWriter<std::fs::File>>,
}

impl FileOutTask {
    pub fn new(
        name: &str,
        path: PathBuf,
        type_name: &str,
        acquire_basis_timestamps: bool,
    ) -> Result<Self> {
        let meta = catalog::lookup_name(type_name)
            .with_context(|| format!("unknown message type '{type_name}'"))?;
        let mut core = TaskCore::new(name, true);
        core.pin_always_using_data();
        Ok(Self {
            core,
            path,
            type_key: meta.key,
            acquire_basis_timestamps,
            writer: None,
        })
    }
}

#[async_trait]
impl TaskUnit for FileOutTask {
    fn core(&self) -> &TaskCore {
        &self.core
    }

    fn core_mut(&mut self) -> &mut TaskCore {
        &mut self.core
    }

    fn dedicated_thread(&self) -> bool {
        true
    }

    async fn start(&mut self) -> Result<()> {
        let file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(&self.path)
            .with_context(|| format!("opening {}", self.path.display()))?;
        tracing::info!(task = %self.core.name(), path = %self.path.display(), "opened output file");
        self.writer = Some(GatherWriter::new(file).with_size_limit(WRITE_BATCH_BYTES));
        Ok(())
    }

    fn deliver_data(&mut self, envelope: Envelope, _slot: usize) -> Result<()> {
        let Some(writer) = self.writer.as_mut() else {
            bail!("output file is not open");
        };
        if !writer.is_ok() {
            bail!("writer already failed");
        }

        let native = envelope.native()?;
        if native.header().type_key() != self.type_key {
            // A wrongly-typed message in the queue means mis-wired channels;
            // that is a construction bug, not a runtime condition.
            panic!(
                "message type {} in queue for writer expecting {}",
                native.header().type_key(),
                self.type_key
            );
        }

        let frame = if self.acquire_basis_timestamps {
            match native.header().root_basis() {
                Some(root) => {
                    frame::encode_message(native.as_ref(), Some(root.header().created()))?
                }
                None => {
                    tracing::warn!(task = %self.core.name(), "no message basis");
                    envelope.encoded()?
                }
            }
        } else {
            envelope.encoded()?
        };

        if !writer.add(frame) {
            self.core.shared.deactivate();
            bail!("gather write failed");
        }
        Ok(())
    }

    fn handle_close(&mut self) {
        if let Some(writer) = self.writer.as_mut() {
            writer.finish();
            if !writer.is_ok() {
                self.core.shared.set_error_text("Failed to flush output file", false);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::state::ProcessingState;
    use crate::core::task::{self, QueueItem};
    use crate::messages::header::{NativeMessage, Timestamp};
    use crate::messages::video::Video;
    use std::sync::Arc;

    fn scratch_path() -> PathBuf {
        std::env::temp_dir().join(format!("fileout-{}.pri", uuid::Uuid::new_v4()))
    }

    fn read_back(path: &PathBuf) -> Vec<Arc<dyn NativeMessage>> {
        let raw = std::fs::read(path).unwrap();
        let mut framer = crate::codec::frame::StreamFramer::new();
        framer.extend(&raw);
        let mut out = Vec::new();
        while let Some(frame) = framer.next_frame() {
            out.push(catalog::decode_message(&frame).unwrap());
        }
        out
    }

    #[tokio::test]
    async fn writes_queued_messages_in_order() {
        let path = scratch_path();
        let mut unit = FileOutTask::new("fileout", path.clone(), "Video", false).unwrap();
        unit.start().await.unwrap();
        task::enter_processing_state(&mut unit, ProcessingState::Run);

        for seq in 1..=4u32 {
            let video = Arc::new(Video::with_samples("w", seq, 0.0, vec![seq as i16]));
            task::dispatch(
                &mut unit,
                QueueItem::Envelope {
                    envelope: Envelope::wrap_native(video),
                    slot: 0,
                },
            );
        }
        unit.handle_close();

        let messages = read_back(&path);
        let sequences: Vec<u32> = messages.iter().map(|m| m.header().sequence()).collect();
        assert_eq!(sequences, vec![1, 2, 3, 4]);
        std::fs::remove_file(&path).ok();
    }

    #[tokio::test]
    async fn basis_timestamps_replace_creation_time() {
        let path = scratch_path();
        let mut unit = FileOutTask::new("fileout", path.clone(), "Video", true).unwrap();
        unit.start().await.unwrap();
        task::enter_processing_state(&mut unit, ProcessingState::Run);

        // The source message is older than the derived one.
        let mut source = Video::with_samples("src", 1, 0.0, vec![1]);
        let old = Timestamp { secs: 1000, micros: 42 };
        // Headers stamp creation at construction; rebuild with a known time
        // by encoding and decoding through the wire.
        let frame = frame::encode_message(&source, Some(old)).unwrap();
        let source_arc = catalog::decode_message(&frame).unwrap();
        assert_eq!(source_arc.header().created(), old);
        source = Video::derived("stage", source_arc, vec![9]).unwrap();

        task::dispatch(
            &mut unit,
            QueueItem::Envelope {
                envelope: Envelope::wrap_native(Arc::new(source)),
                slot: 0,
            },
        );
        unit.handle_close();

        let messages = read_back(&path);
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].header().created(), old);
        std::fs::remove_file(&path).ok();
    }
}
