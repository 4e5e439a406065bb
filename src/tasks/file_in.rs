//! File reader task.
//!
//! Opens a recording file and feeds its frames into the stream. The read
//! loop starts when the task enters Run and honours the using-data flag:
//! while nothing downstream wants data, the file position stays put. At end
//! of file the reader can emit a shutdown control message so the stream
//! winds itself down.

use crate::codec::frame::StreamFramer;
use crate::core::control::ControlMessage;
use crate::core::envelope::Envelope;
use crate::core::pool;
use crate::core::task::{TaskCore, TaskShared, TaskUnit};
use anyhow::{Context, Result};
use async_trait::async_trait;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncReadExt;

pub struct FileInTask {
    core: TaskCore,
    path: PathBuf,
    signal_end_of_file: bool,
    file: Option<tokio::fs::File>,
    reader: Option<tokio::task::JoinHandle<()>>,
}

impl FileInTask {
    pub fn new(name: &str, path: PathBuf, signal_end_of_file: bool) -> Self {
        Self {
            core: TaskCore::new(name, false),
            path,
            signal_end_of_file,
            file: None,
            reader: None,
        }
    }
}

#[async_trait]
impl TaskUnit for FileInTask {
    fn core(&self) -> &TaskCore {
        &self.core
    }

    fn core_mut(&mut self) -> &mut TaskCore {
        &mut self.core
    }

    async fn start(&mut self) -> Result<()> {
        let file = tokio::fs::File::open(&self.path)
            .await
            .with_context(|| format!("opening {}", self.path.display()))?;
        tracing::info!(task = %self.core.name(), path = %self.path.display(), "opened input file");
        self.file = Some(file);
        Ok(())
    }

    fn enter_run(&mut self) -> bool {
        if self.reader.is_some() {
            return true;
        }
        let Some(file) = self.file.take() else {
            self.core.shared.set_error_text("Input file is not open", false);
            return false;
        };
        let shared = self.core.shared.clone();
        let signal = self.signal_end_of_file;
        self.reader = Some(self.core.runtime.spawn(read_loop(file, shared, signal)));
        true
    }

    fn handle_close(&mut self) {
        if let Some(reader) = self.reader.take() {
            reader.abort();
        }
    }
}

async fn read_loop(mut file: tokio::fs::File, shared: Arc<TaskShared>, signal_eof: bool) {
    let mut framer = StreamFramer::new();
    let mut scratch = match pool::block_pool().acquire(16 * 1024) {
        Ok(buf) => buf,
        Err(err) => {
            shared.post_failure(&format!("no read buffer: {err}"));
            return;
        }
    };

    while shared.is_queue_active() {
        if !shared.is_using_data() {
            // Nobody downstream wants data; wait for the flag or a close.
            let mut watch = shared.watch_using_data();
            let _ = tokio::time::timeout(Duration::from_secs(1), watch.changed()).await;
            continue;
        }

        scratch.clear();
        match file.read_buf(&mut *scratch).await {
            Ok(0) => {
                tracing::info!(task = %shared.name(), "end of input file");
                if signal_eof {
                    shared.forward_next(Envelope::control(ControlMessage::Shutdown), 0);
                }
                break;
            }
            Ok(_) => {
                framer.extend(&scratch);
                while let Some(frame) = framer.next_frame() {
                    if !shared.acquire_external(Envelope::wrap_encoded(frame)) {
                        tracing::warn!(task = %shared.name(), "downstream rejected message");
                    }
                }
            }
            Err(err) => {
                shared.post_failure(&format!("read failed: {err}"));
                break;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::frame;
    use crate::core::channel::{OutputChannel, Recipient};
    use crate::core::state::ProcessingState;
    use crate::core::task::{self, QueueItem};
    use crate::messages::video::Video;

    fn scratch_file(frames: &[Vec<i16>]) -> PathBuf {
        let path = std::env::temp_dir().join(format!("filein-{}.pri", uuid::Uuid::new_v4()));
        let mut contents = Vec::new();
        for (index, samples) in frames.iter().enumerate() {
            let video = Video::with_samples("gen", index as u32 + 1, 0.0, samples.clone());
            contents.extend_from_slice(&frame::encode_message(&video, None).unwrap());
        }
        std::fs::write(&path, contents).unwrap();
        path
    }

    #[tokio::test]
    async fn reads_frames_and_signals_eof() {
        let path = scratch_file(&[vec![1, 2], vec![3, 4]]);
        let mut unit = FileInTask::new("filein", path.clone(), true);
        unit.start().await.unwrap();

        // Wire one consumer onto output slot 0 and a downstream task for the
        // shutdown control message.
        let (sink, sink_rx) = TaskShared::new("sink", true);
        let mut channel = OutputChannel::new("0-0", "Video");
        channel.add_recipient(Recipient {
            task: sink.clone(),
            slot: 0,
        });
        unit.core().shared.add_output_channel(channel);
        unit.core().shared.set_next(sink.clone());

        assert!(task::enter_processing_state(&mut unit, ProcessingState::Run));

        // Reader loop runs on the runtime; give it a moment.
        let mut data = Vec::new();
        let mut got_shutdown = false;
        for _ in 0..50 {
            while let Ok(item) = sink_rx.try_recv() {
                if let QueueItem::Envelope { envelope, .. } = item {
                    if envelope.is_control() {
                        got_shutdown = matches!(
                            envelope.as_control(),
                            Some(ControlMessage::Shutdown)
                        );
                    } else {
                        data.push(envelope.native().unwrap().header().sequence());
                    }
                }
            }
            if got_shutdown {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }

        assert_eq!(data, vec![1, 2]);
        assert!(got_shutdown);
        unit.handle_close();
        std::fs::remove_file(&path).ok();
    }

    #[tokio::test]
    async fn missing_file_fails_startup() {
        let mut unit = FileInTask::new("filein", PathBuf::from("/nonexistent/nothing.pri"), false);
        assert!(unit.start().await.is_err());
    }
}
