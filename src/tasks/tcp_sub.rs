//! TCP client subscriber.
//!
//! Locates its publisher through discovery, connects, and feeds received
//! frames into the stream on output slot 0. Connection loss or a publisher
//! restart is handled with a once-per-second reconnect until the service
//! resolves again.

use crate::codec::frame::StreamFramer;
use crate::core::envelope::Envelope;
use crate::core::task::{TaskCore, TaskShared, TaskUnit};
use crate::discovery;
use anyhow::Result;
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncReadExt;
use tokio::net::TcpStream;
use tokio::sync::watch;

const RECONNECT_INTERVAL: Duration = Duration::from_secs(1);

pub struct TcpSubTask {
    core: TaskCore,
    service_name: String,
    type_name: String,
    manager: Option<tokio::task::JoinHandle<()>>,
}

impl TcpSubTask {
    pub fn new(service_name: &str, type_name: &str) -> Self {
        let task_name = format!("{service_name} SUB (TCP)");
        Self {
            core: TaskCore::new(&task_name, false),
            service_name: service_name.to_string(),
            type_name: type_name.to_string(),
            manager: None,
        }
    }
}

#[async_trait]
impl TaskUnit for TcpSubTask {
    fn core(&self) -> &TaskCore {
        &self.core
    }

    fn core_mut(&mut self) -> &mut TaskCore {
        &mut self.core
    }

    async fn start(&mut self) -> Result<()> {
        self.core
            .shared
            .set_error_text("Not connected to publisher", false);
        let shared = self.core.shared.clone();
        let browse = discovery::browse(
            &discovery::subscriber_twin_type(&self.type_name),
            &self.service_name,
        );
        self.manager = Some(self.core.runtime.spawn(manage_loop(shared, browse)));
        Ok(())
    }

    fn handle_close(&mut self) {
        if let Some(manager) = self.manager.take() {
            manager.abort();
        }
    }
}

async fn manage_loop(
    shared: Arc<TaskShared>,
    mut browse: watch::Receiver<Option<discovery::ResolvedService>>,
) {
    while shared.is_queue_active() {
        let Some(service) = browse.borrow().clone() else {
            // Publisher not resolved; wait for discovery (or a close).
            let _ = tokio::time::timeout(RECONNECT_INTERVAL, browse.changed()).await;
            continue;
        };

        match TcpStream::connect((service.host.as_str(), service.port)).await {
            Ok(stream) => {
                tracing::info!(
                    task = %shared.name(),
                    host = %service.host,
                    port = service.port,
                    "connected to publisher"
                );
                shared.clear_error();
                read_until_disconnect(&shared, stream, &mut browse).await;
                shared.set_error_text("Not connected to publisher", true);
            }
            Err(err) => {
                tracing::debug!(task = %shared.name(), error = %err, "connect failed, will retry");
                tokio::time::sleep(RECONNECT_INTERVAL).await;
            }
        }
    }
}

async fn read_until_disconnect(
    shared: &Arc<TaskShared>,
    mut stream: TcpStream,
    browse: &mut watch::Receiver<Option<discovery::ResolvedService>>,
) {
    let mut framer = StreamFramer::new();
    let mut buf = match crate::core::pool::block_pool().acquire(16 * 1024) {
        Ok(buf) => buf,
        Err(err) => {
            shared.post_failure(&format!("no read buffer: {err}"));
            return;
        }
    };
    loop {
        if !shared.is_queue_active() {
            return;
        }
        buf.clear();
        tokio::select! {
            read = tokio::time::timeout(Duration::from_secs(1), stream.read_buf(&mut *buf)) => {
                match read {
                    Err(_) => continue, // timeout; re-check for close
                    Ok(Ok(0)) => {
                        tracing::warn!(task = %shared.name(), "publisher closed the connection");
                        return;
                    }
                    Ok(Ok(_)) => {
                        framer.extend(&buf);
                        while let Some(frame) = framer.next_frame() {
                            shared.acquire_external(Envelope::wrap_encoded(frame));
                        }
                    }
                    Ok(Err(err)) => {
                        tracing::warn!(task = %shared.name(), error = %err, "read failed");
                        return;
                    }
                }
            }
            _ = browse.changed() => {
                // Publisher moved or went away; reconnect against the new
                // resolution.
                return;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::frame;
    use crate::core::channel::{OutputChannel, Recipient};
    use crate::core::task::QueueItem;
    use crate::messages::video::Video;
    use std::collections::HashMap;
    use tokio::io::AsyncWriteExt;
    use tokio::net::TcpListener;

    #[tokio::test]
    async fn subscribes_via_discovery_and_receives_frames() {
        let listener = TcpListener::bind(("127.0.0.1", 0)).await.unwrap();
        let port = listener.local_addr().unwrap().port();

        let mut unit = TcpSubTask::new("disc-pub", "Video");
        let (sink, sink_rx) = TaskShared::new("sink", true);
        let mut channel = OutputChannel::new("0-0", "Video");
        channel.add_recipient(Recipient {
            task: sink,
            slot: 0,
        });
        unit.core().shared.add_output_channel(channel);
        unit.start().await.unwrap();

        // No publisher yet: subscriber sits in its retry loop.
        tokio::time::sleep(Duration::from_millis(50)).await;

        let registration = discovery::register(discovery::ResolvedService {
            name: "disc-pub".to_string(),
            service_type: discovery::publisher_type("Video"),
            host: "127.0.0.1".to_string(),
            port,
            txt: HashMap::from([("transport".to_string(), "tcp".to_string())]),
        });

        let (mut peer, _) = listener.accept().await.unwrap();
        let video = Video::with_samples("pub", 21, 0.0, vec![4]);
        peer.write_all(&frame::encode_message(&video, None).unwrap())
            .await
            .unwrap();

        let item = tokio::time::timeout(Duration::from_secs(3), sink_rx.recv_async())
            .await
            .unwrap()
            .unwrap();
        let QueueItem::Envelope { envelope, .. } = item else {
            panic!("expected envelope");
        };
        assert_eq!(envelope.native().unwrap().header().sequence(), 21);
        assert!(!unit.core().shared.has_error());

        unit.handle_close();
        drop(registration);
    }
}
