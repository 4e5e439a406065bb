//! VME acquisition task.
//!
//! Receives raw sample blocks from a VME crate that broadcasts on a
//! multicast group. The payload format belongs to the acquisition hardware;
//! the task wraps each datagram as an opaque raw envelope and leaves
//! decoding to whichever algorithm consumes it.

use crate::core::envelope::Envelope;
use crate::core::pool;
use crate::core::task::{TaskCore, TaskShared, TaskUnit};
use anyhow::{Context, Result};
use async_trait::async_trait;
use bytes::Bytes;
use std::net::Ipv4Addr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::UdpSocket;

pub struct VmeReaderTask {
    core: TaskCore,
    group: Ipv4Addr,
    port: u16,
    buffer_size: usize,
    reader: Option<tokio::task::JoinHandle<()>>,
}

impl VmeReaderTask {
    pub fn new(name: &str, group: Ipv4Addr, port: u16, buffer_size: usize) -> Self {
        Self {
            core: TaskCore::new(name, false),
            group,
            port,
            buffer_size,
            reader: None,
        }
    }
}

#[async_trait]
impl TaskUnit for VmeReaderTask {
    fn core(&self) -> &TaskCore {
        &self.core
    }

    fn core_mut(&mut self) -> &mut TaskCore {
        &mut self.core
    }

    async fn start(&mut self) -> Result<()> {
        let socket = UdpSocket::bind(("0.0.0.0", self.port))
            .await
            .with_context(|| format!("binding VME port {}", self.port))?;
        socket
            .join_multicast_v4(self.group, Ipv4Addr::UNSPECIFIED)
            .with_context(|| format!("joining VME group {}", self.group))?;
        tracing::info!(
            task = %self.core.name(),
            group = %self.group,
            port = self.port,
            buffer = self.buffer_size,
            "VME acquisition joined"
        );
        let shared = self.core.shared.clone();
        let buffer_size = self.buffer_size;
        self.reader = Some(self.core.runtime.spawn(read_loop(socket, shared, buffer_size)));
        Ok(())
    }

    fn handle_close(&mut self) {
        if let Some(reader) = self.reader.take() {
            reader.abort();
        }
    }
}

async fn read_loop(socket: UdpSocket, shared: Arc<TaskShared>, buffer_size: usize) {
    // Sample blocks are bounded like any other message; the configured
    // buffer size only grows the scratch up to the pool's cap.
    let scratch = buffer_size.clamp(1024, pool::MAX_MESSAGE_SIZE);
    let mut buf = match pool::block_pool().acquire(scratch) {
        Ok(buf) => buf,
        Err(err) => {
            shared.post_failure(&format!("no read buffer: {err}"));
            return;
        }
    };
    while shared.is_queue_active() {
        buf.clear();
        match tokio::time::timeout(Duration::from_secs(1), socket.recv_buf(&mut *buf)).await {
            Err(_) => continue,
            Ok(Err(err)) => {
                shared.post_failure(&format!("VME receive failed: {err}"));
                break;
            }
            Ok(Ok(len)) => {
                let raw = Envelope::wrap_raw(Bytes::copy_from_slice(&buf[..len]));
                shared.acquire_external(raw);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::channel::{OutputChannel, Recipient};
    use crate::core::task::QueueItem;

    #[tokio::test]
    async fn raw_sample_blocks_flow_through_untouched() {
        // Group joins depend on the host's interfaces; drive the read loop
        // over loopback, which exercises the identical datagram path.
        let socket = UdpSocket::bind(("127.0.0.1", 0)).await.unwrap();
        let addr = socket.local_addr().unwrap();

        let (shared, _rx) = TaskShared::new("vme", false);
        let (sink, sink_rx) = TaskShared::new("sink", true);
        let mut channel = OutputChannel::new("0-0", "RawVideo");
        channel.add_recipient(Recipient {
            task: sink,
            slot: 0,
        });
        shared.add_output_channel(channel);

        let reader = tokio::spawn(read_loop(socket, shared.clone(), 256 * 1024));

        let sender = UdpSocket::bind(("127.0.0.1", 0)).await.unwrap();
        sender.send_to(b"\x7f\x00raw-samples", addr).await.unwrap();

        let item = tokio::time::timeout(Duration::from_secs(2), sink_rx.recv_async())
            .await
            .unwrap()
            .unwrap();
        let QueueItem::Envelope { envelope, slot } = item else {
            panic!("expected envelope");
        };
        assert_eq!(slot, 0);
        assert!(envelope.is_raw());
        assert_eq!(&envelope.raw_bytes().unwrap()[..], b"\x7f\x00raw-samples");

        // The reader accounted the block on input slot 0.
        let stats = shared.stats_snapshot();
        assert_eq!(stats[0].message_count(), 1);

        reader.abort();
    }
}
