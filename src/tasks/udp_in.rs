//! Unicast datagram reader task.
//!
//! Binds a UDP port and treats every datagram as one complete frame. A
//! datagram whose preamble is inconsistent is logged and dropped; framing
//! can only be re-established at a datagram boundary anyway.

use crate::codec::frame;
use crate::core::envelope::Envelope;
use crate::core::pool;
use crate::core::task::{TaskCore, TaskShared, TaskUnit};
use anyhow::{Context, Result};
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::UdpSocket;

pub struct UdpInTask {
    core: TaskCore,
    port: u16,
    reader: Option<tokio::task::JoinHandle<()>>,
}

impl UdpInTask {
    pub fn new(name: &str, port: u16) -> Self {
        Self {
            core: TaskCore::new(name, false),
            port,
            reader: None,
        }
    }
}

#[async_trait]
impl TaskUnit for UdpInTask {
    fn core(&self) -> &TaskCore {
        &self.core
    }

    fn core_mut(&mut self) -> &mut TaskCore {
        &mut self.core
    }

    async fn start(&mut self) -> Result<()> {
        let socket = UdpSocket::bind(("0.0.0.0", self.port))
            .await
            .with_context(|| format!("binding UDP port {}", self.port))?;
        tracing::info!(task = %self.core.name(), port = self.port, "listening for datagrams");
        let shared = self.core.shared.clone();
        self.reader = Some(self.core.runtime.spawn(read_loop(socket, shared)));
        Ok(())
    }

    fn handle_close(&mut self) {
        if let Some(reader) = self.reader.take() {
            reader.abort();
        }
    }
}

async fn read_loop(socket: UdpSocket, shared: Arc<TaskShared>) {
    let mut buf = match pool::block_pool().acquire(pool::MAX_MESSAGE_SIZE) {
        Ok(buf) => buf,
        Err(err) => {
            shared.post_failure(&format!("no read buffer: {err}"));
            return;
        }
    };
    while shared.is_queue_active() {
        buf.clear();
        let received =
            tokio::time::timeout(Duration::from_secs(1), socket.recv_buf(&mut *buf)).await;
        match received {
            Err(_) => continue, // timeout keeps the cancellation observable
            Ok(Err(err)) => {
                shared.post_failure(&format!("datagram receive failed: {err}"));
                break;
            }
            Ok(Ok(len)) => match frame::frame_from_datagram(&buf[..len]) {
                Ok(framed) => {
                    shared.acquire_external(Envelope::wrap_encoded(framed));
                }
                Err(err) => {
                    tracing::warn!(task = %shared.name(), error = %err, "discarding datagram");
                }
            },
        }
    }
}
