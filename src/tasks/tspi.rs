//! TSPI acquisition task.
//!
//! Time-space-position reports arrive as unicast datagrams from a range
//! instrumentation server. As with VME acquisition, payloads are opaque to
//! the runtime and travel as raw envelopes.

use crate::core::envelope::Envelope;
use crate::core::pool;
use crate::core::task::{TaskCore, TaskShared, TaskUnit};
use anyhow::{Context, Result};
use async_trait::async_trait;
use bytes::Bytes;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::UdpSocket;

pub struct TspiReaderTask {
    core: TaskCore,
    port: u16,
    reader: Option<tokio::task::JoinHandle<()>>,
}

impl TspiReaderTask {
    pub fn new(name: &str, port: u16) -> Self {
        Self {
            core: TaskCore::new(name, false),
            port,
            reader: None,
        }
    }
}

#[async_trait]
impl TaskUnit for TspiReaderTask {
    fn core(&self) -> &TaskCore {
        &self.core
    }

    fn core_mut(&mut self) -> &mut TaskCore {
        &mut self.core
    }

    async fn start(&mut self) -> Result<()> {
        let socket = UdpSocket::bind(("0.0.0.0", self.port))
            .await
            .with_context(|| format!("binding TSPI port {}", self.port))?;
        tracing::info!(task = %self.core.name(), port = self.port, "TSPI acquisition listening");
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
    let mut buf = match pool::block_pool().acquire(8 * 1024) {
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
                shared.post_failure(&format!("TSPI receive failed: {err}"));
                break;
            }
            Ok(Ok(len)) => {
                shared.acquire_external(Envelope::wrap_raw(Bytes::copy_from_slice(&buf[..len])));
            }
        }
    }
}
