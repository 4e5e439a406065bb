//! Unicast datagram writer task.
//!
//! Sends each data envelope to a fixed remote address as one datagram, then
//! forwards the envelope downstream so further stages can observe the
//! traffic.

use crate::core::envelope::Envelope;
use crate::core::task::{TaskCore, TaskUnit};
use crate::io::devices::UdpWriter;
use anyhow::{Context, Result};
use async_trait::async_trait;
use std::net::{SocketAddr, ToSocketAddrs};

pub struct UdpOutTask {
    core: TaskCore,
    host: String,
    port: u16,
    writer: Option<UdpWriter>,
}

impl UdpOutTask {
    pub fn new(name: &str, host: &str, port: u16) -> Self {
        let mut core = TaskCore::new(name, true);
        core.pin_always_using_data();
        Self {
            core,
            host: host.to_string(),
            port,
            writer: None,
        }
    }

    fn resolve(&self) -> Result<SocketAddr> {
        (self.host.as_str(), self.port)
            .to_socket_addrs()
            .with_context(|| format!("resolving {}:{}", self.host, self.port))?
            .next()
            .with_context(|| format!("no address for {}:{}", self.host, self.port))
    }
}

#[async_trait]
impl TaskUnit for UdpOutTask {
    fn core(&self) -> &TaskCore {
        &self.core
    }

    fn core_mut(&mut self) -> &mut TaskCore {
        &mut self.core
    }

    async fn start(&mut self) -> Result<()> {
        let remote = self.resolve()?;
        self.writer = Some(UdpWriter::connect(remote)?);
        tracing::info!(task = %self.core.name(), %remote, "datagram writer ready");
        Ok(())
    }

    fn deliver_data(&mut self, envelope: Envelope, slot: usize) -> Result<()> {
        let Some(writer) = self.writer.as_ref() else {
            anyhow::bail!("datagram writer is not open");
        };
        writer.send(&envelope.encoded()?)?;
        self.core.shared.forward_next(envelope, slot);
        Ok(())
    }
}
