//! Datagram writer devices.
//!
//! Stream devices (file, TCP) batch through the gather-writer; datagram
//! devices send one frame per datagram and so write directly.

use anyhow::{Context, Result};
use bytes::Bytes;
use std::net::{SocketAddr, UdpSocket};

/// Unicast datagram writer.
pub struct UdpWriter {
    socket: UdpSocket,
    remote: SocketAddr,
}

impl UdpWriter {
    pub fn connect(remote: SocketAddr) -> Result<Self> {
        let socket = UdpSocket::bind(("0.0.0.0", 0)).context("binding datagram socket")?;
        Ok(Self { socket, remote })
    }

    pub fn remote(&self) -> SocketAddr {
        self.remote
    }

    pub fn send(&self, frame: &Bytes) -> Result<()> {
        let sent = self
            .socket
            .send_to(frame, self.remote)
            .with_context(|| format!("sending datagram to {}", self.remote))?;
        if sent != frame.len() {
            anyhow::bail!("short datagram send: {} of {} bytes", sent, frame.len());
        }
        Ok(())
    }
}

/// Multicast datagram writer. The destination is the group address; the
/// local socket is an ordinary ephemeral binding.
pub struct MulticastWriter {
    socket: UdpSocket,
    group: SocketAddr,
}

impl MulticastWriter {
    pub fn open(group: SocketAddr) -> Result<Self> {
        let socket = UdpSocket::bind(("0.0.0.0", 0)).context("binding multicast send socket")?;
        socket
            .set_multicast_ttl_v4(1)
            .context("setting multicast TTL")?;
        Ok(Self { socket, group })
    }

    pub fn group(&self) -> SocketAddr {
        self.group
    }

    pub fn send(&self, frame: &Bytes) -> Result<()> {
        let sent = self
            .socket
            .send_to(frame, self.group)
            .with_context(|| format!("sending to multicast group {}", self.group))?;
        if sent != frame.len() {
            anyhow::bail!("short multicast send: {} of {} bytes", sent, frame.len());
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn udp_writer_delivers_frames_to_the_remote() {
        let receiver = UdpSocket::bind(("127.0.0.1", 0)).unwrap();
        let remote = receiver.local_addr().unwrap();

        let writer = UdpWriter::connect(remote).unwrap();
        writer.send(&Bytes::from_static(b"datagram")).unwrap();

        let mut buf = [0u8; 64];
        let (len, _) = receiver.recv_from(&mut buf).unwrap();
        assert_eq!(&buf[..len], b"datagram");
    }
}
