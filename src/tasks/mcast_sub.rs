//! Multicast subscriber.
//!
//! Resolves its publisher through discovery, joins the advertised multicast
//! group, and heartbeats the publisher every two seconds while it wants
//! data. When using-data turns off it says `BYE` and leaves the group;
//! turning back on re-joins. The publisher's address and heartbeat port come
//! from the discovery record (`ip` and `HeartBeatPort` TXT entries).

use crate::codec::frame;
use crate::core::envelope::Envelope;
use crate::core::pool;
use crate::core::task::{TaskCore, TaskShared, TaskUnit};
use crate::discovery;
use anyhow::Result;
use async_trait::async_trait;
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio::sync::watch;

const HEART_BEAT_INTERVAL: Duration = Duration::from_secs(2);

pub struct McastSubTask {
    core: TaskCore,
    service_name: String,
    type_name: String,
    buffer_size: usize,
    manager: Option<tokio::task::JoinHandle<()>>,
}

impl McastSubTask {
    pub fn new(service_name: &str, type_name: &str, buffer_size: usize) -> Self {
        let task_name = format!("{service_name} SUB");
        Self {
            core: TaskCore::new(&task_name, false),
            service_name: service_name.to_string(),
            type_name: type_name.to_string(),
            buffer_size,
            manager: None,
        }
    }
}

#[async_trait]
impl TaskUnit for McastSubTask {
    fn core(&self) -> &TaskCore {
        &self.core
    }

    fn core_mut(&mut self) -> &mut TaskCore {
        &mut self.core
    }

    async fn start(&mut self) -> Result<()> {
        let shared = self.core.shared.clone();
        let browse = discovery::browse(
            &discovery::subscriber_twin_type(&self.type_name),
            &self.service_name,
        );
        let buffer_size = self.buffer_size;
        self.manager = Some(
            self.core
                .runtime
                .spawn(manage_loop(shared, browse, buffer_size)),
        );
        Ok(())
    }

    fn handle_close(&mut self) {
        if let Some(manager) = self.manager.take() {
            manager.abort();
        }
    }
}

/// Connection details extracted from a discovery record.
struct Resolved {
    group: Ipv4Addr,
    group_port: u16,
    heart_beat: SocketAddr,
}

fn resolve(service: &discovery::ResolvedService) -> Option<Resolved> {
    let group: Ipv4Addr = service.host.parse().ok()?;
    let heart_beat_port: u16 = service.txt_entry("HeartBeatPort")?.parse().ok()?;
    let heart_beat_host = service.txt_entry("ip")?;
    let heart_beat: SocketAddr = format!("{heart_beat_host}:{heart_beat_port}").parse().ok()?;
    Some(Resolved {
        group,
        group_port: service.port,
        heart_beat,
    })
}

struct Membership {
    socket: UdpSocket,
    group: Ipv4Addr,
    heart_beat: SocketAddr,
}

impl Membership {
    async fn join(resolved: &Resolved, buffer_size: usize) -> Result<Self> {
        let socket = UdpSocket::bind(("0.0.0.0", resolved.group_port)).await?;
        socket.join_multicast_v4(resolved.group, Ipv4Addr::UNSPECIFIED)?;
        if buffer_size > 0 {
            // Kernels manage datagram buffering well on their own; the
            // configured size is recorded for operators rather than applied.
            tracing::debug!(buffer_size, "receive buffer size requested");
        }
        Ok(Self {
            socket,
            group: resolved.group,
            heart_beat: resolved.heart_beat,
        })
    }

    async fn send_heart_beat(&self, text: &[u8]) {
        if let Err(err) = self.socket.send_to(text, self.heart_beat).await {
            tracing::error!(target = %self.heart_beat, error = %err, "heartbeat send failed");
        }
    }

    async fn leave(self) {
        self.send_heart_beat(b"BYE\0").await;
        let _ = self.socket.leave_multicast_v4(self.group, Ipv4Addr::UNSPECIFIED);
    }
}

async fn manage_loop(
    shared: Arc<TaskShared>,
    mut browse: watch::Receiver<Option<discovery::ResolvedService>>,
    buffer_size: usize,
) {
    let mut using = shared.watch_using_data();
    let mut membership: Option<Membership> = None;
    let mut heart_beat = tokio::time::interval(HEART_BEAT_INTERVAL);
    heart_beat.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    let mut buf = match pool::block_pool().acquire(pool::MAX_MESSAGE_SIZE) {
        Ok(buf) => buf,
        Err(err) => {
            shared.post_failure(&format!("no read buffer: {err}"));
            return;
        }
    };

    loop {
        if !shared.is_queue_active() {
            if let Some(membership) = membership.take() {
                membership.leave().await;
            }
            return;
        }

        let wants_data = shared.is_using_data();
        if !wants_data {
            if let Some(membership) = membership.take() {
                tracing::info!(task = %shared.name(), "leaving multicast group");
                membership.leave().await;
            }
            let _ = tokio::time::timeout(Duration::from_secs(1), using.changed()).await;
            continue;
        }

        if membership.is_none() {
            let resolved = browse.borrow().clone().and_then(|s| resolve(&s));
            let Some(resolved) = resolved else {
                let _ = tokio::time::timeout(Duration::from_secs(1), browse.changed()).await;
                continue;
            };
            match Membership::join(&resolved, buffer_size).await {
                Ok(joined) => {
                    tracing::info!(
                        task = %shared.name(),
                        group = %joined.group,
                        "joined multicast group"
                    );
                    joined.send_heart_beat(b"HI\0").await;
                    shared.clear_error();
                    membership = Some(joined);
                }
                Err(err) => {
                    shared.set_error_text(&format!("Failed to join multicast group: {err}"), true);
                    tokio::time::sleep(Duration::from_secs(1)).await;
                    continue;
                }
            }
        }

        enum Step {
            Received(usize),
            ReceiveFailed(String),
            HeartBeat,
            UsingChanged,
            BrowseChanged,
        }

        buf.clear();
        let step = {
            let active = membership.as_ref().expect("membership present");
            tokio::select! {
                received = active.socket.recv_buf(&mut *buf) => match received {
                    Ok(len) => Step::Received(len),
                    Err(err) => Step::ReceiveFailed(err.to_string()),
                },
                _ = heart_beat.tick() => Step::HeartBeat,
                _ = using.changed() => Step::UsingChanged,
                _ = browse.changed() => Step::BrowseChanged,
            }
        };

        match step {
            Step::Received(len) => match frame::frame_from_datagram(&buf[..len]) {
                Ok(framed) => {
                    shared.acquire_external(Envelope::wrap_encoded(framed));
                }
                Err(err) => {
                    tracing::warn!(task = %shared.name(), error = %err, "discarding datagram");
                }
            },
            Step::ReceiveFailed(err) => {
                tracing::warn!(task = %shared.name(), error = %err, "receive failed");
                if let Some(membership) = membership.take() {
                    membership.leave().await;
                }
            }
            Step::HeartBeat => {
                if let Some(active) = membership.as_ref() {
                    active.send_heart_beat(b"HI\0").await;
                }
            }
            Step::UsingChanged => {
                // Loop around; the flag is re-read at the top.
            }
            Step::BrowseChanged => {
                // Publisher flapped; drop membership and re-resolve.
                if let Some(membership) = membership.take() {
                    membership.leave().await;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn record(group: &str, port: u16, heart_beat_port: u16) -> discovery::ResolvedService {
        discovery::ResolvedService {
            name: "mc".to_string(),
            service_type: discovery::publisher_type("Video"),
            host: group.to_string(),
            port,
            txt: HashMap::from([
                ("transport".to_string(), "multicast".to_string()),
                ("ip".to_string(), "127.0.0.1".to_string()),
                ("HeartBeatPort".to_string(), heart_beat_port.to_string()),
            ]),
        }
    }

    #[test]
    fn resolve_extracts_group_and_heartbeat_target() {
        let resolved = resolve(&record("239.255.1.7", 9100, 9101)).unwrap();
        assert_eq!(resolved.group, "239.255.1.7".parse::<Ipv4Addr>().unwrap());
        assert_eq!(resolved.group_port, 9100);
        assert_eq!(resolved.heart_beat, "127.0.0.1:9101".parse().unwrap());
    }

    #[test]
    fn malformed_records_do_not_resolve() {
        let mut bad = record("not-an-address", 9100, 9101);
        assert!(resolve(&bad).is_none());
        bad = record("239.255.1.7", 9100, 9101);
        bad.txt.remove("HeartBeatPort");
        assert!(resolve(&bad).is_none());
    }

    #[tokio::test]
    async fn heartbeats_reach_the_publisher_port() {
        let heart_beat_rx = UdpSocket::bind(("127.0.0.1", 0)).await.unwrap();
        let heart_beat_port = heart_beat_rx.local_addr().unwrap().port();

        let resolved = resolve(&record("239.255.44.44", 0, heart_beat_port)).unwrap();
        // Group joins depend on the host's interfaces; drive the heartbeat
        // half directly.
        let membership = Membership {
            socket: UdpSocket::bind(("0.0.0.0", 0)).await.unwrap(),
            group: resolved.group,
            heart_beat: resolved.heart_beat,
        };
        membership.send_heart_beat(b"HI\0").await;

        let mut buf = [0u8; 8];
        let (len, _) = tokio::time::timeout(
            Duration::from_secs(2),
            heart_beat_rx.recv_from(&mut buf),
        )
        .await
        .unwrap()
        .unwrap();
        assert_eq!(&buf[..len], b"HI\0");

        membership.leave().await;
        let (len, _) = tokio::time::timeout(
            Duration::from_secs(2),
            heart_beat_rx.recv_from(&mut buf),
        )
        .await
        .unwrap()
        .unwrap();
        assert_eq!(&buf[..len], b"BYE\0");
    }
}
