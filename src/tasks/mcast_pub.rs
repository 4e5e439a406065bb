//! Multicast publisher.
//!
//! Sends each data envelope as one datagram to a multicast group and keeps a
//! liveness map of its subscribers. Subscribers announce themselves with
//! `HI` heartbeats on a side channel and say `BYE` when they leave; entries
//! that go quiet for five seconds are pruned. The map drives using-data:
//! with nobody listening, upstream tasks can idle.

use crate::core::envelope::Envelope;
use crate::core::task::{TaskCore, TaskShared, TaskUnit};
use crate::discovery;
use crate::io::devices::MulticastWriter;
use anyhow::{Context, Result};
use async_trait::async_trait;
use std::collections::HashMap;
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::net::UdpSocket;

const STALE_AFTER: Duration = Duration::from_secs(5);
const PRUNE_INTERVAL: Duration = Duration::from_secs(1);

type HeartBeatMap = Arc<Mutex<HashMap<SocketAddr, Instant>>>;

pub struct McastPubTask {
    core: TaskCore,
    service_name: String,
    type_name: String,
    group: Ipv4Addr,
    port: u16,
    writer: Option<MulticastWriter>,
    heart_beats: HeartBeatMap,
    listener: Option<tokio::task::JoinHandle<()>>,
    registration: Option<discovery::Registration>,
}

impl McastPubTask {
    pub fn new(service_name: &str, type_name: &str, group: Ipv4Addr, port: u16) -> Self {
        let task_name = format!("{service_name} PUB");
        let mut core = TaskCore::new(&task_name, false);

        let heart_beats: HeartBeatMap = Arc::new(Mutex::new(HashMap::new()));
        let probe = heart_beats.clone();
        core.shared.set_extra_using_data(Box::new(move || {
            !probe.lock().expect("heartbeat map").is_empty()
        }));

        Self {
            core,
            service_name: service_name.to_string(),
            type_name: type_name.to_string(),
            group,
            port,
            writer: None,
            heart_beats,
            listener: None,
            registration: None,
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.heart_beats.lock().expect("heartbeat map").len()
    }
}

#[async_trait]
impl TaskUnit for McastPubTask {
    fn core(&self) -> &TaskCore {
        &self.core
    }

    fn core_mut(&mut self) -> &mut TaskCore {
        &mut self.core
    }

    async fn start(&mut self) -> Result<()> {
        if self.port == 0 {
            // Subscribers bind the advertised group port, so it has to be a
            // concrete value. Borrow a free one from the kernel.
            let probe = UdpSocket::bind(("0.0.0.0", 0))
                .await
                .context("probing for a group port")?;
            self.port = probe.local_addr()?.port();
        }
        let group = SocketAddr::from((self.group, self.port));
        self.writer = Some(MulticastWriter::open(group)?);

        let heart_beat_socket = UdpSocket::bind(("0.0.0.0", 0))
            .await
            .context("binding heartbeat socket")?;
        let heart_beat_port = heart_beat_socket.local_addr()?.port();

        tracing::info!(
            task = %self.core.name(),
            %group,
            heart_beat_port,
            "publishing on multicast"
        );

        self.listener = Some(self.core.runtime.spawn(heart_beat_loop(
            heart_beat_socket,
            self.heart_beats.clone(),
            self.core.shared.clone(),
        )));

        self.registration = Some(discovery::register(discovery::ResolvedService {
            name: self.service_name.clone(),
            service_type: discovery::publisher_type(&self.type_name),
            host: self.group.to_string(),
            port: self.port,
            txt: HashMap::from([
                ("transport".to_string(), "multicast".to_string()),
                ("ip".to_string(), "127.0.0.1".to_string()),
                ("HeartBeatPort".to_string(), heart_beat_port.to_string()),
            ]),
        }));
        Ok(())
    }

    fn deliver_data(&mut self, envelope: Envelope, _slot: usize) -> Result<()> {
        if self.subscriber_count() == 0 {
            return Ok(());
        }
        let Some(writer) = self.writer.as_ref() else {
            anyhow::bail!("multicast writer is not open");
        };
        writer.send(&envelope.encoded()?)
    }

    fn handle_close(&mut self) {
        if let Some(listener) = self.listener.take() {
            listener.abort();
        }
        self.registration.take();
    }
}

async fn heart_beat_loop(socket: UdpSocket, map: HeartBeatMap, shared: Arc<TaskShared>) {
    let mut buf = [0u8; 16];
    let mut prune = tokio::time::interval(PRUNE_INTERVAL);
    prune.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            received = socket.recv_from(&mut buf) => {
                let Ok((len, from)) = received else { continue };
                match &buf[..len] {
                    b"HI\0" | b"HI" => {
                        let fresh = map
                            .lock()
                            .expect("heartbeat map")
                            .insert(from, Instant::now())
                            .is_none();
                        if fresh {
                            tracing::info!(task = %shared.name(), %from, "subscriber joined");
                            shared.update_using_data();
                        }
                    }
                    b"BYE\0" | b"BYE" => {
                        if map.lock().expect("heartbeat map").remove(&from).is_some() {
                            tracing::info!(task = %shared.name(), %from, "subscriber left");
                            shared.update_using_data();
                        }
                    }
                    other => {
                        tracing::warn!(
                            task = %shared.name(),
                            %from,
                            len = other.len(),
                            "unrecognised heartbeat"
                        );
                    }
                }
            }
            _ = prune.tick() => {
                let pruned = {
                    let mut map = map.lock().expect("heartbeat map");
                    let before = map.len();
                    map.retain(|_, last| last.elapsed() < STALE_AFTER);
                    map.len() != before
                };
                if pruned {
                    tracing::warn!(task = %shared.name(), "pruned stale subscribers");
                    shared.update_using_data();
                }
            }
        }
    }
}
