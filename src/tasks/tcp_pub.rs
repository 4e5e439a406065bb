//! TCP server publisher.
//!
//! Listens for subscriber connections and broadcasts every data envelope to
//! each connected client. Each client gets its own queue and writer thread,
//! so one slow consumer cannot stall the rest. Client arrival and departure
//! are fed through the publisher's own queue as markers, which keeps the
//! client list single-threaded without a lock. Connection-count changes feed
//! the using-data calculation: with no clients connected, everything
//! upstream of the publisher may go idle.

use crate::core::envelope::Envelope;
use crate::core::task::{TaskCore, TaskShared, TaskUnit};
use crate::discovery;
use crate::io::gather::GatherWriter;
use anyhow::{Context, Result};
use async_trait::async_trait;
use bytes::Bytes;
use std::any::Any;
use std::collections::HashMap;
use std::io::Read;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::net::TcpListener;

enum ClientItem {
    Frame(Bytes),
    Stop,
}

struct Client {
    tx: flume::Sender<ClientItem>,
    writer: Option<std::thread::JoinHandle<()>>,
}

/// Marker: a client finished its TCP handshake.
struct ClientUp {
    id: u64,
    stream: std::net::TcpStream,
    peer: std::net::SocketAddr,
}

/// Marker: a client hung up or its writer failed.
struct ClientDown {
    id: u64,
}

pub struct TcpPubTask {
    core: TaskCore,
    service_name: String,
    type_name: String,
    port: u16,
    clients: HashMap<u64, Client>,
    client_count: Arc<AtomicUsize>,
    acceptor: Option<tokio::task::JoinHandle<()>>,
    registration: Option<discovery::Registration>,
}

impl TcpPubTask {
    pub fn new(service_name: &str, type_name: &str, port: u16) -> Self {
        let task_name = format!("{service_name} PUB");
        let mut core = TaskCore::new(&task_name, false);

        let client_count = Arc::new(AtomicUsize::new(0));
        let probe = client_count.clone();
        core.shared
            .set_extra_using_data(Box::new(move || probe.load(Ordering::Relaxed) > 0));

        Self {
            core,
            service_name: service_name.to_string(),
            type_name: type_name.to_string(),
            port,
            clients: HashMap::new(),
            client_count,
            acceptor: None,
            registration: None,
        }
    }

    pub fn connection_count(&self) -> usize {
        self.client_count.load(Ordering::Relaxed)
    }

    fn sync_client_count(&mut self) {
        self.client_count.store(self.clients.len(), Ordering::Relaxed);
        self.core.shared.update_using_data();
    }

    fn add_client(&mut self, up: ClientUp) {
        tracing::info!(task = %self.core.name(), peer = %up.peer, "subscriber connected");

        let (tx, rx) = flume::unbounded();
        let shared = self.core.shared.clone();
        let id = up.id;

        // Watch for the peer closing its end. The publisher never expects
        // bytes from a subscriber, so a completed read means hangup.
        let detect_stream = up.stream.try_clone().ok();
        let detect_shared = self.core.shared.clone();
        if let Some(mut stream) = detect_stream {
            self.core.runtime.spawn_blocking(move || {
                let mut byte = [0u8; 1];
                let _ = stream.read(&mut byte);
                let _ = detect_shared.post_marker(Box::new(ClientDown { id }));
            });
        }

        let writer = std::thread::Builder::new()
            .name(format!("{}-client", self.core.name()))
            .spawn(move || {
                let mut gather = GatherWriter::new(up.stream).with_count_limit(1);
                while let Ok(item) = rx.recv() {
                    match item {
                        ClientItem::Frame(frame) => {
                            if !gather.add(frame) {
                                let _ = shared.post_marker(Box::new(ClientDown { id }));
                                break;
                            }
                        }
                        ClientItem::Stop => break,
                    }
                }
                gather.flush();
            });

        match writer {
            Ok(writer) => {
                self.clients.insert(
                    id,
                    Client {
                        tx,
                        writer: Some(writer),
                    },
                );
                self.sync_client_count();
            }
            Err(err) => {
                tracing::error!(error = %err, "failed to start client writer thread");
            }
        }
    }

    fn remove_client(&mut self, id: u64) {
        let Some(mut client) = self.clients.remove(&id) else {
            return;
        };
        let _ = client.tx.send(ClientItem::Stop);
        if let Some(writer) = client.writer.take() {
            let _ = writer.join();
        }
        tracing::info!(task = %self.core.name(), "subscriber disconnected");
        self.sync_client_count();
    }

    fn close_all_clients(&mut self) {
        let ids: Vec<u64> = self.clients.keys().copied().collect();
        for id in ids {
            self.remove_client(id);
        }
    }
}

#[async_trait]
impl TaskUnit for TcpPubTask {
    fn core(&self) -> &TaskCore {
        &self.core
    }

    fn core_mut(&mut self) -> &mut TaskCore {
        &mut self.core
    }

    async fn start(&mut self) -> Result<()> {
        let listener = TcpListener::bind(("0.0.0.0", self.port))
            .await
            .with_context(|| format!("binding publisher port {}", self.port))?;
        let local = listener.local_addr()?;
        tracing::info!(
            task = %self.core.name(),
            port = local.port(),
            "publishing on TCP"
        );

        let shared = self.core.shared.clone();
        self.acceptor = Some(self.core.runtime.spawn(accept_loop(listener, shared)));

        self.registration = Some(discovery::register(discovery::ResolvedService {
            name: self.service_name.clone(),
            service_type: discovery::publisher_type(&self.type_name),
            host: "127.0.0.1".to_string(),
            port: local.port(),
            txt: HashMap::from([
                ("transport".to_string(), "tcp".to_string()),
                ("ip".to_string(), "127.0.0.1".to_string()),
            ]),
        }));
        Ok(())
    }

    fn deliver_data(&mut self, envelope: Envelope, _slot: usize) -> Result<()> {
        if self.clients.is_empty() {
            return Ok(());
        }
        let frame = envelope.encoded()?;
        for client in self.clients.values() {
            if client.tx.send(ClientItem::Frame(frame.clone())).is_err() {
                tracing::warn!(task = %self.core.name(), "client queue gone");
            }
        }
        Ok(())
    }

    fn handle_marker(&mut self, marker: Box<dyn Any + Send>) {
        match marker.downcast::<ClientUp>() {
            Ok(up) => self.add_client(*up),
            Err(marker) => {
                if let Ok(down) = marker.downcast::<ClientDown>() {
                    self.remove_client(down.id);
                }
            }
        }
    }

    fn handle_close(&mut self) {
        if let Some(acceptor) = self.acceptor.take() {
            acceptor.abort();
        }
        self.registration.take();
        self.close_all_clients();
    }
}

async fn accept_loop(listener: TcpListener, shared: Arc<TaskShared>) {
    let mut next_id = 0u64;
    loop {
        match listener.accept().await {
            Ok((stream, peer)) => {
                next_id += 1;
                let stream = match stream.into_std() {
                    Ok(stream) => stream,
                    Err(err) => {
                        tracing::error!(error = %err, "failed to adopt client socket");
                        continue;
                    }
                };
                // The writer thread and hangup detector both block; undo the
                // non-blocking mode the acceptor used.
                if let Err(err) = stream.set_nonblocking(false) {
                    tracing::error!(error = %err, "failed to configure client socket");
                    continue;
                }
                let marker = ClientUp {
                    id: next_id,
                    stream,
                    peer,
                };
                if !shared.post_marker(Box::new(marker)) {
                    break;
                }
            }
            Err(err) => {
                tracing::warn!(error = %err, "accept failed");
                tokio::time::sleep(std::time::Duration::from_millis(100)).await;
            }
        }
    }
}
