//! Connections and the task loops that drive the reconciler over them
//!
//! `SyncConnection` is a framed, bidirectional byte channel. The server runs
//! one `serve_connection` task per client connection, all sharing a
//! `SyncHub`; a client runs `run_client` (or `maintain_connection`, which
//! reconnects with backoff).

use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use serde::{de::DeserializeOwned, Serialize};
use tokio::sync::{mpsc, watch, Mutex, RwLock};
use tokio::time::{Duration, Instant};

use super::client::{ClientSync, ConnectionState};
use super::message::{ClientMessage, ServerMessage};
use super::server::{Outgoing, Recipient, ServerSync};
use super::SyncError;
use crate::config::SyncConfig;

/// How messages are encoded into frames.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum WireFormat {
    #[default]
    Json,
    Cbor,
}

impl WireFormat {
    pub fn encode<T: Serialize>(self, message: &T) -> Result<Vec<u8>, SyncError> {
        match self {
            WireFormat::Json => {
                serde_json::to_vec(message).map_err(|e| SyncError::SerializationError(e.to_string()))
            }
            WireFormat::Cbor => {
                let mut buf = Vec::new();
                ciborium::into_writer(message, &mut buf)
                    .map_err(|e| SyncError::SerializationError(e.to_string()))?;
                Ok(buf)
            }
        }
    }

    pub fn decode<T: DeserializeOwned>(self, frame: &[u8]) -> Result<T, SyncError> {
        match self {
            WireFormat::Json => {
                serde_json::from_slice(frame).map_err(|e| SyncError::SerializationError(e.to_string()))
            }
            WireFormat::Cbor => {
                ciborium::from_reader(frame).map_err(|e| SyncError::SerializationError(e.to_string()))
            }
        }
    }
}

/// A framed connection between a client replica and the server.
#[async_trait]
pub trait SyncConnection: Send + Sync {
    async fn send(&self, frame: &[u8]) -> Result<(), SyncError>;

    /// Next frame from the peer. `ConnectionClosed` once either side closes.
    async fn recv(&self) -> Result<Vec<u8>, SyncError>;

    async fn close(&self);

    fn is_connected(&self) -> bool;
}

/// In-process connection over tokio channels.
pub struct ChannelConnection {
    tx: mpsc::Sender<Vec<u8>>,
    rx: Mutex<mpsc::Receiver<Vec<u8>>>,
    connected: Arc<AtomicBool>,
}

impl ChannelConnection {
    /// Two connected ends.
    pub fn pair() -> (Arc<ChannelConnection>, Arc<ChannelConnection>) {
        let (a_tx, b_rx) = mpsc::channel(256);
        let (b_tx, a_rx) = mpsc::channel(256);
        let connected = Arc::new(AtomicBool::new(true));
        let a = ChannelConnection {
            tx: a_tx,
            rx: Mutex::new(a_rx),
            connected: Arc::clone(&connected),
        };
        let b = ChannelConnection {
            tx: b_tx,
            rx: Mutex::new(b_rx),
            connected,
        };
        (Arc::new(a), Arc::new(b))
    }
}

#[async_trait]
impl SyncConnection for ChannelConnection {
    async fn send(&self, frame: &[u8]) -> Result<(), SyncError> {
        if !self.is_connected() {
            return Err(SyncError::ConnectionClosed);
        }
        self.tx
            .send(frame.to_vec())
            .await
            .map_err(|_| SyncError::ConnectionClosed)
    }

    async fn recv(&self) -> Result<Vec<u8>, SyncError> {
        let mut rx = self.rx.lock().await;
        if !self.is_connected() {
            return Err(SyncError::ConnectionClosed);
        }
        rx.recv().await.ok_or(SyncError::ConnectionClosed)
    }

    async fn close(&self) {
        self.connected.store(false, Ordering::SeqCst);
        // wake a peer blocked in recv()
        let _ = self.tx.try_send(Vec::new());
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }
}

/// Shared server state: the reconciler plus the live connection of every
/// replica.
pub struct SyncHub {
    server: Mutex<ServerSync>,
    connections: RwLock<HashMap<String, Arc<dyn SyncConnection>>>,
    config: SyncConfig,
    format: WireFormat,
}

impl SyncHub {
    pub fn new(server: ServerSync, config: SyncConfig, format: WireFormat) -> Arc<Self> {
        Arc::new(Self {
            server: Mutex::new(server),
            connections: RwLock::new(HashMap::new()),
            config,
            format,
        })
    }

    pub fn server(&self) -> &Mutex<ServerSync> {
        &self.server
    }

    pub async fn connected_replicas(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.connections.read().await.keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Serve one client connection until it closes or goes quiet for longer
    /// than a heartbeat interval plus its timeout.
    pub fn serve_connection(self: &Arc<Self>, conn: Arc<dyn SyncConnection>) -> tokio::task::JoinHandle<()> {
        let hub = Arc::clone(self);
        let idle_limit = self.config.heartbeat_interval() + self.config.heartbeat_timeout();
        tokio::spawn(async move {
            let mut replica_id: Option<String> = None;
            loop {
                let frame = tokio::select! {
                    frame = conn.recv() => frame,
                    _ = tokio::time::sleep(idle_limit) => {
                        log::info!("Connection for {:?} went quiet, dropping it", replica_id);
                        break;
                    }
                };
                let frame = match frame {
                    Ok(frame) if frame.is_empty() => continue,
                    Ok(frame) => frame,
                    Err(_) => break,
                };
                let message: ClientMessage = match hub.format.decode(&frame) {
                    Ok(message) => message,
                    Err(e) => {
                        log::warn!("Dropping malformed frame from {:?}: {}", replica_id, e);
                        continue;
                    }
                };
                if let ClientMessage::Sync { replica_id: id, .. } = &message {
                    hub.connections
                        .write()
                        .await
                        .insert(id.clone(), Arc::clone(&conn));
                    replica_id = Some(id.clone());
                }

                let result = hub.server.lock().await.handle(message, Utc::now()).await;
                let outgoing = match result {
                    Ok(outgoing) => outgoing,
                    Err(e) => {
                        log::warn!("Rejected message from {:?}: {}", replica_id, e);
                        vec![Outgoing {
                            to: Recipient::Reply,
                            message: ServerMessage::Error { message: e.to_string() },
                        }]
                    }
                };
                hub.route(&conn, outgoing).await;
            }

            conn.close().await;
            if let Some(id) = replica_id {
                hub.connections.write().await.remove(&id);
                match hub.server.lock().await.disconnect(&id).await {
                    Ok(outgoing) => hub.route(&conn, outgoing).await,
                    Err(e) => log::warn!("Failed to disconnect {}: {}", id, e),
                }
            }
        })
    }

    async fn route(&self, reply_to: &Arc<dyn SyncConnection>, outgoing: Vec<Outgoing>) {
        for Outgoing { to, message } in outgoing {
            let frame = match self.format.encode(&message) {
                Ok(frame) => frame,
                Err(e) => {
                    log::warn!("Failed to encode {:?}: {}", message, e);
                    continue;
                }
            };
            let targets: Vec<Arc<dyn SyncConnection>> = match to {
                Recipient::Reply => vec![Arc::clone(reply_to)],
                Recipient::Replicas(ids) => {
                    let conns = self.connections.read().await;
                    ids.iter().filter_map(|id| conns.get(id).cloned()).collect()
                }
            };
            for conn in targets {
                if let Err(e) = conn.send(&frame).await {
                    log::debug!("Send failed: {}", e);
                }
            }
        }
    }
}

async fn send_all(conn: &dyn SyncConnection, format: WireFormat, messages: Vec<ClientMessage>) -> Result<(), SyncError> {
    for message in messages {
        conn.send(&format.encode(&message)?).await?;
    }
    Ok(())
}

/// Drive one client connection: handshake, then relay messages and timers
/// until the connection fails. A message the client refuses is logged and
/// dropped. Leaves the client `Disconnected`.
pub async fn run_client(
    client: Arc<Mutex<ClientSync>>,
    conn: Arc<dyn SyncConnection>,
    format: WireFormat,
    tick: Duration,
) -> Result<(), SyncError> {
    let hello = client.lock().await.connect(false);
    let result = async {
        send_all(conn.as_ref(), format, vec![hello]).await?;
        loop {
            tokio::select! {
                frame = conn.recv() => {
                    let frame = frame?;
                    if frame.is_empty() {
                        continue;
                    }
                    let message: ServerMessage = match format.decode(&frame) {
                        Ok(message) => message,
                        Err(e) => {
                            log::warn!("Dropping malformed frame from server: {}", e);
                            continue;
                        }
                    };
                    let replies = match client.lock().await.handle(message, Instant::now()) {
                        Ok(replies) => replies,
                        Err(SyncError::Protocol(e)) => {
                            log::warn!("Ignoring server message: {}", e);
                            continue;
                        }
                        Err(e) => return Err(e),
                    };
                    send_all(conn.as_ref(), format, replies).await?;
                }
                _ = tokio::time::sleep(tick) => {
                    let (out, state) = {
                        let mut client = client.lock().await;
                        let out = client.poll(Instant::now());
                        (out, client.state())
                    };
                    send_all(conn.as_ref(), format, out).await?;
                    if state == ConnectionState::Disconnected {
                        return Err::<(), SyncError>(SyncError::ConnectionClosed);
                    }
                }
            }
        }
    }
    .await;

    conn.close().await;
    client.lock().await.disconnected();
    result
}

/// Keep a client connected, reconnecting with exponential backoff until
/// `shutdown` flips to true.
pub async fn maintain_connection<F, Fut>(
    client: Arc<Mutex<ClientSync>>,
    connect: F,
    format: WireFormat,
    tick: Duration,
    mut shutdown: watch::Receiver<bool>,
) where
    F: Fn() -> Fut,
    Fut: Future<Output = Result<Arc<dyn SyncConnection>, SyncError>>,
{
    while !*shutdown.borrow() {
        match connect().await {
            Ok(conn) => {
                let session = run_client(Arc::clone(&client), Arc::clone(&conn), format, tick);
                tokio::select! {
                    result = session => {
                        if let Err(e) = result {
                            log::info!("Sync session ended: {}", e);
                        }
                    }
                    _ = shutdown.changed() => {
                        conn.close().await;
                        client.lock().await.disconnected();
                        break;
                    }
                }
            }
            Err(e) => {
                log::warn!("Connect failed: {}", e);
                client.lock().await.disconnected();
            }
        }
        let delay = client.lock().await.reconnect_delay();
        tokio::select! {
            _ = tokio::time::sleep(delay) => {}
            _ = shutdown.changed() => break,
        }
    }
}
