//! WebSocket front end for an [`Authority`].
//!
//! ```text
//! Client A ──┐                       ┌──► Ack / Reject (to the submitter)
//!            ├── Join / Edit ──► Authority ──► journal (RocksDB or memory)
//! Client B ──┘                       └──► DocumentRoom ──► Edit (everyone else)
//! ```
//!
//! One task per connection. A connection joins exactly one document; the
//! first Join opens the document on this node (lock + recovery) and the
//! last connection to leave closes it (final checkpoint + unlock).

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use futures_util::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, RwLock};
use tokio_tungstenite::tungstenite::Message;
use uuid::Uuid;

use loom_core::DocumentId;

use crate::authority::Authority;
use crate::broadcast::Frame;
use crate::persistence::{PersistenceConfig, PersistenceEngine};
use crate::protocol::{Ack, MessageType, PeerInfo, Rejection, SyncMessage};
use crate::storage::{DocumentStore, StoreConfig, StoreError};

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub bind_addr: String,
    /// Frames buffered per connection before it starts lagging
    pub broadcast_capacity: usize,
    /// RocksDB directory; `None` keeps everything in memory
    pub storage_path: Option<PathBuf>,
    pub persistence: PersistenceConfig,
    /// How often idle documents are checkpointed and their leases renewed
    pub tick_interval: Duration,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:9090".to_string(),
            broadcast_capacity: 256,
            storage_path: None,
            persistence: PersistenceConfig::default(),
            tick_interval: Duration::from_secs(5),
        }
    }
}

impl ServerConfig {
    /// In memory, ephemeral port.
    pub fn for_testing() -> Self {
        Self {
            bind_addr: "127.0.0.1:0".to_string(),
            broadcast_capacity: 64,
            storage_path: None,
            persistence: PersistenceConfig::for_testing(),
            tick_interval: Duration::from_millis(200),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct ServerStats {
    pub total_connections: u64,
    pub active_connections: u64,
    pub total_messages: u64,
    pub total_bytes: u64,
    pub edits_accepted: u64,
    pub edits_rejected: u64,
}

pub struct SyncServer {
    config: ServerConfig,
    authority: Arc<Authority>,
    stats: Arc<RwLock<ServerStats>>,
    store: Option<Arc<DocumentStore>>,
}

impl SyncServer {
    /// Opens the RocksDB store when `storage_path` is set.
    pub fn new(config: ServerConfig) -> Result<Self, StoreError> {
        let store = match &config.storage_path {
            Some(path) => Some(Arc::new(DocumentStore::open(StoreConfig {
                path: path.clone(),
                ..StoreConfig::default()
            })?)),
            None => None,
        };
        let engine = match &store {
            Some(store) => PersistenceEngine::with_store(store.clone(), config.persistence.clone()),
            None => PersistenceEngine::in_memory(config.persistence.clone()),
        };
        let authority = Arc::new(Authority::new(Arc::new(engine), config.broadcast_capacity));
        Ok(Self { config, authority, stats: Arc::new(RwLock::new(ServerStats::default())), store })
    }

    /// Bind `bind_addr` and serve until the listener fails.
    pub async fn run(&self) -> Result<(), Box<dyn std::error::Error>> {
        let listener = TcpListener::bind(&self.config.bind_addr).await?;
        log::info!("Sync server listening on {}", listener.local_addr()?);
        if let Some(store) = &self.store {
            log::info!("Persisting to {}", store.path().display());
        }
        self.serve(listener).await?;
        Ok(())
    }

    /// Accept connections on an already bound listener.
    pub async fn serve(&self, listener: TcpListener) -> std::io::Result<()> {
        let ticker = {
            let authority = self.authority.clone();
            let period = self.config.tick_interval;
            tokio::spawn(async move {
                let mut interval = tokio::time::interval(period);
                loop {
                    interval.tick().await;
                    let written = authority.tick().await;
                    if written > 0 {
                        log::debug!("Periodic checkpoint wrote {written} documents");
                    }
                }
            })
        };

        let result = loop {
            let (stream, addr) = match listener.accept().await {
                Ok(accepted) => accepted,
                Err(e) => break Err(e),
            };
            log::debug!("New TCP connection from {addr}");

            let authority = self.authority.clone();
            let stats = self.stats.clone();
            tokio::spawn(async move {
                if let Err(e) = Self::handle_connection(stream, addr, authority, stats).await {
                    log::error!("Connection error from {addr}: {e}");
                }
            });
        };
        ticker.abort();
        result
    }

    async fn handle_connection(
        stream: TcpStream,
        addr: SocketAddr,
        authority: Arc<Authority>,
        stats: Arc<RwLock<ServerStats>>,
    ) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        let ws_stream = tokio_tungstenite::accept_async(stream).await?;
        let (mut ws_sender, mut ws_receiver) = ws_stream.split();
        log::info!("WebSocket connection established from {addr}");

        {
            let mut s = stats.write().await;
            s.total_connections += 1;
            s.active_connections += 1;
        }

        let mut peer_id: Option<Uuid> = None;
        let mut doc_id: Option<DocumentId> = None;
        let mut broadcast_rx: Option<broadcast::Receiver<Frame>> = None;

        let outcome: Result<(), Box<dyn std::error::Error + Send + Sync>> = async {
            loop {
                tokio::select! {
                    msg = ws_receiver.next() => {
                        match msg {
                            Some(Ok(Message::Binary(data))) => {
                                let bytes: Vec<u8> = data.into();
                                let sync_msg = match SyncMessage::decode(&bytes) {
                                    Ok(m) => m,
                                    Err(e) => {
                                        log::warn!("Failed to decode message from {addr}: {e}");
                                        continue;
                                    }
                                };
                                {
                                    let mut s = stats.write().await;
                                    s.total_messages += 1;
                                    s.total_bytes += bytes.len() as u64;
                                }

                                match sync_msg.msg_type {
                                    MessageType::Join => {
                                        if doc_id.is_some() {
                                            log::warn!("Ignoring second Join from {addr}");
                                            continue;
                                        }
                                        let info = sync_msg
                                            .peer_info()
                                            .unwrap_or_else(|_| PeerInfo::with_id(sync_msg.peer_id, "Anonymous"));
                                        // subscribe before the snapshot so no edit falls in between
                                        broadcast_rx = Some(authority.join(sync_msg.doc_id, info.clone()).await?);
                                        peer_id = Some(info.peer_id);
                                        doc_id = Some(sync_msg.doc_id);

                                        let state = authority.snapshot(sync_msg.doc_id).await?;
                                        let reply = SyncMessage::state_sync(sync_msg.doc_id, &state)?;
                                        ws_sender.send(Message::Binary(reply.encode()?.into())).await?;
                                        log::info!(
                                            "Peer {} ({}) joined doc {} at sequence {}",
                                            info.name, info.peer_id, sync_msg.doc_id, state.last_sequence()
                                        );
                                    }

                                    MessageType::Edit => {
                                        let (Some(pid), Some(did)) = (peer_id, doc_id) else {
                                            log::warn!("Edit before Join from {addr}");
                                            continue;
                                        };
                                        let mut edit = sync_msg.property_edit()?;
                                        // the connection's identity is authoritative
                                        edit.client_id = pid;
                                        edit.sequence = None;
                                        let client_seq = edit.client_seq;

                                        let reply = match authority.submit(did, edit).await {
                                            Ok(confirmed) => {
                                                stats.write().await.edits_accepted += 1;
                                                let sequence = confirmed.sequence.unwrap_or_default();
                                                SyncMessage::ack(pid, did, Ack { client_seq, sequence })?
                                            }
                                            Err(e) => {
                                                stats.write().await.edits_rejected += 1;
                                                log::warn!("Rejected edit {client_seq} from {pid}: {e}");
                                                let rejection = Rejection {
                                                    client_seq,
                                                    retryable: e.is_retryable(),
                                                    reason: e.to_string(),
                                                };
                                                SyncMessage::reject(pid, did, &rejection)?
                                            }
                                        };
                                        ws_sender.send(Message::Binary(reply.encode()?.into())).await?;
                                    }

                                    MessageType::Ping => {
                                        let pong = SyncMessage::pong(peer_id.unwrap_or(sync_msg.peer_id));
                                        ws_sender.send(Message::Binary(pong.encode()?.into())).await?;
                                    }

                                    other => {
                                        log::debug!("Unhandled message type from {addr}: {other:?}");
                                    }
                                }
                            }

                            Some(Ok(Message::Close(_))) | None => {
                                log::info!("Connection closed from {addr}");
                                return Ok(());
                            }

                            Some(Ok(Message::Ping(data))) => {
                                ws_sender.send(Message::Pong(data)).await?;
                            }

                            Some(Err(e)) => {
                                log::error!("WebSocket error from {addr}: {e}");
                                return Ok(());
                            }

                            _ => {}
                        }
                    }

                    frame = async {
                        match broadcast_rx.as_mut() {
                            Some(rx) => rx.recv().await,
                            None => std::future::pending().await,
                        }
                    } => {
                        match frame {
                            Ok(data) => {
                                // the submitter learns of its edit through the Ack
                                if let Ok(msg) = SyncMessage::decode(&data) {
                                    if Some(msg.peer_id) == peer_id {
                                        continue;
                                    }
                                }
                                ws_sender.send(Message::Binary(data.to_vec().into())).await?;
                            }
                            Err(broadcast::error::RecvError::Lagged(n)) => {
                                log::warn!("Peer {peer_id:?} lagged by {n} edits, resyncing");
                                if let Some(did) = doc_id {
                                    if let Some(room) = authority.room(did).await {
                                        let total = room.record_dropped(n);
                                        log::debug!("Document {did} has dropped {total} frames so far");
                                    }
                                    let state = authority.snapshot(did).await?;
                                    let resync = SyncMessage::state_sync(did, &state)?;
                                    ws_sender.send(Message::Binary(resync.encode()?.into())).await?;
                                }
                            }
                            Err(broadcast::error::RecvError::Closed) => return Ok(()),
                        }
                    }
                }
            }
        }
        .await;

        if let (Some(pid), Some(did)) = (peer_id, doc_id) {
            Self::leave(&authority, pid, did).await;
        }
        stats.write().await.active_connections -= 1;
        outcome
    }

    async fn leave(authority: &Authority, peer_id: Uuid, doc_id: DocumentId) {
        match authority.leave(doc_id, &peer_id).await {
            Ok(true) => log::debug!("Last peer left, closed document {doc_id}"),
            Ok(false) => {}
            Err(e) => log::error!("Closing document {doc_id} failed: {e}"),
        }
    }

    pub async fn stats(&self) -> ServerStats {
        self.stats.read().await.clone()
    }

    pub fn bind_addr(&self) -> &str {
        &self.config.bind_addr
    }

    pub fn authority(&self) -> &Arc<Authority> {
        &self.authority
    }

    pub fn store(&self) -> Option<&Arc<DocumentStore>> {
        self.store.as_ref()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_server_config_default() {
        let config = ServerConfig::default();
        assert_eq!(config.bind_addr, "127.0.0.1:9090");
        assert_eq!(config.broadcast_capacity, 256);
        assert!(config.storage_path.is_none());
        assert_eq!(config.persistence.checkpoint_interval, Duration::from_secs(1800));
    }

    #[tokio::test]
    async fn test_server_in_memory() {
        let server = SyncServer::new(ServerConfig::default()).unwrap();
        assert_eq!(server.bind_addr(), "127.0.0.1:9090");
        assert!(server.store().is_none());
        let stats = server.stats().await;
        assert_eq!(stats.total_connections, 0);
        assert_eq!(stats.edits_accepted, 0);
    }

    #[tokio::test]
    async fn test_server_with_storage() {
        let dir = tempfile::tempdir().unwrap();
        let config = ServerConfig {
            storage_path: Some(dir.path().join("db")),
            ..ServerConfig::for_testing()
        };
        let server = SyncServer::new(config).unwrap();
        assert!(server.store().is_some());
        assert!(server.authority().open_documents().await.is_empty());
    }

    #[tokio::test]
    async fn test_storage_reused_across_servers() {
        let dir = tempfile::tempdir().unwrap();
        let doc = Uuid::new_v4();
        let obj = Uuid::new_v4();
        let config = ServerConfig { storage_path: Some(dir.path().join("db")), ..ServerConfig::for_testing() };

        {
            let server = SyncServer::new(config.clone()).unwrap();
            let authority = server.authority();
            authority.open_document(doc).await.unwrap();
            let edit = loom_core::PropertyEdit::local(Uuid::new_v4(), 1, obj, loom_core::keys::NAME, "hero".into());
            authority.submit(doc, edit).await.unwrap();
            authority.close_document(doc).await.unwrap();
        }

        let server = SyncServer::new(config).unwrap();
        server.authority().open_document(doc).await.unwrap();
        let state = server.authority().snapshot(doc).await.unwrap();
        assert_eq!(state.value(obj, loom_core::keys::NAME), Some(&"hero".into()));
    }
}
