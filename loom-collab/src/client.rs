//! WebSocket transport for a [`SyncEngine`](crate::sync::SyncEngine).
//!
//! `connect` spawns a writer task fed by an outgoing queue and a reader task
//! that turns server frames into [`ChannelEvent`]s. The application pumps
//! those events into the engine:
//!
//! ```ignore
//! let mut channel = WsChannel::new("ws://127.0.0.1:9090", client_id, doc_id);
//! let mut events = channel.connect().await?;
//! let mut engine = SyncEngine::new(client_id, channel);
//! while let Some(event) = events.recv().await {
//!     engine.handle_event(event);
//! }
//! ```

use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;

use loom_core::{ClientId, DocumentId, PropertyEdit};

use crate::channel::{ChannelEvent, EditChannel};
use crate::protocol::{MessageType, PeerInfo, ProtocolError, SyncMessage};

/// Server events buffered before the reader task waits for the application.
const EVENT_CAPACITY: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ConnectionState {
    Disconnected = 0,
    Connecting = 1,
    Connected = 2,
}

impl ConnectionState {
    fn from_u8(v: u8) -> Self {
        match v {
            1 => ConnectionState::Connecting,
            2 => ConnectionState::Connected,
            _ => ConnectionState::Disconnected,
        }
    }
}

pub struct WsChannel {
    server_url: String,
    peer: PeerInfo,
    doc_id: DocumentId,
    state: Arc<AtomicU8>,
    outgoing_tx: Option<mpsc::UnboundedSender<Vec<u8>>>,
}

impl WsChannel {
    pub fn new(server_url: impl Into<String>, client_id: ClientId, doc_id: DocumentId) -> Self {
        Self::with_name(server_url, PeerInfo::with_id(client_id, "loom-client"), doc_id)
    }

    pub fn with_name(server_url: impl Into<String>, peer: PeerInfo, doc_id: DocumentId) -> Self {
        Self {
            server_url: server_url.into(),
            peer,
            doc_id,
            state: Arc::new(AtomicU8::new(ConnectionState::Disconnected as u8)),
            outgoing_tx: None,
        }
    }

    /// Open the socket, join the document and start the I/O tasks.
    ///
    /// The first event is always [`ChannelEvent::Connected`], followed by
    /// the server's state sync. The stream ends with
    /// [`ChannelEvent::Disconnected`]; call `connect` again to reconnect.
    pub async fn connect(&mut self) -> Result<mpsc::Receiver<ChannelEvent>, ProtocolError> {
        self.set_state(ConnectionState::Connecting);
        let (ws_stream, _) = match tokio_tungstenite::connect_async(&self.server_url).await {
            Ok(connected) => connected,
            Err(e) => {
                self.set_state(ConnectionState::Disconnected);
                return Err(ProtocolError::ConnectionFailed(e.to_string()));
            }
        };
        let (mut ws_writer, mut ws_reader) = ws_stream.split();

        // Unbounded: every queued frame is an edit the engine still holds
        // as unacked, so the engine's queue already bounds this one.
        let (out_tx, mut out_rx) = mpsc::unbounded_channel::<Vec<u8>>();
        let (event_tx, event_rx) = mpsc::channel::<ChannelEvent>(EVENT_CAPACITY);

        // Join goes out ahead of anything the engine sends
        let join = SyncMessage::join(self.doc_id, &self.peer)?.encode()?;
        out_tx.send(join).map_err(|_| ProtocolError::ConnectionClosed)?;

        let url = self.server_url.clone();
        tokio::spawn(async move {
            let mut written = 0usize;
            while let Some(data) = out_rx.recv().await {
                if let Err(e) = ws_writer.send(Message::Binary(data.into())).await {
                    log::debug!("Writer to {url} failed: {e}");
                    break;
                }
                written += 1;
            }
            let _ = ws_writer.close().await;
            log::debug!("Writer to {url} stopped after {written} frames");
        });

        let _ = event_tx.send(ChannelEvent::Connected).await;

        let state = self.state.clone();
        let doc_id = self.doc_id;
        tokio::spawn(async move {
            while let Some(msg) = ws_reader.next().await {
                match msg {
                    Ok(Message::Binary(data)) => {
                        let bytes: Vec<u8> = data.into();
                        let sync_msg = match SyncMessage::decode(&bytes) {
                            Ok(m) => m,
                            Err(e) => {
                                log::warn!("Dropping undecodable frame: {e}");
                                continue;
                            }
                        };
                        if sync_msg.doc_id != doc_id && sync_msg.msg_type != MessageType::Pong {
                            continue;
                        }
                        if let Some(event) = to_event(&sync_msg) {
                            if event_tx.send(event).await.is_err() {
                                break;
                            }
                        }
                    }
                    Ok(Message::Close(_)) | Err(_) => break,
                    _ => {}
                }
            }
            state.store(ConnectionState::Disconnected as u8, Ordering::SeqCst);
            let _ = event_tx.send(ChannelEvent::Disconnected).await;
        });

        self.outgoing_tx = Some(out_tx);
        self.set_state(ConnectionState::Connected);
        log::info!("Connected to {} for document {}", self.server_url, self.doc_id);
        Ok(event_rx)
    }

    /// Stop sending; the writer closes the socket once its queue drains.
    pub fn disconnect(&mut self) {
        self.outgoing_tx = None;
        self.set_state(ConnectionState::Disconnected);
    }

    pub fn ping(&self) -> Result<(), ProtocolError> {
        let frame = SyncMessage::ping(self.peer.peer_id).encode()?;
        self.enqueue(frame)
    }

    pub fn state(&self) -> ConnectionState {
        ConnectionState::from_u8(self.state.load(Ordering::SeqCst))
    }

    pub fn doc_id(&self) -> DocumentId {
        self.doc_id
    }

    pub fn server_url(&self) -> &str {
        &self.server_url
    }

    /// Hand a frame to the writer task. Fails once the writer is gone, and
    /// marks the channel disconnected so the caller reconnects.
    fn enqueue(&self, frame: Vec<u8>) -> Result<(), ProtocolError> {
        let tx = match (&self.outgoing_tx, self.state()) {
            (Some(tx), ConnectionState::Connected) => tx,
            _ => return Err(ProtocolError::ConnectionClosed),
        };
        if tx.send(frame).is_err() {
            self.set_state(ConnectionState::Disconnected);
            return Err(ProtocolError::ConnectionClosed);
        }
        Ok(())
    }

    fn set_state(&self, state: ConnectionState) {
        self.state.store(state as u8, Ordering::SeqCst);
    }
}

impl EditChannel for WsChannel {
    /// An edit that cannot be queued (not connected, or the writer
    /// stopped) stays in the engine's unacked queue and goes out again on
    /// reconnect.
    fn send(&mut self, edit: &PropertyEdit) {
        let frame = match SyncMessage::edit(self.doc_id, edit).and_then(|m| m.encode()) {
            Ok(frame) => frame,
            Err(e) => {
                log::error!("Could not encode edit {}: {e}", edit.client_seq);
                return;
            }
        };
        if self.enqueue(frame).is_err() {
            log::debug!("Not connected, edit {} stays queued", edit.client_seq);
        }
    }
}

fn to_event(msg: &SyncMessage) -> Option<ChannelEvent> {
    let parsed = match msg.msg_type {
        MessageType::Edit => msg.property_edit().map(ChannelEvent::Edit),
        MessageType::Ack => msg.ack_payload().map(ChannelEvent::Ack),
        MessageType::Reject => msg.rejection().map(ChannelEvent::Rejected),
        MessageType::StateSync => msg.document_state().map(ChannelEvent::StateSynced),
        MessageType::Pong => {
            log::trace!("Pong from server");
            return None;
        }
        other => {
            log::debug!("Unexpected {other:?} from server");
            return None;
        }
    };
    match parsed {
        Ok(event) => Some(event),
        Err(e) => {
            log::warn!("Malformed {:?} payload: {e}", msg.msg_type);
            None
        }
    }
}
