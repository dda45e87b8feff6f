//! Binary protocol between clients and the authority.
//!
//! Wire format (bincode-encoded):
//! ```text
//! ┌──────────┬───────────┬──────────┬──────────┬──────────┐
//! │ msg_type │ peer_id   │ doc_id   │ clock    │ payload  │
//! │ 1 byte   │ 16 bytes  │ 16 bytes │ varint   │ variable │
//! └──────────┴───────────┴──────────┴──────────┴──────────┘
//! ```
//!
//! `clock` carries the journal sequence for server-originated messages
//! (Edit, Ack, StateSync) and the client submission counter for client
//! edits. `payload` is itself bincode, typed by `msg_type`.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use loom_core::{DocumentId, DocumentState, PropertyEdit};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum MessageType {
    /// Client joins a document; payload is [`PeerInfo`]
    Join = 1,
    /// A property edit; unsequenced from clients, sequenced from the server
    Edit = 2,
    /// Server confirms a client edit; payload is [`Ack`]
    Ack = 3,
    /// Server refuses a client edit; payload is [`Rejection`]
    Reject = 4,
    /// Full document state, sent after Join
    StateSync = 5,
    Ping = 6,
    Pong = 7,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PeerInfo {
    pub peer_id: Uuid,
    pub name: String,
}

impl PeerInfo {
    pub fn new(name: impl Into<String>) -> Self {
        Self::with_id(Uuid::new_v4(), name)
    }

    pub fn with_id(peer_id: Uuid, name: impl Into<String>) -> Self {
        Self { peer_id, name: name.into() }
    }
}

/// Confirmation that the client's edit `client_seq` was journaled at
/// `sequence`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Ack {
    pub client_seq: u64,
    pub sequence: u64,
}

/// Refusal of the client's edit `client_seq`.
///
/// A retryable rejection leaves the edit queued for resend; any other is
/// final.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Rejection {
    pub client_seq: u64,
    pub retryable: bool,
    pub reason: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncMessage {
    pub msg_type: MessageType,
    pub peer_id: Uuid,
    pub doc_id: Uuid,
    pub clock: u64,
    pub payload: Vec<u8>,
}

impl SyncMessage {
    fn with_payload<T: Serialize>(
        msg_type: MessageType,
        peer_id: Uuid,
        doc_id: DocumentId,
        clock: u64,
        payload: &T,
    ) -> Result<Self, ProtocolError> {
        let payload = bincode::serde::encode_to_vec(payload, bincode::config::standard())
            .map_err(|e| ProtocolError::SerializationError(e.to_string()))?;
        Ok(Self { msg_type, peer_id, doc_id, clock, payload })
    }

    pub fn join(doc_id: DocumentId, info: &PeerInfo) -> Result<Self, ProtocolError> {
        Self::with_payload(MessageType::Join, info.peer_id, doc_id, 0, info)
    }

    /// An edit sent on behalf of `edit.client_id`.
    pub fn edit(doc_id: DocumentId, edit: &PropertyEdit) -> Result<Self, ProtocolError> {
        let clock = edit.sequence.unwrap_or(edit.client_seq);
        Self::with_payload(MessageType::Edit, edit.client_id, doc_id, clock, edit)
    }

    pub fn ack(peer_id: Uuid, doc_id: DocumentId, ack: Ack) -> Result<Self, ProtocolError> {
        Self::with_payload(MessageType::Ack, peer_id, doc_id, ack.sequence, &ack)
    }

    pub fn reject(
        peer_id: Uuid,
        doc_id: DocumentId,
        rejection: &Rejection,
    ) -> Result<Self, ProtocolError> {
        Self::with_payload(MessageType::Reject, peer_id, doc_id, 0, rejection)
    }

    pub fn state_sync(doc_id: DocumentId, state: &DocumentState) -> Result<Self, ProtocolError> {
        Self::with_payload(MessageType::StateSync, Uuid::nil(), doc_id, state.last_sequence(), state)
    }

    pub fn ping(peer_id: Uuid) -> Self {
        Self { msg_type: MessageType::Ping, peer_id, doc_id: Uuid::nil(), clock: 0, payload: Vec::new() }
    }

    pub fn pong(peer_id: Uuid) -> Self {
        Self { msg_type: MessageType::Pong, peer_id, doc_id: Uuid::nil(), clock: 0, payload: Vec::new() }
    }

    pub fn encode(&self) -> Result<Vec<u8>, ProtocolError> {
        bincode::serde::encode_to_vec(self, bincode::config::standard())
            .map_err(|e| ProtocolError::SerializationError(e.to_string()))
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, ProtocolError> {
        let (msg, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
            .map_err(|e| ProtocolError::DeserializationError(e.to_string()))?;
        Ok(msg)
    }

    fn parse<T: DeserializeOwned>(&self, expected: MessageType) -> Result<T, ProtocolError> {
        if self.msg_type != expected {
            return Err(ProtocolError::InvalidMessageType);
        }
        let (value, _) = bincode::serde::decode_from_slice(&self.payload, bincode::config::standard())
            .map_err(|e| ProtocolError::DeserializationError(e.to_string()))?;
        Ok(value)
    }

    pub fn peer_info(&self) -> Result<PeerInfo, ProtocolError> {
        self.parse(MessageType::Join)
    }

    pub fn property_edit(&self) -> Result<PropertyEdit, ProtocolError> {
        self.parse(MessageType::Edit)
    }

    pub fn ack_payload(&self) -> Result<Ack, ProtocolError> {
        self.parse(MessageType::Ack)
    }

    pub fn rejection(&self) -> Result<Rejection, ProtocolError> {
        self.parse(MessageType::Reject)
    }

    pub fn document_state(&self) -> Result<DocumentState, ProtocolError> {
        self.parse(MessageType::StateSync)
    }
}

/// Protocol errors.
#[derive(Debug, Clone, PartialEq)]
pub enum ProtocolError {
    SerializationError(String),
    DeserializationError(String),
    InvalidMessageType,
    ConnectionClosed,
    ConnectionFailed(String),
}

impl std::fmt::Display for ProtocolError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::SerializationError(e) => write!(f, "Serialization error: {e}"),
            Self::DeserializationError(e) => write!(f, "Deserialization error: {e}"),
            Self::InvalidMessageType => write!(f, "Invalid message type"),
            Self::ConnectionClosed => write!(f, "Connection closed"),
            Self::ConnectionFailed(e) => write!(f, "Connection failed: {e}"),
        }
    }
}

impl std::error::Error for ProtocolError {}
