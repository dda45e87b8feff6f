//! # loom-collab: synchronization and persistence for Loom documents
//!
//! ```text
//! ┌──────────────┐   EditChannel    ┌──────────────┐
//! │ SyncEngine   │ ───────────────► │ Authority    │──► PersistenceEngine
//! │ (per client) │ ◄─────────────── │ (per node)   │      │ journal
//! └──────────────┘  Edit/Ack/Reject └──────┬───────┘      │ checkpoints
//!   optimistic state                       │              │ leases
//!   unacked queue                   ┌──────┴───────┐      ▼
//!                                   │ Rooms        │   RocksDB / memory
//!                                   │ (fan-out)    │
//!                                   └──────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`sync`]: client engine: optimistic apply, last-writer-wins by
//!   server sequence, resend on reconnect
//! - [`persistence`]: sequencing, journal, checkpoints, recovery, leases
//! - [`storage`]: journal/snapshot/lock traits with memory and RocksDB
//!   implementations
//! - [`authority`]: per-document ordering and fan-out
//! - [`protocol`]: bincode wire messages
//! - [`broadcast`]: per-document tokio broadcast rooms
//! - [`channel`], [`client`]: transports (in-memory loopback, WebSocket)
//! - [`server`]: WebSocket server hosting an authority

pub mod authority;
pub mod broadcast;
pub mod channel;
pub mod client;
pub mod persistence;
pub mod protocol;
pub mod server;
pub mod storage;
pub mod sync;

pub use authority::{Authority, AuthorityError};
pub use broadcast::{DocumentRoom, Frame, RoomStats, Rooms};
pub use channel::{ChannelEvent, EditChannel, LoopbackChannel};
pub use client::{ConnectionState, WsChannel};
pub use persistence::{PersistenceConfig, PersistenceEngine, PersistenceError, Recovered};
pub use protocol::{Ack, MessageType, PeerInfo, ProtocolError, Rejection, SyncMessage};
pub use server::{ServerConfig, ServerStats, SyncServer};
pub use storage::{
    Checkpoint, DocumentStore, JournalEntry, JournalStore, LockError, LockLease, LockService,
    MemoryJournal, MemoryLockService, MemorySnapshotStore, SnapshotStore, StoreConfig, StoreError,
};
pub use sync::{RemoteOutcome, SubscriptionId, SyncEngine, SyncError};
