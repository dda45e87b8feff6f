//! Durable storage behind the persistence engine.
//!
//! ```text
//!                       ┌──────────────────────────────────────┐
//!  PersistenceEngine ──►│ JournalStore   append-only, per doc  │
//!                       │ SnapshotStore  one checkpoint per doc│
//!                       │ LockService    leases with expiry    │
//!                       └──────────────┬───────────────────────┘
//!                                      │
//!                  ┌───────────────────┴──────────────────┐
//!                  ▼                                      ▼
//!          memory::Memory*                      rocks::DocumentStore
//!          (tests, single process)              CF journal / checkpoints /
//!                                               locks / meta
//! ```
//!
//! All three seams are object-safe so the engine can hold any mix of
//! implementations behind `Arc<dyn ...>`.

pub mod journal;
pub mod memory;
pub mod rocks;

use serde::{Deserialize, Serialize};
use std::time::Duration;
use uuid::Uuid;

use loom_core::{DocumentId, DocumentState};

pub use journal::JournalEntry;
pub use memory::{MemoryJournal, MemoryLockService, MemorySnapshotStore};
pub use rocks::{DocumentStore, StoreConfig};

/// Append-only, per-document journal of sequenced edits.
pub trait JournalStore: Send + Sync {
    /// Durably append one entry. Returns only once the entry is stored.
    fn append(&self, entry: &JournalEntry) -> Result<(), StoreError>;

    /// Entries of `doc_id` with `sequence >= from_sequence`, in sequence
    /// order, plus the number of corrupted entries that were skipped.
    fn read_from(
        &self,
        doc_id: DocumentId,
        from_sequence: u64,
    ) -> Result<(Vec<JournalEntry>, usize), StoreError>;

    /// Highest sequence ever appended for `doc_id`, `0` if none.
    fn last_sequence(&self, doc_id: DocumentId) -> Result<u64, StoreError>;
}

/// One checkpoint per document; a new one overwrites the old.
pub trait SnapshotStore: Send + Sync {
    fn put(&self, checkpoint: &Checkpoint) -> Result<(), StoreError>;

    fn get(&self, doc_id: DocumentId) -> Result<Option<Checkpoint>, StoreError>;
}

/// Exclusive, expiring write leases on documents.
pub trait LockService: Send + Sync {
    /// Take the lease for `doc_id`. Fails with [`LockError::Held`] while
    /// another holder's lease is unexpired. Re-acquiring one's own lease
    /// extends it.
    fn acquire(&self, doc_id: DocumentId, holder: &str, ttl: Duration)
        -> Result<LockLease, LockError>;

    /// Extend a lease that is still ours.
    fn renew(&self, lease: &LockLease, ttl: Duration) -> Result<LockLease, LockError>;

    /// Give the lease up. Releasing a lease we no longer hold is a no-op.
    fn release(&self, lease: &LockLease) -> Result<(), LockError>;
}

/// Full document state and the journal sequence it reflects.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Checkpoint {
    pub doc_id: DocumentId,
    /// Every journal entry up to and including this sequence is folded in.
    pub sequence: u64,
    pub state: DocumentState,
    pub saved_at_ms: u64,
}

impl Checkpoint {
    pub(crate) fn encode(&self) -> Result<Vec<u8>, StoreError> {
        bincode::serde::encode_to_vec(self, bincode::config::standard())
            .map_err(|e| StoreError::SerializationError(e.to_string()))
    }

    pub(crate) fn decode(bytes: &[u8]) -> Result<Self, StoreError> {
        let (checkpoint, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
            .map_err(|e| StoreError::DeserializationError(e.to_string()))?;
        Ok(checkpoint)
    }
}

/// A write lease on one document.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockLease {
    pub doc_id: DocumentId,
    pub holder: String,
    /// Distinguishes successive leases of the same holder.
    pub token: Uuid,
    pub expires_at_ms: u64,
}

impl LockLease {
    pub fn is_expired(&self, now_ms: u64) -> bool {
        now_ms >= self.expires_at_ms
    }

    /// Milliseconds left before expiry, `0` once expired.
    pub fn remaining_ms(&self, now_ms: u64) -> u64 {
        self.expires_at_ms.saturating_sub(now_ms)
    }

    pub(crate) fn encode(&self) -> Result<Vec<u8>, StoreError> {
        bincode::serde::encode_to_vec(self, bincode::config::standard())
            .map_err(|e| StoreError::SerializationError(e.to_string()))
    }

    pub(crate) fn decode(bytes: &[u8]) -> Result<Self, StoreError> {
        let (lease, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
            .map_err(|e| StoreError::DeserializationError(e.to_string()))?;
        Ok(lease)
    }
}

/// Storage errors.
#[derive(Debug, Clone, PartialEq)]
pub enum StoreError {
    /// RocksDB internal error
    DatabaseError(String),
    SerializationError(String),
    DeserializationError(String),
    CompressionError(String),
    /// Store refused the operation (injected failures, shutdown)
    Unavailable(String),
}

impl std::fmt::Display for StoreError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StoreError::DatabaseError(e) => write!(f, "Database error: {e}"),
            StoreError::SerializationError(e) => write!(f, "Serialization error: {e}"),
            StoreError::DeserializationError(e) => write!(f, "Deserialization error: {e}"),
            StoreError::CompressionError(e) => write!(f, "Compression error: {e}"),
            StoreError::Unavailable(e) => write!(f, "Store unavailable: {e}"),
        }
    }
}

impl std::error::Error for StoreError {}

impl From<rocksdb::Error> for StoreError {
    fn from(e: rocksdb::Error) -> Self {
        StoreError::DatabaseError(e.to_string())
    }
}

/// Lease errors.
#[derive(Debug, Clone, PartialEq)]
pub enum LockError {
    /// Another holder owns an unexpired lease.
    Held { holder: String, expires_at_ms: u64 },
    /// The lease was lost (expired and taken, or released).
    NotHolder,
    Store(StoreError),
}

impl std::fmt::Display for LockError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LockError::Held { holder, expires_at_ms } => {
                write!(f, "Lock held by {holder} until {expires_at_ms}")
            }
            LockError::NotHolder => write!(f, "Lock is not held by this holder"),
            LockError::Store(e) => write!(f, "Lock store error: {e}"),
        }
    }
}

impl std::error::Error for LockError {}

impl From<StoreError> for LockError {
    fn from(e: StoreError) -> Self {
        LockError::Store(e)
    }
}

/// Lease arbitration shared by every [`LockService`]: given the current
/// record (if any), decide the new one.
pub(crate) fn grant_lease(
    current: Option<&LockLease>,
    doc_id: DocumentId,
    holder: &str,
    ttl: Duration,
    now_ms: u64,
) -> Result<LockLease, LockError> {
    if let Some(existing) = current {
        if existing.holder != holder && !existing.is_expired(now_ms) {
            return Err(LockError::Held {
                holder: existing.holder.clone(),
                expires_at_ms: existing.expires_at_ms,
            });
        }
    }
    Ok(LockLease {
        doc_id,
        holder: holder.to_string(),
        token: Uuid::new_v4(),
        expires_at_ms: now_ms + ttl.as_millis() as u64,
    })
}

/// Renewal succeeds while the stored record is still this lease, even past
/// expiry as long as nobody else took it.
pub(crate) fn extend_lease(
    current: Option<&LockLease>,
    lease: &LockLease,
    ttl: Duration,
    now_ms: u64,
) -> Result<LockLease, LockError> {
    match current {
        Some(existing) if existing.token == lease.token => Ok(LockLease {
            expires_at_ms: now_ms + ttl.as_millis() as u64,
            ..existing.clone()
        }),
        _ => Err(LockError::NotHolder),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_grant_lease_contention() {
        let doc = Uuid::new_v4();
        let ttl = Duration::from_secs(30);
        let first = grant_lease(None, doc, "a", ttl, 1_000).unwrap();
        assert_eq!(first.expires_at_ms, 31_000);

        let err = grant_lease(Some(&first), doc, "b", ttl, 2_000).unwrap_err();
        assert_eq!(err, LockError::Held { holder: "a".into(), expires_at_ms: 31_000 });

        // expired leases can be taken over
        let second = grant_lease(Some(&first), doc, "b", ttl, 31_000).unwrap();
        assert_eq!(second.holder, "b");
    }

    #[test]
    fn test_same_holder_reacquires() {
        let doc = Uuid::new_v4();
        let ttl = Duration::from_secs(1);
        let first = grant_lease(None, doc, "a", ttl, 0).unwrap();
        let again = grant_lease(Some(&first), doc, "a", ttl, 500).unwrap();
        assert_eq!(again.expires_at_ms, 1_500);
        assert_ne!(again.token, first.token);
    }

    #[test]
    fn test_extend_requires_same_token() {
        let doc = Uuid::new_v4();
        let ttl = Duration::from_secs(10);
        let lease = grant_lease(None, doc, "a", ttl, 0).unwrap();
        let renewed = extend_lease(Some(&lease), &lease, ttl, 5_000).unwrap();
        assert_eq!(renewed.expires_at_ms, 15_000);
        assert_eq!(renewed.token, lease.token);

        let other = grant_lease(None, doc, "b", ttl, 0).unwrap();
        assert_eq!(extend_lease(Some(&other), &lease, ttl, 0), Err(LockError::NotHolder));
        assert_eq!(extend_lease(None, &lease, ttl, 0), Err(LockError::NotHolder));
    }

    #[test]
    fn test_lease_remaining() {
        let lease = LockLease {
            doc_id: Uuid::new_v4(),
            holder: "a".into(),
            token: Uuid::new_v4(),
            expires_at_ms: 100,
        };
        assert_eq!(lease.remaining_ms(40), 60);
        assert_eq!(lease.remaining_ms(400), 0);
        assert!(lease.is_expired(100));
        assert!(!lease.is_expired(99));
    }

    #[test]
    fn test_store_error_display() {
        let err = StoreError::Unavailable("injected".into());
        assert_eq!(err.to_string(), "Store unavailable: injected");
        let lock: LockError = err.into();
        assert!(lock.to_string().contains("injected"));
    }
}
