//! Persistence engine: sequencing, journaling, checkpoints and recovery
//! for the documents this node holds a lease on.
//!
//! ```text
//!  edit ──► lease check ──► next sequence ──► JournalStore::append ──► Ok(entry)
//!                              (per-doc mutex)
//!
//!  every checkpoint_interval:  DocumentState ──► SnapshotStore::put
//!
//!  recovery:  SnapshotStore::get ──► replay journal (checkpoint.sequence + 1 ..)
//! ```
//!
//! Sequence numbers are handed out before the append is attempted, so a
//! failed append leaves a gap and the number is never reused.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use loom_core::{now_millis, DocumentId, DocumentState, PropertyEdit};
use uuid::Uuid;

use crate::storage::{
    Checkpoint, DocumentStore, JournalEntry, JournalStore, LockError, LockLease, LockService,
    MemoryJournal, MemoryLockService, MemorySnapshotStore, SnapshotStore, StoreError,
};

#[derive(Debug, Clone)]
pub struct PersistenceConfig {
    /// Minimum time between two checkpoints of one document (default: 30 min)
    pub checkpoint_interval: Duration,
    /// Lifetime of a write lease (default: 30s)
    pub lease_ttl: Duration,
    /// Renew the lease once less than this is left (default: 10s)
    pub lease_renew_margin: Duration,
    /// Identity written into leases
    pub holder_id: String,
}

impl Default for PersistenceConfig {
    fn default() -> Self {
        Self {
            checkpoint_interval: Duration::from_secs(30 * 60),
            lease_ttl: Duration::from_secs(30),
            lease_renew_margin: Duration::from_secs(10),
            holder_id: format!("loom-{}", Uuid::new_v4()),
        }
    }
}

impl PersistenceConfig {
    /// Checkpoint on every tick, short leases.
    pub fn for_testing() -> Self {
        Self {
            checkpoint_interval: Duration::ZERO,
            lease_ttl: Duration::from_secs(5),
            lease_renew_margin: Duration::from_secs(1),
            holder_id: "test-node".to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum PersistenceError {
    /// No lease is held for the document on this node.
    NotLocked(DocumentId),
    Lock(LockError),
    /// The journal refused the entry; `sequence` is burned.
    Journal { doc_id: DocumentId, sequence: u64, source: StoreError },
    Snapshot(StoreError),
    Store(StoreError),
}

impl PersistenceError {
    /// Whether the client should keep the edit and resend it later.
    ///
    /// A missing or lost lease is transient: the authority takes it back on
    /// its next tick, or the holder that took it over lets it lapse.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            PersistenceError::NotLocked(_)
                | PersistenceError::Journal { .. }
                | PersistenceError::Lock(LockError::Held { .. } | LockError::NotHolder)
        )
    }
}

impl std::fmt::Display for PersistenceError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PersistenceError::NotLocked(doc) => write!(f, "No lease held for document {doc}"),
            PersistenceError::Lock(e) => write!(f, "Lease error: {e}"),
            PersistenceError::Journal { doc_id, sequence, source } => {
                write!(f, "Journal append failed for {doc_id} at sequence {sequence}: {source}")
            }
            PersistenceError::Snapshot(e) => write!(f, "Checkpoint error: {e}"),
            PersistenceError::Store(e) => write!(f, "Store error: {e}"),
        }
    }
}

impl std::error::Error for PersistenceError {}

impl From<LockError> for PersistenceError {
    fn from(e: LockError) -> Self {
        PersistenceError::Lock(e)
    }
}

impl From<StoreError> for PersistenceError {
    fn from(e: StoreError) -> Self {
        PersistenceError::Store(e)
    }
}

/// What [`PersistenceEngine::recover_from_failure`] rebuilt.
#[derive(Debug, Clone)]
pub struct Recovered {
    pub state: DocumentState,
    /// Sequence of the checkpoint used, `0` when starting empty
    pub checkpoint_sequence: u64,
    pub replayed: usize,
    pub corrupted: usize,
}

/// Per-document bookkeeping, guarded by its own mutex.
struct DocSlot {
    lease: Option<LockLease>,
    /// Next sequence to hand out; `0` until the journal has been consulted
    next_sequence: u64,
    last_checkpoint_at: Instant,
    last_checkpoint_sequence: u64,
}

impl DocSlot {
    fn new() -> Self {
        Self {
            lease: None,
            next_sequence: 0,
            last_checkpoint_at: Instant::now(),
            last_checkpoint_sequence: 0,
        }
    }
}

pub struct PersistenceEngine {
    journal: Arc<dyn JournalStore>,
    snapshots: Arc<dyn SnapshotStore>,
    locks: Arc<dyn LockService>,
    config: PersistenceConfig,
    slots: Mutex<HashMap<DocumentId, Arc<Mutex<DocSlot>>>>,
}

impl PersistenceEngine {
    pub fn new(
        journal: Arc<dyn JournalStore>,
        snapshots: Arc<dyn SnapshotStore>,
        locks: Arc<dyn LockService>,
        config: PersistenceConfig,
    ) -> Self {
        Self { journal, snapshots, locks, config, slots: Mutex::new(HashMap::new()) }
    }

    /// All three stores in process memory.
    pub fn in_memory(config: PersistenceConfig) -> Self {
        Self::new(
            Arc::new(MemoryJournal::new()),
            Arc::new(MemorySnapshotStore::new()),
            Arc::new(MemoryLockService::new()),
            config,
        )
    }

    /// All three stores backed by one RocksDB instance.
    pub fn with_store(store: Arc<DocumentStore>, config: PersistenceConfig) -> Self {
        Self::new(store.clone(), store.clone(), store, config)
    }

    pub fn config(&self) -> &PersistenceConfig {
        &self.config
    }

    /// Take the write lease for `doc_id`.
    pub fn acquire_lock(&self, doc_id: DocumentId) -> Result<LockLease, PersistenceError> {
        let slot = self.slot(doc_id)?;
        let mut slot = lock_slot(&slot)?;

        let lease = match self.locks.acquire(doc_id, &self.config.holder_id, self.config.lease_ttl) {
            Ok(lease) => lease,
            Err(e) => {
                log::warn!("Could not lock document {doc_id}: {e}");
                return Err(e.into());
            }
        };
        // another node may have appended while we did not hold the lease
        let last = self.journal.last_sequence(doc_id)?;
        slot.next_sequence = slot.next_sequence.max(last + 1);
        slot.lease = Some(lease.clone());
        log::debug!("Locked document {doc_id} until {}", lease.expires_at_ms);
        Ok(lease)
    }

    pub fn release_lock(&self, doc_id: DocumentId) -> Result<(), PersistenceError> {
        let slot = self.slot(doc_id)?;
        let mut slot = lock_slot(&slot)?;
        if let Some(lease) = slot.lease.take() {
            self.locks.release(&lease)?;
            log::debug!("Released document {doc_id}");
        }
        Ok(())
    }

    pub fn holds_lock(&self, doc_id: DocumentId) -> bool {
        self.slot(doc_id)
            .ok()
            .and_then(|slot| slot.lock().ok().map(|s| s.lease.is_some()))
            .unwrap_or(false)
    }

    /// Renew the lease if it is due. Idle documents call this from a timer
    /// so the lease does not lapse between edits.
    pub fn keep_alive(&self, doc_id: DocumentId) -> Result<(), PersistenceError> {
        let slot = self.slot(doc_id)?;
        let mut slot = lock_slot(&slot)?;
        self.ensure_lease(doc_id, &mut slot)
    }

    /// Sequence reflected by the last checkpoint written or recovered.
    pub fn last_checkpoint_sequence(&self, doc_id: DocumentId) -> u64 {
        self.slot(doc_id)
            .ok()
            .and_then(|slot| slot.lock().ok().map(|s| s.last_checkpoint_sequence))
            .unwrap_or(0)
    }

    /// Assign the next sequence to `edit` and append it durably.
    ///
    /// Returns the journal entry; its `edit` carries the sequence.
    pub fn append_to_journal(
        &self,
        doc_id: DocumentId,
        edit: PropertyEdit,
    ) -> Result<JournalEntry, PersistenceError> {
        let slot = self.slot(doc_id)?;
        let mut slot = lock_slot(&slot)?;
        self.ensure_lease(doc_id, &mut slot)?;

        let sequence = slot.next_sequence.max(1);
        slot.next_sequence = sequence + 1;

        let entry = JournalEntry::new(doc_id, sequence, edit, now_millis())?;
        if let Err(source) = self.journal.append(&entry) {
            log::warn!("Journal append failed for {doc_id} at sequence {sequence}: {source}");
            return Err(PersistenceError::Journal { doc_id, sequence, source });
        }
        log::trace!("Journaled {doc_id}#{sequence} {}/{}", entry.edit.object_id, entry.edit.key);
        Ok(entry)
    }

    /// Write `state` as the document's checkpoint.
    pub fn save_checkpoint(
        &self,
        doc_id: DocumentId,
        state: &DocumentState,
    ) -> Result<Checkpoint, PersistenceError> {
        let slot = self.slot(doc_id)?;
        let mut slot = lock_slot(&slot)?;
        self.ensure_lease(doc_id, &mut slot)?;

        let checkpoint = Checkpoint {
            doc_id,
            sequence: state.last_sequence(),
            state: state.clone(),
            saved_at_ms: now_millis(),
        };
        self.snapshots.put(&checkpoint).map_err(PersistenceError::Snapshot)?;

        slot.last_checkpoint_at = Instant::now();
        slot.last_checkpoint_sequence = checkpoint.sequence;
        log::info!(
            "Checkpointed document {doc_id} at sequence {} ({} objects)",
            checkpoint.sequence,
            state.object_count()
        );
        Ok(checkpoint)
    }

    /// Checkpoint if the interval has passed and anything changed since
    /// the last one. Failures are logged and retried on a later tick.
    pub fn maybe_checkpoint(&self, doc_id: DocumentId, state: &DocumentState) -> Option<Checkpoint> {
        let due = {
            let slot = self.slot(doc_id).ok()?;
            let slot = slot.lock().ok()?;
            slot.last_checkpoint_at.elapsed() >= self.config.checkpoint_interval
                && state.last_sequence() > slot.last_checkpoint_sequence
        };
        if !due {
            return None;
        }
        match self.save_checkpoint(doc_id, state) {
            Ok(checkpoint) => Some(checkpoint),
            Err(e) => {
                log::warn!("Checkpoint of {doc_id} deferred: {e}");
                None
            }
        }
    }

    /// Rebuild a document from its latest checkpoint plus the journal
    /// entries after it.
    ///
    /// An unreadable checkpoint counts as absent and the whole journal is
    /// replayed instead. Corrupted journal entries are skipped.
    pub fn recover_from_failure(&self, doc_id: DocumentId) -> Result<Recovered, PersistenceError> {
        let checkpoint = match self.snapshots.get(doc_id) {
            Ok(Some(cp)) if cp.doc_id == doc_id => Some(cp),
            Ok(Some(_)) => {
                log::warn!("Checkpoint for {doc_id} belongs to another document, ignoring it");
                None
            }
            Ok(None) => None,
            Err(e) => {
                log::warn!("Checkpoint for {doc_id} unreadable, replaying full journal: {e}");
                None
            }
        };
        let (mut state, checkpoint_sequence) = match checkpoint {
            Some(cp) => (cp.state, cp.sequence),
            None => (DocumentState::new(), 0),
        };

        let (entries, corrupted) = self.journal.read_from(doc_id, checkpoint_sequence + 1)?;
        if corrupted > 0 {
            log::warn!("Skipped {corrupted} corrupted journal entries of {doc_id}");
        }
        for entry in &entries {
            state.apply_sequenced(&entry.edit);
        }

        let slot = self.slot(doc_id)?;
        let mut slot = lock_slot(&slot)?;
        slot.last_checkpoint_sequence = checkpoint_sequence;
        slot.last_checkpoint_at = Instant::now();
        if let Some(last) = entries.last() {
            slot.next_sequence = slot.next_sequence.max(last.sequence + 1);
        }

        log::info!(
            "Recovered document {doc_id}: checkpoint {checkpoint_sequence}, {} replayed, {corrupted} corrupted",
            entries.len()
        );
        Ok(Recovered { state, checkpoint_sequence, replayed: entries.len(), corrupted })
    }

    /// Renew the lease if it is close to (or past) expiry.
    fn ensure_lease(&self, doc_id: DocumentId, slot: &mut DocSlot) -> Result<(), PersistenceError> {
        let lease = slot.lease.as_ref().ok_or(PersistenceError::NotLocked(doc_id))?;
        let margin = self.config.lease_renew_margin.as_millis() as u64;
        if lease.remaining_ms(now_millis()) > margin {
            return Ok(());
        }
        match self.locks.renew(lease, self.config.lease_ttl) {
            Ok(renewed) => {
                slot.lease = Some(renewed);
                Ok(())
            }
            Err(e) => {
                log::warn!("Lost lease on {doc_id}: {e}");
                slot.lease = None;
                Err(e.into())
            }
        }
    }

    fn slot(&self, doc_id: DocumentId) -> Result<Arc<Mutex<DocSlot>>, PersistenceError> {
        let mut slots = self
            .slots
            .lock()
            .map_err(|_| PersistenceError::Store(StoreError::Unavailable("slot table poisoned".into())))?;
        Ok(slots.entry(doc_id).or_insert_with(|| Arc::new(Mutex::new(DocSlot::new()))).clone())
    }
}

fn lock_slot(slot: &Mutex<DocSlot>) -> Result<std::sync::MutexGuard<'_, DocSlot>, PersistenceError> {
    slot.lock()
        .map_err(|_| PersistenceError::Store(StoreError::Unavailable("document slot poisoned".into())))
}
