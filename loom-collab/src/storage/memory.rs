//! In-process stores. Journal records are kept encoded, the same bytes the
//! RocksDB store writes, so corruption handling is exercised identically.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use loom_core::{now_millis, DocumentId};

use super::{
    extend_lease, grant_lease, Checkpoint, JournalEntry, JournalStore, LockError, LockLease,
    LockService, SnapshotStore, StoreError,
};

fn poisoned<T>(_: T) -> StoreError {
    StoreError::Unavailable("store mutex poisoned".into())
}

#[derive(Default)]
pub struct MemoryJournal {
    records: Mutex<HashMap<DocumentId, BTreeMap<u64, Vec<u8>>>>,
    fail_appends: AtomicBool,
}

impl MemoryJournal {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every following append fail until switched off again.
    pub fn set_fail_appends(&self, fail: bool) {
        self.fail_appends.store(fail, Ordering::SeqCst);
    }

    /// Overwrite the raw record at `sequence`. Used to simulate disk
    /// corruption.
    pub fn overwrite_raw(&self, doc_id: DocumentId, sequence: u64, bytes: Vec<u8>) {
        if let Ok(mut records) = self.records.lock() {
            records.entry(doc_id).or_default().insert(sequence, bytes);
        }
    }

    pub fn len(&self, doc_id: DocumentId) -> usize {
        self.records.lock().map_or(0, |r| r.get(&doc_id).map_or(0, BTreeMap::len))
    }
}

impl JournalStore for MemoryJournal {
    fn append(&self, entry: &JournalEntry) -> Result<(), StoreError> {
        if self.fail_appends.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable("journal append rejected".into()));
        }
        let bytes = entry.encode()?;
        self.records
            .lock()
            .map_err(poisoned)?
            .entry(entry.doc_id)
            .or_default()
            .insert(entry.sequence, bytes);
        Ok(())
    }

    fn read_from(
        &self,
        doc_id: DocumentId,
        from_sequence: u64,
    ) -> Result<(Vec<JournalEntry>, usize), StoreError> {
        let records = self.records.lock().map_err(poisoned)?;
        let Some(doc) = records.get(&doc_id) else {
            return Ok((Vec::new(), 0));
        };
        Ok(JournalEntry::decode_all(doc.range(from_sequence..).map(|(_, b)| b.as_slice())))
    }

    fn last_sequence(&self, doc_id: DocumentId) -> Result<u64, StoreError> {
        let records = self.records.lock().map_err(poisoned)?;
        Ok(records
            .get(&doc_id)
            .and_then(|doc| doc.keys().next_back().copied())
            .unwrap_or(0))
    }
}

#[derive(Default)]
pub struct MemorySnapshotStore {
    blobs: Mutex<HashMap<DocumentId, Vec<u8>>>,
    fail_puts: AtomicBool,
}

impl MemorySnapshotStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_fail_puts(&self, fail: bool) {
        self.fail_puts.store(fail, Ordering::SeqCst);
    }

    pub fn overwrite_raw(&self, doc_id: DocumentId, bytes: Vec<u8>) {
        if let Ok(mut blobs) = self.blobs.lock() {
            blobs.insert(doc_id, bytes);
        }
    }
}

impl SnapshotStore for MemorySnapshotStore {
    fn put(&self, checkpoint: &Checkpoint) -> Result<(), StoreError> {
        if self.fail_puts.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable("snapshot write rejected".into()));
        }
        let bytes = checkpoint.encode()?;
        self.blobs.lock().map_err(poisoned)?.insert(checkpoint.doc_id, bytes);
        Ok(())
    }

    fn get(&self, doc_id: DocumentId) -> Result<Option<Checkpoint>, StoreError> {
        let blobs = self.blobs.lock().map_err(poisoned)?;
        blobs.get(&doc_id).map(|b| Checkpoint::decode(b)).transpose()
    }
}

#[derive(Default)]
pub struct MemoryLockService {
    leases: Mutex<HashMap<DocumentId, LockLease>>,
}

impl MemoryLockService {
    pub fn new() -> Self {
        Self::default()
    }
}

impl LockService for MemoryLockService {
    fn acquire(
        &self,
        doc_id: DocumentId,
        holder: &str,
        ttl: Duration,
    ) -> Result<LockLease, LockError> {
        let mut leases = self.leases.lock().map_err(poisoned)?;
        let lease = grant_lease(leases.get(&doc_id), doc_id, holder, ttl, now_millis())?;
        leases.insert(doc_id, lease.clone());
        Ok(lease)
    }

    fn renew(&self, lease: &LockLease, ttl: Duration) -> Result<LockLease, LockError> {
        let mut leases = self.leases.lock().map_err(poisoned)?;
        let renewed = extend_lease(leases.get(&lease.doc_id), lease, ttl, now_millis())?;
        leases.insert(lease.doc_id, renewed.clone());
        Ok(renewed)
    }

    fn release(&self, lease: &LockLease) -> Result<(), LockError> {
        let mut leases = self.leases.lock().map_err(poisoned)?;
        if leases.get(&lease.doc_id).is_some_and(|l| l.token == lease.token) {
            leases.remove(&lease.doc_id);
        }
        Ok(())
    }
}
