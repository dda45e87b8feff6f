//! The sequencing authority: the one place edits of a document are
//! ordered, made durable and fanned out.
//!
//! ```text
//!  submit(doc, edit) ──► type check ──► journal (assigns sequence)
//!                                           │
//!                         DocumentState ◄───┤ apply
//!                                           ├── checkpoint tick
//!                                           ▼
//!                                 DocumentRoom (all peers of doc)
//! ```
//!
//! Transport agnostic: the WebSocket server and in-process tests drive
//! the same methods.

use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{broadcast, Mutex, RwLock};
use uuid::Uuid;

use loom_core::{keys, DocumentId, DocumentState, PropertyEdit, PropertyValue, ValueKind};

use crate::broadcast::{DocumentRoom, Frame, Rooms};
use crate::persistence::{PersistenceEngine, PersistenceError};
use crate::protocol::{PeerInfo, ProtocolError, SyncMessage};

#[derive(Debug, Clone, PartialEq)]
pub enum AuthorityError {
    /// The document has not been opened on this node.
    NotOpen(DocumentId),
    TypeMismatch { key: String, expected: ValueKind, found: ValueKind },
    Persistence(PersistenceError),
    Protocol(ProtocolError),
}

impl AuthorityError {
    /// Whether a client should keep the edit queued and try again.
    pub fn is_retryable(&self) -> bool {
        match self {
            AuthorityError::Persistence(e) => e.is_retryable(),
            AuthorityError::NotOpen(_) => true,
            _ => false,
        }
    }
}

impl std::fmt::Display for AuthorityError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AuthorityError::NotOpen(doc) => write!(f, "Document {doc} is not open"),
            AuthorityError::TypeMismatch { key, expected, found } => {
                write!(f, "Property {key} expects {expected}, got {found}")
            }
            AuthorityError::Persistence(e) => write!(f, "{e}"),
            AuthorityError::Protocol(e) => write!(f, "{e}"),
        }
    }
}

impl std::error::Error for AuthorityError {}

impl From<PersistenceError> for AuthorityError {
    fn from(e: PersistenceError) -> Self {
        AuthorityError::Persistence(e)
    }
}

impl From<ProtocolError> for AuthorityError {
    fn from(e: ProtocolError) -> Self {
        AuthorityError::Protocol(e)
    }
}

type DocumentTable = HashMap<DocumentId, Arc<Mutex<DocumentState>>>;

pub struct Authority {
    persistence: Arc<PersistenceEngine>,
    rooms: Rooms,
    documents: RwLock<DocumentTable>,
}

impl Authority {
    pub fn new(persistence: Arc<PersistenceEngine>, broadcast_capacity: usize) -> Self {
        Self {
            persistence,
            rooms: Rooms::new(broadcast_capacity),
            documents: RwLock::new(HashMap::new()),
        }
    }

    pub fn persistence(&self) -> &Arc<PersistenceEngine> {
        &self.persistence
    }

    /// Lock and recover `doc_id`, or return at once if it is already open
    /// here. Returns the document's room.
    pub async fn open_document(&self, doc_id: DocumentId) -> Result<Arc<DocumentRoom>, AuthorityError> {
        {
            let documents = self.documents.read().await;
            if documents.contains_key(&doc_id) {
                return Ok(self.rooms.get_or_create(doc_id).await);
            }
        }

        let mut documents = self.documents.write().await;
        self.open_locked(&mut documents, doc_id)?;
        drop(documents);
        Ok(self.rooms.get_or_create(doc_id).await)
    }

    /// Open `doc_id` if needed and register `peer` in its room.
    ///
    /// Runs under the document table's write lock, so it cannot interleave
    /// with [`leave`](Self::leave) closing the same document.
    pub async fn join(
        &self,
        doc_id: DocumentId,
        peer: PeerInfo,
    ) -> Result<broadcast::Receiver<Frame>, AuthorityError> {
        let mut documents = self.documents.write().await;
        self.open_locked(&mut documents, doc_id)?;
        let room = self.rooms.get_or_create(doc_id).await;
        Ok(room.add_peer(peer).await)
    }

    /// Remove `peer_id` from the document's room and close the document
    /// once nobody is left. Returns whether it was closed.
    pub async fn leave(&self, doc_id: DocumentId, peer_id: &Uuid) -> Result<bool, AuthorityError> {
        let mut documents = self.documents.write().await;
        let Some(room) = self.rooms.get(&doc_id).await else {
            return Ok(false);
        };
        if room.remove_peer(peer_id).await.is_none() {
            log::debug!("Peer {peer_id} was not in document {doc_id}");
        }
        if room.peer_count().await > 0 || !documents.contains_key(&doc_id) {
            return Ok(false);
        }
        self.close_locked(&mut documents, doc_id).await?;
        Ok(true)
    }

    fn open_locked(&self, documents: &mut DocumentTable, doc_id: DocumentId) -> Result<(), AuthorityError> {
        if documents.contains_key(&doc_id) {
            return Ok(());
        }
        self.persistence.acquire_lock(doc_id)?;
        let recovered = match self.persistence.recover_from_failure(doc_id) {
            Ok(recovered) => recovered,
            Err(e) => {
                self.release_after_failure(doc_id);
                return Err(e.into());
            }
        };
        log::info!(
            "Opened document {doc_id} at sequence {} ({} objects)",
            recovered.state.last_sequence(),
            recovered.state.object_count()
        );
        documents.insert(doc_id, Arc::new(Mutex::new(recovered.state)));
        Ok(())
    }

    fn release_after_failure(&self, doc_id: DocumentId) {
        if let Err(e) = self.persistence.release_lock(doc_id) {
            log::warn!("Releasing {doc_id} after a failed open: {e}");
        }
    }

    /// Sequence, journal, apply and fan out one client edit.
    ///
    /// The returned edit carries its sequence. Nothing is applied or
    /// broadcast unless the journal append succeeded.
    pub async fn submit(
        &self,
        doc_id: DocumentId,
        edit: PropertyEdit,
    ) -> Result<PropertyEdit, AuthorityError> {
        let document = self.document(doc_id).await?;
        let mut state = document.lock().await;

        check_kind(&state, &edit)?;
        let entry = self.persistence.append_to_journal(doc_id, edit)?;
        let confirmed = entry.edit;
        state.apply_sequenced(&confirmed);
        self.persistence.maybe_checkpoint(doc_id, &state);

        // journaled already; a fan-out failure only costs peers a resync
        if let Some(room) = self.rooms.get(&doc_id).await {
            match SyncMessage::edit(doc_id, &confirmed) {
                Ok(msg) => {
                    if let Err(e) = room.broadcast(&msg) {
                        log::error!("Fan-out of {doc_id}#{} failed: {e}", entry.sequence);
                    }
                }
                Err(e) => log::error!("Could not encode {doc_id}#{}: {e}", entry.sequence),
            }
        }
        Ok(confirmed)
    }

    /// Copy of the authoritative state.
    pub async fn snapshot(&self, doc_id: DocumentId) -> Result<DocumentState, AuthorityError> {
        let document = self.document(doc_id).await?;
        let state = document.lock().await;
        Ok(state.clone())
    }

    /// Checkpoint open documents whose interval has passed and keep their
    /// leases alive. A document whose lease lapsed is locked again and
    /// rebuilt from storage. Returns how many checkpoints were written.
    pub async fn tick(&self) -> usize {
        let documents: Vec<(DocumentId, Arc<Mutex<DocumentState>>)> = self
            .documents
            .read()
            .await
            .iter()
            .map(|(id, doc)| (*id, doc.clone()))
            .collect();

        let mut written = 0;
        for (doc_id, document) in documents {
            if let Err(e) = self.persistence.keep_alive(doc_id) {
                log::warn!("Lease keep-alive for {doc_id} failed: {e}");
                if let Err(e) = self.reclaim(doc_id, &document).await {
                    log::warn!("Could not reclaim {doc_id}, retrying next tick: {e}");
                }
                continue;
            }
            let state = document.lock().await;
            if self.persistence.maybe_checkpoint(doc_id, &state).is_some() {
                written += 1;
            }
        }
        written
    }

    /// Take the lease again after losing it and replace the in-memory state
    /// with what storage holds, since another holder may have appended in
    /// the meantime. Peers get a state sync when anything moved.
    async fn reclaim(&self, doc_id: DocumentId, document: &Mutex<DocumentState>) -> Result<(), AuthorityError> {
        let mut state = document.lock().await;
        self.persistence.acquire_lock(doc_id)?;
        let recovered = match self.persistence.recover_from_failure(doc_id) {
            Ok(recovered) => recovered,
            Err(e) => {
                self.release_after_failure(doc_id);
                return Err(e.into());
            }
        };
        let moved = recovered.state != *state;
        *state = recovered.state;
        log::info!("Reclaimed lease on {doc_id} at sequence {}", state.last_sequence());

        if moved {
            if let Some(room) = self.rooms.get(&doc_id).await {
                let resync = SyncMessage::state_sync(doc_id, &state)?;
                room.broadcast(&resync)?;
            }
        }
        Ok(())
    }

    /// Write a final checkpoint if anything changed and give up the lease.
    pub async fn close_document(&self, doc_id: DocumentId) -> Result<(), AuthorityError> {
        let mut documents = self.documents.write().await;
        self.close_locked(&mut documents, doc_id).await
    }

    async fn close_locked(&self, documents: &mut DocumentTable, doc_id: DocumentId) -> Result<(), AuthorityError> {
        let Some(document) = documents.remove(&doc_id) else {
            return Err(AuthorityError::NotOpen(doc_id));
        };
        let state = document.lock().await;
        if state.last_sequence() > self.persistence.last_checkpoint_sequence(doc_id) {
            if let Err(e) = self.persistence.save_checkpoint(doc_id, &state) {
                // the journal still has everything
                log::warn!("Final checkpoint of {doc_id} failed: {e}");
            }
        }
        self.rooms.remove_if_empty(&doc_id).await;
        self.persistence.release_lock(doc_id)?;
        log::info!("Closed document {doc_id} at sequence {}", state.last_sequence());
        Ok(())
    }

    pub async fn room(&self, doc_id: DocumentId) -> Option<Arc<DocumentRoom>> {
        self.rooms.get(&doc_id).await
    }

    pub async fn is_open(&self, doc_id: DocumentId) -> bool {
        self.documents.read().await.contains_key(&doc_id)
    }

    pub async fn open_documents(&self) -> Vec<DocumentId> {
        self.documents.read().await.keys().cloned().collect()
    }

    async fn document(&self, doc_id: DocumentId) -> Result<Arc<Mutex<DocumentState>>, AuthorityError> {
        self.documents
            .read()
            .await
            .get(&doc_id)
            .cloned()
            .ok_or(AuthorityError::NotOpen(doc_id))
    }
}

/// Well-known keys have a fixed kind; anything else must keep the kind of
/// its current value.
fn check_kind(state: &DocumentState, edit: &PropertyEdit) -> Result<(), AuthorityError> {
    let expected = keys::expected_kind(&edit.key)
        .or_else(|| state.value(edit.object_id, &edit.key).map(PropertyValue::kind));
    match expected {
        Some(expected) if expected != edit.value.kind() => Err(AuthorityError::TypeMismatch {
            key: edit.key.clone(),
            expected,
            found: edit.value.kind(),
        }),
        _ => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::persistence::PersistenceConfig;
    use crate::protocol::MessageType;
    use crate::storage::{
        JournalEntry, JournalStore, LockService, MemoryJournal, MemoryLockService, MemorySnapshotStore,
    };
    use std::time::Duration;

    fn authority() -> Authority {
        Authority::new(Arc::new(PersistenceEngine::in_memory(PersistenceConfig::for_testing())), 64)
    }

    fn edit(client: Uuid, seq: u64, object: Uuid, value: f64) -> PropertyEdit {
        PropertyEdit::local(client, seq, object, keys::X, value.into())
    }

    #[tokio::test]
    async fn test_submit_requires_open_document() {
        let authority = authority();
        let doc = Uuid::new_v4();
        let err = authority.submit(doc, edit(Uuid::new_v4(), 1, Uuid::new_v4(), 1.0)).await.unwrap_err();
        assert_eq!(err, AuthorityError::NotOpen(doc));
    }

    #[tokio::test]
    async fn test_submit_sequences_and_broadcasts() {
        let authority = authority();
        let doc = Uuid::new_v4();
        let mut rx = authority.join(doc, PeerInfo::new("watcher")).await.unwrap();

        let obj = Uuid::new_v4();
        let client = Uuid::new_v4();
        let first = authority.submit(doc, edit(client, 1, obj, 1.0)).await.unwrap();
        let second = authority.submit(doc, edit(client, 2, obj, 2.0)).await.unwrap();
        assert_eq!(first.sequence, Some(1));
        assert_eq!(second.sequence, Some(2));

        let frame = rx.recv().await.unwrap();
        let msg = SyncMessage::decode(&frame).unwrap();
        assert_eq!(msg.peer_id, client);
        assert_eq!(msg.property_edit().unwrap(), first);

        let state = authority.snapshot(doc).await.unwrap();
        assert_eq!(state.value(obj, keys::X), Some(&2.0f64.into()));
        assert_eq!(state.last_sequence(), 2);
    }

    #[tokio::test]
    async fn test_type_mismatch_is_final() {
        let authority = authority();
        let doc = Uuid::new_v4();
        authority.open_document(doc).await.unwrap();
        let bad = PropertyEdit::local(Uuid::new_v4(), 1, Uuid::new_v4(), keys::WIDTH, "wide".into());
        let err = authority.submit(doc, bad).await.unwrap_err();
        assert!(matches!(err, AuthorityError::TypeMismatch { .. }));
        assert!(!err.is_retryable());
        assert_eq!(authority.snapshot(doc).await.unwrap().last_sequence(), 0);
    }

    #[tokio::test]
    async fn test_journal_failure_is_retryable_and_not_applied() {
        let journal = Arc::new(MemoryJournal::new());
        let engine = PersistenceEngine::new(
            journal.clone(),
            Arc::new(MemorySnapshotStore::new()),
            Arc::new(MemoryLockService::new()),
            PersistenceConfig::for_testing(),
        );
        let authority = Authority::new(Arc::new(engine), 16);
        let doc = Uuid::new_v4();
        authority.open_document(doc).await.unwrap();

        journal.set_fail_appends(true);
        let obj = Uuid::new_v4();
        let err = authority.submit(doc, edit(Uuid::new_v4(), 1, obj, 1.0)).await.unwrap_err();
        assert!(err.is_retryable());
        assert!(authority.snapshot(doc).await.unwrap().value(obj, keys::X).is_none());

        journal.set_fail_appends(false);
        let ok = authority.submit(doc, edit(Uuid::new_v4(), 2, obj, 1.0)).await.unwrap();
        // sequence 1 was burned by the failed append
        assert_eq!(ok.sequence, Some(2));
        assert_eq!(journal.last_sequence(doc).unwrap(), 2);
    }

    #[tokio::test]
    async fn test_close_and_reopen_recovers() {
        let engine = Arc::new(PersistenceEngine::in_memory(PersistenceConfig::for_testing()));
        let authority = Authority::new(engine.clone(), 16);
        let doc = Uuid::new_v4();
        let obj = Uuid::new_v4();
        authority.open_document(doc).await.unwrap();
        authority.submit(doc, edit(Uuid::new_v4(), 1, obj, 7.0)).await.unwrap();
        let before = authority.snapshot(doc).await.unwrap();

        authority.close_document(doc).await.unwrap();
        assert!(!authority.is_open(doc).await);
        assert!(!engine.holds_lock(doc));
        assert_eq!(authority.close_document(doc).await, Err(AuthorityError::NotOpen(doc)));

        authority.open_document(doc).await.unwrap();
        assert_eq!(authority.snapshot(doc).await.unwrap(), before);
    }

    #[tokio::test]
    async fn test_open_is_idempotent() {
        let authority = authority();
        let doc = Uuid::new_v4();
        let a = authority.open_document(doc).await.unwrap();
        let b = authority.open_document(doc).await.unwrap();
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(authority.open_documents().await, vec![doc]);
    }

    #[tokio::test]
    async fn test_lost_lease_is_retryable_and_reclaimed() {
        let journal = Arc::new(MemoryJournal::new());
        let locks = Arc::new(MemoryLockService::new());
        let config = PersistenceConfig {
            lease_ttl: Duration::from_millis(20),
            lease_renew_margin: Duration::from_millis(5),
            ..PersistenceConfig::for_testing()
        };
        let engine = Arc::new(PersistenceEngine::new(
            journal.clone(),
            Arc::new(MemorySnapshotStore::new()),
            locks.clone(),
            config,
        ));
        let authority = Authority::new(engine.clone(), 16);
        let doc = Uuid::new_v4();
        let obj = Uuid::new_v4();
        let mut rx = authority.join(doc, PeerInfo::new("watcher")).await.unwrap();
        authority.submit(doc, edit(Uuid::new_v4(), 1, obj, 1.0)).await.unwrap();
        rx.recv().await.unwrap();

        // the lease lapses; another node takes the document and writes to it
        tokio::time::sleep(Duration::from_millis(40)).await;
        let intruder = locks.acquire(doc, "intruder", Duration::from_secs(5)).unwrap();
        let theirs = edit(Uuid::new_v4(), 1, obj, 9.0);
        journal.append(&JournalEntry::new(doc, 2, theirs, 0).unwrap()).unwrap();

        let err = authority.submit(doc, edit(Uuid::new_v4(), 2, obj, 2.0)).await.unwrap_err();
        assert!(err.is_retryable(), "{err}");

        // still held elsewhere
        authority.tick().await;
        assert!(!engine.holds_lock(doc));
        let err = authority.submit(doc, edit(Uuid::new_v4(), 2, obj, 2.0)).await.unwrap_err();
        assert_eq!(err, AuthorityError::Persistence(PersistenceError::NotLocked(doc)));
        assert!(err.is_retryable());

        locks.release(&intruder).unwrap();
        authority.tick().await;
        assert!(engine.holds_lock(doc));
        let resync = SyncMessage::decode(&rx.recv().await.unwrap()).unwrap();
        assert_eq!(resync.msg_type, MessageType::StateSync);
        assert_eq!(resync.document_state().unwrap().value(obj, keys::X), Some(&9.0f64.into()));

        let retried = authority.submit(doc, edit(Uuid::new_v4(), 2, obj, 2.0)).await.unwrap();
        assert_eq!(retried.sequence, Some(3));
        assert_eq!(authority.snapshot(doc).await.unwrap().value(obj, keys::X), Some(&2.0f64.into()));
    }

    #[tokio::test]
    async fn test_leave_closes_only_when_empty() {
        let authority = authority();
        let doc = Uuid::new_v4();
        let alice = PeerInfo::new("alice");
        let bob = PeerInfo::new("bob");
        let _a = authority.join(doc, alice.clone()).await.unwrap();
        let _b = authority.join(doc, bob.clone()).await.unwrap();

        assert!(!authority.leave(doc, &alice.peer_id).await.unwrap());
        assert!(authority.is_open(doc).await);
        assert!(authority.leave(doc, &bob.peer_id).await.unwrap());
        assert!(!authority.is_open(doc).await);
        assert!(!authority.persistence().holds_lock(doc));
        assert!(authority.room(doc).await.is_none());
        // leaving a closed document is a no-op
        assert!(!authority.leave(doc, &bob.peer_id).await.unwrap());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_join_racing_last_leave() {
        let authority = Arc::new(authority());
        let doc = Uuid::new_v4();
        for round in 1..=50u64 {
            let leaving = PeerInfo::new("leaving");
            let joiner = PeerInfo::new("joiner");
            let _rx = authority.join(doc, leaving.clone()).await.unwrap();

            let left = {
                let authority = authority.clone();
                tokio::spawn(async move { authority.leave(doc, &leaving.peer_id).await })
            };
            let joined = {
                let authority = authority.clone();
                let joiner = joiner.clone();
                tokio::spawn(async move { authority.join(doc, joiner).await })
            };
            left.await.unwrap().unwrap();
            let _joiner_rx = joined.await.unwrap().unwrap();

            // whichever ran first, the joiner ends up in an open document
            let accepted = authority.submit(doc, edit(joiner.peer_id, round, Uuid::new_v4(), 1.0)).await;
            assert!(accepted.is_ok(), "round {round}: {accepted:?}");
            assert!(authority.leave(doc, &joiner.peer_id).await.unwrap());
        }
    }

    #[tokio::test]
    async fn test_tick_checkpoints_changed_documents() {
        let authority = authority();
        let doc = Uuid::new_v4();
        authority.open_document(doc).await.unwrap();
        assert_eq!(authority.tick().await, 0);
        authority.submit(doc, edit(Uuid::new_v4(), 1, Uuid::new_v4(), 1.0)).await.unwrap();
        // the zero interval already checkpointed inside submit
        assert_eq!(authority.persistence().last_checkpoint_sequence(doc), 1);
        assert_eq!(authority.tick().await, 0);
    }
}
