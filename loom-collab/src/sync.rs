//! Client-side synchronization engine.
//!
//! ```text
//!  apply_local_edit ──► optimistic state ──► unacked queue ──► EditChannel
//!                               ▲                  │
//!                               │             Ack / Reject
//!  on_remote_edit ──► pending key? ── yes ──► retained (not shown)
//!                         │
//!                         no ──► sequence > stored? ──► commit + notify
//! ```
//!
//! Visible state is the confirmed state with every pending local edit laid
//! over it. While a key has edits in flight, remote edits to it are held
//! back so the user never sees their own change flicker away; once the
//! last of those edits is confirmed the highest-sequenced value seen for
//! the key wins, exactly as on every other replica.

use std::collections::{HashMap, VecDeque};

use loom_core::{
    keys, ChangeOrigin, ClientId, DocumentState, Entry, ObjectId, PropertyEdit, PropertyRef,
    PropertyValue, StateChange, ValueKind,
};

use crate::channel::{ChannelEvent, EditChannel};
use crate::protocol::{Ack, Rejection};

pub type SubscriptionId = u64;

type Listener = Box<dyn FnMut(&StateChange) + Send>;

/// What happened to an incoming sequenced edit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RemoteOutcome {
    Applied,
    /// Held back behind a pending local edit of the same key.
    Deferred,
    /// Already reflected, or superseded.
    Stale,
}

#[derive(Debug, Clone, PartialEq)]
pub enum SyncError {
    TypeMismatch { key: String, expected: ValueKind, found: ValueKind },
}

impl std::fmt::Display for SyncError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SyncError::TypeMismatch { key, expected, found } => {
                write!(f, "Property {key} expects {expected}, got {found}")
            }
        }
    }
}

impl std::error::Error for SyncError {}

pub struct SyncEngine<C: EditChannel> {
    client_id: ClientId,
    channel: C,
    state: DocumentState,
    next_client_seq: u64,

    /// Sent or queued edits awaiting acknowledgement, in submission order
    unacked: VecDeque<PropertyEdit>,
    /// Number of unacked edits per key
    pending: HashMap<PropertyRef, usize>,
    /// Highest confirmed value known for a pending key: its value before
    /// the first pending edit, a held-back remote edit, or one of our own
    /// already acknowledged edits
    retained: HashMap<PropertyRef, Entry>,

    listeners: Vec<(SubscriptionId, Listener)>,
    next_subscription: SubscriptionId,
    connected: bool,
}

impl<C: EditChannel> SyncEngine<C> {
    /// A disconnected engine over an empty document.
    pub fn new(client_id: ClientId, channel: C) -> Self {
        Self {
            client_id,
            channel,
            state: DocumentState::new(),
            next_client_seq: 1,
            unacked: VecDeque::new(),
            pending: HashMap::new(),
            retained: HashMap::new(),
            listeners: Vec::new(),
            next_subscription: 1,
            connected: false,
        }
    }

    pub fn client_id(&self) -> ClientId {
        self.client_id
    }

    /// Visible state, pending local edits included.
    pub fn state(&self) -> &DocumentState {
        &self.state
    }

    pub fn value(&self, object_id: ObjectId, key: &str) -> Option<&PropertyValue> {
        self.state.value(object_id, key)
    }

    pub fn channel(&self) -> &C {
        &self.channel
    }

    pub fn channel_mut(&mut self) -> &mut C {
        &mut self.channel
    }

    pub fn is_connected(&self) -> bool {
        self.connected
    }

    pub fn unacked_count(&self) -> usize {
        self.unacked.len()
    }

    pub fn unacked(&self) -> impl Iterator<Item = &PropertyEdit> {
        self.unacked.iter()
    }

    pub fn is_pending(&self, object_id: ObjectId, key: &str) -> bool {
        self.pending.contains_key(&PropertyRef::new(object_id, key))
    }

    /// Register a listener for visible state changes. Listeners run in
    /// commit order, synchronously.
    pub fn subscribe(&mut self, listener: impl FnMut(&StateChange) + Send + 'static) -> SubscriptionId {
        let id = self.next_subscription;
        self.next_subscription += 1;
        self.listeners.push((id, Box::new(listener)));
        id
    }

    /// Returns whether `id` was subscribed.
    pub fn unsubscribe(&mut self, id: SubscriptionId) -> bool {
        let before = self.listeners.len();
        self.listeners.retain(|(sid, _)| *sid != id);
        self.listeners.len() != before
    }

    /// Apply an edit locally and send it to the authority.
    ///
    /// The value must match the key's expected kind, or the kind of its
    /// current value for free-form keys. While disconnected the edit is
    /// only queued.
    pub fn apply_local_edit(
        &mut self,
        object_id: ObjectId,
        key: &str,
        value: PropertyValue,
    ) -> Result<PropertyEdit, SyncError> {
        let expected = keys::expected_kind(key)
            .or_else(|| self.state.value(object_id, key).map(PropertyValue::kind));
        if let Some(expected) = expected {
            if expected != value.kind() {
                return Err(SyncError::TypeMismatch {
                    key: key.to_string(),
                    expected,
                    found: value.kind(),
                });
            }
        }

        let edit = PropertyEdit::local(self.client_id, self.next_client_seq, object_id, key, value);
        self.next_client_seq += 1;

        let property = edit.property();
        if !self.pending.contains_key(&property) {
            // remember the confirmed value we are about to cover
            if let Some(entry) = self.state.entry(object_id, key).filter(|e| e.sequence > 0) {
                self.retained.insert(property.clone(), entry.clone());
            }
        }
        *self.pending.entry(property).or_insert(0) += 1;

        let previous = self.state.value(object_id, key).cloned();
        self.state.apply_optimistic(&edit);
        self.unacked.push_back(edit.clone());
        if self.connected {
            self.channel.send(&edit);
        }

        self.notify(
            StateChange::new(object_id, key, Some(edit.value.clone()), ChangeOrigin::Local)
                .with_previous(previous),
        );
        Ok(edit)
    }

    /// Tombstone an object. Deleting twice is harmless.
    pub fn delete_object(&mut self, object_id: ObjectId) -> Result<PropertyEdit, SyncError> {
        self.apply_local_edit(object_id, keys::DELETED, PropertyValue::Bool(true))
    }

    /// Handle a sequenced edit fanned out by the authority.
    pub fn on_remote_edit(&mut self, edit: PropertyEdit) -> RemoteOutcome {
        if edit.client_id == self.client_id {
            // our own edit coming back; counts as its acknowledgement
            if let Some(sequence) = edit.sequence {
                self.on_local_edit_confirmed(Ack { client_seq: edit.client_seq, sequence });
            }
            return RemoteOutcome::Stale;
        }
        self.apply_remote(edit, ChangeOrigin::Remote)
    }

    fn apply_remote(&mut self, edit: PropertyEdit, origin: ChangeOrigin) -> RemoteOutcome {
        let Some(sequence) = edit.sequence else {
            log::warn!("Dropping unsequenced remote edit for {}/{}", edit.object_id, edit.key);
            return RemoteOutcome::Stale;
        };

        let property = edit.property();
        if self.pending.contains_key(&property) {
            log::debug!(
                "Holding back remote edit {}/{} #{} behind pending local edit",
                edit.object_id, edit.key, sequence
            );
            self.retain(property, edit.value, sequence);
            return RemoteOutcome::Deferred;
        }

        let PropertyEdit { object_id, key, value, .. } = edit;
        let previous = self.state.value(object_id, &key).cloned();
        match self.state.commit(object_id, &key, value.clone(), sequence) {
            loom_core::ApplyOutcome::Applied => {
                self.notify(
                    StateChange::new(object_id, key, Some(value), origin)
                        .with_previous(previous)
                        .with_sequence(sequence),
                );
                RemoteOutcome::Applied
            }
            loom_core::ApplyOutcome::Stale => RemoteOutcome::Stale,
        }
    }

    /// Handle the authority's acknowledgement of one of our edits.
    ///
    /// Unknown or repeated acknowledgements are ignored. Returns whether
    /// an edit was confirmed.
    pub fn on_local_edit_confirmed(&mut self, ack: Ack) -> bool {
        let Some(pos) = self.unacked.iter().position(|e| e.client_seq == ack.client_seq) else {
            log::trace!("Ignoring ack for unknown client_seq {}", ack.client_seq);
            return false;
        };
        let Some(edit) = self.unacked.remove(pos) else {
            return false;
        };
        let property = edit.property();
        self.retain(property.clone(), edit.value, ack.sequence);

        if self.release_pending(&property) {
            self.settle(property, ChangeOrigin::Confirmed);
        }
        true
    }

    /// Handle a refusal. Retryable refusals keep the edit queued for the
    /// next reconnect; any other drops it and restores the key.
    pub fn on_local_edit_rejected(&mut self, rejection: &Rejection) {
        if rejection.retryable {
            log::warn!(
                "Edit {} refused for now ({}), will resend on reconnect",
                rejection.client_seq, rejection.reason
            );
            return;
        }
        let Some(pos) = self.unacked.iter().position(|e| e.client_seq == rejection.client_seq) else {
            return;
        };
        let Some(edit) = self.unacked.remove(pos) else {
            return;
        };
        log::warn!("Edit {}/{} rejected: {}", edit.object_id, edit.key, rejection.reason);

        let property = edit.property();
        if !self.release_pending(&property) {
            // a later edit still covers the key, and it reapplies on top
            return;
        }
        if self.retained.contains_key(&property) {
            self.settle(property, ChangeOrigin::Reverted);
        } else if let Some(removed) = self.state.forget(property.object_id, &property.key) {
            let PropertyRef { object_id, key } = property;
            self.notify(
                StateChange::new(object_id, key, None, ChangeOrigin::Reverted)
                    .with_previous(Some(removed.value)),
            );
        }
    }

    /// Bootstrap or refresh from a full authority snapshot. Entries go
    /// through the same rules as remote edits.
    pub fn on_state_sync(&mut self, snapshot: DocumentState) -> usize {
        let mut applied = 0;
        for (object_id, key, entry) in snapshot.entries() {
            if entry.sequence == 0 {
                continue;
            }
            let edit = PropertyEdit {
                object_id,
                key: key.to_string(),
                value: entry.value.clone(),
                client_id: ClientId::nil(),
                client_seq: 0,
                local_timestamp: 0,
                sequence: Some(entry.sequence),
            };
            if self.apply_remote(edit, ChangeOrigin::Snapshot) == RemoteOutcome::Applied {
                applied += 1;
            }
        }
        log::debug!("State sync applied {applied} entries (up to #{})", snapshot.last_sequence());
        applied
    }

    pub fn on_disconnect(&mut self) {
        if self.connected {
            log::info!("Client {} disconnected with {} unacked edits", self.client_id, self.unacked.len());
        }
        self.connected = false;
    }

    /// Resend every unacked edit in submission order with a fresh local
    /// timestamp. Returns how many were sent.
    pub fn on_reconnect(&mut self) -> usize {
        self.connected = true;
        for edit in self.unacked.iter_mut() {
            *edit = edit.refreshed();
            self.channel.send(edit);
        }
        if !self.unacked.is_empty() {
            log::info!("Resent {} unacked edits", self.unacked.len());
        }
        self.unacked.len()
    }

    pub fn handle_event(&mut self, event: ChannelEvent) {
        match event {
            ChannelEvent::Connected => {
                self.on_reconnect();
            }
            ChannelEvent::Disconnected => self.on_disconnect(),
            ChannelEvent::Edit(edit) => {
                self.on_remote_edit(edit);
            }
            ChannelEvent::Ack(ack) => {
                self.on_local_edit_confirmed(ack);
            }
            ChannelEvent::Rejected(rejection) => self.on_local_edit_rejected(&rejection),
            ChannelEvent::StateSynced(state) => {
                self.on_state_sync(state);
            }
        }
    }

    /// Keep the higher-sequenced of the stored and the offered value.
    fn retain(&mut self, property: PropertyRef, value: PropertyValue, sequence: u64) {
        match self.retained.get(&property) {
            Some(existing) if existing.sequence >= sequence => {}
            _ => {
                self.retained.insert(property, Entry { value, sequence });
            }
        }
    }

    /// Drop one pending count. Returns true once none are left.
    fn release_pending(&mut self, property: &PropertyRef) -> bool {
        match self.pending.get_mut(property) {
            Some(count) if *count > 1 => {
                *count -= 1;
                false
            }
            Some(_) => {
                self.pending.remove(property);
                true
            }
            None => true,
        }
    }

    /// Replace a no-longer-pending key with its highest known confirmed
    /// value.
    fn settle(&mut self, property: PropertyRef, origin: ChangeOrigin) {
        let Some(winner) = self.retained.remove(&property) else {
            return;
        };
        let PropertyRef { object_id, key } = property;
        let (stored, previous) = match self.state.entry(object_id, &key) {
            Some(entry) => (entry.sequence, Some(entry.value.clone())),
            None => (0, None),
        };
        if winner.sequence < stored {
            return;
        }
        self.state.settle(object_id, &key, winner.value.clone(), winner.sequence);
        self.notify(
            StateChange::new(object_id, key, Some(winner.value), origin)
                .with_previous(previous)
                .with_sequence(winner.sequence),
        );
    }

    fn notify(&mut self, change: StateChange) {
        for (_, listener) in self.listeners.iter_mut() {
            listener(&change);
        }
    }
}
