//! Flat document state: one last-writer-wins register per
//! `(object id, property key)`.

use log::trace;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::edit::{ObjectId, PropertyEdit};
use crate::value::PropertyValue;

/// Current value of one property and the sequence that last committed it.
///
/// A sequence of `0` means the value was applied optimistically and no
/// confirmed edit has touched the key yet.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Entry {
    pub value: PropertyValue,
    pub sequence: u64,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ApplyOutcome {
    Applied,
    Stale,
}

/// Why a [`StateChange`] happened.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ChangeOrigin {
    /// Optimistic local edit, not yet confirmed.
    Local,
    /// Sequenced edit from another client.
    Remote,
    /// Our own edit confirmed; the value may have been replaced by a
    /// concurrent remote edit with a higher sequence.
    Confirmed,
    /// Entry loaded from an authority snapshot.
    Snapshot,
    /// Our own edit was refused; the key went back to its last confirmed
    /// value, or was removed if it never had one.
    Reverted,
}

/// A change to the visible document state, delivered to subscribers.
#[derive(Clone, Debug, PartialEq)]
pub struct StateChange {
    pub object_id: ObjectId,
    pub key: String,
    /// New visible value; `None` when the key was removed.
    pub value: Option<PropertyValue>,
    /// Visible value before the change.
    pub previous: Option<PropertyValue>,
    pub sequence: Option<u64>,
    pub origin: ChangeOrigin,
}

impl StateChange {
    pub fn new(
        object_id: ObjectId,
        key: impl Into<String>,
        value: Option<PropertyValue>,
        origin: ChangeOrigin,
    ) -> Self {
        Self { object_id, key: key.into(), value, previous: None, sequence: None, origin }
    }

    pub fn with_previous(mut self, previous: Option<PropertyValue>) -> Self {
        self.previous = previous;
        self
    }

    pub fn with_sequence(mut self, sequence: u64) -> Self {
        self.sequence = Some(sequence);
        self
    }
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct DocumentState {
    objects: HashMap<ObjectId, HashMap<String, Entry>>,
    last_sequence: u64,
}

impl DocumentState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Commit `value` at `sequence` unless the stored sequence is already
    /// at or beyond it.
    pub fn commit(
        &mut self,
        object_id: ObjectId,
        key: &str,
        value: PropertyValue,
        sequence: u64,
    ) -> ApplyOutcome {
        if let Some(existing) = self.entry(object_id, key) {
            if sequence <= existing.sequence {
                trace!(
                    "Discarding stale value for {}/{} (seq {} <= {})",
                    object_id, key, sequence, existing.sequence
                );
                return ApplyOutcome::Stale;
            }
        }
        self.objects
            .entry(object_id)
            .or_default()
            .insert(key.to_string(), Entry { value, sequence });
        self.last_sequence = self.last_sequence.max(sequence);
        ApplyOutcome::Applied
    }

    /// Apply a confirmed edit. Unsequenced edits are never committed.
    pub fn apply_sequenced(&mut self, edit: &PropertyEdit) -> ApplyOutcome {
        match edit.sequence {
            Some(sequence) => self.commit(edit.object_id, &edit.key, edit.value.clone(), sequence),
            None => ApplyOutcome::Stale,
        }
    }

    /// Set the visible value without touching the stored sequence.
    pub fn apply_optimistic(&mut self, edit: &PropertyEdit) {
        let props = self.objects.entry(edit.object_id).or_default();
        match props.get_mut(&edit.key) {
            Some(entry) => entry.value = edit.value.clone(),
            None => {
                props.insert(edit.key.clone(), Entry { value: edit.value.clone(), sequence: 0 });
            }
        }
    }

    /// Overwrite an entry regardless of its stored sequence. Used when a
    /// pending local edit is resolved and the winner is already known.
    pub fn settle(&mut self, object_id: ObjectId, key: &str, value: PropertyValue, sequence: u64) {
        self.objects
            .entry(object_id)
            .or_default()
            .insert(key.to_string(), Entry { value, sequence });
        self.last_sequence = self.last_sequence.max(sequence);
    }

    /// Drop an entry entirely, removing the object once it has no keys left.
    pub fn forget(&mut self, object_id: ObjectId, key: &str) -> Option<Entry> {
        let props = self.objects.get_mut(&object_id)?;
        let removed = props.remove(key);
        if props.is_empty() {
            self.objects.remove(&object_id);
        }
        removed
    }

    pub fn value(&self, object_id: ObjectId, key: &str) -> Option<&PropertyValue> {
        self.entry(object_id, key).map(|e| &e.value)
    }

    pub fn sequence_of(&self, object_id: ObjectId, key: &str) -> Option<u64> {
        self.entry(object_id, key).map(|e| e.sequence)
    }

    pub fn entry(&self, object_id: ObjectId, key: &str) -> Option<&Entry> {
        self.objects.get(&object_id).and_then(|props| props.get(key))
    }

    pub fn object(&self, object_id: ObjectId) -> Option<&HashMap<String, Entry>> {
        self.objects.get(&object_id)
    }

    pub fn objects(&self) -> impl Iterator<Item = (&ObjectId, &HashMap<String, Entry>)> {
        self.objects.iter()
    }

    /// Every entry, ordered by sequence then by (object, key).
    pub fn entries(&self) -> Vec<(ObjectId, &str, &Entry)> {
        let mut out: Vec<_> = self
            .objects
            .iter()
            .flat_map(|(id, props)| props.iter().map(move |(k, e)| (*id, k.as_str(), e)))
            .collect();
        out.sort_by(|a, b| a.2.sequence.cmp(&b.2.sequence).then(a.0.cmp(&b.0)).then(a.1.cmp(b.1)));
        out
    }

    /// Highest sequence committed into this state.
    pub fn last_sequence(&self) -> u64 {
        self.last_sequence
    }

    pub fn object_count(&self) -> usize {
        self.objects.len()
    }

    pub fn is_empty(&self) -> bool {
        self.objects.is_empty()
    }
}
