//! Property edits: the unit of change exchanged between clients and the
//! authority.

use serde::{Deserialize, Serialize};
use std::time::SystemTime;
use uuid::Uuid;

use crate::value::PropertyValue;

pub type ObjectId = Uuid;
pub type ClientId = Uuid;
pub type DocumentId = Uuid;

/// A single `(object, property, value)` mutation request.
///
/// `sequence` is `None` until the authority appends the edit to the
/// document journal. Once assigned it never changes. `local_timestamp` is
/// advisory only and never participates in ordering.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PropertyEdit {
    pub object_id: ObjectId,
    pub key: String,
    pub value: PropertyValue,
    pub client_id: ClientId,
    /// Per-client submission counter, echoed back in acknowledgements.
    pub client_seq: u64,
    /// Client wall clock in milliseconds since the Unix epoch.
    pub local_timestamp: u64,
    pub sequence: Option<u64>,
}

impl PropertyEdit {
    /// A fresh, unconfirmed edit stamped with the local clock.
    pub fn local(
        client_id: ClientId,
        client_seq: u64,
        object_id: ObjectId,
        key: impl Into<String>,
        value: PropertyValue,
    ) -> Self {
        Self {
            object_id,
            key: key.into(),
            value,
            client_id,
            client_seq,
            local_timestamp: now_millis(),
            sequence: None,
        }
    }

    /// Attach the authority-assigned sequence number.
    ///
    /// An already-sequenced edit keeps its original number.
    pub fn with_sequence(mut self, sequence: u64) -> Self {
        if self.sequence.is_none() {
            self.sequence = Some(sequence);
        }
        self
    }

    pub fn is_confirmed(&self) -> bool {
        self.sequence.is_some()
    }

    pub fn property(&self) -> PropertyRef {
        PropertyRef::new(self.object_id, self.key.clone())
    }

    /// Same payload, new local timestamp (used when resending).
    pub fn refreshed(&self) -> Self {
        Self { local_timestamp: now_millis(), ..self.clone() }
    }
}

/// `(object id, property key)`, the granularity of conflict resolution.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PropertyRef {
    pub object_id: ObjectId,
    pub key: String,
}

impl PropertyRef {
    pub fn new(object_id: ObjectId, key: impl Into<String>) -> Self {
        Self { object_id, key: key.into() }
    }
}

/// Milliseconds since the Unix epoch.
pub fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}
