//! Journal entries: one sequenced edit per record, checksummed so a torn
//! or bit-flipped record is detected and skipped on replay.

use serde::{Deserialize, Serialize};

use loom_core::{DocumentId, PropertyEdit};

use super::StoreError;

/// One durably appended edit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JournalEntry {
    pub doc_id: DocumentId,
    /// Authority-assigned, strictly increasing per document
    pub sequence: u64,
    /// Authority wall clock at receipt, milliseconds since the epoch
    pub received_at_ms: u64,
    /// The edit, already carrying `sequence`
    pub edit: PropertyEdit,
    pub checksum: u32,
}

impl JournalEntry {
    /// Build an entry for `edit`, stamping it with `sequence`.
    pub fn new(
        doc_id: DocumentId,
        sequence: u64,
        edit: PropertyEdit,
        received_at_ms: u64,
    ) -> Result<Self, StoreError> {
        let edit = edit.with_sequence(sequence);
        let checksum = Self::compute_checksum(doc_id, sequence, received_at_ms, &edit)?;
        Ok(Self { doc_id, sequence, received_at_ms, edit, checksum })
    }

    /// Whether the stored checksum still matches the contents.
    pub fn verify(&self) -> bool {
        if self.edit.sequence != Some(self.sequence) {
            return false;
        }
        Self::compute_checksum(self.doc_id, self.sequence, self.received_at_ms, &self.edit)
            .is_ok_and(|expected| expected == self.checksum)
    }

    /// FNV-1a over the entry fields and the encoded edit.
    fn compute_checksum(
        doc_id: DocumentId,
        sequence: u64,
        received_at_ms: u64,
        edit: &PropertyEdit,
    ) -> Result<u32, StoreError> {
        let edit_bytes = bincode::serde::encode_to_vec(edit, bincode::config::standard())
            .map_err(|e| StoreError::SerializationError(e.to_string()))?;

        let mut hash: u32 = 0x811c_9dc5;
        let mut mix = |byte: u8| {
            hash ^= byte as u32;
            hash = hash.wrapping_mul(0x0100_0193);
        };
        doc_id.as_bytes().iter().copied().for_each(&mut mix);
        sequence.to_le_bytes().into_iter().for_each(&mut mix);
        received_at_ms.to_le_bytes().into_iter().for_each(&mut mix);
        edit_bytes.into_iter().for_each(&mut mix);
        Ok(hash)
    }

    pub fn encode(&self) -> Result<Vec<u8>, StoreError> {
        bincode::serde::encode_to_vec(self, bincode::config::standard())
            .map_err(|e| StoreError::SerializationError(e.to_string()))
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, StoreError> {
        let (entry, _): (Self, _) =
            bincode::serde::decode_from_slice(bytes, bincode::config::standard())
                .map_err(|e| StoreError::DeserializationError(e.to_string()))?;
        Ok(entry)
    }

    /// Decode raw records, dropping any that fail to decode or verify.
    ///
    /// Returns the valid entries in sequence order and the number dropped.
    pub fn decode_all<'a>(records: impl IntoIterator<Item = &'a [u8]>) -> (Vec<JournalEntry>, usize) {
        let mut valid = Vec::new();
        let mut corrupted = 0;
        for bytes in records {
            match JournalEntry::decode(bytes) {
                Ok(entry) if entry.verify() => valid.push(entry),
                _ => corrupted += 1,
            }
        }
        valid.sort_by_key(|e| e.sequence);
        (valid, corrupted)
    }
}
