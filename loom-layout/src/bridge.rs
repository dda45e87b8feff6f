//! Document changes → layout recomputation.
//!
//! ```text
//!  SyncEngine ──StateChange──▸ LayoutBridge ──dirty containers──▸ LayoutEngine
//!                                  │
//!                             batch buffer
//! ```
//!
//! The bridge buffers incoming changes and resolves them to a set of dirty
//! containers in a single pass on `flush`, so a burst of edits to one
//! container costs one recomputation. A width or height change carries the
//! value it replaced, which gives the container's size before the burst
//! and lets constrained children follow the resize.

use rustc_hash::FxHashSet;
use std::collections::VecDeque;
use uuid::Uuid;

use loom_core::{keys, ObjectTree, PropertyValue, StateChange};

use crate::engine::{Geometry, LayoutEngine, LayoutError, PreviousSizes};

/// Outcome of one [`LayoutBridge::flush`].
#[derive(Debug, Default)]
pub struct FlushResult {
    /// Changes drained from the buffer.
    pub total: usize,
    /// Changes that could move or resize something.
    pub relevant: usize,
    /// Containers recomputed.
    pub recomputed: usize,
    pub geometry: Geometry,
}

pub struct LayoutBridge {
    /// Changes waiting to be resolved.
    pending: VecDeque<StateChange>,

    /// Running count of changes processed (lifetime of the bridge).
    changes_processed: u64,
}

impl Default for LayoutBridge {
    fn default() -> Self {
        Self::new()
    }
}

impl LayoutBridge {
    pub fn new() -> Self {
        Self { pending: VecDeque::new(), changes_processed: 0 }
    }

    #[inline]
    pub fn push(&mut self, change: StateChange) {
        self.pending.push_back(change);
    }

    pub fn push_batch(&mut self, changes: impl IntoIterator<Item = StateChange>) {
        self.pending.extend(changes);
    }

    #[inline]
    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    #[inline]
    pub fn total_processed(&self) -> u64 {
        self.changes_processed
    }

    /// Recompute every container affected by the buffered changes.
    ///
    /// `tree` must already reflect the changes. Structural changes
    /// (reparenting, deletion) relayout every root since the old parent is
    /// no longer known.
    pub fn flush(
        &mut self,
        engine: &mut LayoutEngine,
        tree: &ObjectTree,
    ) -> Result<FlushResult, LayoutError> {
        let mut result = FlushResult { total: self.pending.len(), ..FlushResult::default() };
        let mut dirty: FxHashSet<Uuid> = FxHashSet::default();
        let mut previous = PreviousSizes::default();
        // axes whose pre-burst size is already known
        let mut seen: FxHashSet<(Uuid, bool)> = FxHashSet::default();

        while let Some(change) = self.pending.pop_front() {
            if !keys::affects_layout(&change.key) {
                continue;
            }
            result.relevant += 1;
            let is_width = change.key == keys::WIDTH;
            if is_width || change.key == keys::HEIGHT {
                if let Some(node) = tree.get(change.object_id) {
                    if seen.insert((change.object_id, is_width)) {
                        let size = previous.entry(change.object_id).or_insert(node.bounds.size());
                        if let Some(old) = change.previous.as_ref().and_then(PropertyValue::as_f32) {
                            if is_width {
                                size.width = old;
                            } else {
                                size.height = old;
                            }
                        }
                    }
                }
            }
            match change.key.as_str() {
                keys::PARENT | keys::DELETED | keys::INDEX => dirty.extend(tree.roots()),
                _ => {
                    if tree.get(change.object_id).is_some_and(|n| n.kind.is_container()) {
                        dirty.insert(change.object_id);
                    }
                    if let Some(parent) = tree.parent(change.object_id) {
                        dirty.insert(parent);
                    }
                }
            }
        }
        self.changes_processed += result.total as u64;

        // a dirty ancestor already covers its subtree
        let mut containers: Vec<Uuid> = dirty
            .iter()
            .copied()
            .filter(|id| tree.contains(*id))
            .filter(|id| !tree.ancestors(*id).iter().any(|a| dirty.contains(a)))
            .collect();
        containers.sort();

        for id in containers {
            let geometry = engine.relayout(tree, id, &previous)?;
            result.geometry.extend(geometry);
            result.recomputed += 1;
        }
        log::debug!(
            "Layout flush: {} change(s), {} relevant, {} container(s) recomputed",
            result.total, result.relevant, result.recomputed
        );
        Ok(result)
    }
}
