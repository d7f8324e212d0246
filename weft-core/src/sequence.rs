//! Replicated sequence store.
//!
//! Every element ever created is kept, tombstones included, sorted by
//! [`Element::cmp_order`]. Local edits address the *visible* text by index;
//! remote operations are merged by id and land wherever the total order puts
//! them, so any arrival order of the same operation set yields the same text.
//!
//! ```text
//!   stored:   H  e  x  l  l  o        (x tombstoned)
//!   visible:  H  e     l  l  o        text() == "Hello"
//!   index:    0  1     2  3  4
//! ```

use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};

use crate::element::{Element, ElementId, Operation, ReplicaId};
use crate::position::{Position, PositionError};

/// What to do with a delete whose insert has not arrived yet.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum DeletePolicy {
    /// Drop the delete and log a warning.
    #[default]
    Drop,
    /// Remember the id and tombstone the element when its insert arrives.
    Buffer,
}

/// Result of merging one remote operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MergeOutcome {
    /// The operation changed local state.
    Applied,
    /// Already applied before; nothing changed.
    Duplicate,
    /// Delete for an unknown id, discarded under [`DeletePolicy::Drop`].
    Dropped,
    /// Delete for an unknown id, parked under [`DeletePolicy::Buffer`].
    Buffered,
    /// Insert carrying a position the allocator could not have produced.
    Rejected,
}

/// Sequence store errors.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SequenceError {
    #[error("visible index {index} out of range (length {len})")]
    IndexOutOfRange { index: usize, len: usize },
    #[error(transparent)]
    Position(#[from] PositionError),
    #[error("snapshot encoding error: {0}")]
    Snapshot(String),
    #[error("element counter exhausted for replica {0}")]
    CounterExhausted(ReplicaId),
}

/// Serializable copy of a store's full element set.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Snapshot {
    pub elements: Vec<Element>,
    #[serde(default)]
    pub pending_deletes: Vec<ElementId>,
}

impl Snapshot {
    pub fn to_json(&self) -> Result<String, SequenceError> {
        serde_json::to_string(self).map_err(|e| SequenceError::Snapshot(e.to_string()))
    }

    pub fn from_json(json: &str) -> Result<Self, SequenceError> {
        serde_json::from_str(json).map_err(|e| SequenceError::Snapshot(e.to_string()))
    }
}

/// One replica's copy of the document.
#[derive(Debug, Clone)]
pub struct SequenceStore {
    replica: ReplicaId,
    policy: DeletePolicy,
    /// Last counter handed out for this replica's element ids.
    counter: u64,
    /// All elements in total order.
    elements: Vec<Element>,
    /// Id → position, for locating elements by binary search.
    index: HashMap<ElementId, Position>,
    pending_deletes: HashSet<ElementId>,
    visible: usize,
}

impl SequenceStore {
    /// Create an empty store for `replica` with the default delete policy.
    pub fn new(replica: impl Into<ReplicaId>) -> Self {
        Self::with_policy(replica, DeletePolicy::default())
    }

    pub fn with_policy(replica: impl Into<ReplicaId>, policy: DeletePolicy) -> Self {
        Self {
            replica: replica.into(),
            policy,
            counter: 0,
            elements: Vec::new(),
            index: HashMap::new(),
            pending_deletes: HashSet::new(),
            visible: 0,
        }
    }

    pub fn replica(&self) -> &ReplicaId {
        &self.replica
    }

    pub fn policy(&self) -> DeletePolicy {
        self.policy
    }

    // ─── Local edits ──────────────────────────────────────────────────

    /// Insert `ch` so that it becomes visible character number `index`.
    ///
    /// Returns the new element, to be sent as an insert operation.
    pub fn local_insert(&mut self, ch: char, index: usize) -> Result<Element, SequenceError> {
        if index > self.visible {
            return Err(SequenceError::IndexOutOfRange {
                index,
                len: self.visible,
            });
        }

        // Left neighbor is the preceding visible element; the right one is
        // whatever follows it in storage, tombstones included.
        let left = match index {
            0 => None,
            n => self.nth_visible(n - 1),
        };
        let mut right = left.map_or(0, |l| l + 1);
        if let Some(l) = left {
            let left_pos = &self.elements[l].position;
            while right < self.elements.len() && self.elements[right].position == *left_pos {
                right += 1;
            }
        }

        let position = Position::between(
            left.map(|l| &self.elements[l].position),
            self.elements.get(right).map(|e| &e.position),
        )?;

        let counter = self
            .counter
            .checked_add(1)
            .ok_or_else(|| SequenceError::CounterExhausted(self.replica.clone()))?;
        self.counter = counter;
        let id = ElementId::new(self.replica.clone(), counter);
        let element = Element::new(id, ch, position);
        self.insert_sorted(element.clone());
        Ok(element)
    }

    /// Insert every character of `text` starting at visible `index`.
    pub fn local_insert_str(
        &mut self,
        text: &str,
        index: usize,
    ) -> Result<Vec<Element>, SequenceError> {
        text.chars()
            .enumerate()
            .map(|(offset, ch)| self.local_insert(ch, index + offset))
            .collect()
    }

    /// Tombstone the visible character at `index`.
    ///
    /// Returns `None` when the index is out of range.
    pub fn local_delete(&mut self, index: usize) -> Option<Operation> {
        let at = self.nth_visible(index)?;
        let element = &mut self.elements[at];
        element.deleted = true;
        self.visible -= 1;
        Some(Operation::Delete {
            id: element.id.clone(),
        })
    }

    // ─── Remote merge ─────────────────────────────────────────────────

    /// Merge an element created by some replica. Idempotent.
    pub fn remote_insert(&mut self, element: Element) -> MergeOutcome {
        if let Some(at) = self.locate(&element.id) {
            // A later copy may carry a tombstone the first one did not.
            if element.deleted && !self.elements[at].deleted {
                self.tombstone(at);
                return MergeOutcome::Applied;
            }
            return MergeOutcome::Duplicate;
        }
        if !element.position.is_well_formed() {
            log::warn!(
                "Rejecting element {} with malformed position {:?}",
                element.id,
                element.position.as_str()
            );
            return MergeOutcome::Rejected;
        }

        let mut element = element;
        if self.pending_deletes.remove(&element.id) {
            element.deleted = true;
        }
        if element.id.replica == self.replica && element.id.counter > self.counter {
            self.counter = element.id.counter;
        }
        self.insert_sorted(element);
        MergeOutcome::Applied
    }

    /// Tombstone the element with `id`. Idempotent.
    pub fn remote_delete(&mut self, id: &ElementId) -> MergeOutcome {
        match self.locate(id) {
            Some(at) if self.elements[at].deleted => MergeOutcome::Duplicate,
            Some(at) => {
                self.tombstone(at);
                MergeOutcome::Applied
            }
            None => match self.policy {
                DeletePolicy::Drop => {
                    log::warn!("Dropping delete for unknown element {id}");
                    MergeOutcome::Dropped
                }
                DeletePolicy::Buffer => {
                    log::debug!("Buffering delete for unknown element {id}");
                    self.pending_deletes.insert(id.clone());
                    MergeOutcome::Buffered
                }
            },
        }
    }

    /// Merge any operation.
    pub fn apply(&mut self, op: &Operation) -> MergeOutcome {
        match op {
            Operation::Insert { element } => self.remote_insert(element.clone()),
            Operation::Delete { id } => self.remote_delete(id),
        }
    }

    // ─── Reads ────────────────────────────────────────────────────────

    /// Visible text in total order.
    pub fn text(&self) -> String {
        self.elements
            .iter()
            .filter(|e| !e.deleted)
            .map(|e| e.ch)
            .collect()
    }

    /// Number of visible characters.
    pub fn visible_len(&self) -> usize {
        self.visible
    }

    /// Number of stored elements, tombstones included.
    pub fn len(&self) -> usize {
        self.elements.len()
    }

    pub fn is_empty(&self) -> bool {
        self.elements.is_empty()
    }

    pub fn contains(&self, id: &ElementId) -> bool {
        self.index.contains_key(id)
    }

    /// Visible index of a live element, `None` if unknown or tombstoned.
    pub fn visible_index_of(&self, id: &ElementId) -> Option<usize> {
        let at = self.locate(id)?;
        if self.elements[at].deleted {
            return None;
        }
        Some(self.elements[..at].iter().filter(|e| !e.deleted).count())
    }

    /// All stored elements in total order.
    pub fn elements(&self) -> impl Iterator<Item = &Element> {
        self.elements.iter()
    }

    /// Ids of deletes waiting for their insert.
    pub fn pending_deletes(&self) -> usize {
        self.pending_deletes.len()
    }

    // ─── Snapshots ────────────────────────────────────────────────────

    pub fn snapshot(&self) -> Snapshot {
        let mut pending_deletes: Vec<ElementId> = self.pending_deletes.iter().cloned().collect();
        pending_deletes.sort();
        Snapshot {
            elements: self.elements.clone(),
            pending_deletes,
        }
    }

    /// Merge a snapshot into this store.
    ///
    /// Elements are merged exactly like remote inserts, so restoring into a
    /// non-empty store (or restoring twice) converges.
    pub fn restore(&mut self, snapshot: Snapshot) {
        for element in snapshot.elements {
            self.remote_insert(element);
        }
        for id in snapshot.pending_deletes {
            if let Some(at) = self.locate(&id) {
                if !self.elements[at].deleted {
                    self.tombstone(at);
                }
            } else {
                self.pending_deletes.insert(id);
            }
        }
    }

    // ─── Internals ────────────────────────────────────────────────────

    fn insert_sorted(&mut self, element: Element) {
        let at = match self.search(&element.position, &element.id) {
            Ok(at) | Err(at) => at,
        };
        if !element.deleted {
            self.visible += 1;
        }
        self.index
            .insert(element.id.clone(), element.position.clone());
        self.elements.insert(at, element);
    }

    fn tombstone(&mut self, at: usize) {
        self.elements[at].deleted = true;
        self.visible -= 1;
    }

    fn locate(&self, id: &ElementId) -> Option<usize> {
        let position = self.index.get(id)?;
        self.search(position, id).ok()
    }

    fn search(&self, position: &Position, id: &ElementId) -> Result<usize, usize> {
        self.elements.binary_search_by(|e| {
            e.position
                .cmp(position)
                .then_with(|| e.id.replica.cmp(&id.replica))
                .then_with(|| e.id.counter.cmp(&id.counter))
        })
    }

    /// Storage index of the `n`th visible element.
    fn nth_visible(&self, n: usize) -> Option<usize> {
        self.elements
            .iter()
            .enumerate()
            .filter(|(_, e)| !e.deleted)
            .nth(n)
            .map(|(at, _)| at)
    }
}
