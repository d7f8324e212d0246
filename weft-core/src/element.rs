//! Elements and the operations that create or tombstone them.

use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;

use crate::position::Position;

/// Identifies one replica (one editing session) of a document.
///
/// Ids must be unique per live session; the server does not check this.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ReplicaId(String);

impl ReplicaId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ReplicaId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ReplicaId {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

impl From<String> for ReplicaId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

/// Globally unique element id: the creating replica plus a counter local to it.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ElementId {
    pub replica: ReplicaId,
    pub counter: u64,
}

impl ElementId {
    pub fn new(replica: ReplicaId, counter: u64) -> Self {
        Self { replica, counter }
    }
}

impl fmt::Display for ElementId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.replica, self.counter)
    }
}

/// One character of the replicated sequence.
///
/// Everything except `deleted` is fixed at creation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Element {
    pub id: ElementId,
    #[serde(rename = "char")]
    pub ch: char,
    pub position: Position,
    #[serde(default)]
    pub deleted: bool,
}

impl Element {
    pub fn new(id: ElementId, ch: char, position: Position) -> Self {
        Self {
            id,
            ch,
            position,
            deleted: false,
        }
    }

    /// The replica that created this element.
    pub fn replica(&self) -> &ReplicaId {
        &self.id.replica
    }

    /// Total order shared by every replica: position, then replica id.
    ///
    /// The counter only separates two elements of one replica at one position,
    /// which a replica allocating against real neighbors never produces.
    pub fn cmp_order(&self, other: &Element) -> Ordering {
        self.position
            .cmp(&other.position)
            .then_with(|| self.id.replica.cmp(&other.id.replica))
            .then_with(|| self.id.counter.cmp(&other.id.counter))
    }
}

/// An immutable fact exchanged between replicas.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum Operation {
    Insert { element: Element },
    Delete { id: ElementId },
}

impl Operation {
    /// Id of the element this operation creates or tombstones.
    pub fn target(&self) -> &ElementId {
        match self {
            Operation::Insert { element } => &element.id,
            Operation::Delete { id } => id,
        }
    }
}

impl From<Element> for Operation {
    fn from(element: Element) -> Self {
        Operation::Insert { element }
    }
}
