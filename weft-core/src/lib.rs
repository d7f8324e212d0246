//! # weft-core: Replicated plaintext sequence
//!
//! A character-wise CRDT: every character is an [`Element`] with an immutable
//! dense [`Position`] key, deletes leave tombstones, and the visible text is
//! the live elements in `(position, replica)` order.
//!
//! ```text
//!   local edit ──► SequenceStore::local_* ──► Operation ──► network
//!                                                             │
//!   text() ◄── SequenceStore::apply ◄─────────────────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`position`]: Dense key allocation between two neighbors
//! - [`element`]: Element, ids and operations (the wire data model)
//! - [`sequence`]: Per-replica store with idempotent merge

pub mod element;
pub mod position;
pub mod sequence;

pub use element::{Element, ElementId, Operation, ReplicaId};
pub use position::{alloc, Position, PositionError};
pub use sequence::{DeletePolicy, MergeOutcome, SequenceError, SequenceStore, Snapshot};
