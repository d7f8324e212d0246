//! Session adapter: binds one replica's sequence store to an editor surface.
//!
//! ```text
//!   editor ──LocalChange──► Session ──ClientMessage──► SyncClient
//!     ▲                       │
//!     └──insert/delete──── Session ◄──ServerMessage── SyncClient
//! ```
//!
//! Remote operations become minimal edits on the surface: one character
//! inserted or removed at the index the store reports. Local changes are
//! assumed to be on the surface already; when the store places a local insert
//! elsewhere (a concurrent insert into the same gap can do that) the surface
//! is reset to the store's text.

use std::collections::HashMap;

use weft_core::{
    DeletePolicy, ElementId, MergeOutcome, Operation, ReplicaId, SequenceError, SequenceStore,
};

use crate::protocol::{ClientMessage, PeerId, ServerMessage};

/// Text view the session keeps in step with the store.
///
/// Indices and lengths count `char`s.
pub trait EditorSurface {
    fn insert(&mut self, index: usize, text: &str);
    fn delete(&mut self, index: usize, len: usize);
    fn set_text(&mut self, text: &str);
    fn text(&self) -> String;
}

/// Plain in-memory surface.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TextSurface {
    chars: Vec<char>,
}

impl TextSurface {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.chars.len()
    }

    pub fn is_empty(&self) -> bool {
        self.chars.is_empty()
    }
}

impl EditorSurface for TextSurface {
    fn insert(&mut self, index: usize, text: &str) {
        let at = index.min(self.chars.len());
        self.chars.splice(at..at, text.chars());
    }

    fn delete(&mut self, index: usize, len: usize) {
        let start = index.min(self.chars.len());
        let end = (index + len).min(self.chars.len());
        self.chars.drain(start..end);
    }

    fn set_text(&mut self, text: &str) {
        self.chars = text.chars().collect();
    }

    fn text(&self) -> String {
        self.chars.iter().collect()
    }
}

/// One edit made in the editor: `removed` characters deleted at `index`,
/// then `inserted` placed there.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalChange {
    pub index: usize,
    pub removed: usize,
    pub inserted: String,
}

impl LocalChange {
    pub fn insert(index: usize, text: impl Into<String>) -> Self {
        Self {
            index,
            removed: 0,
            inserted: text.into(),
        }
    }

    pub fn delete(index: usize, len: usize) -> Self {
        Self {
            index,
            removed: len,
            inserted: String::new(),
        }
    }

    pub fn replace(index: usize, removed: usize, text: impl Into<String>) -> Self {
        Self {
            index,
            removed,
            inserted: text.into(),
        }
    }
}

/// A replica's editing session.
pub struct Session<S: EditorSurface> {
    store: SequenceStore,
    surface: S,
    /// Assigned by the server in `Init`
    peer_id: Option<PeerId>,
    peers: HashMap<PeerId, Option<String>>,
    cursors: HashMap<PeerId, serde_json::Value>,
    resyncs: u64,
}

impl<S: EditorSurface> Session<S> {
    pub fn new(replica: impl Into<ReplicaId>, surface: S) -> Self {
        Self::with_policy(replica, DeletePolicy::default(), surface)
    }

    pub fn with_policy(replica: impl Into<ReplicaId>, policy: DeletePolicy, mut surface: S) -> Self {
        surface.set_text("");
        Self {
            store: SequenceStore::with_policy(replica, policy),
            surface,
            peer_id: None,
            peers: HashMap::new(),
            cursors: HashMap::new(),
            resyncs: 0,
        }
    }

    /// Record an edit the editor has already applied to the surface.
    ///
    /// Returns the operations to send, deletes first.
    pub fn local_change(&mut self, change: LocalChange) -> Result<Vec<ClientMessage>, SequenceError> {
        let len = self.store.visible_len();
        if change.index + change.removed > len {
            return Err(SequenceError::IndexOutOfRange {
                index: change.index + change.removed,
                len,
            });
        }

        let mut out = Vec::with_capacity(change.removed + change.inserted.len());
        for _ in 0..change.removed {
            if let Some(op) = self.store.local_delete(change.index) {
                out.push(ClientMessage::Op { op });
            }
        }

        let elements = self.store.local_insert_str(&change.inserted, change.index)?;
        let misplaced = elements.iter().enumerate().any(|(offset, element)| {
            self.store.visible_index_of(&element.id) != Some(change.index + offset)
        });
        if misplaced {
            log::debug!("Local insert landed off the caret; resyncing surface");
            self.resync();
        }
        out.extend(
            elements
                .into_iter()
                .map(|element| ClientMessage::Op { op: element.into() }),
        );
        Ok(out)
    }

    /// Apply `change` to the surface, then record it.
    pub fn edit(&mut self, change: LocalChange) -> Result<Vec<ClientMessage>, SequenceError> {
        let len = self.store.visible_len();
        if change.index + change.removed > len {
            return Err(SequenceError::IndexOutOfRange {
                index: change.index + change.removed,
                len,
            });
        }
        self.surface.delete(change.index, change.removed);
        self.surface.insert(change.index, &change.inserted);
        self.local_change(change)
    }

    /// Apply a frame from the server.
    pub fn receive(&mut self, msg: ServerMessage) {
        match msg {
            ServerMessage::Init {
                operations,
                peer_id,
            } => {
                log::debug!("Replaying {} operations from init", operations.len());
                for op in &operations {
                    self.store.apply(op);
                }
                self.peer_id = Some(peer_id);
                self.peers.clear();
                self.cursors.clear();
                self.surface.set_text(&self.store.text());
            }
            ServerMessage::Op { op, .. } => {
                self.merge(&op);
            }
            ServerMessage::Cursor { payload, peer_id } => {
                self.cursors.insert(peer_id, payload);
            }
            ServerMessage::PeerJoin { peer_id, user } => {
                self.peers.insert(peer_id, user);
            }
            ServerMessage::PeerLeave { peer_id } => {
                self.peers.remove(&peer_id);
                self.cursors.remove(&peer_id);
            }
        }
    }

    /// Merge one remote operation and mirror its visible effect.
    pub fn merge(&mut self, op: &Operation) -> MergeOutcome {
        let id: &ElementId = op.target();
        let before = self.store.visible_index_of(id);
        let outcome = self.store.apply(op);
        let after = self.store.visible_index_of(id);

        match (before, after, op) {
            (None, Some(index), Operation::Insert { element }) => {
                self.surface.insert(index, element.ch.encode_utf8(&mut [0; 4]));
            }
            (Some(index), None, _) => self.surface.delete(index, 1),
            _ => {}
        }
        outcome
    }

    /// Reset the surface to the store's text.
    pub fn resync(&mut self) {
        self.resyncs += 1;
        self.surface.set_text(&self.store.text());
    }

    /// Cursor message for the server.
    pub fn cursor(&self, payload: serde_json::Value) -> ClientMessage {
        ClientMessage::Cursor { payload }
    }

    /// Preview save carrying the current text.
    pub fn save(&self) -> ClientMessage {
        ClientMessage::Save {
            content: self.store.text(),
        }
    }

    pub fn text(&self) -> String {
        self.store.text()
    }

    pub fn store(&self) -> &SequenceStore {
        &self.store
    }

    pub fn surface(&self) -> &S {
        &self.surface
    }

    pub fn into_surface(self) -> S {
        self.surface
    }

    pub fn peer_id(&self) -> Option<PeerId> {
        self.peer_id
    }

    /// Connected peers and their user names, as announced since `Init`.
    pub fn peers(&self) -> &HashMap<PeerId, Option<String>> {
        &self.peers
    }

    pub fn cursors(&self) -> &HashMap<PeerId, serde_json::Value> {
        &self.cursors
    }

    /// Times the surface was reset after a misplaced local insert.
    pub fn resyncs(&self) -> u64 {
        self.resyncs
    }
}
