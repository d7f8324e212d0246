//! Room lifecycle: one room per document, created on first join, evicted
//! after an idle grace period.
//!
//! ```text
//!   absent ──join──► active ──last leave──► draining ──grace expires──► absent
//!                      ▲                        │
//!                      └──────── join ──────────┘
//! ```
//!
//! The durable log is authoritative; a room's in-memory log is a replay
//! cache loaded from it when the room is created. Every mutation of a room
//! (log append, durable append, broadcast) happens under the room's mutex, so
//! all peers observe one order per room.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::{broadcast, Mutex, OnceCell, RwLock};
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use uuid::Uuid;

use weft_core::Operation;

use crate::auth::{AuthError, IdentityVerifier};
use crate::broadcast::{BroadcastGroup, Envelope, PeerInfo};
use crate::protocol::{DocumentId, PeerId, ServerMessage};
use crate::storage::{LogWriter, Storage, StoreError};

/// Limits applied to every room.
#[derive(Debug, Clone)]
pub struct RoomLimits {
    pub max_peers: usize,
    pub broadcast_capacity: usize,
    pub idle_grace: Duration,
}

impl Default for RoomLimits {
    fn default() -> Self {
        Self {
            max_peers: 100,
            broadcast_capacity: 256,
            idle_grace: Duration::from_secs(300),
        }
    }
}

/// Why a join was refused.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum JoinError {
    #[error("authentication failed: {0}")]
    Unauthenticated(#[from] AuthError),
    #[error("unknown document")]
    UnknownDocument,
    #[error("room is full")]
    RoomFull,
    #[error("storage unavailable: {0}")]
    Storage(#[from] StoreError),
}

impl JoinError {
    /// WebSocket close code sent to the refused replica.
    pub fn close_code(&self) -> CloseCode {
        match self {
            JoinError::Unauthenticated(_) | JoinError::UnknownDocument => CloseCode::Policy,
            JoinError::RoomFull => CloseCode::Again,
            JoinError::Storage(_) => CloseCode::Error,
        }
    }
}

/// Room-level counters, shared with the server statistics.
#[derive(Debug, Default)]
pub struct RoomCounters {
    pub rooms_created: AtomicU64,
    pub rooms_evicted: AtomicU64,
}

struct RoomState {
    log: Vec<Operation>,
    /// Bumped on every join and every last-leave; a pending eviction only
    /// fires if the generation it captured is still current.
    generation: u64,
    /// Set once the room has been removed from the registry.
    evicted: bool,
}

/// Live state of one document.
pub struct Room {
    doc_id: DocumentId,
    state: Mutex<RoomState>,
    broadcast: BroadcastGroup,
}

impl Room {
    fn new(doc_id: DocumentId, log: Vec<Operation>, capacity: usize) -> Self {
        Self {
            doc_id,
            state: Mutex::new(RoomState {
                log,
                generation: 0,
                evicted: false,
            }),
            broadcast: BroadcastGroup::new(capacity),
        }
    }

    pub fn doc_id(&self) -> DocumentId {
        self.doc_id
    }

    pub async fn peer_count(&self) -> usize {
        self.broadcast.peer_count().await
    }

    pub async fn peers(&self) -> Vec<PeerInfo> {
        self.broadcast.peers().await
    }

    /// Number of operations in the in-memory log.
    pub async fn log_len(&self) -> usize {
        self.state.lock().await.log.len()
    }
}

/// A successful join.
pub struct Joined {
    pub peer_id: PeerId,
    pub user: String,
    pub room: Arc<Room>,
    /// History to send as `Init`, in append order.
    pub operations: Vec<Operation>,
    /// Every frame broadcast after the history snapshot.
    pub receiver: broadcast::Receiver<Envelope>,
}

/// Registry entry; empty while the room's history is loading.
type RoomSlot = Arc<OnceCell<Arc<Room>>>;

/// Owns the document → room registry.
///
/// The registry lock is only held to look up or insert a slot. Loading a
/// room's history happens inside the slot, so a slow document never stalls
/// joins to other documents.
pub struct RoomManager {
    rooms: RwLock<HashMap<DocumentId, RoomSlot>>,
    limits: RoomLimits,
    verifier: Arc<dyn IdentityVerifier>,
    storage: Storage,
    writer: LogWriter,
    counters: RoomCounters,
    me: Weak<RoomManager>,
}

impl RoomManager {
    /// Create a manager and start its log writer.
    pub fn new(
        limits: RoomLimits,
        verifier: Arc<dyn IdentityVerifier>,
        storage: Storage,
    ) -> Arc<Self> {
        let writer = LogWriter::spawn(storage.log.clone());
        Arc::new_cyclic(|me| Self {
            rooms: RwLock::new(HashMap::new()),
            limits,
            verifier,
            storage,
            writer,
            counters: RoomCounters::default(),
            me: me.clone(),
        })
    }

    /// Authenticate, check the document, and register a new peer.
    ///
    /// The returned history and receiver together cover every operation of
    /// the room exactly once.
    pub async fn join(&self, token: &str, doc_id: DocumentId) -> Result<Joined, JoinError> {
        let identity = self.verifier.verify(token)?;

        let catalog = self.storage.catalog.clone();
        let exists = tokio::task::spawn_blocking(move || catalog.exists(doc_id))
            .await
            .map_err(|e| StoreError::Database(e.to_string()))??;
        if !exists {
            return Err(JoinError::UnknownDocument);
        }

        loop {
            let room = self.get_or_create(doc_id).await?;
            let mut state = room.state.lock().await;
            if state.evicted {
                // Lost a race with eviction; the registry has moved on.
                continue;
            }
            if room.broadcast.peer_count().await >= self.limits.max_peers {
                return Err(JoinError::RoomFull);
            }

            let peer_id = Uuid::new_v4();
            state.generation += 1;
            let receiver = room
                .broadcast
                .add_peer(PeerInfo {
                    peer_id,
                    user: identity.user.clone(),
                })
                .await;
            let operations = state.log.clone();

            let join = ServerMessage::PeerJoin {
                peer_id,
                user: Some(identity.user.clone()),
            };
            if let Err(e) = room.broadcast.broadcast(peer_id, &join) {
                log::error!("Failed to announce peer {peer_id}: {e}");
            }
            drop(state);

            log::info!(
                "Peer {peer_id} ({}) joined doc {doc_id} ({} ops replayed)",
                identity.user,
                operations.len()
            );
            return Ok(Joined {
                peer_id,
                user: identity.user,
                room,
                operations,
                receiver,
            });
        }
    }

    /// Append an operation and relay it to every other peer.
    pub async fn submit_op(&self, room: &Room, peer_id: PeerId, op: Operation) {
        let mut state = room.state.lock().await;
        state.log.push(op.clone());
        self.writer.append(room.doc_id, op.clone());

        let msg = ServerMessage::Op { op, peer_id };
        if let Err(e) = room.broadcast.broadcast(peer_id, &msg) {
            log::error!("Failed to relay op in doc {}: {e}", room.doc_id);
        }
    }

    /// Relay ephemeral presence data. Never persisted.
    pub fn relay_cursor(&self, room: &Room, peer_id: PeerId, payload: serde_json::Value) {
        log::trace!("Cursor update from {peer_id} in doc {}", room.doc_id);
        let msg = ServerMessage::Cursor { payload, peer_id };
        if let Err(e) = room.broadcast.broadcast(peer_id, &msg) {
            log::error!("Failed to relay cursor in doc {}: {e}", room.doc_id);
        }
    }

    /// Store the human-readable preview of a document.
    pub async fn save_preview(&self, doc_id: DocumentId, content: String) -> Result<(), StoreError> {
        let catalog = self.storage.catalog.clone();
        tokio::task::spawn_blocking(move || catalog.save_preview(doc_id, &content))
            .await
            .map_err(|e| StoreError::Database(e.to_string()))?
    }

    /// Remove a peer, announce it, and schedule eviction if the room is empty.
    pub async fn leave(&self, room: &Arc<Room>, peer_id: PeerId) {
        let mut state = room.state.lock().await;
        if room.broadcast.remove_peer(&peer_id).await.is_none() {
            return;
        }
        if let Err(e) = room
            .broadcast
            .broadcast(peer_id, &ServerMessage::PeerLeave { peer_id })
        {
            log::error!("Failed to announce departure of peer {peer_id}: {e}");
        }
        log::info!("Peer {peer_id} left doc {}", room.doc_id);

        if room.broadcast.peer_count().await == 0 {
            state.generation += 1;
            let generation = state.generation;
            let doc_id = room.doc_id;
            let grace = self.limits.idle_grace;
            let manager = self.me.clone();
            log::debug!("Doc {doc_id} idle; evicting in {grace:?} unless rejoined");

            tokio::spawn(async move {
                tokio::time::sleep(grace).await;
                if let Some(manager) = manager.upgrade() {
                    manager.evict_if_idle(doc_id, generation).await;
                }
            });
        }
    }

    /// Drop a room from memory if nothing happened since `generation`.
    async fn evict_if_idle(&self, doc_id: DocumentId, generation: u64) -> bool {
        let mut rooms = self.rooms.write().await;
        let Some(room) = rooms.get(&doc_id).and_then(|slot| slot.get().cloned()) else {
            return false;
        };
        let mut state = room.state.lock().await;
        if state.generation != generation || room.broadcast.peer_count().await > 0 {
            return false;
        }
        state.evicted = true;
        rooms.remove(&doc_id);
        self.counters.rooms_evicted.fetch_add(1, Ordering::Relaxed);
        log::info!("Evicted idle room for doc {doc_id}");
        true
    }

    /// Get or create a room, loading its history from the durable log.
    ///
    /// Concurrent joins to a loading document wait on its slot; only one of
    /// them reads the log.
    async fn get_or_create(&self, doc_id: DocumentId) -> Result<Arc<Room>, StoreError> {
        let slot = self.slot(doc_id).await;
        let loaded = slot.get_or_try_init(|| self.load_room(doc_id)).await.cloned();

        if loaded.is_err() {
            // Let the next join retry with a fresh slot.
            let mut rooms = self.rooms.write().await;
            if rooms
                .get(&doc_id)
                .is_some_and(|current| Arc::ptr_eq(current, &slot) && !current.initialized())
            {
                rooms.remove(&doc_id);
            }
        }
        loaded
    }

    /// The registry slot for a document, inserting an empty one if absent.
    async fn slot(&self, doc_id: DocumentId) -> RoomSlot {
        // Fast path: read lock
        if let Some(slot) = self.rooms.read().await.get(&doc_id) {
            return slot.clone();
        }
        self.rooms.write().await.entry(doc_id).or_default().clone()
    }

    async fn load_room(&self, doc_id: DocumentId) -> Result<Arc<Room>, StoreError> {
        // Appends queued by an evicted incarnation must land first.
        self.writer.flush().await?;
        let oplog = self.storage.log.clone();
        let history = tokio::task::spawn_blocking(move || oplog.read_all(doc_id))
            .await
            .map_err(|e| StoreError::Database(e.to_string()))??;

        log::info!("Room created for doc {doc_id} ({} ops loaded)", history.len());
        self.counters.rooms_created.fetch_add(1, Ordering::Relaxed);
        Ok(Arc::new(Room::new(
            doc_id,
            history,
            self.limits.broadcast_capacity,
        )))
    }

    pub async fn room(&self, doc_id: DocumentId) -> Option<Arc<Room>> {
        self.rooms
            .read()
            .await
            .get(&doc_id)
            .and_then(|slot| slot.get().cloned())
    }

    /// Get the number of loaded rooms.
    pub async fn room_count(&self) -> usize {
        self.rooms
            .read()
            .await
            .values()
            .filter(|slot| slot.initialized())
            .count()
    }

    /// Get all loaded document IDs.
    pub async fn active_documents(&self) -> Vec<DocumentId> {
        self.rooms
            .read()
            .await
            .iter()
            .filter(|(_, slot)| slot.initialized())
            .map(|(doc_id, _)| *doc_id)
            .collect()
    }

    /// Wait until every operation submitted so far is durable.
    pub async fn flush(&self) -> Result<(), StoreError> {
        self.writer.flush().await
    }

    pub fn writer(&self) -> &LogWriter {
        &self.writer
    }

    pub fn counters(&self) -> &RoomCounters {
        &self.counters
    }

    pub fn storage(&self) -> &Storage {
        &self.storage
    }

    pub fn limits(&self) -> &RoomLimits {
        &self.limits
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::StaticTokens;
    use crate::storage::{DocumentCatalog, MemoryStore, OperationLog};
    use tokio::sync::broadcast::error::TryRecvError;
    use weft_core::SequenceStore;

    struct Fixture {
        manager: Arc<RoomManager>,
        store: Arc<MemoryStore>,
        doc: DocumentId,
    }

    fn fixture(limits: RoomLimits) -> Fixture {
        let doc = Uuid::new_v4();
        let store = Arc::new(MemoryStore::with_documents([doc]));
        let tokens = StaticTokens::new()
            .with("t-alice", "alice")
            .with("t-bob", "bob")
            .with("t-carol", "carol");
        let manager = RoomManager::new(limits, Arc::new(tokens), Storage::shared(store.clone()));
        Fixture { manager, store, doc }
    }

    fn ops(text: &str) -> Vec<Operation> {
        let mut replica = SequenceStore::new("writer");
        replica
            .local_insert_str(text, 0)
            .unwrap()
            .into_iter()
            .map(Operation::from)
            .collect()
    }

    fn decode(envelope: Envelope) -> ServerMessage {
        ServerMessage::decode(&envelope.frame).unwrap()
    }

    /// Next frame not sent by `me`, as the connection loop would see it.
    async fn next_foreign(joined: &mut Joined) -> Envelope {
        loop {
            let envelope = joined.receiver.recv().await.unwrap();
            if envelope.from != joined.peer_id {
                return envelope;
            }
        }
    }

    #[tokio::test]
    async fn test_join_rejections() {
        let f = fixture(RoomLimits::default());
        assert!(matches!(
            f.manager.join("nope", f.doc).await,
            Err(JoinError::Unauthenticated(AuthError::Invalid))
        ));
        assert!(matches!(
            f.manager.join("", f.doc).await,
            Err(JoinError::Unauthenticated(AuthError::MissingToken))
        ));
        assert!(matches!(
            f.manager.join("t-alice", Uuid::new_v4()).await,
            Err(JoinError::UnknownDocument)
        ));
        assert_eq!(f.manager.room_count().await, 0);
    }

    #[tokio::test]
    async fn test_room_full() {
        let f = fixture(RoomLimits {
            max_peers: 2,
            ..RoomLimits::default()
        });
        let _a = f.manager.join("t-alice", f.doc).await.unwrap();
        let _b = f.manager.join("t-bob", f.doc).await.unwrap();
        assert!(matches!(
            f.manager.join("t-carol", f.doc).await,
            Err(JoinError::RoomFull)
        ));
        assert_eq!(JoinError::RoomFull.close_code(), CloseCode::Again);
        assert_eq!(JoinError::UnknownDocument.close_code(), CloseCode::Policy);
    }

    #[tokio::test]
    async fn test_join_replays_persisted_history() {
        let f = fixture(RoomLimits::default());
        let history = ops("abc");
        for op in &history {
            f.store.append(f.doc, op).unwrap();
        }

        let joined = f.manager.join("t-alice", f.doc).await.unwrap();
        assert_eq!(joined.operations, history);
        assert_eq!(joined.user, "alice");
    }

    #[tokio::test]
    async fn test_op_is_relayed_logged_and_persisted() {
        let f = fixture(RoomLimits::default());
        let mut alice = f.manager.join("t-alice", f.doc).await.unwrap();
        let mut bob = f.manager.join("t-bob", f.doc).await.unwrap();

        // Alice hears about Bob; her own join frame is filtered by sender.
        let seen = alice.receiver.recv().await.unwrap();
        assert_eq!(seen.from, alice.peer_id);
        let seen = decode(alice.receiver.recv().await.unwrap());
        assert_eq!(
            seen,
            ServerMessage::PeerJoin {
                peer_id: bob.peer_id,
                user: Some("bob".into())
            }
        );

        let op = ops("x").remove(0);
        f.manager
            .submit_op(&alice.room, alice.peer_id, op.clone())
            .await;

        let relayed = next_foreign(&mut bob).await;
        assert_eq!(relayed.from, alice.peer_id);
        assert_eq!(
            decode(relayed),
            ServerMessage::Op {
                op: op.clone(),
                peer_id: alice.peer_id
            }
        );

        f.manager.flush().await.unwrap();
        assert_eq!(f.store.read_all(f.doc).unwrap(), vec![op]);
        assert_eq!(alice.room.log_len().await, 1);
    }

    #[tokio::test]
    async fn test_late_joiner_sees_each_op_once() {
        let f = fixture(RoomLimits::default());
        let alice = f.manager.join("t-alice", f.doc).await.unwrap();
        let history = ops("hey");
        for op in &history[..2] {
            f.manager.submit_op(&alice.room, alice.peer_id, op.clone()).await;
        }

        let mut bob = f.manager.join("t-bob", f.doc).await.unwrap();
        f.manager
            .submit_op(&alice.room, alice.peer_id, history[2].clone())
            .await;

        assert_eq!(bob.operations, history[..2].to_vec());
        // Own join announcement, then the op sent after joining.
        assert_eq!(bob.receiver.recv().await.unwrap().from, bob.peer_id);
        match decode(bob.receiver.recv().await.unwrap()) {
            ServerMessage::Op { op, .. } => assert_eq!(op, history[2]),
            other => panic!("unexpected {other:?}"),
        }
        assert!(matches!(bob.receiver.try_recv(), Err(TryRecvError::Empty)));
    }

    #[tokio::test]
    async fn test_cursor_is_not_persisted() {
        let f = fixture(RoomLimits::default());
        let alice = f.manager.join("t-alice", f.doc).await.unwrap();
        let mut bob = f.manager.join("t-bob", f.doc).await.unwrap();

        f.manager
            .relay_cursor(&alice.room, alice.peer_id, serde_json::json!({"line": 1}));
        match decode(next_foreign(&mut bob).await) {
            ServerMessage::Cursor { payload, peer_id } => {
                assert_eq!(payload["line"], 1);
                assert_eq!(peer_id, alice.peer_id);
            }
            other => panic!("unexpected {other:?}"),
        }
        f.manager.flush().await.unwrap();
        assert_eq!(f.store.log_len(f.doc), 0);
        assert_eq!(alice.room.log_len().await, 0);
    }

    #[tokio::test]
    async fn test_save_preview() {
        let f = fixture(RoomLimits::default());
        f.manager.save_preview(f.doc, "hello".into()).await.unwrap();
        assert_eq!(f.store.preview(f.doc).unwrap().as_deref(), Some("hello"));
    }

    #[tokio::test]
    async fn test_leave_announces_and_evicts_after_grace() {
        let f = fixture(RoomLimits {
            idle_grace: Duration::from_millis(50),
            ..RoomLimits::default()
        });
        let alice = f.manager.join("t-alice", f.doc).await.unwrap();
        let mut bob = f.manager.join("t-bob", f.doc).await.unwrap();

        f.manager.leave(&alice.room, alice.peer_id).await;
        assert_eq!(
            decode(next_foreign(&mut bob).await),
            ServerMessage::PeerLeave {
                peer_id: alice.peer_id
            }
        );
        assert_eq!(alice.room.peer_count().await, 1);

        f.manager.leave(&bob.room, bob.peer_id).await;
        assert_eq!(f.manager.room_count().await, 1);

        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(f.manager.room_count().await, 0);
        assert_eq!(f.manager.counters().rooms_evicted.load(Ordering::Relaxed), 1);
    }

    #[tokio::test]
    async fn test_rejoin_within_grace_keeps_room() {
        let f = fixture(RoomLimits {
            idle_grace: Duration::from_millis(100),
            ..RoomLimits::default()
        });
        let alice = f.manager.join("t-alice", f.doc).await.unwrap();
        let room = alice.room.clone();
        f.manager.leave(&alice.room, alice.peer_id).await;

        let _bob = f.manager.join("t-bob", f.doc).await.unwrap();
        tokio::time::sleep(Duration::from_millis(250)).await;

        let current = f.manager.room(f.doc).await.unwrap();
        assert!(Arc::ptr_eq(&room, &current));
        assert_eq!(f.manager.counters().rooms_evicted.load(Ordering::Relaxed), 0);
    }

    #[tokio::test]
    async fn test_reload_after_eviction_includes_every_op() {
        let f = fixture(RoomLimits {
            idle_grace: Duration::from_millis(10),
            ..RoomLimits::default()
        });
        let history = ops("persist");
        let alice = f.manager.join("t-alice", f.doc).await.unwrap();
        for op in &history {
            f.manager.submit_op(&alice.room, alice.peer_id, op.clone()).await;
        }
        f.manager.leave(&alice.room, alice.peer_id).await;
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(f.manager.room_count().await, 0);

        let bob = f.manager.join("t-bob", f.doc).await.unwrap();
        assert!(!Arc::ptr_eq(&alice.room, &bob.room));
        assert_eq!(bob.operations, history);
    }

    /// Store whose log reads for one document wait for a release signal.
    struct GatedStore {
        inner: MemoryStore,
        gated: DocumentId,
        gate: std::sync::Mutex<std::sync::mpsc::Receiver<()>>,
        fail_reads: std::sync::atomic::AtomicBool,
    }

    impl GatedStore {
        fn new(gated: DocumentId, others: &[DocumentId]) -> (Arc<Self>, std::sync::mpsc::Sender<()>) {
            let (release, gate) = std::sync::mpsc::channel();
            let inner = MemoryStore::with_documents(others.iter().copied().chain([gated]));
            let store = Arc::new(Self {
                inner,
                gated,
                gate: std::sync::Mutex::new(gate),
                fail_reads: std::sync::atomic::AtomicBool::new(false),
            });
            (store, release)
        }
    }

    impl OperationLog for GatedStore {
        fn append(&self, doc_id: DocumentId, op: &Operation) -> Result<(), StoreError> {
            self.inner.append(doc_id, op)
        }

        fn read_all(&self, doc_id: DocumentId) -> Result<Vec<Operation>, StoreError> {
            if doc_id == self.gated {
                let _ = self.gate.lock().unwrap().recv();
            }
            if self.fail_reads.load(Ordering::SeqCst) {
                return Err(StoreError::Database("disk gone".into()));
            }
            self.inner.read_all(doc_id)
        }
    }

    impl DocumentCatalog for GatedStore {
        fn exists(&self, doc_id: DocumentId) -> Result<bool, StoreError> {
            self.inner.exists(doc_id)
        }

        fn register(&self, doc_id: DocumentId) -> Result<(), StoreError> {
            self.inner.register(doc_id)
        }

        fn save_preview(&self, doc_id: DocumentId, content: &str) -> Result<(), StoreError> {
            self.inner.save_preview(doc_id, content)
        }

        fn preview(&self, doc_id: DocumentId) -> Result<Option<String>, StoreError> {
            self.inner.preview(doc_id)
        }
    }

    fn gated_manager(store: Arc<GatedStore>) -> Arc<RoomManager> {
        let tokens = StaticTokens::new()
            .with("t-alice", "alice")
            .with("t-bob", "bob");
        RoomManager::new(RoomLimits::default(), Arc::new(tokens), Storage::shared(store))
    }

    #[tokio::test]
    async fn test_slow_load_does_not_stall_other_rooms() {
        let slow = Uuid::new_v4();
        let fast = Uuid::new_v4();
        let (store, release) = GatedStore::new(slow, &[fast]);
        let manager = gated_manager(store);

        let loading = tokio::spawn({
            let manager = manager.clone();
            async move { manager.join("t-alice", slow).await.map(|j| j.room.doc_id()) }
        });
        tokio::time::sleep(Duration::from_millis(50)).await;

        let joined = tokio::time::timeout(Duration::from_secs(2), manager.join("t-bob", fast))
            .await
            .expect("join to another document stalled")
            .unwrap();
        assert_eq!(joined.room.doc_id(), fast);
        // The loading room is not visible yet.
        assert_eq!(manager.room_count().await, 1);
        assert!(manager.room(slow).await.is_none());
        assert_eq!(manager.active_documents().await, vec![fast]);

        release.send(()).unwrap();
        assert_eq!(loading.await.unwrap().unwrap(), slow);
        assert_eq!(manager.room_count().await, 2);
    }

    #[tokio::test]
    async fn test_failed_load_is_retried() {
        let doc = Uuid::new_v4();
        let (store, release) = GatedStore::new(Uuid::new_v4(), &[doc]);
        drop(release);
        let manager = gated_manager(store.clone());

        store.fail_reads.store(true, Ordering::SeqCst);
        assert!(matches!(
            manager.join("t-alice", doc).await,
            Err(JoinError::Storage(_))
        ));
        assert_eq!(manager.room_count().await, 0);

        store.fail_reads.store(false, Ordering::SeqCst);
        let joined = manager.join("t-alice", doc).await.unwrap();
        assert_eq!(joined.room.doc_id(), doc);
        assert_eq!(manager.room_count().await, 1);
    }

    #[tokio::test]
    async fn test_leave_twice_is_harmless() {
        let f = fixture(RoomLimits::default());
        let alice = f.manager.join("t-alice", f.doc).await.unwrap();
        f.manager.leave(&alice.room, alice.peer_id).await;
        f.manager.leave(&alice.room, alice.peer_id).await;
        assert_eq!(alice.room.peer_count().await, 0);
    }
}
