//! Fan-out of encoded frames to every peer in a room.
//!
//! Uses a tokio broadcast channel for O(1) send to all subscribers. Each peer
//! gets an independent receiver buffering up to `capacity` frames; a receiver
//! that falls further behind observes `Lagged` and must be disconnected,
//! since it has lost operations.
//!
//! Frames are encoded once and shared; the sender id travels alongside so
//! receivers can skip their own messages without decoding.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{broadcast, RwLock};

use crate::protocol::{PeerId, ProtocolError, ServerMessage};

/// One encoded server frame plus the peer it came from.
#[derive(Debug, Clone)]
pub struct Envelope {
    pub from: PeerId,
    pub frame: Arc<str>,
}

/// A connected peer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerInfo {
    pub peer_id: PeerId,
    pub user: String,
}

/// Statistics for monitoring broadcast health.
#[derive(Debug, Clone, Default)]
pub struct BroadcastStats {
    pub messages_sent: u64,
    pub active_peers: usize,
}

/// A broadcast group for a single document room.
pub struct BroadcastGroup {
    sender: broadcast::Sender<Envelope>,
    peers: RwLock<HashMap<PeerId, PeerInfo>>,
    capacity: usize,
    /// Lock-free on the hot path
    messages_sent: AtomicU64,
}

impl BroadcastGroup {
    /// Create a new broadcast group with the given buffer capacity.
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self {
            sender,
            peers: RwLock::new(HashMap::new()),
            capacity,
            messages_sent: AtomicU64::new(0),
        }
    }

    /// Add a peer and return its receiver.
    ///
    /// The receiver sees every frame sent after this call.
    pub async fn add_peer(&self, info: PeerInfo) -> broadcast::Receiver<Envelope> {
        let mut peers = self.peers.write().await;
        peers.insert(info.peer_id, info);
        self.sender.subscribe()
    }

    pub async fn remove_peer(&self, peer_id: &PeerId) -> Option<PeerInfo> {
        self.peers.write().await.remove(peer_id)
    }

    /// Encode and send a message on behalf of `from`.
    ///
    /// Returns the number of receivers, the sender's own included; filtering
    /// is the receiver's job.
    pub fn broadcast(&self, from: PeerId, msg: &ServerMessage) -> Result<usize, ProtocolError> {
        let frame: Arc<str> = msg.encode()?.into();
        Ok(self.broadcast_raw(Envelope { from, frame }))
    }

    /// Send a pre-encoded frame.
    pub fn broadcast_raw(&self, envelope: Envelope) -> usize {
        let count = self.sender.send(envelope).unwrap_or(0);
        self.messages_sent.fetch_add(1, Ordering::Relaxed);
        count
    }

    pub async fn peer_count(&self) -> usize {
        self.peers.read().await.len()
    }

    pub async fn peers(&self) -> Vec<PeerInfo> {
        self.peers.read().await.values().cloned().collect()
    }

    pub async fn has_peer(&self, peer_id: &PeerId) -> bool {
        self.peers.read().await.contains_key(peer_id)
    }

    pub async fn stats(&self) -> BroadcastStats {
        BroadcastStats {
            messages_sent: self.messages_sent.load(Ordering::Relaxed),
            active_peers: self.peers.read().await.len(),
        }
    }

    /// Get the channel capacity.
    pub fn capacity(&self) -> usize {
        self.capacity
    }
}
