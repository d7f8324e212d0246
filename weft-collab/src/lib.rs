//! # weft-collab: Real-time sync for weft documents
//!
//! Relays sequence operations between replicas over WebSocket and keeps
//! each document's operation history durable.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────┐     WebSocket      ┌─────────────┐
//! │ SyncClient  │ ◄─────────────────► │ SyncServer  │
//! │ (per user)  │     JSON frames     │ (central)   │
//! └──────┬──────┘                     └──────┬──────┘
//!        │                                   │
//!        ▼                                   ▼
//! ┌─────────────┐                     ┌─────────────┐
//! │ Session     │                     │ RoomManager │
//! │ + store     │                     │ (per doc)   │
//! └─────────────┘                     └──────┬──────┘
//!                                            │
//!                                    ┌───────┴───────┐
//!                                    │ BroadcastGroup│
//!                                    │ LogWriter     │
//!                                    └───────────────┘
//! ```
//!
//! The server never interprets operations; it stores and relays them in
//! arrival order. Convergence is the replicas' job.
//!
//! ## Modules
//!
//! - [`protocol`]: JSON wire messages
//! - [`auth`]: Token verification
//! - [`storage`]: Operation log and document catalog (memory, RocksDB)
//! - [`broadcast`]: Per-room fan-out with lag detection
//! - [`room`]: Room lifecycle, join/leave, eviction
//! - [`server`]: WebSocket sync server
//! - [`client`]: WebSocket sync client with offline queue
//! - [`session`]: Binds a sequence store to an editor surface

pub mod auth;
pub mod broadcast;
pub mod client;
pub mod protocol;
pub mod room;
pub mod server;
pub mod session;
pub mod storage;

// Re-exports for convenience
pub use auth::{AuthError, HmacTokens, Identity, IdentityVerifier, OpenAccess, StaticTokens};
pub use broadcast::{BroadcastGroup, BroadcastStats, Envelope, PeerInfo};
pub use client::{ClientError, ConnectionState, OfflineQueue, SyncClient, SyncEvent};
pub use protocol::{ClientMessage, DocumentId, PeerId, ProtocolError, ServerMessage};
pub use room::{JoinError, Joined, Room, RoomLimits, RoomManager};
pub use server::{JoinRequest, ServerConfig, ServerStats, SyncServer};
pub use session::{EditorSurface, LocalChange, Session, TextSurface};
pub use storage::{
    DocumentCatalog, DocumentStore, LogWriter, MemoryStore, OperationLog, Storage,
    StorageBackend, StoreConfig, StoreError,
};
