//! WebSocket sync server with room-based document routing.
//!
//! Architecture:
//! ```text
//! Client A ──┐   ws://host/?token=..&doc=..
//!             ├── RoomManager ── Room (doc_id) ── BroadcastGroup
//! Client B ──┘        │              │
//!                     │              └── in-memory log (replay cache)
//!                     │
//!                     ├── LogWriter ──► OperationLog (memory | RocksDB)
//!                     └── DocumentCatalog (exists, preview)
//! ```
//!
//! Connection lifecycle:
//! 1. Upgrade; token and document id are read from the request query.
//! 2. Join; on refusal the socket is closed with 1008 / 1013 / 1011.
//! 3. `Init` is sent before any frame from the replica is read.
//! 4. Frames are relayed until either side closes; then the peer leaves.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::broadcast::error::RecvError;
use tokio_tungstenite::tungstenite::handshake::server::{Request, Response};
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::{Message, Utf8Bytes};
use tokio_tungstenite::WebSocketStream;
use uuid::Uuid;

use crate::auth::{AuthError, IdentityVerifier};
use crate::protocol::{ClientMessage, DocumentId, ServerMessage};
use crate::room::{JoinError, Joined, RoomLimits, RoomManager};
use crate::storage::{Storage, StorageBackend, StoreError};

type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address to bind to
    pub bind_addr: String,
    /// Maximum peers per room
    pub max_peers_per_room: usize,
    /// Broadcast channel capacity per room
    pub broadcast_capacity: usize,
    /// Heartbeat interval in seconds
    pub heartbeat_interval_secs: u64,
    /// How long an empty room stays in memory
    pub idle_room_grace_secs: u64,
    /// Durable storage backend
    pub storage: StorageBackend,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:9090".to_string(),
            max_peers_per_room: 100,
            broadcast_capacity: 256,
            heartbeat_interval_secs: 30,
            idle_room_grace_secs: 300,
            storage: StorageBackend::Memory,
        }
    }
}

impl ServerConfig {
    /// Ephemeral port, memory storage, short timers.
    pub fn for_testing() -> Self {
        Self {
            bind_addr: "127.0.0.1:0".to_string(),
            max_peers_per_room: 10,
            broadcast_capacity: 64,
            heartbeat_interval_secs: 30,
            idle_room_grace_secs: 1,
            storage: StorageBackend::Memory,
        }
    }

    pub fn room_limits(&self) -> RoomLimits {
        RoomLimits {
            max_peers: self.max_peers_per_room,
            broadcast_capacity: self.broadcast_capacity,
            idle_grace: Duration::from_secs(self.idle_room_grace_secs),
        }
    }
}

/// Server statistics.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ServerStats {
    pub total_connections: u64,
    pub active_connections: u64,
    pub rejected_connections: u64,
    pub total_messages: u64,
    pub malformed_messages: u64,
    pub active_rooms: usize,
    pub rooms_evicted: u64,
    pub persisted_operations: u64,
    pub persistence_failures: u64,
}

/// Connection counters, lock-free on the hot path.
#[derive(Debug, Default)]
struct ConnectionCounters {
    total: AtomicU64,
    active: AtomicU64,
    rejected: AtomicU64,
    messages: AtomicU64,
    malformed: AtomicU64,
}

/// Token and document parsed from the upgrade request query.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JoinRequest {
    pub token: String,
    pub doc_id: DocumentId,
}

impl JoinRequest {
    /// Parse `token=..&doc=..`.
    pub fn from_query(query: Option<&str>) -> Result<Self, JoinError> {
        let mut token = None;
        let mut doc = None;
        for (key, value) in url::form_urlencoded::parse(query.unwrap_or("").as_bytes()) {
            match key.as_ref() {
                "token" => token = Some(value.into_owned()),
                "doc" => doc = Some(value.into_owned()),
                _ => {}
            }
        }

        let token = token
            .filter(|t| !t.is_empty())
            .ok_or(JoinError::Unauthenticated(AuthError::MissingToken))?;
        let doc_id = doc
            .and_then(|d| Uuid::parse_str(&d).ok())
            .ok_or(JoinError::UnknownDocument)?;
        Ok(Self { token, doc_id })
    }
}

/// The sync server.
pub struct SyncServer {
    config: ServerConfig,
    rooms: Arc<RoomManager>,
    counters: Arc<ConnectionCounters>,
}

impl SyncServer {
    /// Open the configured storage and build the server.
    ///
    /// A storage backend that fails to open is an error, never replaced by
    /// a different backend.
    pub fn new(
        config: ServerConfig,
        verifier: Arc<dyn IdentityVerifier>,
    ) -> Result<Self, StoreError> {
        let storage = Storage::open(&config.storage)?;
        Ok(Self::with_storage(config, verifier, storage))
    }

    /// Build the server on already-open storage.
    ///
    /// Must be called within a tokio runtime (the log writer is spawned).
    pub fn with_storage(
        config: ServerConfig,
        verifier: Arc<dyn IdentityVerifier>,
        storage: Storage,
    ) -> Self {
        let rooms = RoomManager::new(config.room_limits(), verifier, storage);
        Self {
            config,
            rooms,
            counters: Arc::new(ConnectionCounters::default()),
        }
    }

    /// Bind the configured address and serve forever.
    pub async fn run(&self) -> std::io::Result<()> {
        let listener = TcpListener::bind(&self.config.bind_addr).await?;
        self.serve(listener).await
    }

    /// Serve connections from an already-bound listener.
    pub async fn serve(&self, listener: TcpListener) -> std::io::Result<()> {
        log::info!("Sync server listening on {}", listener.local_addr()?);

        loop {
            let (stream, addr) = match listener.accept().await {
                Ok(accepted) => accepted,
                Err(e) => {
                    log::error!("Accept failed: {e}");
                    continue;
                }
            };
            log::debug!("New TCP connection from {addr}");

            let rooms = self.rooms.clone();
            let counters = self.counters.clone();
            let heartbeat = Duration::from_secs(self.config.heartbeat_interval_secs.max(1));

            tokio::spawn(async move {
                if let Err(e) =
                    Self::handle_connection(stream, addr, rooms, counters, heartbeat).await
                {
                    log::error!("Connection error from {addr}: {e}");
                }
            });
        }
    }

    /// Handle a single WebSocket connection.
    async fn handle_connection(
        stream: TcpStream,
        addr: SocketAddr,
        rooms: Arc<RoomManager>,
        counters: Arc<ConnectionCounters>,
        heartbeat: Duration,
    ) -> Result<(), BoxError> {
        let mut query: Option<String> = None;
        let mut ws = tokio_tungstenite::accept_hdr_async(stream, |req: &Request, resp: Response| {
            query = req.uri().query().map(str::to_owned);
            Ok(resp)
        })
        .await?;

        counters.total.fetch_add(1, Ordering::Relaxed);

        let joined = match JoinRequest::from_query(query.as_deref()) {
            Ok(request) => rooms.join(&request.token, request.doc_id).await,
            Err(e) => Err(e),
        };
        let joined = match joined {
            Ok(joined) => joined,
            Err(e) => {
                counters.rejected.fetch_add(1, Ordering::Relaxed);
                log::warn!("Refusing connection from {addr}: {e}");
                ws.close(Some(CloseFrame {
                    code: e.close_code(),
                    reason: e.to_string().into(),
                }))
                .await?;
                return Ok(());
            }
        };

        counters.active.fetch_add(1, Ordering::Relaxed);
        let room = joined.room.clone();
        let peer_id = joined.peer_id;

        let outcome = Self::pump(ws, joined, &rooms, &counters, heartbeat).await;

        rooms.leave(&room, peer_id).await;
        counters.active.fetch_sub(1, Ordering::Relaxed);
        log::info!("Connection closed from {addr}");
        outcome
    }

    /// Send `Init`, then relay frames in both directions until either side
    /// goes away.
    async fn pump(
        ws: WebSocketStream<TcpStream>,
        joined: Joined,
        rooms: &RoomManager,
        counters: &ConnectionCounters,
        heartbeat: Duration,
    ) -> Result<(), BoxError> {
        let Joined {
            peer_id,
            room,
            operations,
            mut receiver,
            ..
        } = joined;
        let (mut ws_sender, mut ws_receiver) = ws.split();

        let init = ServerMessage::Init {
            operations,
            peer_id,
        };
        ws_sender.send(Message::text(init.encode()?)).await?;

        let mut ticker =
            tokio::time::interval_at(tokio::time::Instant::now() + heartbeat, heartbeat);

        loop {
            tokio::select! {
                // Incoming WebSocket message
                msg = ws_receiver.next() => {
                    match msg {
                        Some(Ok(Message::Text(text))) => {
                            counters.messages.fetch_add(1, Ordering::Relaxed);
                            match ClientMessage::decode(text.as_str()) {
                                Ok(ClientMessage::Op { op }) => {
                                    rooms.submit_op(&room, peer_id, op).await;
                                }
                                Ok(ClientMessage::Cursor { payload }) => {
                                    rooms.relay_cursor(&room, peer_id, payload);
                                }
                                Ok(ClientMessage::Save { content }) => {
                                    if let Err(e) = rooms.save_preview(room.doc_id(), content).await {
                                        log::error!("Failed to save preview for doc {}: {e}", room.doc_id());
                                    }
                                }
                                Err(e) => {
                                    counters.malformed.fetch_add(1, Ordering::Relaxed);
                                    log::warn!("Dropping message from peer {peer_id}: {e}");
                                }
                            }
                        }

                        Some(Ok(Message::Binary(_))) => {
                            counters.malformed.fetch_add(1, Ordering::Relaxed);
                            log::warn!("Dropping binary frame from peer {peer_id}");
                        }

                        Some(Ok(Message::Ping(data))) => {
                            ws_sender.send(Message::Pong(data)).await?;
                        }

                        Some(Ok(Message::Close(_))) | None => break,

                        Some(Err(e)) => {
                            log::error!("WebSocket error from peer {peer_id}: {e}");
                            break;
                        }

                        _ => {}
                    }
                }

                // Outgoing broadcast frame
                envelope = receiver.recv() => {
                    match envelope {
                        Ok(envelope) => {
                            // Don't echo back to sender
                            if envelope.from == peer_id {
                                continue;
                            }
                            ws_sender.send(Message::text(envelope.frame.to_string())).await?;
                        }
                        Err(RecvError::Lagged(n)) => {
                            log::warn!("Peer {peer_id} lagged by {n} messages; disconnecting");
                            ws_sender
                                .send(Message::Close(Some(CloseFrame {
                                    code: CloseCode::Error,
                                    reason: Utf8Bytes::from_static("lagged behind room broadcast"),
                                })))
                                .await?;
                            break;
                        }
                        Err(RecvError::Closed) => break,
                    }
                }

                _ = ticker.tick() => {
                    ws_sender.send(Message::Ping(Default::default())).await?;
                }
            }
        }

        Ok(())
    }

    /// Get server statistics.
    pub async fn stats(&self) -> ServerStats {
        let writer = self.rooms.writer().stats();
        ServerStats {
            total_connections: self.counters.total.load(Ordering::Relaxed),
            active_connections: self.counters.active.load(Ordering::Relaxed),
            rejected_connections: self.counters.rejected.load(Ordering::Relaxed),
            total_messages: self.counters.messages.load(Ordering::Relaxed),
            malformed_messages: self.counters.malformed.load(Ordering::Relaxed),
            active_rooms: self.rooms.room_count().await,
            rooms_evicted: self.rooms.counters().rooms_evicted.load(Ordering::Relaxed),
            persisted_operations: writer.persisted.load(Ordering::Relaxed),
            persistence_failures: writer.failures.load(Ordering::Relaxed),
        }
    }

    /// Get the configured bind address.
    pub fn bind_addr(&self) -> &str {
        &self.config.bind_addr
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    /// Get room manager reference.
    pub fn room_manager(&self) -> &Arc<RoomManager> {
        &self.rooms
    }

    pub fn storage(&self) -> &Storage {
        self.rooms.storage()
    }
}
