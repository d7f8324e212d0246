//! Server configuration from the environment.

use anyhow::{bail, Context, Result};
use std::path::PathBuf;
use uuid::Uuid;
use weft_collab::{ServerConfig, StorageBackend};

/// Everything the binary needs to start.
#[derive(Debug, Clone, Default)]
pub struct Config {
    pub server: ServerConfig,

    /// HMAC secret for signed tokens; open access when unset
    pub auth_secret: Option<String>,

    /// Documents registered in the catalog at startup
    pub documents: Vec<Uuid>,
}

impl Config {
    /// Load configuration from environment variables.
    ///
    /// # Environment Variables
    ///
    /// - `WEFT_BIND_ADDR`: listen address (default `127.0.0.1:9090`)
    /// - `WEFT_MAX_PEERS`: peers per room
    /// - `WEFT_BROADCAST_CAPACITY`: per-room broadcast buffer
    /// - `WEFT_HEARTBEAT_SECS`: ping interval
    /// - `WEFT_IDLE_GRACE_SECS`: how long an empty room stays loaded
    /// - `WEFT_STORAGE`: `memory` or `rocksdb`
    /// - `WEFT_DB_PATH`: RocksDB directory (default `weft_data`)
    /// - `WEFT_AUTH_SECRET`: HMAC token secret
    /// - `WEFT_DOCUMENTS`: comma-separated document UUIDs
    ///
    /// # Errors
    ///
    /// Returns error if a variable is set to an unparsable value.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load configuration from any key → value source.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let mut config = Self::default();
        let server = &mut config.server;

        if let Some(addr) = lookup("WEFT_BIND_ADDR") {
            server.bind_addr = addr;
        }
        if let Some(peers) = lookup("WEFT_MAX_PEERS") {
            server.max_peers_per_room = peers.parse().context("Invalid WEFT_MAX_PEERS")?;
        }
        if let Some(capacity) = lookup("WEFT_BROADCAST_CAPACITY") {
            server.broadcast_capacity = capacity
                .parse()
                .context("Invalid WEFT_BROADCAST_CAPACITY")?;
        }
        if let Some(secs) = lookup("WEFT_HEARTBEAT_SECS") {
            server.heartbeat_interval_secs = secs.parse().context("Invalid WEFT_HEARTBEAT_SECS")?;
        }
        if let Some(secs) = lookup("WEFT_IDLE_GRACE_SECS") {
            server.idle_room_grace_secs = secs.parse().context("Invalid WEFT_IDLE_GRACE_SECS")?;
        }

        let db_path = lookup("WEFT_DB_PATH").map_or_else(|| PathBuf::from("weft_data"), PathBuf::from);
        server.storage = match lookup("WEFT_STORAGE").as_deref() {
            None | Some("memory") => StorageBackend::Memory,
            Some("rocksdb") => StorageBackend::RocksDb { path: db_path },
            Some(other) => bail!("Invalid WEFT_STORAGE {other:?} (expected memory or rocksdb)"),
        };

        config.auth_secret = lookup("WEFT_AUTH_SECRET").filter(|s| !s.is_empty());

        if let Some(docs) = lookup("WEFT_DOCUMENTS") {
            config.documents = docs
                .split(',')
                .map(str::trim)
                .filter(|d| !d.is_empty())
                .map(|d| Uuid::parse_str(d).with_context(|| format!("Invalid document id {d:?}")))
                .collect::<Result<_>>()?;
        }

        Ok(config)
    }
}
