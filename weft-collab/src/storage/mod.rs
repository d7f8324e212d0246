//! Durable operation log and document catalog.
//!
//! Architecture:
//! ```text
//! ┌─────────────┐  append (queued)  ┌────────────┐      ┌──────────────────┐
//! │ RoomManager │ ────────────────► │ LogWriter  │ ───► │ dyn OperationLog │
//! │             │                   │ (blocking) │      └──────────────────┘
//! │             │  read_all on load                       ▲
//! │             │ ────────────────────────────────────────┘
//! │             │  exists / save_preview ──► dyn DocumentCatalog
//! └─────────────┘
//! ```
//!
//! Two backends implement both traits: [`MemoryStore`] and the RocksDB-backed
//! [`DocumentStore`]. The backend is chosen once at startup through
//! [`StorageBackend`]; a backend that fails to open is a fatal error.

pub mod memory;
pub mod rocks;
pub mod writer;

pub use memory::MemoryStore;
pub use rocks::{DocumentMetadata, DocumentStore, StoreConfig};
pub use writer::LogWriter;

use std::path::PathBuf;
use std::sync::Arc;

use weft_core::Operation;

use crate::protocol::DocumentId;

/// Storage errors.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StoreError {
    /// RocksDB internal error
    #[error("database error: {0}")]
    Database(String),
    #[error("serialization error: {0}")]
    Serialization(String),
    #[error("deserialization error: {0}")]
    Deserialization(String),
    #[error("compression error: {0}")]
    Compression(String),
    /// The writer task is gone.
    #[error("log writer stopped")]
    WriterStopped,
}

impl From<rocksdb::Error> for StoreError {
    fn from(e: rocksdb::Error) -> Self {
        StoreError::Database(e.to_string())
    }
}

/// Append-only, per-document operation history.
pub trait OperationLog: Send + Sync {
    /// Append one operation after every operation previously appended for
    /// the same document.
    fn append(&self, doc_id: DocumentId, op: &Operation) -> Result<(), StoreError>;

    /// All operations of a document in append order.
    fn read_all(&self, doc_id: DocumentId) -> Result<Vec<Operation>, StoreError>;
}

/// Registry of joinable documents plus their non-authoritative preview.
pub trait DocumentCatalog: Send + Sync {
    fn exists(&self, doc_id: DocumentId) -> Result<bool, StoreError>;

    /// Make a document joinable. Registering twice is a no-op.
    fn register(&self, doc_id: DocumentId) -> Result<(), StoreError>;

    fn save_preview(&self, doc_id: DocumentId, content: &str) -> Result<(), StoreError>;

    fn preview(&self, doc_id: DocumentId) -> Result<Option<String>, StoreError>;
}

/// Storage backend selected at startup.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum StorageBackend {
    /// Process memory; lost on restart.
    #[default]
    Memory,
    /// RocksDB database at `path`.
    RocksDb { path: PathBuf },
}

/// The collaborators a server needs, backed by one store.
#[derive(Clone)]
pub struct Storage {
    pub log: Arc<dyn OperationLog>,
    pub catalog: Arc<dyn DocumentCatalog>,
}

impl Storage {
    /// Open the configured backend.
    pub fn open(backend: &StorageBackend) -> Result<Self, StoreError> {
        match backend {
            StorageBackend::Memory => Ok(Self::memory()),
            StorageBackend::RocksDb { path } => {
                let store = Arc::new(DocumentStore::open(StoreConfig {
                    path: path.clone(),
                    ..StoreConfig::default()
                })?);
                log::info!("Opened document store at {}", path.display());
                Ok(Self::shared(store))
            }
        }
    }

    /// Fresh in-memory storage.
    pub fn memory() -> Self {
        Self::shared(Arc::new(MemoryStore::new()))
    }

    /// Use one store for both roles.
    pub fn shared<S>(store: Arc<S>) -> Self
    where
        S: OperationLog + DocumentCatalog + 'static,
    {
        Self {
            log: store.clone(),
            catalog: store,
        }
    }
}

impl std::fmt::Debug for Storage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Storage").finish_non_exhaustive()
    }
}
