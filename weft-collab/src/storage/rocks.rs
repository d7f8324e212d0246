//! RocksDB-backed operation log and document catalog.
//!
//! Column families:
//! - `documents` : Document metadata (bincode), one key per registered document
//! - `previews`  : Latest saved preview text (LZ4 compressed)
//! - `operations`: Operation log, keyed by `doc_id:seq` so a prefix scan
//!   returns one document's history in append order
//!
//! Reference: Kleppmann, DDIA Chapter 3 (LSM Trees, SSTables)

use rocksdb::{
    BlockBasedOptions, Cache, ColumnFamilyDescriptor, DBCompressionType, DBWithThreadMode,
    Direction, IteratorMode, Options, SingleThreaded, WriteBatch, WriteOptions,
};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::SystemTime;
use uuid::Uuid;
use weft_core::{Element, ElementId, Operation};

use super::{DocumentCatalog, OperationLog, StoreError};
use crate::protocol::DocumentId;

/// Column family names.
const CF_DOCUMENTS: &str = "documents";
const CF_PREVIEWS: &str = "previews";
const CF_OPERATIONS: &str = "operations";

/// All column family names for initialization.
const COLUMN_FAMILIES: &[&str] = &[CF_DOCUMENTS, CF_PREVIEWS, CF_OPERATIONS];

/// Store configuration.
#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// Database directory path
    pub path: PathBuf,
    /// Block cache size in bytes (default: 64MB)
    pub block_cache_size: usize,
    /// Bloom filter bits per key (default: 10)
    pub bloom_filter_bits: i32,
    /// fsync every write (default: false)
    pub sync_writes: bool,
    /// Max open files for RocksDB (default: 512)
    pub max_open_files: i32,
    /// Write buffer size per column family (default: 16MB)
    pub write_buffer_size: usize,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("weft_data"),
            block_cache_size: 64 * 1024 * 1024,
            bloom_filter_bits: 10,
            sync_writes: false,
            max_open_files: 512,
            write_buffer_size: 16 * 1024 * 1024,
        }
    }
}

impl StoreConfig {
    /// Create config for testing (small caches, temp directory).
    pub fn for_testing(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            block_cache_size: 8 * 1024 * 1024,
            bloom_filter_bits: 10,
            sync_writes: false,
            max_open_files: 64,
            write_buffer_size: 4 * 1024 * 1024,
        }
    }
}

/// Document metadata stored in the `documents` column family.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DocumentMetadata {
    pub doc_id: Uuid,
    /// Uncompressed preview size in bytes
    pub preview_size: u64,
    /// Compressed preview size in bytes
    pub compressed_size: u64,
    /// Creation timestamp (seconds since epoch)
    pub created_at: u64,
    /// Last preview save (seconds since epoch)
    pub updated_at: u64,
}

impl DocumentMetadata {
    fn new(doc_id: Uuid) -> Self {
        let now = now_secs();
        Self {
            doc_id,
            preview_size: 0,
            compressed_size: 0,
            created_at: now,
            updated_at: now,
        }
    }

    fn encode(&self) -> Result<Vec<u8>, StoreError> {
        bincode::serde::encode_to_vec(self, bincode::config::standard())
            .map_err(|e| StoreError::Serialization(e.to_string()))
    }

    fn decode(bytes: &[u8]) -> Result<Self, StoreError> {
        let (meta, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
            .map_err(|e| StoreError::Deserialization(e.to_string()))?;
        Ok(meta)
    }
}

/// On-disk form of an [`Operation`].
///
/// The wire type is internally tagged for JSON, which bincode cannot decode,
/// so records use an externally tagged mirror.
#[derive(Debug, Serialize, Deserialize)]
enum OperationRecord {
    Insert(Element),
    Delete(ElementId),
}

impl OperationRecord {
    fn encode(op: &Operation) -> Result<Vec<u8>, StoreError> {
        let record = match op {
            Operation::Insert { element } => OperationRecord::Insert(element.clone()),
            Operation::Delete { id } => OperationRecord::Delete(id.clone()),
        };
        bincode::serde::encode_to_vec(&record, bincode::config::standard())
            .map_err(|e| StoreError::Serialization(e.to_string()))
    }

    fn decode(bytes: &[u8]) -> Result<Operation, StoreError> {
        let (record, _): (OperationRecord, usize) =
            bincode::serde::decode_from_slice(bytes, bincode::config::standard())
                .map_err(|e| StoreError::Deserialization(e.to_string()))?;
        Ok(match record {
            OperationRecord::Insert(element) => Operation::Insert { element },
            OperationRecord::Delete(id) => Operation::Delete { id },
        })
    }
}

/// RocksDB-backed document store.
pub struct DocumentStore {
    /// RocksDB instance (single-threaded mode; concurrency via tokio)
    db: DBWithThreadMode<SingleThreaded>,
    /// Store configuration
    config: StoreConfig,
    /// Next log sequence number per document, recovered lazily.
    sequences: Mutex<HashMap<DocumentId, u64>>,
}

impl DocumentStore {
    /// Open the document store at the configured path.
    ///
    /// Creates the database and column families if they don't exist.
    pub fn open(config: StoreConfig) -> Result<Self, StoreError> {
        let mut db_opts = Options::default();
        db_opts.create_if_missing(true);
        db_opts.create_missing_column_families(true);
        db_opts.set_max_open_files(config.max_open_files);
        db_opts.set_keep_log_file_num(5);
        db_opts.increase_parallelism(num_cpus());

        let cf_descriptors: Vec<ColumnFamilyDescriptor> = COLUMN_FAMILIES
            .iter()
            .map(|name| ColumnFamilyDescriptor::new(*name, Self::cf_options(name, &config)))
            .collect();

        let db = DBWithThreadMode::<SingleThreaded>::open_cf_descriptors(
            &db_opts,
            &config.path,
            cf_descriptors,
        )?;

        Ok(Self {
            db,
            config,
            sequences: Mutex::new(HashMap::new()),
        })
    }

    /// Build column-family-specific options.
    fn cf_options(name: &str, config: &StoreConfig) -> Options {
        let mut opts = Options::default();

        let mut block_opts = BlockBasedOptions::default();
        let cache = Cache::new_lru_cache(config.block_cache_size);
        block_opts.set_block_cache(&cache);
        block_opts.set_bloom_filter(config.bloom_filter_bits as f64, false);
        block_opts.set_block_size(16 * 1024);
        opts.set_block_based_table_factory(&block_opts);

        opts.set_compression_type(DBCompressionType::Lz4);
        opts.set_write_buffer_size(config.write_buffer_size);

        match name {
            CF_DOCUMENTS | CF_PREVIEWS => {
                // Small values, point lookups
                opts.set_max_write_buffer_number(2);
                opts.optimize_for_point_lookup(config.block_cache_size as u64);
            }
            CF_OPERATIONS => {
                // Many small appends, prefix-scanned by doc_id
                opts.set_max_write_buffer_number(4);
                opts.set_prefix_extractor(rocksdb::SliceTransform::create_fixed_prefix(16));
            }
            _ => {}
        }

        opts
    }

    // ─── Catalog ──────────────────────────────────────────────────────

    /// Load document metadata, `None` if the document is not registered.
    pub fn load_metadata(&self, doc_id: Uuid) -> Result<Option<DocumentMetadata>, StoreError> {
        let cf = self.cf(CF_DOCUMENTS)?;
        match self.db.get_cf(&cf, doc_id.as_bytes())? {
            Some(bytes) => DocumentMetadata::decode(&bytes).map(Some),
            None => Ok(None),
        }
    }

    /// List all registered document IDs.
    pub fn list_documents(&self) -> Result<Vec<Uuid>, StoreError> {
        let cf = self.cf(CF_DOCUMENTS)?;
        let mut doc_ids = Vec::new();

        let iter = self.db.iterator_cf(&cf, IteratorMode::Start);
        for item in iter {
            let (key, _) = item?;
            if key.len() == 16 {
                let id = Uuid::from_bytes(
                    key.as_ref()
                        .try_into()
                        .map_err(|_| StoreError::Deserialization("invalid UUID key".into()))?,
                );
                doc_ids.push(id);
            }
        }

        Ok(doc_ids)
    }

    // ─── Operation log ────────────────────────────────────────────────

    /// Number of operations logged for a document.
    pub fn operation_count(&self, doc_id: Uuid) -> Result<u64, StoreError> {
        let mut sequences = self.sequences.lock().unwrap_or_else(|e| e.into_inner());
        self.next_sequence(&mut sequences, doc_id)
    }

    /// Next free sequence number, scanning the log tail on first use.
    fn next_sequence(
        &self,
        sequences: &mut HashMap<DocumentId, u64>,
        doc_id: Uuid,
    ) -> Result<u64, StoreError> {
        if let Some(seq) = sequences.get(&doc_id) {
            return Ok(*seq);
        }

        let cf = self.cf(CF_OPERATIONS)?;
        let last_key = Self::op_key(doc_id, u64::MAX);
        let mut iter = self
            .db
            .iterator_cf(&cf, IteratorMode::From(&last_key, Direction::Reverse));

        let next = match iter.next() {
            Some(item) => {
                let (key, _) = item?;
                match Self::parse_op_key(&key) {
                    Some((id, seq)) if id == doc_id => seq + 1,
                    _ => 0,
                }
            }
            None => 0,
        };
        sequences.insert(doc_id, next);
        Ok(next)
    }

    // ─── Helpers ──────────────────────────────────────────────────────

    /// Get a column family handle.
    fn cf(&self, name: &str) -> Result<&rocksdb::ColumnFamily, StoreError> {
        self.db
            .cf_handle(name)
            .ok_or_else(|| StoreError::Database(format!("column family '{name}' not found")))
    }

    fn write_options(&self) -> WriteOptions {
        let mut write_opts = WriteOptions::default();
        write_opts.set_sync(self.config.sync_writes);
        write_opts
    }

    /// Build an operation key: doc_id (16 bytes) + sequence (8 bytes big-endian).
    fn op_key(doc_id: Uuid, seq: u64) -> Vec<u8> {
        let mut key = Vec::with_capacity(24);
        key.extend_from_slice(doc_id.as_bytes());
        key.extend_from_slice(&seq.to_be_bytes());
        key
    }

    fn parse_op_key(key: &[u8]) -> Option<(Uuid, u64)> {
        if key.len() != 24 {
            return None;
        }
        let doc_id = Uuid::from_bytes(key[..16].try_into().ok()?);
        let seq = u64::from_be_bytes(key[16..24].try_into().ok()?);
        Some((doc_id, seq))
    }

    /// Get the database path.
    pub fn path(&self) -> &Path {
        &self.config.path
    }
}

impl OperationLog for DocumentStore {
    fn append(&self, doc_id: DocumentId, op: &Operation) -> Result<(), StoreError> {
        let cf = self.cf(CF_OPERATIONS)?;
        let value = OperationRecord::encode(op)?;

        let mut sequences = self.sequences.lock().unwrap_or_else(|e| e.into_inner());
        let seq = self.next_sequence(&mut sequences, doc_id)?;
        self.db
            .put_cf_opt(&cf, Self::op_key(doc_id, seq), &value, &self.write_options())?;
        sequences.insert(doc_id, seq + 1);
        Ok(())
    }

    fn read_all(&self, doc_id: DocumentId) -> Result<Vec<Operation>, StoreError> {
        let cf = self.cf(CF_OPERATIONS)?;
        let start_key = Self::op_key(doc_id, 0);

        let mut operations = Vec::new();
        let iter = self
            .db
            .iterator_cf(&cf, IteratorMode::From(&start_key, Direction::Forward));

        for item in iter {
            let (key, value) = item?;
            // Stop once past this document's key prefix
            match Self::parse_op_key(&key) {
                Some((id, _)) if id == doc_id => {}
                _ => break,
            }
            operations.push(OperationRecord::decode(&value)?);
        }

        Ok(operations)
    }
}

impl DocumentCatalog for DocumentStore {
    fn exists(&self, doc_id: DocumentId) -> Result<bool, StoreError> {
        let cf = self.cf(CF_DOCUMENTS)?;
        Ok(self.db.get_cf(&cf, doc_id.as_bytes())?.is_some())
    }

    fn register(&self, doc_id: DocumentId) -> Result<(), StoreError> {
        if self.exists(doc_id)? {
            return Ok(());
        }
        let cf = self.cf(CF_DOCUMENTS)?;
        let meta = DocumentMetadata::new(doc_id);
        self.db
            .put_cf_opt(&cf, doc_id.as_bytes(), meta.encode()?, &self.write_options())?;
        Ok(())
    }

    fn save_preview(&self, doc_id: DocumentId, content: &str) -> Result<(), StoreError> {
        let cf_docs = self.cf(CF_DOCUMENTS)?;
        let cf_previews = self.cf(CF_PREVIEWS)?;

        let compressed = lz4_flex::compress_prepend_size(content.as_bytes());

        let mut meta = self
            .load_metadata(doc_id)?
            .unwrap_or_else(|| DocumentMetadata::new(doc_id));
        meta.preview_size = content.len() as u64;
        meta.compressed_size = compressed.len() as u64;
        meta.updated_at = now_secs();

        // Atomic batch write: preview + metadata
        let mut batch = WriteBatch::default();
        let key = doc_id.as_bytes();
        batch.put_cf(&cf_previews, key, &compressed);
        batch.put_cf(&cf_docs, key, meta.encode()?);
        self.db.write_opt(batch, &self.write_options())?;
        Ok(())
    }

    fn preview(&self, doc_id: DocumentId) -> Result<Option<String>, StoreError> {
        let cf = self.cf(CF_PREVIEWS)?;
        match self.db.get_cf(&cf, doc_id.as_bytes())? {
            Some(compressed) => {
                let bytes = lz4_flex::decompress_size_prepended(&compressed)
                    .map_err(|e| StoreError::Compression(e.to_string()))?;
                String::from_utf8(bytes)
                    .map(Some)
                    .map_err(|e| StoreError::Deserialization(e.to_string()))
            }
            None => Ok(None),
        }
    }
}

fn now_secs() -> u64 {
    SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

/// Get number of CPU cores for RocksDB parallelism.
fn num_cpus() -> i32 {
    std::thread::available_parallelism()
        .map(|n| n.get() as i32)
        .unwrap_or(4)
}
