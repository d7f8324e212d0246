//! In-process store for tests and single-run deployments.

use std::collections::{HashMap, HashSet};
use std::sync::Mutex;

use weft_core::Operation;

use super::{DocumentCatalog, OperationLog, StoreError};
use crate::protocol::DocumentId;

/// Memory-backed operation log and catalog.
#[derive(Debug, Default)]
pub struct MemoryStore {
    logs: Mutex<HashMap<DocumentId, Vec<Operation>>>,
    documents: Mutex<HashSet<DocumentId>>,
    previews: Mutex<HashMap<DocumentId, String>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a store with `documents` already registered.
    pub fn with_documents(documents: impl IntoIterator<Item = DocumentId>) -> Self {
        let store = Self::new();
        store
            .documents
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .extend(documents);
        store
    }

    /// Number of operations logged for a document.
    pub fn log_len(&self, doc_id: DocumentId) -> usize {
        self.logs
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(&doc_id)
            .map_or(0, Vec::len)
    }
}

impl OperationLog for MemoryStore {
    fn append(&self, doc_id: DocumentId, op: &Operation) -> Result<(), StoreError> {
        self.logs
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .entry(doc_id)
            .or_default()
            .push(op.clone());
        Ok(())
    }

    fn read_all(&self, doc_id: DocumentId) -> Result<Vec<Operation>, StoreError> {
        Ok(self
            .logs
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(&doc_id)
            .cloned()
            .unwrap_or_default())
    }
}

impl DocumentCatalog for MemoryStore {
    fn exists(&self, doc_id: DocumentId) -> Result<bool, StoreError> {
        Ok(self
            .documents
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .contains(&doc_id))
    }

    fn register(&self, doc_id: DocumentId) -> Result<(), StoreError> {
        self.documents
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(doc_id);
        Ok(())
    }

    fn save_preview(&self, doc_id: DocumentId, content: &str) -> Result<(), StoreError> {
        self.previews
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(doc_id, content.to_string());
        Ok(())
    }

    fn preview(&self, doc_id: DocumentId) -> Result<Option<String>, StoreError> {
        Ok(self
            .previews
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(&doc_id)
            .cloned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;
    use weft_core::SequenceStore;

    #[test]
    fn test_log_keeps_append_order_per_document() {
        let store = MemoryStore::new();
        let (doc_a, doc_b) = (Uuid::new_v4(), Uuid::new_v4());
        let mut replica = SequenceStore::new("r");
        let ops: Vec<Operation> = "abc"
            .chars()
            .enumerate()
            .map(|(i, ch)| Operation::from(replica.local_insert(ch, i).unwrap()))
            .collect();

        for op in &ops {
            store.append(doc_a, op).unwrap();
        }
        store.append(doc_b, &ops[0]).unwrap();

        assert_eq!(store.read_all(doc_a).unwrap(), ops);
        assert_eq!(store.log_len(doc_b), 1);
        assert!(store.read_all(Uuid::new_v4()).unwrap().is_empty());
    }

    #[test]
    fn test_catalog() {
        let known = Uuid::new_v4();
        let store = MemoryStore::with_documents([known]);
        assert!(store.exists(known).unwrap());
        assert!(!store.exists(Uuid::new_v4()).unwrap());

        assert_eq!(store.preview(known).unwrap(), None);
        store.save_preview(known, "draft").unwrap();
        store.save_preview(known, "final").unwrap();
        assert_eq!(store.preview(known).unwrap().as_deref(), Some("final"));
    }
}
