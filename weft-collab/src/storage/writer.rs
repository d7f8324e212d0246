//! Ordered asynchronous appends to the durable operation log.
//!
//! Rooms hand appends to a single writer running on the blocking pool, so a
//! slow disk never stalls a broadcast. Jobs are processed strictly in
//! submission order; [`LogWriter::flush`] resolves once every job submitted
//! before it has been written (or has failed).

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};

use weft_core::Operation;

use super::{OperationLog, StoreError};
use crate::protocol::DocumentId;

enum WriteJob {
    Append { doc_id: DocumentId, op: Operation },
    Flush(oneshot::Sender<()>),
}

/// Persistence counters, shared with the server statistics.
#[derive(Debug, Default)]
pub struct WriterStats {
    pub persisted: AtomicU64,
    pub failures: AtomicU64,
}

/// Handle to the log writer task. Cheap to clone.
#[derive(Clone)]
pub struct LogWriter {
    tx: mpsc::UnboundedSender<WriteJob>,
    stats: Arc<WriterStats>,
}

impl LogWriter {
    /// Start the writer on the tokio blocking pool.
    ///
    /// The task ends when every handle has been dropped.
    pub fn spawn(sink: Arc<dyn OperationLog>) -> Self {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let stats = Arc::new(WriterStats::default());
        let task_stats = stats.clone();

        tokio::task::spawn_blocking(move || {
            while let Some(job) = rx.blocking_recv() {
                match job {
                    WriteJob::Append { doc_id, op } => match sink.append(doc_id, &op) {
                        Ok(()) => {
                            task_stats.persisted.fetch_add(1, Ordering::Relaxed);
                        }
                        Err(e) => {
                            task_stats.failures.fetch_add(1, Ordering::Relaxed);
                            log::error!(
                                "Failed to persist operation {} for doc {doc_id}: {e}",
                                op.target()
                            );
                        }
                    },
                    WriteJob::Flush(done) => {
                        let _ = done.send(());
                    }
                }
            }
            log::debug!("Log writer stopped");
        });

        Self { tx, stats }
    }

    /// Queue an append. Never blocks.
    pub fn append(&self, doc_id: DocumentId, op: Operation) {
        if self.tx.send(WriteJob::Append { doc_id, op }).is_err() {
            self.stats.failures.fetch_add(1, Ordering::Relaxed);
            log::error!("Log writer stopped; dropping append for doc {doc_id}");
        }
    }

    /// Wait until every append queued so far has been processed.
    pub async fn flush(&self) -> Result<(), StoreError> {
        let (done_tx, done_rx) = oneshot::channel();
        self.tx
            .send(WriteJob::Flush(done_tx))
            .map_err(|_| StoreError::WriterStopped)?;
        done_rx.await.map_err(|_| StoreError::WriterStopped)
    }

    pub fn stats(&self) -> &Arc<WriterStats> {
        &self.stats
    }
}
