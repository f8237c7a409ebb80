//! Per-document update queue and the worker that applies it.
//!
//! ```text
//! enqueue(doc, op)
//!       │
//!       ├─► PendingUpdates:{doc}   (serialized op appended)
//!       └─► pending-updates-list   (doc id, for the dispatcher)
//!
//! flush(doc)                       (FlushScheduler / Dispatcher / caller)
//!       │
//!       └─► with_lock(Blocking:{doc})
//!               ├─► drain PendingUpdates:{doc}
//!               ├─► per op: snapshot → dup check → apply_op(expected version)
//!               └─► publish AppliedUpdate on applied-ops:{doc}
//! ```

mod dispatcher;
mod flush;
mod in_progress;
mod scheduler;

pub use dispatcher::{Dispatcher, DispatcherHandle};
pub use flush::{FlushMode, FlushOutcome, FlushWorker};
pub use in_progress::InProgressSet;
pub use scheduler::FlushScheduler;

use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::config::defaults;
use crate::document::{ConnectionId, DocumentId, EditOperation};
use crate::error::{SyncError, SyncResult};
use crate::store::{SharedStore, keys};

const LOG_TARGET: &str = "collab_sync::queue";

/// Limits and retry budget for queued operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueueOptions {
    /// Largest accepted serialized op, in bytes
    pub max_op_size: usize,
    /// Applied ops remembered per document for duplicate detection
    pub recent_ops_len: usize,
    pub version_conflict_retries: u32,
}

impl Default for QueueOptions {
    fn default() -> Self {
        Self {
            max_op_size: defaults::DEFAULT_MAX_OP_SIZE_BYTES,
            recent_ops_len: defaults::DEFAULT_RECENT_OPS_LEN,
            version_conflict_retries: defaults::DEFAULT_VERSION_CONFLICT_RETRIES,
        }
    }
}

/// An operation after it went through the flush worker.
///
/// `version` is the document version reached by applying `op`. Duplicates
/// (`dup`) were not applied again and carry the unchanged current version.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AppliedUpdate {
    pub doc_id: DocumentId,
    pub version: u64,
    pub op: EditOperation,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<ConnectionId>,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub dup: bool,
}

/// Producer side of the per-document queues.
pub struct UpdateQueue<S> {
    store: Arc<S>,
    options: QueueOptions,
}

impl<S> Clone for UpdateQueue<S> {
    fn clone(&self) -> Self {
        Self {
            store: Arc::clone(&self.store),
            options: self.options,
        }
    }
}

impl<S: SharedStore> UpdateQueue<S> {
    pub fn new(store: Arc<S>, options: QueueOptions) -> Self {
        Self { store, options }
    }

    pub fn options(&self) -> &QueueOptions {
        &self.options
    }

    /// Append `op` to the document's pending queue.
    ///
    /// Returns the queue length after the append. Nothing is enqueued when
    /// the op is refused.
    pub async fn enqueue(&self, doc_id: &DocumentId, op: &EditOperation) -> SyncResult<usize> {
        if let Some(field) = op.find_nul() {
            return Err(SyncError::malformed(
                doc_id.as_str(),
                format!("NUL character in {}", field),
            ));
        }

        let payload = serde_json::to_string(op)
            .map_err(|e| SyncError::malformed(doc_id.as_str(), e.to_string()))?;
        if payload.len() > self.options.max_op_size {
            return Err(SyncError::too_large(
                doc_id.as_str(),
                payload.len(),
                self.options.max_op_size,
            ));
        }

        let length = self
            .store
            .push_back(&keys::pending_updates(doc_id), payload)
            .await
            .map_err(|e| SyncError::store(doc_id.as_str(), "enqueueing op", e))?;
        self.store
            .push_back(keys::PENDING_UPDATES_LIST, doc_id.to_string())
            .await
            .map_err(|e| SyncError::store(doc_id.as_str(), "announcing pending op", e))?;

        log::trace!(
            target: LOG_TARGET,
            "Queued op for {} (queue length {})",
            doc_id,
            length
        );
        Ok(length)
    }

    /// Number of ops waiting to be flushed for `doc_id`.
    pub async fn pending_len(&self, doc_id: &DocumentId) -> SyncResult<usize> {
        self.store
            .len(&keys::pending_updates(doc_id))
            .await
            .map_err(|e| SyncError::store(doc_id.as_str(), "reading queue length", e))
    }
}
