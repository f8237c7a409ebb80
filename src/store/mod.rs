//! Shared key-value store consumed by the lock and queue layers.
//!
//! Every process in the pool talks to the same store; it is the only shared
//! state between them. The trait mirrors the handful of primitives the core
//! needs from a Redis-like backend: an atomic set-if-absent with expiry, a
//! server-side compare-and-delete, and a durable list.

mod memory;

pub use memory::MemoryStore;

use std::future::Future;
use std::time::Duration;

use thiserror::Error;

/// Failure reported by a shared store backend.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum StoreError {
    /// Backend cannot be reached
    #[error("store unavailable: {0}")]
    Unavailable(String),
    /// Backend answered with an error
    #[error("store backend error: {0}")]
    Backend(String),
}

pub type StoreResult<T> = Result<T, StoreError>;

/// Primitives required from the shared key-value store.
///
/// All methods must be atomic with respect to other processes using the same
/// backend.
pub trait SharedStore: Send + Sync + 'static {
    /// Set `key` to `value` with the given time-to-live, only if absent.
    ///
    /// Returns `true` if this call created the key.
    fn set_if_absent(
        &self,
        key: &str,
        value: &str,
        ttl: Duration,
    ) -> impl Future<Output = StoreResult<bool>> + Send;

    /// Delete `key` only if its current value equals `expected`.
    ///
    /// Returns `true` if the key was deleted.
    fn compare_and_delete(
        &self,
        key: &str,
        expected: &str,
    ) -> impl Future<Output = StoreResult<bool>> + Send;

    /// Read a plain (non-list) value.
    fn get(&self, key: &str) -> impl Future<Output = StoreResult<Option<String>>> + Send;

    /// Append to the tail of a list, returning its new length.
    fn push_back(
        &self,
        key: &str,
        value: String,
    ) -> impl Future<Output = StoreResult<usize>> + Send;

    /// Put `values` back at the head of a list, keeping their order.
    ///
    /// Returns the new length.
    fn push_front_all(
        &self,
        key: &str,
        values: Vec<String>,
    ) -> impl Future<Output = StoreResult<usize>> + Send;

    /// Remove and return every element of a list, head first.
    fn drain(&self, key: &str) -> impl Future<Output = StoreResult<Vec<String>>> + Send;

    /// Remove and return the head of a list.
    fn pop_front(&self, key: &str) -> impl Future<Output = StoreResult<Option<String>>> + Send;

    /// Length of a list (0 when missing).
    fn len(&self, key: &str) -> impl Future<Output = StoreResult<usize>> + Send;

    /// Every element of a list, head first, without removing them.
    fn range(&self, key: &str) -> impl Future<Output = StoreResult<Vec<String>>> + Send;

    /// Keep only the last `keep` elements of a list.
    fn trim_to_last(&self, key: &str, keep: usize)
    -> impl Future<Output = StoreResult<()>> + Send;
}

/// Key layout shared by every process.
pub mod keys {
    use crate::document::DocumentId;

    /// List of doc ids with queued work, consumed by the dispatcher.
    pub const PENDING_UPDATES_LIST: &str = "pending-updates-list";

    /// Lock key for a document.
    pub fn blocking(doc_id: &DocumentId) -> String {
        format!("Blocking:{}", doc_id)
    }

    /// Pending (not yet applied) operations for a document.
    pub fn pending_updates(doc_id: &DocumentId) -> String {
        format!("PendingUpdates:{}", doc_id)
    }

    /// Recently applied operations, used for duplicate detection.
    pub fn doc_ops(doc_id: &DocumentId) -> String {
        format!("DocOps:{}", doc_id)
    }

    #[cfg(test)]
    mod tests {
        use super::*;

        #[test]
        fn keys_are_scoped_per_document() {
            let doc = DocumentId::new("abc");
            assert_eq!(blocking(&doc), "Blocking:abc");
            assert_eq!(pending_updates(&doc), "PendingUpdates:abc");
            assert_eq!(doc_ops(&doc), "DocOps:abc");
        }
    }
}
