//! Error handling types for collab-sync
//!
//! This module provides the error taxonomy shared by the lock, queue,
//! broadcast and router layers.

use std::sync::PoisonError;
use std::time::Duration;
use thiserror::Error;

use crate::broadcast::BroadcastDecodeError;
use crate::document::PersistenceError;
use crate::store::StoreError;

/// Comprehensive error type for synchronization operations
#[derive(Debug, Error)]
pub enum SyncError {
    /// The distributed lock could not be acquired within the wait budget.
    ///
    /// Retryable by the caller's own retry policy.
    #[error("Timed out after {waited:?} waiting for lock {key}")]
    LockTimeout { key: String, waited: Duration },

    /// The shared store failed while acquiring a lock
    #[error("Lock store unavailable while locking {key}: {source}")]
    LockStoreUnavailable {
        key: String,
        #[source]
        source: StoreError,
    },

    /// Operation rejected before it reached the queue
    #[error("Malformed operation for document {doc_id}: {reason}")]
    MalformedOperation { doc_id: String, reason: String },

    /// The persistence layer saw a stale expected version
    #[error("Version conflict on document {doc_id}: expected {expected}, found {actual}")]
    VersionConflict {
        doc_id: String,
        expected: u64,
        actual: u64,
    },

    /// Serialized operation exceeds the configured maximum
    #[error("Operation for document {doc_id} is {size} bytes, maximum is {max}")]
    OperationTooLarge {
        doc_id: String,
        size: usize,
        max: usize,
    },

    /// A broadcast payload could not be decoded
    #[error(transparent)]
    BroadcastDecode(#[from] BroadcastDecodeError),

    /// Shared store failure, wrapped with document context
    #[error("Store error for document {doc_id} while {context}: {source}")]
    Store {
        doc_id: String,
        context: String,
        #[source]
        source: StoreError,
    },

    /// Persistence collaborator failure, wrapped with document context
    #[error("Persistence error for document {doc_id} while {context}: {source}")]
    Persistence {
        doc_id: String,
        context: String,
        #[source]
        source: PersistenceError,
    },

    /// The persistence layer refused to apply an operation
    #[error("Update rejected for document {doc_id}: {reason}")]
    ApplyRejected { doc_id: String, reason: String },

    /// Configuration error
    #[error("Invalid configuration: {message}")]
    Config { message: String },

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type for synchronization operations
pub type SyncResult<T> = Result<T, SyncError>;

/// Helper trait to convert PoisonError into a recovered guard
pub trait LockResultExt<T> {
    /// Recover the guard from a poisoned lock, logging which operation hit it.
    fn recover_poison(self, context: &str) -> T;
}

impl<T> LockResultExt<T> for Result<T, PoisonError<T>> {
    fn recover_poison(self, context: &str) -> T {
        match self {
            Ok(guard) => guard,
            Err(poisoned) => {
                log::warn!(
                    target: "collab_sync::lock_recovery",
                    "Recovered from poisoned lock in {}",
                    context
                );
                poisoned.into_inner()
            }
        }
    }
}

/// Helper functions for common error patterns
impl SyncError {
    pub fn lock_timeout(key: impl Into<String>, waited: Duration) -> Self {
        SyncError::LockTimeout {
            key: key.into(),
            waited,
        }
    }

    pub fn lock_store_unavailable(key: impl Into<String>, source: StoreError) -> Self {
        SyncError::LockStoreUnavailable {
            key: key.into(),
            source,
        }
    }

    pub fn malformed(doc_id: impl Into<String>, reason: impl Into<String>) -> Self {
        SyncError::MalformedOperation {
            doc_id: doc_id.into(),
            reason: reason.into(),
        }
    }

    pub fn too_large(doc_id: impl Into<String>, size: usize, max: usize) -> Self {
        SyncError::OperationTooLarge {
            doc_id: doc_id.into(),
            size,
            max,
        }
    }

    pub fn store(doc_id: impl Into<String>, context: impl Into<String>, source: StoreError) -> Self {
        SyncError::Store {
            doc_id: doc_id.into(),
            context: context.into(),
            source,
        }
    }

    /// Wrap a persistence failure, lifting version conflicts into their own variant.
    pub fn persistence(
        doc_id: impl Into<String>,
        context: impl Into<String>,
        source: PersistenceError,
    ) -> Self {
        match source {
            PersistenceError::VersionConflict { expected, actual } => SyncError::VersionConflict {
                doc_id: doc_id.into(),
                expected,
                actual,
            },
            PersistenceError::Rejected(reason) => SyncError::ApplyRejected {
                doc_id: doc_id.into(),
                reason,
            },
            source => SyncError::Persistence {
                doc_id: doc_id.into(),
                context: context.into(),
                source,
            },
        }
    }

    pub fn config(message: impl Into<String>) -> Self {
        SyncError::Config {
            message: message.into(),
        }
    }

    /// Whether a higher-level retry policy may try the same call again.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            SyncError::LockTimeout { .. }
                | SyncError::LockStoreUnavailable { .. }
                | SyncError::VersionConflict { .. }
        )
    }
}
