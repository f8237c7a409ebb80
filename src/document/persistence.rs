//! Persistence collaborator: the versioned document store.
//!
//! The core never owns document storage. It reads a snapshot, asks the store
//! to apply an op against the version it read, and relies on the store to
//! reject stale writes with `VersionConflict`.

use std::future::Future;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::{DocumentId, EditOperation};

/// Document lines plus the version they correspond to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DocumentSnapshot {
    pub lines: Vec<String>,
    pub version: u64,
}

impl DocumentSnapshot {
    pub fn text(&self) -> String {
        self.lines.join("\n")
    }
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum PersistenceError {
    /// `expected_version` did not match the stored version
    #[error("version conflict: expected {expected}, found {actual}")]
    VersionConflict { expected: u64, actual: u64 },
    #[error("document not found: {0}")]
    NotFound(String),
    /// The op cannot be applied to the stored text
    #[error("op rejected: {0}")]
    Rejected(String),
    #[error("persistence unavailable: {0}")]
    Unavailable(String),
}

/// Versioned key-value view of document storage.
pub trait DocumentStore: Send + Sync + 'static {
    fn get_document(
        &self,
        doc_id: &DocumentId,
    ) -> impl Future<Output = Result<DocumentSnapshot, PersistenceError>> + Send;

    /// Apply `op` if the stored version equals `expected_version`.
    ///
    /// Returns the new version (`expected_version + 1`).
    fn apply_op(
        &self,
        doc_id: &DocumentId,
        op: &EditOperation,
        expected_version: u64,
    ) -> impl Future<Output = Result<u64, PersistenceError>> + Send;
}
