//! In-memory `DocumentStore` that really applies text edits.

use std::collections::HashMap;
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};

use super::operation::byte_index;
use super::{DocumentId, DocumentSnapshot, DocumentStore, EditOperation, OpComponent, PersistenceError};
use crate::error::LockResultExt;

pub struct MemoryDocumentStore {
    documents: Mutex<HashMap<DocumentId, DocumentSnapshot>>,
    /// Number of upcoming `apply_op` calls that report a spurious conflict
    injected_conflicts: AtomicUsize,
    /// Number of upcoming `get_document` calls that report an outage
    injected_outages: AtomicUsize,
}

impl Default for MemoryDocumentStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryDocumentStore {
    pub fn new() -> Self {
        Self {
            documents: Mutex::new(HashMap::new()),
            injected_conflicts: AtomicUsize::new(0),
            injected_outages: AtomicUsize::new(0),
        }
    }

    /// Create (or replace) a document at version 0.
    pub fn create(&self, doc_id: &DocumentId, text: &str) {
        let snapshot = DocumentSnapshot {
            lines: text.split('\n').map(str::to_string).collect(),
            version: 0,
        };
        self.documents
            .lock()
            .recover_poison("MemoryDocumentStore::create")
            .insert(doc_id.clone(), snapshot);
    }

    /// Synchronous read for assertions.
    pub fn snapshot(&self, doc_id: &DocumentId) -> Option<DocumentSnapshot> {
        self.documents
            .lock()
            .recover_poison("MemoryDocumentStore::snapshot")
            .get(doc_id)
            .cloned()
    }

    /// Make the next `count` applies fail with a version conflict.
    pub fn inject_version_conflicts(&self, count: usize) {
        self.injected_conflicts.store(count, Ordering::SeqCst);
    }

    /// Make the next `count` reads fail as if the backend were down.
    pub fn inject_outages(&self, count: usize) {
        self.injected_outages.store(count, Ordering::SeqCst);
    }

    fn take_injected_conflict(&self) -> bool {
        take_one(&self.injected_conflicts)
    }
}

impl DocumentStore for MemoryDocumentStore {
    async fn get_document(&self, doc_id: &DocumentId) -> Result<DocumentSnapshot, PersistenceError> {
        if take_one(&self.injected_outages) {
            return Err(PersistenceError::Unavailable(format!(
                "injected outage reading {}",
                doc_id
            )));
        }
        self.snapshot(doc_id)
            .ok_or_else(|| PersistenceError::NotFound(doc_id.to_string()))
    }

    async fn apply_op(
        &self,
        doc_id: &DocumentId,
        op: &EditOperation,
        expected_version: u64,
    ) -> Result<u64, PersistenceError> {
        let mut documents = self
            .documents
            .lock()
            .recover_poison("MemoryDocumentStore::apply_op");
        let snapshot = documents
            .get_mut(doc_id)
            .ok_or_else(|| PersistenceError::NotFound(doc_id.to_string()))?;

        if self.take_injected_conflict() {
            return Err(PersistenceError::VersionConflict {
                expected: expected_version,
                actual: snapshot.version + 1,
            });
        }
        if snapshot.version != expected_version {
            return Err(PersistenceError::VersionConflict {
                expected: expected_version,
                actual: snapshot.version,
            });
        }

        let mut text = snapshot.text();
        for component in &op.components {
            apply_component(&mut text, component)?;
        }

        snapshot.lines = text.split('\n').map(str::to_string).collect();
        snapshot.version += 1;
        Ok(snapshot.version)
    }
}

fn take_one(counter: &AtomicUsize) -> bool {
    counter
        .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
        .is_ok()
}

fn apply_component(text: &mut String, component: &OpComponent) -> Result<(), PersistenceError> {
    let position = component.position();
    let start = byte_index(text, position).ok_or_else(|| {
        PersistenceError::Rejected(format!("position {} is past the end of the document", position))
    })?;

    match component {
        OpComponent::Insert { text: inserted, .. } => {
            text.insert_str(start, inserted);
        }
        OpComponent::Delete { text: deleted, .. } => {
            if !text[start..].starts_with(deleted.as_str()) {
                return Err(PersistenceError::Rejected(format!(
                    "delete at {} does not match document text",
                    position
                )));
            }
            text.replace_range(start..start + deleted.len(), "");
        }
        OpComponent::Comment { text: commented, .. } => {
            if !text[start..].starts_with(commented.as_str()) {
                return Err(PersistenceError::Rejected(format!(
                    "comment at {} does not match document text",
                    position
                )));
            }
        }
    }
    Ok(())
}
