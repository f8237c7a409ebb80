//! Thread-safe set of documents currently being flushed by this process.

use crate::error::LockResultExt;
use std::collections::HashSet;
use std::hash::Hash;
use std::sync::{Arc, Mutex};

/// A thread-safe set for tracking in-progress work.
///
/// Cheaply cloneable via `Arc` for sharing across tasks. `try_start` tells
/// the caller whether it was the one to start the work.
///
/// # Example
///
/// ```
/// use collab_sync::updates::InProgressSet;
///
/// let flushing: InProgressSet<String> = InProgressSet::new();
///
/// assert!(flushing.try_start(&"doc-1".to_string()));
/// assert!(!flushing.try_start(&"doc-1".to_string())); // already running
///
/// flushing.finish(&"doc-1".to_string());
/// assert!(flushing.try_start(&"doc-1".to_string()));
/// ```
#[derive(Clone)]
pub struct InProgressSet<T> {
    items: Arc<Mutex<HashSet<T>>>,
}

impl<T: Eq + Hash + Clone> InProgressSet<T> {
    pub fn new() -> Self {
        Self {
            items: Arc::new(Mutex::new(HashSet::new())),
        }
    }

    /// Returns `true` if this call started the work, `false` if it was
    /// already in progress.
    pub fn try_start(&self, item: &T) -> bool {
        self.items
            .lock()
            .recover_poison("InProgressSet::try_start")
            .insert(item.clone())
    }

    pub fn finish(&self, item: &T) {
        self.items
            .lock()
            .recover_poison("InProgressSet::finish")
            .remove(item);
    }

    pub fn is_in_progress(&self, item: &T) -> bool {
        self.items
            .lock()
            .recover_poison("InProgressSet::is_in_progress")
            .contains(item)
    }

    pub fn len(&self) -> usize {
        self.items.lock().recover_poison("InProgressSet::len").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<T: Eq + Hash + Clone> Default for InProgressSet<T> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::document::DocumentId;

    #[test]
    fn tracks_a_document_until_finished() {
        let flushing: InProgressSet<DocumentId> = InProgressSet::new();
        let doc = DocumentId::new("d1");

        assert!(!flushing.is_in_progress(&doc));
        assert!(flushing.try_start(&doc));
        assert!(flushing.is_in_progress(&doc));
        assert!(!flushing.try_start(&doc));

        flushing.finish(&doc);
        assert!(!flushing.is_in_progress(&doc));
        assert!(flushing.is_empty());
    }

    #[test]
    fn documents_are_tracked_independently() {
        let flushing: InProgressSet<DocumentId> = InProgressSet::new();
        let [a, b, c] = ["a", "b", "c"].map(DocumentId::new);

        assert!(flushing.try_start(&a));
        assert!(flushing.try_start(&b));
        assert!(flushing.try_start(&c));

        flushing.finish(&b);

        assert!(flushing.is_in_progress(&a));
        assert!(!flushing.is_in_progress(&b));
        assert!(flushing.is_in_progress(&c));
        assert_eq!(flushing.len(), 2);
    }
}
