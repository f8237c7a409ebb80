//! In-process `SharedStore` backed by a mutex-protected map.
//!
//! Used by tests and the `simulate` command. Several "processes" in a test
//! share one `Arc<MemoryStore>` the way real workers share one Redis.

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use tokio::time::Instant;

use super::{SharedStore, StoreError, StoreResult};
use crate::error::LockResultExt;

struct ValueEntry {
    value: String,
    expires_at: Option<Instant>,
}

impl ValueEntry {
    fn is_live(&self, now: Instant) -> bool {
        self.expires_at.is_none_or(|at| at > now)
    }
}

#[derive(Default)]
struct MemoryState {
    values: HashMap<String, ValueEntry>,
    lists: HashMap<String, VecDeque<String>>,
}

/// Shared store living entirely in memory.
pub struct MemoryStore {
    state: Mutex<MemoryState>,
    available: AtomicBool,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(MemoryState::default()),
            available: AtomicBool::new(true),
        }
    }

    /// Simulate the backend going away (or coming back).
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    fn check_available(&self) -> StoreResult<()> {
        if self.available.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(StoreError::Unavailable("memory store switched off".into()))
        }
    }

    fn with_state<T>(&self, context: &str, f: impl FnOnce(&mut MemoryState) -> T) -> StoreResult<T> {
        self.check_available()?;
        let mut state = self.state.lock().recover_poison(context);
        Ok(f(&mut *state))
    }
}

impl SharedStore for MemoryStore {
    async fn set_if_absent(&self, key: &str, value: &str, ttl: Duration) -> StoreResult<bool> {
        let now = Instant::now();
        self.with_state("MemoryStore::set_if_absent", |state| {
            if state.values.get(key).is_some_and(|entry| entry.is_live(now)) {
                return false;
            }
            state.values.insert(
                key.to_string(),
                ValueEntry {
                    value: value.to_string(),
                    expires_at: Some(now + ttl),
                },
            );
            true
        })
    }

    async fn compare_and_delete(&self, key: &str, expected: &str) -> StoreResult<bool> {
        let now = Instant::now();
        self.with_state("MemoryStore::compare_and_delete", |state| {
            let matches = state
                .values
                .get(key)
                .is_some_and(|entry| entry.is_live(now) && entry.value == expected);
            if matches {
                state.values.remove(key);
            }
            matches
        })
    }

    async fn get(&self, key: &str) -> StoreResult<Option<String>> {
        let now = Instant::now();
        self.with_state("MemoryStore::get", |state| {
            state
                .values
                .get(key)
                .filter(|entry| entry.is_live(now))
                .map(|entry| entry.value.clone())
        })
    }

    async fn push_back(&self, key: &str, value: String) -> StoreResult<usize> {
        self.with_state("MemoryStore::push_back", |state| {
            let list = state.lists.entry(key.to_string()).or_default();
            list.push_back(value);
            list.len()
        })
    }

    async fn push_front_all(&self, key: &str, values: Vec<String>) -> StoreResult<usize> {
        self.with_state("MemoryStore::push_front_all", |state| {
            let list = state.lists.entry(key.to_string()).or_default();
            for value in values.into_iter().rev() {
                list.push_front(value);
            }
            let len = list.len();
            if len == 0 {
                state.lists.remove(key);
            }
            len
        })
    }

    async fn drain(&self, key: &str) -> StoreResult<Vec<String>> {
        self.with_state("MemoryStore::drain", |state| {
            state
                .lists
                .remove(key)
                .map(Vec::from)
                .unwrap_or_default()
        })
    }

    async fn pop_front(&self, key: &str) -> StoreResult<Option<String>> {
        self.with_state("MemoryStore::pop_front", |state| {
            let list = state.lists.get_mut(key)?;
            let head = list.pop_front();
            if list.is_empty() {
                state.lists.remove(key);
            }
            head
        })
    }

    async fn len(&self, key: &str) -> StoreResult<usize> {
        self.with_state("MemoryStore::len", |state| {
            state.lists.get(key).map_or(0, VecDeque::len)
        })
    }

    async fn range(&self, key: &str) -> StoreResult<Vec<String>> {
        self.with_state("MemoryStore::range", |state| {
            state
                .lists
                .get(key)
                .map(|list| list.iter().cloned().collect())
                .unwrap_or_default()
        })
    }

    async fn trim_to_last(&self, key: &str, keep: usize) -> StoreResult<()> {
        self.with_state("MemoryStore::trim_to_last", |state| {
            if let Some(list) = state.lists.get_mut(key) {
                let excess = list.len().saturating_sub(keep);
                list.drain(..excess);
                if list.is_empty() {
                    state.lists.remove(key);
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn set_if_absent_only_succeeds_once() {
        let store = MemoryStore::new();
        let ttl = Duration::from_secs(30);

        assert!(store.set_if_absent("k", "a", ttl).await.unwrap());
        assert!(!store.set_if_absent("k", "b", ttl).await.unwrap());
        assert_eq!(store.get("k").await.unwrap().as_deref(), Some("a"));
    }

    #[tokio::test(start_paused = true)]
    async fn expired_values_can_be_replaced() {
        let store = MemoryStore::new();

        assert!(store.set_if_absent("k", "a", Duration::from_millis(100)).await.unwrap());
        tokio::time::advance(Duration::from_millis(101)).await;

        assert_eq!(store.get("k").await.unwrap(), None);
        assert!(store.set_if_absent("k", "b", Duration::from_secs(1)).await.unwrap());
        assert_eq!(store.get("k").await.unwrap().as_deref(), Some("b"));
    }

    #[tokio::test]
    async fn compare_and_delete_requires_matching_value() {
        let store = MemoryStore::new();
        store.set_if_absent("k", "mine", Duration::from_secs(30)).await.unwrap();

        assert!(!store.compare_and_delete("k", "theirs").await.unwrap());
        assert_eq!(store.get("k").await.unwrap().as_deref(), Some("mine"));

        assert!(store.compare_and_delete("k", "mine").await.unwrap());
        assert_eq!(store.get("k").await.unwrap(), None);
    }

    #[tokio::test]
    async fn lists_preserve_fifo_order() {
        let store = MemoryStore::new();
        for value in ["one", "two", "three"] {
            store.push_back("list", value.to_string()).await.unwrap();
        }

        assert_eq!(store.len("list").await.unwrap(), 3);
        assert_eq!(store.pop_front("list").await.unwrap().as_deref(), Some("one"));
        assert_eq!(store.drain("list").await.unwrap(), vec!["two", "three"]);
        assert_eq!(store.len("list").await.unwrap(), 0);
        assert_eq!(store.pop_front("list").await.unwrap(), None);
    }

    #[tokio::test]
    async fn push_front_all_restores_order_ahead_of_newer_entries() {
        let store = MemoryStore::new();
        store.push_back("list", "newer".to_string()).await.unwrap();

        let len = store
            .push_front_all("list", vec!["first".into(), "second".into()])
            .await
            .unwrap();

        assert_eq!(len, 3);
        assert_eq!(store.range("list").await.unwrap(), vec!["first", "second", "newer"]);
        assert_eq!(store.push_front_all("empty", Vec::new()).await.unwrap(), 0);
        assert_eq!(store.len("empty").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn trim_keeps_only_the_tail() {
        let store = MemoryStore::new();
        for i in 0..5 {
            store.push_back("log", i.to_string()).await.unwrap();
        }

        store.trim_to_last("log", 2).await.unwrap();
        assert_eq!(store.range("log").await.unwrap(), vec!["3", "4"]);
    }

    #[tokio::test]
    async fn unavailable_store_reports_errors() {
        let store = MemoryStore::new();
        store.set_available(false);

        let err = store.push_back("list", "x".into()).await.unwrap_err();
        assert!(matches!(err, StoreError::Unavailable(_)));

        store.set_available(true);
        assert_eq!(store.push_back("list", "x".into()).await.unwrap(), 1);
    }
}
