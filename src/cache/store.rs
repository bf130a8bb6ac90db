//! Backing key-value store contract and the bundled in-process store.
//!
//! The cache core only consumes [`KvStore`]; any failure it reports is turned
//! into a cache miss by the caller, never into a caller-visible error.

use std::num::NonZeroUsize;
use std::sync::RwLock;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use bytes::Bytes;
use lru::LruCache;

use super::config::CacheConfig;
use super::error::StoreError;
use super::lock::{rw_read, rw_write};

const SOURCE: &str = "cache::store";

/// Key-value store consumed by the cache layer.
///
/// Eventual visibility is sufficient; TTL is wall-clock expiry.
#[async_trait]
pub trait KvStore: Send + Sync {
    async fn exists(&self, key: &str) -> Result<bool, StoreError>;

    /// True only if every key exists.
    async fn batch_exists(&self, keys: &[String]) -> Result<bool, StoreError>;

    /// `Ok(None)` signals absence; an empty value is `Ok(Some(..))`.
    async fn get(&self, key: &str) -> Result<Option<Bytes>, StoreError>;

    /// Values in key order; fails with [`StoreError::Missing`] if any key is absent.
    async fn batch_get(&self, keys: &[String]) -> Result<Vec<Bytes>, StoreError>;

    async fn set(&self, key: &str, value: Bytes, ttl: Duration) -> Result<(), StoreError>;

    async fn batch_set(&self, entries: Vec<(String, Bytes)>, ttl: Duration)
    -> Result<(), StoreError>;

    /// Returns true if `key` was present.
    async fn delete(&self, key: &str) -> Result<bool, StoreError>;

    /// Delete every key starting with `prefix`, returning how many were removed.
    async fn delete_by_prefix(&self, prefix: &str) -> Result<u64, StoreError>;

    async fn list_keys(&self) -> Result<Vec<String>, StoreError>;
}

struct Entry {
    value: Bytes,
    expires_at: Instant,
}

impl Entry {
    fn is_live(&self, now: Instant) -> bool {
        now < self.expires_at
    }
}

/// In-process [`KvStore`] with LRU eviction and per-entry expiry.
pub struct MemoryStore {
    entries: RwLock<LruCache<String, Entry>>,
}

impl MemoryStore {
    /// Create a store sized by `config.memory_capacity`.
    pub fn new(config: &CacheConfig) -> Self {
        Self::bounded(config.memory_capacity_non_zero())
    }

    /// Create a store holding at most `capacity` entries (clamped to 1).
    pub fn with_capacity(capacity: usize) -> Self {
        Self::bounded(NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN))
    }

    fn bounded(capacity: NonZeroUsize) -> Self {
        Self {
            entries: RwLock::new(LruCache::new(capacity)),
        }
    }

    /// Number of stored entries, expired ones included until touched.
    pub fn len(&self) -> usize {
        rw_read(&self.entries, SOURCE, "len").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn lookup(&self, key: &str, op: &'static str) -> Option<Bytes> {
        let now = Instant::now();
        let mut entries = rw_write(&self.entries, SOURCE, op);
        let found = entries
            .get(key)
            .map(|entry| entry.is_live(now).then(|| entry.value.clone()));
        match found {
            Some(Some(value)) => Some(value),
            Some(None) => {
                entries.pop(key);
                None
            }
            None => None,
        }
    }

    fn insert(&self, key: String, value: Bytes, ttl: Duration, op: &'static str) {
        let entry = Entry {
            value,
            expires_at: Instant::now() + ttl,
        };
        rw_write(&self.entries, SOURCE, op).put(key, entry);
    }
}

#[async_trait]
impl KvStore for MemoryStore {
    async fn exists(&self, key: &str) -> Result<bool, StoreError> {
        Ok(self.lookup(key, "exists").is_some())
    }

    async fn batch_exists(&self, keys: &[String]) -> Result<bool, StoreError> {
        Ok(keys
            .iter()
            .all(|key| self.lookup(key, "batch_exists").is_some()))
    }

    async fn get(&self, key: &str) -> Result<Option<Bytes>, StoreError> {
        Ok(self.lookup(key, "get"))
    }

    async fn batch_get(&self, keys: &[String]) -> Result<Vec<Bytes>, StoreError> {
        keys.iter()
            .map(|key| {
                self.lookup(key, "batch_get")
                    .ok_or_else(|| StoreError::Missing(key.clone()))
            })
            .collect()
    }

    async fn set(&self, key: &str, value: Bytes, ttl: Duration) -> Result<(), StoreError> {
        self.insert(key.to_string(), value, ttl, "set");
        Ok(())
    }

    async fn batch_set(
        &self,
        entries: Vec<(String, Bytes)>,
        ttl: Duration,
    ) -> Result<(), StoreError> {
        for (key, value) in entries {
            self.insert(key, value, ttl, "batch_set");
        }
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<bool, StoreError> {
        let now = Instant::now();
        let removed = rw_write(&self.entries, SOURCE, "delete").pop(key);
        Ok(removed.is_some_and(|entry| entry.is_live(now)))
    }

    async fn delete_by_prefix(&self, prefix: &str) -> Result<u64, StoreError> {
        let mut entries = rw_write(&self.entries, SOURCE, "delete_by_prefix");
        let doomed: Vec<String> = entries
            .iter()
            .filter(|(key, _)| key.starts_with(prefix))
            .map(|(key, _)| key.clone())
            .collect();
        for key in &doomed {
            entries.pop(key);
        }
        Ok(doomed.len() as u64)
    }

    async fn list_keys(&self) -> Result<Vec<String>, StoreError> {
        let now = Instant::now();
        Ok(rw_read(&self.entries, SOURCE, "list_keys")
            .iter()
            .filter(|(_, entry)| entry.is_live(now))
            .map(|(key, _)| key.clone())
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use std::panic::{AssertUnwindSafe, catch_unwind};

    use super::*;

    const TTL: Duration = Duration::from_secs(60);

    fn keys(names: &[&str]) -> Vec<String> {
        names.iter().map(|name| name.to_string()).collect()
    }

    #[tokio::test]
    async fn get_distinguishes_absent_from_empty() {
        let store = MemoryStore::with_capacity(8);
        store.set("empty", Bytes::new(), TTL).await.unwrap();

        assert_eq!(store.get("empty").await.unwrap(), Some(Bytes::new()));
        assert_eq!(store.get("absent").await.unwrap(), None);
    }

    #[tokio::test]
    async fn batch_operations_are_all_or_nothing() {
        let store = MemoryStore::with_capacity(8);
        store
            .batch_set(
                vec![
                    ("a".to_string(), Bytes::from_static(b"1")),
                    ("b".to_string(), Bytes::from_static(b"2")),
                ],
                TTL,
            )
            .await
            .unwrap();

        assert!(store.batch_exists(&keys(&["a", "b"])).await.unwrap());
        assert!(!store.batch_exists(&keys(&["a", "c"])).await.unwrap());

        let values = store.batch_get(&keys(&["b", "a"])).await.unwrap();
        assert_eq!(values, vec![Bytes::from_static(b"2"), Bytes::from_static(b"1")]);

        let missing = store.batch_get(&keys(&["a", "c"])).await;
        assert_eq!(missing, Err(StoreError::Missing("c".to_string())));
    }

    #[tokio::test]
    async fn entries_expire_after_ttl() {
        let store = MemoryStore::with_capacity(8);
        store
            .set("short", Bytes::from_static(b"x"), Duration::from_millis(20))
            .await
            .unwrap();
        assert!(store.exists("short").await.unwrap());

        tokio::time::sleep(Duration::from_millis(40)).await;

        assert!(!store.exists("short").await.unwrap());
        assert!(store.list_keys().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn delete_by_prefix_only_touches_matching_keys() {
        let store = MemoryStore::with_capacity(8);
        for key in ["ns:p:orders:1", "ns:p:orders:2", "ns:s:orders:q", "ns:p:users:1"] {
            store.set(key, Bytes::from_static(b"v"), TTL).await.unwrap();
        }

        let removed = store.delete_by_prefix("ns:p:orders:").await.unwrap();
        assert_eq!(removed, 2);
        assert!(store.delete("ns:p:users:1").await.unwrap());
        assert!(!store.delete("ns:p:users:1").await.unwrap());

        let mut remaining = store.list_keys().await.unwrap();
        remaining.sort();
        assert_eq!(remaining, keys(&["ns:s:orders:q"]));
    }

    #[tokio::test]
    async fn deleting_absent_keys_is_a_no_op() {
        let store = MemoryStore::with_capacity(8);
        assert!(!store.delete("nothing").await.unwrap());
        assert_eq!(store.delete_by_prefix("nothing:").await.unwrap(), 0);
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn lru_eviction_respects_capacity() {
        let store = MemoryStore::with_capacity(2);
        store.set("1", Bytes::from_static(b"a"), TTL).await.unwrap();
        store.set("2", Bytes::from_static(b"b"), TTL).await.unwrap();
        store.set("3", Bytes::from_static(b"c"), TTL).await.unwrap();

        assert_eq!(store.len(), 2);
        assert!(!store.exists("1").await.unwrap());
        assert!(store.exists("3").await.unwrap());
    }

    #[tokio::test]
    async fn store_recovers_from_poisoned_lock() {
        let store = MemoryStore::with_capacity(2);

        let _ = catch_unwind(AssertUnwindSafe(|| {
            let _guard = store
                .entries
                .write()
                .expect("entries lock should be acquired");
            panic!("poison entries lock");
        }));

        store.set("k", Bytes::from_static(b"v"), TTL).await.unwrap();
        assert!(store.exists("k").await.unwrap());
    }
}
