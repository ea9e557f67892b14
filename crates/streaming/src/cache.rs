use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use foundation::time::{Clock, Time};
use parking_lot::Mutex;

#[derive(Debug)]
struct CacheEntry<V> {
    payload: Arc<V>,
    created_at: Time,
    ttl: Duration,
}

impl<V> CacheEntry<V> {
    fn is_valid_at(&self, now: Time) -> bool {
        now.saturating_duration_since(self.created_at) <= self.ttl
    }
}

/// In-memory response cache keyed by the full request URL.
///
/// Notes:
/// - An entry is valid while `now - created_at <= ttl`. Expired entries are
///   dropped lazily by the lookup that notices them; nothing sweeps.
/// - No capacity bound: the key space is a handful of datasets times the
///   query shapes the UI issues.
/// - The mutex only guards individual map operations. Two fetches racing on
///   one key may both miss and both write; the last write wins.
pub struct CacheStore<V> {
    clock: Arc<dyn Clock>,
    entries: Mutex<HashMap<String, CacheEntry<V>>>,
}

impl<V> CacheStore<V> {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            clock,
            entries: Mutex::new(HashMap::new()),
        }
    }

    pub fn get(&self, key: &str) -> Option<Arc<V>> {
        let now = self.clock.now();
        let mut entries = self.entries.lock();
        let valid = entries.get(key)?.is_valid_at(now);
        if !valid {
            entries.remove(key);
            tracing::trace!(key, "evicted expired cache entry");
            return None;
        }
        entries.get(key).map(|e| Arc::clone(&e.payload))
    }

    pub fn set(&self, key: impl Into<String>, payload: impl Into<Arc<V>>, ttl: Duration) {
        let entry = CacheEntry {
            payload: payload.into(),
            created_at: self.clock.now(),
            ttl,
        };
        self.entries.lock().insert(key.into(), entry);
    }

    /// Drops every entry whose key matches. Returns how many were dropped.
    pub fn invalidate(&self, mut predicate: impl FnMut(&str) -> bool) -> usize {
        let mut entries = self.entries.lock();
        let before = entries.len();
        entries.retain(|k, _| !predicate(k));
        before - entries.len()
    }

    /// Drops the entries of one dataset, recognised by its identifier
    /// appearing in the request URL.
    pub fn invalidate_dataset(&self, dataset_id: &str) -> usize {
        self.invalidate(|k| k.contains(dataset_id))
    }

    pub fn clear(&self) {
        self.entries.lock().clear();
    }

    /// Number of stored entries, expired ones included until looked up.
    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }
}

impl<V> std::fmt::Debug for CacheStore<V> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CacheStore")
            .field("entries", &self.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::CacheStore;
    use foundation::time::ManualClock;
    use std::sync::Arc;
    use std::time::Duration;

    fn store() -> (Arc<ManualClock>, CacheStore<Vec<u32>>) {
        let clock = Arc::new(ManualClock::new());
        let store = CacheStore::new(clock.clone());
        (clock, store)
    }

    #[test]
    fn entry_is_valid_through_ttl_boundary() {
        let (clock, cache) = store();
        cache.set("k", vec![1, 2], Duration::from_secs(60));

        clock.advance(Duration::from_secs(60));
        assert_eq!(cache.get("k").as_deref(), Some(&vec![1, 2]));

        clock.advance(Duration::from_millis(1));
        assert!(cache.get("k").is_none());
    }

    #[test]
    fn expired_entries_are_evicted_lazily() {
        let (clock, cache) = store();
        cache.set("a", vec![1], Duration::from_secs(1));
        cache.set("b", vec![2], Duration::from_secs(1));
        clock.advance(Duration::from_secs(5));

        // Nothing sweeps: both still stored until looked up.
        assert_eq!(cache.len(), 2);
        assert!(cache.get("a").is_none());
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn set_overwrites_and_restarts_ttl() {
        let (clock, cache) = store();
        cache.set("k", vec![1], Duration::from_secs(10));
        clock.advance(Duration::from_secs(8));
        cache.set("k", vec![2], Duration::from_secs(10));
        clock.advance(Duration::from_secs(8));
        assert_eq!(cache.get("k").as_deref(), Some(&vec![2]));
    }

    #[test]
    fn invalidate_dataset_only_touches_matching_keys() {
        let (_clock, cache) = store();
        let ttl = Duration::from_secs(60);
        cache.set("https://h/resource/wr8u-xric.json?%24limit=1", vec![1], ttl);
        cache.set("https://h/resource/wr8u-xric.json?%24limit=2", vec![2], ttl);
        cache.set("https://h/resource/nuek-vuh3.json?%24limit=1", vec![3], ttl);

        assert_eq!(cache.invalidate_dataset("wr8u-xric"), 2);
        assert_eq!(cache.len(), 1);
        assert!(cache.get("https://h/resource/nuek-vuh3.json?%24limit=1").is_some());

        cache.clear();
        assert!(cache.is_empty());
    }
}
