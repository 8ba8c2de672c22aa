//! Per-namespace decision cache.
//!
//! Stores the last successfully applied routing decision per Service so
//! identical reconciles short-circuit without an API write. Entries are
//! advisory only: correctness never depends on cache presence, a cold cache
//! just forces one extra write per Service.

use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Instant;

use crate::decision::LeaderRecord;

/// Memoized outcome of the last successful reconcile for one Service.
#[derive(Debug, Clone)]
pub struct DecisionCacheEntry {
    /// Last-applied leader record, or `None` for an empty slice
    pub record: Option<LeaderRecord>,
    /// Fingerprint of the written EndpointSlice content
    pub fingerprint: String,
    /// Insertion/refresh time, drives least-recently-updated eviction
    pub refreshed_at: Instant,
}

impl DecisionCacheEntry {
    /// Creates an entry refreshed now.
    #[must_use]
    pub fn new(record: Option<LeaderRecord>, fingerprint: String) -> Self {
        Self {
            record,
            fingerprint,
            refreshed_at: Instant::now(),
        }
    }
}

type NamespaceMap = HashMap<String, DecisionCacheEntry>;

/// Bounded per-namespace store of routing decisions.
///
/// One lock per namespace map; operations never block across namespaces.
/// A `put` over capacity evicts the least-recently-updated entry other than
/// the key being written. Capacity 0 means unbounded.
#[derive(Debug)]
pub struct DecisionCache {
    capacity: usize,
    namespaces: RwLock<HashMap<String, Arc<RwLock<NamespaceMap>>>>,
}

impl DecisionCache {
    /// Creates a cache with the given per-namespace capacity (0 = unbounded).
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            namespaces: RwLock::new(HashMap::new()),
        }
    }

    /// Returns the cached entry for a Service, if any.
    #[must_use]
    pub fn get(&self, namespace: &str, service: &str) -> Option<DecisionCacheEntry> {
        let outer = self.namespaces.read().unwrap_or_else(PoisonError::into_inner);
        let ns_map = outer.get(namespace)?;
        let map = ns_map.read().unwrap_or_else(PoisonError::into_inner);
        map.get(service).cloned()
    }

    /// Inserts or refreshes an entry, evicting the least-recently-updated
    /// other entry if the namespace is at capacity.
    pub fn put(&self, namespace: &str, service: &str, entry: DecisionCacheEntry) {
        let ns_map = self.namespace_map(namespace);
        let mut map = ns_map.write().unwrap_or_else(PoisonError::into_inner);
        map.insert(service.to_string(), entry);
        if self.capacity > 0 && map.len() > self.capacity {
            let victim = map
                .iter()
                .filter(|(key, _)| key.as_str() != service)
                .min_by_key(|(_, e)| e.refreshed_at)
                .map(|(key, _)| key.clone());
            if let Some(victim) = victim {
                map.remove(&victim);
            }
        }
    }

    /// Drops the entry for a Service, if present.
    pub fn evict(&self, namespace: &str, service: &str) {
        let outer = self.namespaces.read().unwrap_or_else(PoisonError::into_inner);
        if let Some(ns_map) = outer.get(namespace) {
            ns_map
                .write()
                .unwrap_or_else(PoisonError::into_inner)
                .remove(service);
        }
    }

    /// Entry count for one namespace.
    #[must_use]
    pub fn len(&self, namespace: &str) -> usize {
        let outer = self.namespaces.read().unwrap_or_else(PoisonError::into_inner);
        outer
            .get(namespace)
            .map(|m| m.read().unwrap_or_else(PoisonError::into_inner).len())
            .unwrap_or(0)
    }

    /// True when no namespace holds any entry.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        let outer = self.namespaces.read().unwrap_or_else(PoisonError::into_inner);
        outer
            .values()
            .all(|m| m.read().unwrap_or_else(PoisonError::into_inner).is_empty())
    }

    fn namespace_map(&self, namespace: &str) -> Arc<RwLock<NamespaceMap>> {
        {
            let outer = self.namespaces.read().unwrap_or_else(PoisonError::into_inner);
            if let Some(ns_map) = outer.get(namespace) {
                return Arc::clone(ns_map);
            }
        }
        let mut outer = self.namespaces.write().unwrap_or_else(PoisonError::into_inner);
        Arc::clone(
            outer
                .entry(namespace.to_string())
                .or_insert_with(|| Arc::new(RwLock::new(HashMap::new()))),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn entry(fingerprint: &str) -> DecisionCacheEntry {
        DecisionCacheEntry::new(None, fingerprint.to_string())
    }

    #[test]
    fn get_put_evict_roundtrip() {
        let cache = DecisionCache::new(0);
        assert!(cache.get("ns", "s1").is_none());
        cache.put("ns", "s1", entry("fp1"));
        assert_eq!(cache.get("ns", "s1").unwrap().fingerprint, "fp1");
        cache.evict("ns", "s1");
        assert!(cache.get("ns", "s1").is_none());
    }

    #[test]
    fn capacity_bounds_each_namespace() {
        let cache = DecisionCache::new(3);
        for i in 0..10 {
            cache.put("ns", &format!("s{i}"), entry("fp"));
            assert!(cache.len("ns") <= 3);
        }
        assert_eq!(cache.len("ns"), 3);
    }

    #[test]
    fn evicts_least_recently_updated() {
        let cache = DecisionCache::new(2);
        cache.put("ns", "old", entry("fp"));
        std::thread::sleep(Duration::from_millis(5));
        cache.put("ns", "mid", entry("fp"));
        std::thread::sleep(Duration::from_millis(5));
        // Refresh "old" so "mid" becomes the eviction victim.
        cache.put("ns", "old", entry("fp2"));
        std::thread::sleep(Duration::from_millis(5));
        cache.put("ns", "new", entry("fp"));
        assert!(cache.get("ns", "mid").is_none());
        assert!(cache.get("ns", "old").is_some());
        assert!(cache.get("ns", "new").is_some());
    }

    #[test]
    fn never_evicts_the_key_being_written() {
        let cache = DecisionCache::new(1);
        cache.put("ns", "s1", entry("fp1"));
        std::thread::sleep(Duration::from_millis(5));
        cache.put("ns", "s2", entry("fp2"));
        assert_eq!(cache.get("ns", "s2").unwrap().fingerprint, "fp2");
        assert!(cache.get("ns", "s1").is_none());
        assert_eq!(cache.len("ns"), 1);
    }

    #[test]
    fn namespaces_are_independent() {
        let cache = DecisionCache::new(1);
        cache.put("ns-a", "s1", entry("a"));
        cache.put("ns-b", "s1", entry("b"));
        assert_eq!(cache.get("ns-a", "s1").unwrap().fingerprint, "a");
        assert_eq!(cache.get("ns-b", "s1").unwrap().fingerprint, "b");
        assert_eq!(cache.len("ns-a"), 1);
        assert_eq!(cache.len("ns-b"), 1);
    }

    #[test]
    fn zero_capacity_is_unbounded() {
        let cache = DecisionCache::new(0);
        for i in 0..100 {
            cache.put("ns", &format!("s{i}"), entry("fp"));
        }
        assert_eq!(cache.len("ns"), 100);
        assert!(!cache.is_empty());
    }
}
