//! Result cache.
//!
//! A concurrent map from query fingerprint to result, bounded by a TTL and a
//! capacity. When full, expired entries go first, then the least recently
//! used one. Entries are immutable once inserted; only their access tick
//! moves. Concurrent inserts for one key race and the last writer wins.

use super::ast::Query;
use dashmap::DashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

/// Cache key for a compiled query.
///
/// Hashes the canonical KQL text of the AST, so queries that differ only in
/// whitespace or keyword case share a key, together with the organization and
/// the row cap the result was produced under.
///
/// # Example
///
/// ```
/// use engine::query::{fingerprint, parse_query};
///
/// let a = parse_query("T | where x == 1").unwrap();
/// let b = parse_query("T|WHERE   x==1").unwrap();
/// assert_eq!(fingerprint(&a, "org", 10), fingerprint(&b, "org", 10));
/// assert_ne!(fingerprint(&a, "org", 10), fingerprint(&a, "other", 10));
/// ```
#[must_use]
pub fn fingerprint(query: &Query, org_id: &str, max_rows: u64) -> String {
    let mut hasher = blake3::Hasher::new();
    hasher.update(query.to_string().as_bytes());
    hasher.update(&[0]);
    hasher.update(org_id.as_bytes());
    hasher.update(&[0]);
    hasher.update(&max_rows.to_le_bytes());
    hex::encode(hasher.finalize().as_bytes())
}

#[derive(Debug)]
struct CacheEntry<V> {
    value: V,
    created_at: Instant,
    last_access: AtomicU64,
}

/// Concurrent TTL + LRU cache.
#[derive(Debug)]
pub struct ResultCache<V> {
    entries: DashMap<String, CacheEntry<V>>,
    capacity: usize,
    ttl: Duration,
    tick: AtomicU64,
}

impl<V: Clone> ResultCache<V> {
    /// Creates a cache holding at most `capacity` entries for `ttl` each.
    /// A capacity of zero disables caching.
    #[must_use]
    pub fn new(capacity: usize, ttl: Duration) -> Self {
        Self {
            entries: DashMap::new(),
            capacity,
            ttl,
            tick: AtomicU64::new(0),
        }
    }

    fn next_tick(&self) -> u64 {
        self.tick.fetch_add(1, Ordering::Relaxed)
    }

    fn is_expired(&self, entry: &CacheEntry<V>) -> bool {
        entry.created_at.elapsed() >= self.ttl
    }

    /// Returns a live entry and marks it as recently used.
    pub fn get(&self, key: &str) -> Option<V> {
        let expired = {
            let entry = self.entries.get(key)?;
            if self.is_expired(&entry) {
                true
            } else {
                entry.last_access.store(self.next_tick(), Ordering::Relaxed);
                return Some(entry.value.clone());
            }
        };
        if expired {
            self.entries.remove_if(key, |_, e| self.is_expired(e));
        }
        None
    }

    /// Stores a value, evicting to stay within capacity.
    pub fn insert(&self, key: String, value: V) {
        if self.capacity == 0 {
            return;
        }
        if !self.entries.contains_key(&key) {
            while self.entries.len() >= self.capacity {
                if !self.evict_one() {
                    break;
                }
            }
        }
        self.entries.insert(
            key,
            CacheEntry {
                value,
                created_at: Instant::now(),
                last_access: AtomicU64::new(self.next_tick()),
            },
        );
    }

    /// Removes every expired entry, or else the least recently used one.
    fn evict_one(&self) -> bool {
        let before = self.entries.len();
        self.entries.retain(|_, e| !self.is_expired(e));
        if self.entries.len() < before {
            return true;
        }

        let victim = self
            .entries
            .iter()
            .min_by_key(|e| e.last_access.load(Ordering::Relaxed))
            .map(|e| e.key().clone());
        match victim {
            Some(key) => self.entries.remove(&key).is_some(),
            None => false,
        }
    }

    /// Number of stored entries, including expired ones not yet evicted.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Returns true if nothing is stored.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Drops every entry.
    pub fn clear(&self) {
        self.entries.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::query::parse_query;
    use std::sync::Arc;

    fn cache(capacity: usize) -> ResultCache<u32> {
        ResultCache::new(capacity, Duration::from_secs(60))
    }

    #[test]
    fn test_get_after_insert() {
        let cache = cache(4);
        cache.insert("a".into(), 1);
        assert_eq!(cache.get("a"), Some(1));
        assert_eq!(cache.get("b"), None);
    }

    #[test]
    fn test_last_writer_wins() {
        let cache = cache(4);
        cache.insert("a".into(), 1);
        cache.insert("a".into(), 2);
        assert_eq!(cache.get("a"), Some(2));
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn test_evicts_least_recently_used() {
        let cache = cache(2);
        cache.insert("a".into(), 1);
        cache.insert("b".into(), 2);
        assert_eq!(cache.get("a"), Some(1));
        cache.insert("c".into(), 3);

        assert_eq!(cache.len(), 2);
        assert_eq!(cache.get("b"), None);
        assert_eq!(cache.get("a"), Some(1));
        assert_eq!(cache.get("c"), Some(3));
    }

    #[test]
    fn test_expired_entries_are_not_served() {
        let cache = ResultCache::new(4, Duration::ZERO);
        cache.insert("a".to_string(), 1);
        assert_eq!(cache.get("a"), None);
        assert!(cache.is_empty());
    }

    #[test]
    fn test_zero_capacity_disables() {
        let cache = cache(0);
        cache.insert("a".into(), 1);
        assert!(cache.is_empty());
    }

    #[test]
    fn test_concurrent_inserts_stay_bounded() {
        let cache = Arc::new(cache(8));
        let handles: Vec<_> = (0..4)
            .map(|t| {
                let cache = Arc::clone(&cache);
                std::thread::spawn(move || {
                    for i in 0..50 {
                        cache.insert(format!("{t}-{i}"), i);
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
        // each insert evicts before writing, so races overshoot by at most
        // one entry per writer
        assert!(cache.len() <= 8 + 4);
    }

    #[test]
    fn test_fingerprint_ignores_formatting() {
        let a = parse_query("SecurityEvent | where EventID == 4625 | take 10").unwrap();
        let b = parse_query("SecurityEvent\n|   WHERE EventID==4625\n| limit 10").unwrap();
        assert_eq!(fingerprint(&a, "org", 100), fingerprint(&b, "org", 100));
        assert_ne!(fingerprint(&a, "org", 100), fingerprint(&a, "org", 101));
        assert_eq!(fingerprint(&a, "org", 100).len(), 64);
    }
}
