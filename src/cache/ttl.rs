//! In-memory bounded TTL cache.
//! Eviction is by insertion order: reads use `peek`, so the LRU list inside
//! `LruCache` never reorders and its tail is always the oldest insertion.

use std::num::NonZeroUsize;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use lru::LruCache;
use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use super::{CacheStats, KeyValueStore};

/// A single cached value with its bookkeeping.
#[derive(Debug, Clone)]
pub struct CacheEntry<T> {
    pub key: String,
    pub value: T,
    pub created_at: Instant,
    pub ttl: Duration,
    pub hit_count: u64,
}

impl<T> CacheEntry<T> {
    fn is_expired(&self, now: Instant) -> bool {
        now.saturating_duration_since(self.created_at) > self.ttl
    }
}

struct Inner<V> {
    entries: LruCache<String, CacheEntry<V>>,
    stats: CacheStats,
}

/// Capacity-bounded key/value store with per-entry TTL and hit counting.
pub struct TtlCache<V> {
    name: &'static str,
    inner: Mutex<Inner<V>>,
    default_ttl: Duration,
}

impl<V: Clone> TtlCache<V> {
    /// `capacity` of zero is treated as one.
    pub fn new(name: &'static str, capacity: usize, default_ttl: Duration) -> Self {
        let capacity = NonZeroUsize::new(capacity.max(1)).unwrap_or(NonZeroUsize::MIN);
        Self {
            name,
            inner: Mutex::new(Inner {
                entries: LruCache::new(capacity),
                stats: CacheStats::default(),
            }),
            default_ttl,
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn capacity(&self) -> usize {
        self.inner.lock().entries.cap().get()
    }

    pub fn default_ttl(&self) -> Duration {
        self.default_ttl
    }

    /// Look up a live value, bumping its hit counter. Expired entries are
    /// removed on the spot and reported as a miss.
    pub fn get(&self, key: &str) -> Option<V> {
        let now = Instant::now();
        let mut inner = self.inner.lock();
        let Inner { entries, stats } = &mut *inner;

        let expired = match entries.peek_mut(key) {
            Some(entry) if !entry.is_expired(now) => {
                entry.hit_count += 1;
                stats.hits += 1;
                return Some(entry.value.clone());
            }
            Some(_) => true,
            None => false,
        };
        if expired {
            entries.pop(key);
            stats.expirations += 1;
            debug!(cache = self.name, key, "expired entry purged on read");
        }
        stats.misses += 1;
        None
    }

    /// Insert with an explicit TTL. Re-inserting a key replaces it and makes
    /// it the newest entry; inserting a new key at capacity evicts the oldest.
    pub fn set(&self, key: &str, value: V, ttl: Duration) {
        let entry = CacheEntry {
            key: key.to_string(),
            value,
            created_at: Instant::now(),
            ttl,
            hit_count: 0,
        };
        let mut inner = self.inner.lock();
        if let Some((old_key, _)) = inner.entries.push(key.to_string(), entry) {
            if old_key != key {
                inner.stats.evictions += 1;
                debug!(cache = self.name, evicted = %old_key, "capacity eviction");
            }
        }
    }

    /// Insert with the cache's default TTL.
    pub fn insert(&self, key: &str, value: V) {
        self.set(key, value, self.default_ttl);
    }

    pub fn delete(&self, key: &str) -> bool {
        self.inner.lock().entries.pop(key).is_some()
    }

    /// Copy of the entry without counting a hit. Expired entries are not returned.
    pub fn peek_entry(&self, key: &str) -> Option<CacheEntry<V>> {
        let now = Instant::now();
        let inner = self.inner.lock();
        inner
            .entries
            .peek(key)
            .filter(|e| !e.is_expired(now))
            .cloned()
    }

    /// Live values, oldest insertion first.
    pub fn values(&self) -> Vec<V> {
        let now = Instant::now();
        let inner = self.inner.lock();
        inner
            .entries
            .iter()
            .rev()
            .filter(|(_, e)| !e.is_expired(now))
            .map(|(_, e)| e.value.clone())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn stats(&self) -> CacheStats {
        let inner = self.inner.lock();
        CacheStats {
            size: inner.entries.len(),
            ..inner.stats
        }
    }

    pub fn clear(&self) {
        self.inner.lock().entries.clear();
    }

    /// Remove expired entries. Called periodically from the sweep loop.
    pub fn sweep_expired(&self) -> usize {
        let now = Instant::now();
        let mut inner = self.inner.lock();
        let expired: Vec<String> = inner
            .entries
            .iter()
            .filter(|(_, e)| e.is_expired(now))
            .map(|(k, _)| k.clone())
            .collect();
        for key in &expired {
            inner.entries.pop(key);
        }
        inner.stats.expirations += expired.len() as u64;
        if !expired.is_empty() {
            info!(cache = self.name, removed = expired.len(), "cache sweep");
        }
        expired.len()
    }
}

impl<V: Clone + Send + Sync + 'static> TtlCache<V> {
    /// Start a background sweep task that runs every `interval` until `shutdown`
    /// is cancelled. Keeps memory bounded under read-light workloads.
    pub fn start_sweep_loop(
        cache: Arc<Self>,
        interval: Duration,
        shutdown: CancellationToken,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            // The first tick completes immediately; nothing can be expired yet.
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        cache.sweep_expired();
                    }
                    _ = shutdown.cancelled() => {
                        debug!(cache = cache.name, "sweep loop stopped");
                        break;
                    }
                }
            }
        })
    }
}

#[async_trait]
impl<V> KeyValueStore<V> for TtlCache<V>
where
    V: Clone + Send + Sync + 'static,
{
    async fn get(&self, key: &str) -> Option<V> {
        TtlCache::get(self, key)
    }

    async fn set(&self, key: &str, value: V, ttl: Duration) {
        TtlCache::set(self, key, value, ttl)
    }

    async fn delete(&self, key: &str) -> bool {
        TtlCache::delete(self, key)
    }

    async fn values(&self) -> Vec<V> {
        TtlCache::values(self)
    }

    async fn stats(&self) -> CacheStats {
        TtlCache::stats(self)
    }

    async fn sweep_expired(&self) -> usize {
        TtlCache::sweep_expired(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    const MINUTE: Duration = Duration::from_secs(60);

    #[tokio::test(start_paused = true)]
    async fn set_then_get_returns_value() {
        let cache = TtlCache::new("test", 8, MINUTE);
        cache.set("k", 42u32, MINUTE);
        assert_eq!(cache.get("k"), Some(42));
    }

    #[tokio::test(start_paused = true)]
    async fn entry_expires_after_ttl() {
        let cache = TtlCache::new("test", 8, MINUTE);
        cache.set("k", "v".to_string(), Duration::from_secs(10));

        tokio::time::advance(Duration::from_secs(10)).await;
        assert_eq!(cache.get("k").as_deref(), Some("v"), "ttl boundary is inclusive");

        tokio::time::advance(Duration::from_millis(1)).await;
        assert_eq!(cache.get("k"), None);
        let stats = cache.stats();
        assert_eq!(stats.size, 0);
        assert_eq!(stats.expirations, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn hits_do_not_change_value_or_ttl() {
        let cache = TtlCache::new("test", 8, MINUTE);
        cache.set("k", 7u8, Duration::from_secs(30));
        let created = cache.peek_entry("k").map(|e| e.created_at);

        tokio::time::advance(Duration::from_secs(20)).await;
        for _ in 0..5 {
            assert_eq!(cache.get("k"), Some(7));
        }
        let entry = cache.peek_entry("k").expect("entry should be live");
        assert_eq!(entry.hit_count, 5);
        assert_eq!(Some(entry.created_at), created);
        assert_eq!(entry.ttl, Duration::from_secs(30));

        tokio::time::advance(Duration::from_secs(11)).await;
        assert_eq!(cache.get("k"), None);
    }

    #[test]
    fn evicts_oldest_inserted_not_least_recently_read() {
        let cache = TtlCache::new("test", 2, MINUTE);
        cache.insert("a", 1);
        cache.insert("b", 2);
        // Reading "a" must not protect it.
        assert_eq!(cache.get("a"), Some(1));
        cache.insert("c", 3);

        assert_eq!(cache.get("a"), None);
        assert_eq!(cache.get("b"), Some(2));
        assert_eq!(cache.get("c"), Some(3));
        assert_eq!(cache.stats().evictions, 1);
    }

    #[test]
    fn reinsert_replaces_without_eviction() {
        let cache = TtlCache::new("test", 2, MINUTE);
        cache.insert("a", 1);
        cache.insert("b", 2);
        cache.insert("a", 10);
        assert_eq!(cache.len(), 2);
        assert_eq!(cache.stats().evictions, 0);
        // "a" is now the newest, so "b" goes first.
        cache.insert("c", 3);
        assert_eq!(cache.get("b"), None);
        assert_eq!(cache.get("a"), Some(10));
    }

    #[test]
    fn delete_and_stats() {
        let cache = TtlCache::new("test", 4, MINUTE);
        cache.insert("a", 1);
        assert!(cache.delete("a"));
        assert!(!cache.delete("a"));
        assert_eq!(cache.get("a"), None);
        let stats = cache.stats();
        assert_eq!(stats.misses, 1);
        assert_eq!(stats.hits, 0);
        assert_eq!(stats.size, 0);
    }

    #[test]
    fn zero_capacity_is_clamped() {
        let cache = TtlCache::new("test", 0, MINUTE);
        assert_eq!(cache.capacity(), 1);
        cache.insert("a", 1);
        cache.insert("b", 2);
        assert_eq!(cache.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn values_skip_expired_and_keep_insertion_order() {
        let cache = TtlCache::new("test", 8, MINUTE);
        cache.set("short", 1, Duration::from_secs(5));
        cache.set("long1", 2, Duration::from_secs(50));
        cache.set("long2", 3, Duration::from_secs(50));
        tokio::time::advance(Duration::from_secs(6)).await;
        assert_eq!(cache.values(), vec![2, 3]);
    }

    #[tokio::test(start_paused = true)]
    async fn sweep_removes_only_expired() {
        let cache = TtlCache::new("test", 8, MINUTE);
        cache.set("a", 1, Duration::from_secs(5));
        cache.set("b", 2, Duration::from_secs(5));
        cache.set("c", 3, Duration::from_secs(500));
        tokio::time::advance(Duration::from_secs(6)).await;
        assert_eq!(cache.sweep_expired(), 2);
        assert_eq!(cache.len(), 1);
        assert_eq!(cache.stats().expirations, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn background_sweep_runs_and_stops() {
        let cache = Arc::new(TtlCache::new("test", 8, MINUTE));
        cache.set("a", 1, Duration::from_secs(5));
        let shutdown = CancellationToken::new();
        let handle = TtlCache::start_sweep_loop(
            Arc::clone(&cache),
            Duration::from_secs(10),
            shutdown.clone(),
        );

        tokio::time::sleep(Duration::from_secs(11)).await;
        assert_eq!(cache.len(), 0, "sweep should have purged without any read");

        shutdown.cancel();
        handle.await.expect("sweep task should exit cleanly");
    }

    #[tokio::test]
    async fn concurrent_access_keeps_hit_counts_consistent() {
        let cache = Arc::new(TtlCache::new("test", 64, MINUTE));
        cache.insert("shared", 1usize);
        let mut tasks = Vec::new();
        for i in 0..16 {
            let cache = Arc::clone(&cache);
            tasks.push(tokio::spawn(async move {
                for j in 0..50 {
                    assert!(cache.get("shared").is_some());
                    cache.insert(&format!("k{}", (i * 50 + j) % 32), j);
                }
            }));
        }
        for t in tasks {
            t.await.expect("task should not panic");
        }
        let entry = cache.peek_entry("shared");
        // "shared" may have been evicted by capacity pressure; if present, every read counted.
        if let Some(entry) = entry {
            assert_eq!(entry.hit_count, 16 * 50);
        }
        assert!(cache.len() <= 64);
    }

    proptest! {
        #[test]
        fn prop_never_exceeds_capacity(
            capacity in 1usize..32,
            keys in prop::collection::vec(0u16..200, 0..300),
        ) {
            let cache = TtlCache::new("prop", capacity, MINUTE);
            for k in keys {
                cache.insert(&k.to_string(), k);
                prop_assert!(cache.len() <= capacity);
            }
        }

        #[test]
        fn prop_set_then_get(key in "[a-z]{1,12}", value in any::<i64>()) {
            let cache = TtlCache::new("prop", 4, MINUTE);
            cache.set(&key, value, MINUTE);
            prop_assert_eq!(cache.get(&key), Some(value));
        }
    }
}
