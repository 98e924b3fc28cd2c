//! Caching capability used by the resolution chain and the generation loop.
//!
//! Orchestrators only see [`KeyValueStore`]; the in-memory [`TtlCache`] is the
//! default implementation and [`SqliteStore`] a persistent one. A distributed
//! backend slots in by implementing the same trait.

pub mod key;
pub mod sqlite;
pub mod ttl;

use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;

pub use key::{CacheKey, CacheKeyEngine};
pub use sqlite::SqliteStore;
pub use ttl::{CacheEntry, TtlCache};

/// Counters exposed by every store. `hits`/`misses` count `get` outcomes.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CacheStats {
    pub size: usize,
    pub hits: u64,
    pub misses: u64,
    /// Entries removed to respect the capacity bound.
    pub evictions: u64,
    /// Entries removed because their TTL elapsed (lazily or by a sweep).
    pub expirations: u64,
}

/// Key/value capability with per-entry TTL. Values come back as owned clones,
/// so callers can never mutate what the store holds.
#[async_trait]
pub trait KeyValueStore<V>: Send + Sync
where
    V: Clone + Send + Sync + 'static,
{
    /// Live value for `key`, or None if absent or expired.
    async fn get(&self, key: &str) -> Option<V>;

    async fn set(&self, key: &str, value: V, ttl: Duration);

    /// Returns true if an entry was removed.
    async fn delete(&self, key: &str) -> bool;

    /// Snapshot of every live value. Does not count as hits.
    async fn values(&self) -> Vec<V>;

    async fn stats(&self) -> CacheStats;

    /// Drop expired entries, returning how many were removed.
    async fn sweep_expired(&self) -> usize;
}
