//! Persistent key/value store backed by SQLite.
//! Values are MessagePack-encoded; expiry is stored per row so mixed TTLs work.
//! Survives restarts, unlike `TtlCache`. Every statement runs on the blocking
//! pool so disk I/O never stalls a runtime worker.

use std::marker::PhantomData;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension};
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::{CacheStats, KeyValueStore};
use crate::error::StoreError;

/// SQLite-backed store for one logical cache (one table).
pub struct SqliteStore<V> {
    inner: Arc<StoreInner>,
    /// Row bound; the oldest inserts are evicted past it.
    capacity: Option<usize>,
    _value: PhantomData<fn() -> V>,
}

/// Connection and counters shared with blocking tasks. Works on encoded rows only.
struct StoreInner {
    conn: Mutex<Connection>,
    table: String,
    stats: Mutex<CacheStats>,
}

impl<V> SqliteStore<V> {
    /// Open (or create) the database at `db_path` using `table` for this cache.
    /// `table` must be a plain identifier.
    pub fn open(db_path: &Path, table: &str) -> Result<Self, StoreError> {
        let conn = Connection::open(db_path)?;
        Self::init(conn, table, Some(db_path))
    }

    /// In-memory database, mostly for tests.
    pub fn open_in_memory(table: &str) -> Result<Self, StoreError> {
        Self::init(Connection::open_in_memory()?, table, None)
    }

    /// Bound the table to `capacity` rows (minimum 1).
    pub fn with_capacity(mut self, capacity: usize) -> Self {
        self.capacity = Some(capacity.max(1));
        self
    }

    fn init(conn: Connection, table: &str, path: Option<&Path>) -> Result<Self, StoreError> {
        let table: String = table
            .chars()
            .filter(|c| c.is_ascii_alphanumeric() || *c == '_')
            .collect();

        // WAL mode for better concurrent read performance
        if path.is_some() {
            conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA synchronous=NORMAL;")?;
        }
        conn.execute_batch(&format!(
            "CREATE TABLE IF NOT EXISTS {table} (
                cache_key TEXT PRIMARY KEY,
                value BLOB NOT NULL,
                created_at_ms INTEGER NOT NULL,
                expires_at_ms INTEGER NOT NULL,
                hit_count INTEGER NOT NULL DEFAULT 0
            );
            CREATE INDEX IF NOT EXISTS idx_{table}_expires ON {table}(expires_at_ms);"
        ))?;

        match path {
            Some(p) => info!(path = %p.display(), table = %table, "sqlite store opened"),
            None => debug!(table = %table, "in-memory sqlite store opened"),
        }

        Ok(Self {
            inner: Arc::new(StoreInner {
                conn: Mutex::new(conn),
                table,
                stats: Mutex::new(CacheStats::default()),
            }),
            capacity: None,
            _value: PhantomData,
        })
    }

    /// Run `op` against the shared connection on the blocking pool.
    async fn blocking<T, F>(&self, op: F) -> Result<T, StoreError>
    where
        T: Send + 'static,
        F: FnOnce(&StoreInner) -> Result<T, StoreError> + Send + 'static,
    {
        let inner = Arc::clone(&self.inner);
        tokio::task::spawn_blocking(move || op(&inner)).await?
    }
}

impl StoreInner {
    fn get_blob(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError> {
        let conn = self.conn.lock();
        let now = now_ms();
        let row: Option<(Vec<u8>, i64)> = conn
            .query_row(
                &format!("SELECT value, expires_at_ms FROM {} WHERE cache_key = ?1", self.table),
                params![key],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()?;

        let Some((blob, expires_at)) = row else {
            self.stats.lock().misses += 1;
            return Ok(None);
        };
        if now > expires_at {
            conn.execute(
                &format!("DELETE FROM {} WHERE cache_key = ?1", self.table),
                params![key],
            )?;
            let mut stats = self.stats.lock();
            stats.expirations += 1;
            stats.misses += 1;
            return Ok(None);
        }
        conn.execute(
            &format!("UPDATE {} SET hit_count = hit_count + 1 WHERE cache_key = ?1", self.table),
            params![key],
        )?;
        self.stats.lock().hits += 1;
        Ok(Some(blob))
    }

    /// Insert or replace, then trim to `capacity`. Returns rows evicted.
    fn put_blob(
        &self,
        key: &str,
        blob: &[u8],
        ttl: Duration,
        capacity: Option<usize>,
    ) -> Result<usize, StoreError> {
        let now = now_ms();
        let expires_at = now.saturating_add(ttl.as_millis().min(i64::MAX as u128) as i64);
        let conn = self.conn.lock();
        conn.execute(
            &format!(
                "INSERT OR REPLACE INTO {}
                 (cache_key, value, created_at_ms, expires_at_ms, hit_count)
                 VALUES (?1, ?2, ?3, ?4, 0)",
                self.table
            ),
            params![key, blob, now, expires_at],
        )?;
        let Some(capacity) = capacity else {
            return Ok(0);
        };

        // A replaced row gets a fresh rowid, so rowid order is insertion order.
        let evicted = conn.execute(
            &format!(
                "DELETE FROM {t} WHERE rowid IN
                 (SELECT rowid FROM {t} ORDER BY rowid DESC LIMIT -1 OFFSET ?1)",
                t = self.table
            ),
            params![capacity as i64],
        )?;
        if evicted > 0 {
            debug!(evicted, table = %self.table, "sqlite store over capacity");
            self.stats.lock().evictions += evicted as u64;
        }
        Ok(evicted)
    }

    fn remove(&self, key: &str) -> Result<bool, StoreError> {
        let conn = self.conn.lock();
        let n = conn.execute(
            &format!("DELETE FROM {} WHERE cache_key = ?1", self.table),
            params![key],
        )?;
        Ok(n > 0)
    }

    fn live_blobs(&self) -> Result<Vec<Vec<u8>>, StoreError> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(&format!(
            "SELECT value FROM {} WHERE expires_at_ms >= ?1 ORDER BY rowid",
            self.table
        ))?;
        let blobs = stmt
            .query_map(params![now_ms()], |row| row.get::<_, Vec<u8>>(0))?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(blobs)
    }

    fn len(&self) -> Result<usize, StoreError> {
        let conn = self.conn.lock();
        let n: i64 = conn.query_row(&format!("SELECT COUNT(*) FROM {}", self.table), [], |row| {
            row.get(0)
        })?;
        Ok(n.max(0) as usize)
    }

    fn cleanup_expired(&self) -> Result<usize, StoreError> {
        let conn = self.conn.lock();
        let count = conn.execute(
            &format!("DELETE FROM {} WHERE expires_at_ms < ?1", self.table),
            params![now_ms()],
        )?;
        if count > 0 {
            info!(removed = count, table = %self.table, "sqlite store cleanup");
            self.stats.lock().expirations += count as u64;
        }
        Ok(count)
    }
}

impl<V> SqliteStore<V>
where
    V: Clone + Serialize + DeserializeOwned + Send + Sync + 'static,
{
    /// Start a background cleanup loop (default cadence: hourly).
    pub fn start_cleanup_loop(
        store: Arc<Self>,
        interval: Duration,
        shutdown: CancellationToken,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        store.sweep_expired().await;
                    }
                    _ = shutdown.cancelled() => break,
                }
            }
        })
    }
}

#[async_trait]
impl<V> KeyValueStore<V> for SqliteStore<V>
where
    V: Clone + Serialize + DeserializeOwned + Send + Sync + 'static,
{
    async fn get(&self, key: &str) -> Option<V> {
        let owned = key.to_string();
        let blob = match self.blocking(move |inner| inner.get_blob(&owned)).await {
            Ok(blob) => blob?,
            Err(e) => {
                warn!(error = %e, key, "sqlite store get failed");
                return None;
            }
        };
        match rmp_serde::from_slice(&blob) {
            Ok(value) => Some(value),
            Err(e) => {
                warn!(error = %e, key, "sqlite store row undecodable");
                None
            }
        }
    }

    async fn set(&self, key: &str, value: V, ttl: Duration) {
        let blob = match rmp_serde::to_vec_named(&value) {
            Ok(blob) => blob,
            Err(e) => {
                warn!(error = %e, key, "sqlite store encode failed");
                return;
            }
        };
        let owned = key.to_string();
        let capacity = self.capacity;
        let put = self.blocking(move |inner| inner.put_blob(&owned, &blob, ttl, capacity));
        if let Err(e) = put.await {
            warn!(error = %e, key, "sqlite store insert failed");
        }
    }

    async fn delete(&self, key: &str) -> bool {
        let owned = key.to_string();
        self.blocking(move |inner| inner.remove(&owned))
            .await
            .unwrap_or_else(|e| {
                warn!(error = %e, key, "sqlite store delete failed");
                false
            })
    }

    async fn values(&self) -> Vec<V> {
        let blobs = match self.blocking(|inner| inner.live_blobs()).await {
            Ok(blobs) => blobs,
            Err(e) => {
                warn!(error = %e, "sqlite store scan failed");
                return Vec::new();
            }
        };
        let mut out = Vec::with_capacity(blobs.len());
        for blob in blobs {
            match rmp_serde::from_slice(&blob) {
                Ok(v) => out.push(v),
                Err(e) => warn!(error = %e, table = %self.inner.table, "skipping undecodable row"),
            }
        }
        out
    }

    async fn stats(&self) -> CacheStats {
        let size = self.blocking(|inner| inner.len()).await.unwrap_or(0);
        CacheStats {
            size,
            ..*self.inner.stats.lock()
        }
    }

    async fn sweep_expired(&self) -> usize {
        self.blocking(|inner| inner.cleanup_expired())
            .await
            .unwrap_or_else(|e| {
                warn!(error = %e, "sqlite store cleanup failed");
                0
            })
    }
}

/// Current wall-clock time in Unix milliseconds.
fn now_ms() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as i64
}
