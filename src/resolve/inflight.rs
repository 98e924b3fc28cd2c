//! Coalescing of concurrent cache misses: callers resolving the same key
//! share one upstream walk. The table holds weak handles only, so when every
//! caller has gone away the walk is dropped and its provider call aborted.

use std::collections::HashMap;
use std::future::Future;

use futures_util::future::{BoxFuture, FutureExt, Shared, WeakShared};
use parking_lot::Mutex;

use super::ResolvedResult;
use crate::error::ResolveError;

pub(crate) type WalkOutput = Result<ResolvedResult, ResolveError>;
pub(crate) type SharedWalk = Shared<BoxFuture<'static, WalkOutput>>;

/// Dead handles are pruned once the table grows past this.
const PRUNE_THRESHOLD: usize = 256;

#[derive(Default)]
pub(crate) struct InFlight {
    walks: Mutex<HashMap<String, WeakShared<BoxFuture<'static, WalkOutput>>>>,
}

impl InFlight {
    /// Join the live walk for `key`, or start one with `start`.
    /// The bool is true when an existing walk was joined.
    pub fn join_or_start<F>(&self, key: &str, start: impl FnOnce() -> F) -> (SharedWalk, bool)
    where
        F: Future<Output = WalkOutput> + Send + 'static,
    {
        let mut walks = self.walks.lock();
        if let Some(live) = walks.get(key).and_then(WeakShared::upgrade) {
            return (live, true);
        }
        if walks.len() >= PRUNE_THRESHOLD {
            walks.retain(|_, weak| weak.upgrade().is_some());
        }
        let walk = start().boxed().shared();
        if let Some(weak) = walk.downgrade() {
            walks.insert(key.to_string(), weak);
        }
        (walk, false)
    }

    /// Called by a walk once its result is cached.
    pub fn finish(&self, key: &str) {
        self.walks.lock().remove(key);
    }

    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.walks.lock().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resolve::{Provenance, RequestKind};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    fn result() -> ResolvedResult {
        ResolvedResult::new(
            RequestKind::Text,
            "rice",
            Vec::new(),
            Provenance::StructuredDb,
            0.9,
            "stub",
        )
    }

    #[tokio::test]
    async fn concurrent_callers_share_one_walk() {
        let inflight = Arc::new(InFlight::default());
        let started = Arc::new(AtomicUsize::new(0));

        let make = |inflight: Arc<InFlight>, started: Arc<AtomicUsize>| {
            let table = Arc::clone(&inflight);
            let (walk, _) = table.join_or_start("k", move || {
                started.fetch_add(1, Ordering::SeqCst);
                async move {
                    tokio::time::sleep(Duration::from_millis(20)).await;
                    inflight.finish("k");
                    Ok(result())
                }
            });
            walk
        };

        let a = make(Arc::clone(&inflight), Arc::clone(&started));
        let b = make(Arc::clone(&inflight), Arc::clone(&started));
        let (ra, rb) = tokio::join!(a, b);
        assert_eq!(ra, rb);
        assert_eq!(started.load(Ordering::SeqCst), 1);
        assert_eq!(inflight.len(), 0);
    }

    #[tokio::test]
    async fn abandoned_walk_is_restarted() {
        let inflight = InFlight::default();
        let (walk, joined) = inflight.join_or_start("k", || async {
            tokio::time::sleep(Duration::from_secs(60)).await;
            Ok(result())
        });
        assert!(!joined);
        drop(walk);

        let (_walk, joined) = inflight.join_or_start("k", || async { Ok(result()) });
        assert!(!joined, "dropped walk must not be joined");
    }
}
