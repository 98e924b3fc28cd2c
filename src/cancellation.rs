//! Cancellation and deadlines for upstream calls, plus ownership of the
//! background sweep tasks.
//!
//! Dropping a provider future aborts the HTTP request, so both helpers work by
//! racing the call against a timer or a token and dropping the loser.

use std::future::Future;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::error::ProviderError;

/// Run a provider call with a deadline. Elapsed deadline is `Timeout`.
pub async fn bounded<T, F>(timeout: Duration, call: F) -> Result<T, ProviderError>
where
    F: Future<Output = Result<T, ProviderError>>,
{
    match tokio::time::timeout(timeout, call).await {
        Ok(result) => result,
        Err(_) => Err(ProviderError::Timeout),
    }
}

/// Run a call until it finishes or `token` fires. Cancellation wins ties.
pub async fn cancellable<T, F>(token: &CancellationToken, call: F) -> Result<T, ProviderError>
where
    F: Future<Output = Result<T, ProviderError>>,
{
    tokio::select! {
        biased;
        _ = token.cancelled() => Err(ProviderError::Cancelled),
        result = call => result,
    }
}

/// `bounded` and `cancellable` together: the usual shape of one upstream attempt.
pub async fn guarded<T, F>(
    token: &CancellationToken,
    timeout: Duration,
    call: F,
) -> Result<T, ProviderError>
where
    F: Future<Output = Result<T, ProviderError>>,
{
    cancellable(token, bounded(timeout, call)).await
}

/// Owns long-running background loops and stops them together.
pub struct BackgroundTasks {
    token: CancellationToken,
    handles: Mutex<Vec<(&'static str, JoinHandle<()>)>>,
}

impl Default for BackgroundTasks {
    fn default() -> Self {
        Self::new()
    }
}

impl BackgroundTasks {
    pub fn new() -> Self {
        Self {
            token: CancellationToken::new(),
            handles: Mutex::new(Vec::new()),
        }
    }

    /// Token for a new loop; fires on `shutdown`.
    pub fn child_token(&self) -> CancellationToken {
        self.token.child_token()
    }

    pub fn track(&self, name: &'static str, handle: JoinHandle<()>) {
        self.handles.lock().push((name, handle));
    }

    pub fn len(&self) -> usize {
        self.handles.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_shut_down(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Cancel every loop and wait for it to exit.
    pub async fn shutdown(&self) {
        self.token.cancel();
        let handles: Vec<_> = std::mem::take(&mut *self.handles.lock());
        for (name, handle) in handles {
            match handle.await {
                Ok(()) => debug!(task = name, "background task stopped"),
                Err(e) => warn!(task = name, error = %e, "background task ended abnormally"),
            }
        }
    }
}
