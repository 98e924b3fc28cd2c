//! Error taxonomy for provider calls, resolution and generation.
//! Provider errors never escape the chain or the retry loop; they only lower
//! confidence or route to fallback content.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::resolve::RequestKind;

/// Failure of a single upstream call. Always recoverable by the caller of the
/// provider (the chain advances, the generation loop retries).
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProviderError {
    #[error("provider timed out")]
    Timeout,
    #[error("provider unavailable: {0}")]
    Unavailable(String),
    #[error("rate limited, retry after {retry_after_ms}ms")]
    RateLimited { retry_after_ms: u64 },
    #[error("not found upstream")]
    NotFoundUpstream,
    #[error("malformed provider response: {0}")]
    MalformedResponse(String),
    #[error("provider call cancelled")]
    Cancelled,
}

impl ProviderError {
    /// Transient failures are worth another provider (or another attempt).
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            ProviderError::Timeout
                | ProviderError::Unavailable(_)
                | ProviderError::RateLimited { .. }
        )
    }
}

/// The only failures `resolve` surfaces to its caller.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ResolveError {
    #[error("no provider could resolve {kind} request")]
    NotFound { kind: RequestKind },
    #[error("resolution cancelled by caller")]
    Cancelled,
}

/// Every generation attempt produced a duplicate or failed. Recorded on the
/// fallback artifact, never returned as an `Err` to `generate` callers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error, Serialize, Deserialize)]
#[error(
    "generation exhausted after {attempts} attempts \
     ({duplicates} duplicates, {failures} failures)"
)]
pub struct GenerationExhausted {
    pub attempts: u32,
    pub duplicates: u32,
    pub failures: u32,
}

/// Returned by `generate_with_cancel` when the caller cancels mid-flight.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("generation cancelled by caller")]
pub struct GenerationCancelled;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("config IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("config parse error: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("invalid config: {0}")]
    Invalid(String),
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("encode error: {0}")]
    Encode(#[from] rmp_serde::encode::Error),
    #[error("decode error: {0}")]
    Decode(#[from] rmp_serde::decode::Error),
    #[error("blocking task failed: {0}")]
    Task(#[from] tokio::task::JoinError),
}

/// Failure to assemble an engine from configuration.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("persistent cache: {0}")]
    Store(#[from] StoreError),
}
