//! Content-addressed cache keys.
//! Key: blake3(version | kind | params | canonical payload), hex-truncated.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::normalize::canonicalize;
use crate::resolve::{Payload, ResolutionRequest};

/// Bumped whenever the preimage layout changes so old persisted keys stop matching.
const KEY_SCHEMA_VERSION: &[u8] = b"v1";

pub const DEFAULT_KEY_HEX_LEN: usize = 32;

/// Hex digest identifying a cache entry.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct CacheKey(String);

impl CacheKey {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Computes stable keys for resolution requests.
#[derive(Debug, Clone)]
pub struct CacheKeyEngine {
    hex_len: usize,
}

impl Default for CacheKeyEngine {
    fn default() -> Self {
        Self::new(DEFAULT_KEY_HEX_LEN)
    }
}

impl CacheKeyEngine {
    /// `hex_len` is clamped to 16..=64 (64 to 256 bits).
    pub fn new(hex_len: usize) -> Self {
        Self {
            hex_len: hex_len.clamp(16, 64),
        }
    }

    /// Text payloads are canonicalized first so "Banana!" and "banana" collide;
    /// binary payloads are hashed byte-for-byte. `params` carries whatever else
    /// changes the answer (provider set, locale) and is hashed verbatim.
    pub fn compute_key(&self, request: &ResolutionRequest, params: &str) -> CacheKey {
        let mut hasher = blake3::Hasher::new();
        hasher.update(KEY_SCHEMA_VERSION);
        hasher.update(b"|");
        hasher.update(request.kind.as_str().as_bytes());
        hasher.update(b"|");
        hasher.update(&(params.len() as u64).to_le_bytes());
        hasher.update(params.as_bytes());
        hasher.update(b"|");
        match &request.payload {
            Payload::Text(text) => {
                hasher.update(canonicalize(text).as_bytes());
            }
            Payload::Bytes(bytes) => {
                hasher.update(bytes);
            }
        }
        let hex = hasher.finalize().to_hex();
        CacheKey(hex.as_str()[..self.hex_len].to_string())
    }

}
