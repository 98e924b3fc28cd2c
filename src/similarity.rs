//! 128-bit SimHash fingerprints for near-duplicate detection of generated text.
//!
//! Features are word unigrams and bigrams of the normalized text. Each feature
//! is hashed to 128 bits and votes +1/-1 on every bit position; the sign of the
//! tally becomes the fingerprint bit. Similar texts share most features, so
//! their tallies (and bits) mostly agree. This is the opposite of a
//! cryptographic digest and must never be used as one.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::normalize::normalize_content;

pub const FINGERPRINT_BITS: usize = 128;
pub const DEFAULT_SIMILARITY_THRESHOLD: u32 = 3;

/// Fixed-width locality-sensitive fingerprint. Serialized as 32 hex chars.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Fingerprint(u128);

impl Fingerprint {
    pub const fn from_bits(bits: u128) -> Self {
        Self(bits)
    }

    pub const fn bits(self) -> u128 {
        self.0
    }

    /// Number of differing bit positions.
    #[inline]
    pub fn distance(self, other: Fingerprint) -> u32 {
        (self.0 ^ other.0).count_ones()
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:032x}", self.0)
    }
}

impl From<Fingerprint> for String {
    fn from(fp: Fingerprint) -> Self {
        fp.to_string()
    }
}

impl TryFrom<String> for Fingerprint {
    type Error = std::num::ParseIntError;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        u128::from_str_radix(&s, 16).map(Fingerprint)
    }
}

/// Computes fingerprints and judges near-duplicates against a tunable threshold.
#[derive(Debug, Clone, Copy)]
pub struct SimilarityHasher {
    threshold: u32,
}

impl Default for SimilarityHasher {
    fn default() -> Self {
        Self::new(DEFAULT_SIMILARITY_THRESHOLD)
    }
}

impl SimilarityHasher {
    pub fn new(threshold: u32) -> Self {
        Self { threshold }
    }

    pub fn threshold(&self) -> u32 {
        self.threshold
    }

    /// Deterministic fingerprint of `text` after normalization.
    /// Empty (or all-punctuation) text maps to the zero fingerprint.
    pub fn fingerprint(&self, text: &str) -> Fingerprint {
        let normalized = normalize_content(text);
        let tokens: Vec<&str> = normalized.split(' ').filter(|t| !t.is_empty()).collect();
        if tokens.is_empty() {
            return Fingerprint(0);
        }

        let mut tally = [0i64; FINGERPRINT_BITS];
        let mut vote = |feature: &[u8]| {
            let h = feature_hash(feature);
            for (bit, slot) in tally.iter_mut().enumerate() {
                if (h >> bit) & 1 == 1 {
                    *slot += 1;
                } else {
                    *slot -= 1;
                }
            }
        };

        for token in &tokens {
            vote(token.as_bytes());
        }
        let mut pair = Vec::with_capacity(32);
        for window in tokens.windows(2) {
            pair.clear();
            pair.extend_from_slice(window[0].as_bytes());
            pair.push(b' ');
            pair.extend_from_slice(window[1].as_bytes());
            vote(&pair);
        }

        let mut bits = 0u128;
        for (bit, &count) in tally.iter().enumerate() {
            if count > 0 {
                bits |= 1u128 << bit;
            }
        }
        Fingerprint(bits)
    }

    pub fn distance(&self, a: Fingerprint, b: Fingerprint) -> u32 {
        a.distance(b)
    }

    pub fn is_near_duplicate(&self, a: Fingerprint, b: Fingerprint) -> bool {
        a.distance(b) <= self.threshold
    }

    /// Closest fingerprint in `window` and its distance, if any.
    pub fn nearest<'a, I>(&self, candidate: Fingerprint, window: I) -> Option<(usize, u32)>
    where
        I: IntoIterator<Item = &'a Fingerprint>,
    {
        window
            .into_iter()
            .enumerate()
            .map(|(i, fp)| (i, candidate.distance(*fp)))
            .min_by_key(|&(_, d)| d)
    }
}

/// Per-feature 128-bit hash. blake3 keeps it stable across platforms and
/// releases, which `std`'s hasher does not promise.
fn feature_hash(feature: &[u8]) -> u128 {
    let digest = blake3::hash(feature);
    let mut buf = [0u8; 16];
    buf.copy_from_slice(&digest.as_bytes()[..16]);
    u128::from_le_bytes(buf)
}
