//! Request resolution: turning an image, barcode, text or voice transcript
//! into a structured nutrition result through cache and provider chain.

pub mod analysis;
pub mod chain;
mod inflight;

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::enrich::{DietaryPreferences, Enrichment};
use crate::nutrition::{totals, FoodItem, NutrientRecord};

pub use chain::{ChainBuilder, SourceResolutionChain};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RequestKind {
    Image,
    Barcode,
    Text,
    Voice,
}

impl RequestKind {
    pub fn as_str(self) -> &'static str {
        match self {
            RequestKind::Image => "image",
            RequestKind::Barcode => "barcode",
            RequestKind::Text => "text",
            RequestKind::Voice => "voice",
        }
    }
}

impl fmt::Display for RequestKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Payload {
    Text(String),
    Bytes(Vec<u8>),
}

impl Payload {
    pub fn as_text(&self) -> Option<&str> {
        match self {
            Payload::Text(s) => Some(s),
            Payload::Bytes(_) => None,
        }
    }

    pub fn as_bytes(&self) -> &[u8] {
        match self {
            Payload::Text(s) => s.as_bytes(),
            Payload::Bytes(b) => b,
        }
    }
}

/// Who is asking. Never part of the cache key.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RequesterContext {
    pub user_id: Option<String>,
    pub locale: Option<String>,
    pub preferences: DietaryPreferences,
}

/// An immutable resolution request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolutionRequest {
    pub kind: RequestKind,
    pub payload: Payload,
    /// MIME type of binary payloads.
    pub media_type: Option<String>,
    pub requester: RequesterContext,
}

impl ResolutionRequest {
    pub fn new(kind: RequestKind, payload: Payload) -> Self {
        Self {
            kind,
            payload,
            media_type: None,
            requester: RequesterContext::default(),
        }
    }

    pub fn text(text: impl Into<String>) -> Self {
        Self::new(RequestKind::Text, Payload::Text(text.into()))
    }

    pub fn barcode(code: impl Into<String>) -> Self {
        Self::new(RequestKind::Barcode, Payload::Text(code.into()))
    }

    /// `transcript` is the upstream speech-to-text output.
    pub fn voice(transcript: impl Into<String>) -> Self {
        Self::new(RequestKind::Voice, Payload::Text(transcript.into()))
    }

    pub fn image(bytes: Vec<u8>, media_type: impl Into<String>) -> Self {
        Self {
            media_type: Some(media_type.into()),
            ..Self::new(RequestKind::Image, Payload::Bytes(bytes))
        }
    }

    pub fn with_requester(mut self, requester: RequesterContext) -> Self {
        self.requester = requester;
        self
    }
}

/// Where a result came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Provenance {
    Cache,
    StructuredDb,
    Generative,
}

impl Provenance {
    pub fn as_str(self) -> &'static str {
        match self {
            Provenance::Cache => "cache",
            Provenance::StructuredDb => "structured-db",
            Provenance::Generative => "generative",
        }
    }
}

impl fmt::Display for Provenance {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Structured outcome of a resolution. Callers receive an owned copy.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResolvedResult {
    pub request_kind: RequestKind,
    /// Text that was resolved: the query, transcript, barcode or image description.
    pub query: String,
    pub items: Vec<FoodItem>,
    pub totals: NutrientRecord,
    pub provenance: Provenance,
    /// Source that produced the data; differs from `provenance` on cache hits.
    pub origin: Provenance,
    pub confidence: f64,
    /// Placeholder produced after every source failed.
    #[serde(default)]
    pub degraded: bool,
    /// Name of the provider that answered.
    pub source: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub enrichment: Option<Enrichment>,
}

impl ResolvedResult {
    pub fn new(
        request_kind: RequestKind,
        query: impl Into<String>,
        items: Vec<FoodItem>,
        provenance: Provenance,
        confidence: f64,
        source: impl Into<String>,
    ) -> Self {
        let totals = totals(&items);
        Self {
            request_kind,
            query: query.into(),
            items,
            totals,
            provenance,
            origin: provenance,
            confidence: confidence.clamp(0.0, 1.0),
            degraded: false,
            source: source.into(),
            enrichment: None,
        }
    }

    pub fn with_degraded(mut self, degraded: bool) -> Self {
        self.degraded = degraded;
        self
    }

    /// Structured-database data, fresh or cached. Anything else is approximate.
    pub fn is_verified(&self) -> bool {
        !self.degraded && self.origin == Provenance::StructuredDb
    }

    pub fn is_cached(&self) -> bool {
        self.provenance == Provenance::Cache
    }

    /// Scale every confidence by `factor`, clamped to [0, 1].
    pub(crate) fn discounted(mut self, factor: f64) -> Self {
        self.confidence = (self.confidence * factor).clamp(0.0, 1.0);
        for item in &mut self.items {
            item.confidence = (item.confidence * factor).clamp(0.0, 1.0);
        }
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn provenance_serializes_kebab_case() {
        assert_eq!(
            serde_json::to_string(&Provenance::StructuredDb).expect("serialize"),
            "\"structured-db\""
        );
        assert_eq!(Provenance::Cache.to_string(), "cache");
    }

    #[test]
    fn constructors_set_kind_and_media_type() {
        let img = ResolutionRequest::image(vec![1, 2], "image/jpeg");
        assert_eq!(img.kind, RequestKind::Image);
        assert_eq!(img.media_type.as_deref(), Some("image/jpeg"));
        assert_eq!(ResolutionRequest::voice("two eggs").payload.as_text(), Some("two eggs"));
        assert_eq!(RequestKind::Barcode.to_string(), "barcode");
    }

    #[test]
    fn verification_depends_on_origin() {
        let mut r = ResolvedResult::new(
            RequestKind::Text,
            "rice",
            Vec::new(),
            Provenance::StructuredDb,
            0.9,
            "usda",
        );
        assert!(r.is_verified());
        r.provenance = Provenance::Cache;
        assert!(r.is_verified() && r.is_cached());
        r.origin = Provenance::Generative;
        assert!(!r.is_verified());
    }

    #[test]
    fn discount_scales_items_too() {
        let item = FoodItem {
            name: "egg".into(),
            brand: None,
            quantity: 50.0,
            unit: "g".into(),
            confidence: 0.7,
            nutrients: NutrientRecord::default(),
        };
        let r = ResolvedResult::new(
            RequestKind::Image,
            "egg",
            vec![item],
            Provenance::Generative,
            0.7,
            "llm",
        )
        .discounted(0.8);
        assert!((r.confidence - 0.56).abs() < 1e-9);
        assert!((r.items[0].confidence - 0.56).abs() < 1e-9);
    }
}
