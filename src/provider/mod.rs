//! Upstream provider seams.
//!
//! Structured providers (product and nutrition databases) answer lookups with
//! per-100 g nutrient data or `NotFoundUpstream`. The generative provider turns
//! prompts into raw text and images into descriptions; callers validate its
//! output. HTTP implementations live in the submodules; tests use stubs.

pub mod chat;
pub mod openfoodfacts;
pub mod usda;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::ProviderError;
use crate::nutrition::NutrientRecord;

pub use chat::ChatCompletionsClient;
pub use openfoodfacts::OpenFoodFactsClient;
pub use usda::UsdaClient;

/// What a structured provider is asked for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StructuredQuery<'a> {
    Barcode(&'a str),
    Text(&'a str),
}

impl StructuredQuery<'_> {
    pub fn as_str(&self) -> &str {
        match self {
            StructuredQuery::Barcode(s) | StructuredQuery::Text(s) => s,
        }
    }
}

/// A structured database hit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FoodMatch {
    pub name: String,
    pub brand: Option<String>,
    pub per_100g: NutrientRecord,
    /// Labelled serving size, when the product declares one.
    pub serving_size_g: Option<f64>,
}

/// Product or nutrition database. Providers that cannot answer a query kind
/// return `NotFoundUpstream`.
#[async_trait]
pub trait StructuredProvider: Send + Sync {
    fn name(&self) -> &str;

    async fn lookup(&self, query: StructuredQuery<'_>) -> Result<FoodMatch, ProviderError>;
}

/// A text completion request for the generative service.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CompletionRequest {
    pub system: String,
    pub prompt: String,
    pub temperature: f32,
    pub max_tokens: u32,
    /// Sampling seed, varied per attempt so retries are not byte-identical.
    pub seed: Option<u64>,
}

/// Generative AI service: free-form completion and vision extraction.
#[async_trait]
pub trait GenerativeProvider: Send + Sync {
    fn name(&self) -> &str;

    async fn complete(&self, request: &CompletionRequest) -> Result<String, ProviderError>;

    /// Describe the food visible in an image, following `instruction`.
    async fn describe_image(
        &self,
        image: &[u8],
        media_type: &str,
        instruction: &str,
    ) -> Result<String, ProviderError>;
}

/// Map an HTTP status to the provider error taxonomy.
pub(crate) fn classify_status(status: reqwest::StatusCode, retry_after_ms: u64) -> ProviderError {
    match status.as_u16() {
        404 => ProviderError::NotFoundUpstream,
        429 => ProviderError::RateLimited { retry_after_ms },
        408 | 504 => ProviderError::Timeout,
        s if s >= 500 => ProviderError::Unavailable(format!("server error: {status}")),
        _ => ProviderError::Unavailable(format!("unexpected status {status}")),
    }
}

/// Map a transport error.
pub(crate) fn classify_transport(err: &reqwest::Error) -> ProviderError {
    if err.is_timeout() {
        ProviderError::Timeout
    } else if err.is_decode() {
        ProviderError::MalformedResponse(err.to_string())
    } else {
        ProviderError::Unavailable(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use reqwest::StatusCode;

    #[test]
    fn status_classification() {
        assert_eq!(
            classify_status(StatusCode::NOT_FOUND, 0),
            ProviderError::NotFoundUpstream
        );
        assert_eq!(
            classify_status(StatusCode::TOO_MANY_REQUESTS, 2000),
            ProviderError::RateLimited { retry_after_ms: 2000 }
        );
        assert_eq!(
            classify_status(StatusCode::GATEWAY_TIMEOUT, 0),
            ProviderError::Timeout
        );
        assert!(matches!(
            classify_status(StatusCode::BAD_GATEWAY, 0),
            ProviderError::Unavailable(_)
        ));
    }

    #[test]
    fn query_text() {
        assert_eq!(StructuredQuery::Barcode("0123").as_str(), "0123");
        assert_eq!(StructuredQuery::Text("rice").as_str(), "rice");
    }
}
