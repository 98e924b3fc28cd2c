//! Open Food Facts product lookup (barcode -> per-100 g nutriments).

use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use tracing::debug;

use super::{classify_status, classify_transport, FoodMatch, StructuredProvider, StructuredQuery};
use crate::config::OpenFoodFactsEndpoint;
use crate::error::ProviderError;
use crate::nutrition::NutrientRecord;

const FIELDS: &str = "product_name,brands,nutriments,serving_quantity";

pub struct OpenFoodFactsClient {
    http: reqwest::Client,
    base_url: String,
}

impl OpenFoodFactsClient {
    pub fn new(endpoint: &OpenFoodFactsEndpoint) -> Result<Self, ProviderError> {
        let http = reqwest::Client::builder()
            .user_agent(endpoint.user_agent.clone())
            .timeout(Duration::from_millis(endpoint.request_timeout_ms))
            .build()
            .map_err(|e| ProviderError::Unavailable(e.to_string()))?;
        Ok(Self {
            http,
            base_url: endpoint.base_url.trim_end_matches('/').to_string(),
        })
    }
}

#[async_trait]
impl StructuredProvider for OpenFoodFactsClient {
    fn name(&self) -> &str {
        "open-food-facts"
    }

    async fn lookup(&self, query: StructuredQuery<'_>) -> Result<FoodMatch, ProviderError> {
        let StructuredQuery::Barcode(code) = query else {
            return Err(ProviderError::NotFoundUpstream);
        };
        if code.is_empty() || !code.chars().all(|c| c.is_ascii_digit()) {
            return Err(ProviderError::NotFoundUpstream);
        }

        let resp = self
            .http
            .get(format!("{}/api/v2/product/{code}.json", self.base_url))
            .query(&[("fields", FIELDS)])
            .send()
            .await
            .map_err(|e| classify_transport(&e))?;
        if !resp.status().is_success() {
            return Err(classify_status(resp.status(), 0));
        }
        let body: ProductResponse = resp
            .json()
            .await
            .map_err(|e| ProviderError::MalformedResponse(e.to_string()))?;
        debug!(code, status = body.status, "open food facts response");
        parse_product(body)
    }
}

fn parse_product(body: ProductResponse) -> Result<FoodMatch, ProviderError> {
    if body.status != 1 {
        return Err(ProviderError::NotFoundUpstream);
    }
    let product = body.product.ok_or(ProviderError::NotFoundUpstream)?;
    let n = product.nutriments.unwrap_or_default();
    let Some(calories) = n.energy_kcal_100g else {
        return Err(ProviderError::MalformedResponse(
            "product has no energy-kcal_100g".into(),
        ));
    };
    let name = product
        .product_name
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .unwrap_or_else(|| "Unnamed product".to_string());
    let brand = product
        .brands
        .and_then(|b| b.split(',').next().map(|s| s.trim().to_string()))
        .filter(|s| !s.is_empty());

    Ok(FoodMatch {
        name,
        brand,
        per_100g: NutrientRecord {
            calories,
            protein: n.proteins_100g.unwrap_or(0.0),
            carbs: n.carbohydrates_100g.unwrap_or(0.0),
            fat: n.fat_100g.unwrap_or(0.0),
            fiber: n.fiber_100g.unwrap_or(0.0),
            sugar: n.sugars_100g.unwrap_or(0.0),
            // Open Food Facts reports sodium in grams.
            sodium_mg: n.sodium_100g.unwrap_or(0.0) * 1000.0,
        }
        .sanitized(),
        serving_size_g: product.serving_quantity.filter(|q| *q > 0.0),
    })
}

// --- Response types ---

#[derive(Deserialize)]
struct ProductResponse {
    #[serde(default)]
    status: i64,
    product: Option<Product>,
}

#[derive(Deserialize)]
struct Product {
    product_name: Option<String>,
    brands: Option<String>,
    nutriments: Option<Nutriments>,
    #[serde(default, deserialize_with = "lenient_f64")]
    serving_quantity: Option<f64>,
}

#[derive(Deserialize, Default)]
struct Nutriments {
    #[serde(rename = "energy-kcal_100g", default, deserialize_with = "lenient_f64")]
    energy_kcal_100g: Option<f64>,
    #[serde(default, deserialize_with = "lenient_f64")]
    proteins_100g: Option<f64>,
    #[serde(default, deserialize_with = "lenient_f64")]
    carbohydrates_100g: Option<f64>,
    #[serde(default, deserialize_with = "lenient_f64")]
    fat_100g: Option<f64>,
    #[serde(default, deserialize_with = "lenient_f64")]
    fiber_100g: Option<f64>,
    #[serde(default, deserialize_with = "lenient_f64")]
    sugars_100g: Option<f64>,
    #[serde(default, deserialize_with = "lenient_f64")]
    sodium_100g: Option<f64>,
}

/// Open Food Facts mixes numbers and numeric strings for the same field.
fn lenient_f64<'de, D>(deserializer: D) -> Result<Option<f64>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    let value = Option::<serde_json::Value>::deserialize(deserializer)?;
    Ok(match value {
        Some(serde_json::Value::Number(n)) => n.as_f64(),
        Some(serde_json::Value::String(s)) => s.trim().parse().ok(),
        _ => None,
    })
}
