//! USDA FoodData Central search (free text -> per-100 g nutrients).

use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use tracing::debug;

use super::{classify_status, classify_transport, FoodMatch, StructuredProvider, StructuredQuery};
use crate::config::UsdaEndpoint;
use crate::error::ProviderError;
use crate::nutrition::NutrientRecord;

// FoodData Central nutrient ids.
const ENERGY_KCAL: u32 = 1008;
const PROTEIN: u32 = 1003;
const FAT: u32 = 1004;
const CARBS: u32 = 1005;
const FIBER: u32 = 1079;
const SUGARS: u32 = 2000;
const SODIUM_MG: u32 = 1093;

pub struct UsdaClient {
    http: reqwest::Client,
    base_url: String,
    api_key: String,
    data_types: String,
}

impl UsdaClient {
    /// Reads the API key from the variable named by `endpoint.api_key_env`.
    pub fn from_endpoint(endpoint: &UsdaEndpoint) -> Result<Self, ProviderError> {
        let api_key = std::env::var(&endpoint.api_key_env).map_err(|_| {
            let name = &endpoint.api_key_env;
            ProviderError::Unavailable(format!("{name} environment variable not set"))
        })?;
        let http = reqwest::Client::builder()
            .timeout(Duration::from_millis(endpoint.request_timeout_ms))
            .build()
            .map_err(|e| ProviderError::Unavailable(e.to_string()))?;
        Ok(Self {
            http,
            base_url: endpoint.base_url.trim_end_matches('/').to_string(),
            api_key,
            data_types: endpoint.data_types.join(","),
        })
    }
}

#[async_trait]
impl StructuredProvider for UsdaClient {
    fn name(&self) -> &str {
        "usda-fdc"
    }

    async fn lookup(&self, query: StructuredQuery<'_>) -> Result<FoodMatch, ProviderError> {
        let StructuredQuery::Text(text) = query else {
            return Err(ProviderError::NotFoundUpstream);
        };
        if text.trim().is_empty() {
            return Err(ProviderError::NotFoundUpstream);
        }

        let resp = self
            .http
            .get(format!("{}/v1/foods/search", self.base_url))
            .query(&[
                ("query", text),
                ("pageSize", "1"),
                ("dataType", self.data_types.as_str()),
                ("api_key", self.api_key.as_str()),
            ])
            .send()
            .await
            .map_err(|e| classify_transport(&e))?;
        if !resp.status().is_success() {
            return Err(classify_status(resp.status(), 0));
        }
        let body: SearchResponse = resp
            .json()
            .await
            .map_err(|e| ProviderError::MalformedResponse(e.to_string()))?;
        debug!(query = text, hits = body.total_hits, "usda search response");
        parse_search(body)
    }
}

fn parse_search(body: SearchResponse) -> Result<FoodMatch, ProviderError> {
    let food = body.foods.into_iter().next().ok_or(ProviderError::NotFoundUpstream)?;

    let mut record = NutrientRecord::default();
    let mut has_energy = false;
    for n in &food.food_nutrients {
        let Some(value) = n.value else { continue };
        match n.nutrient_id {
            ENERGY_KCAL => {
                record.calories = value;
                has_energy = true;
            }
            PROTEIN => record.protein = value,
            FAT => record.fat = value,
            CARBS => record.carbs = value,
            FIBER => record.fiber = value,
            SUGARS => record.sugar = value,
            SODIUM_MG => record.sodium_mg = value,
            _ => {}
        }
    }
    if !has_energy {
        return Err(ProviderError::MalformedResponse(format!(
            "fdc food {} has no energy value",
            food.fdc_id
        )));
    }

    Ok(FoodMatch {
        name: food.description.trim().to_lowercase(),
        brand: food.brand_owner.filter(|b| !b.trim().is_empty()),
        per_100g: record.sanitized(),
        serving_size_g: None,
    })
}

// --- Response types ---

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct SearchResponse {
    #[serde(default)]
    total_hits: u64,
    #[serde(default)]
    foods: Vec<SearchFood>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct SearchFood {
    fdc_id: u64,
    description: String,
    brand_owner: Option<String>,
    #[serde(default)]
    food_nutrients: Vec<SearchNutrient>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct SearchNutrient {
    nutrient_id: u32,
    value: Option<f64>,
}
