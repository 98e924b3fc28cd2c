//! Generative nutrition analysis: prompt composition and validation of the
//! model's JSON. Missing fields take defaults; unusable output is a
//! `MalformedResponse`, which the chain treats as a provider failure.

use serde::Deserialize;

use crate::error::ProviderError;
use crate::normalize::{extract_json_object, DEFAULT_PORTION_GRAMS};
use crate::nutrition::{FoodItem, NutrientRecord};
use crate::provider::CompletionRequest;

const ANALYSIS_SYSTEM_PROMPT: &str = "You are a nutrition analyst. Identify every food in the \
user's description and estimate its nutrients for the stated portion (assume 100 g when no \
portion is given). Respond with a single JSON object and nothing else: \
{\"items\":[{\"name\":string,\"quantity\":number,\"unit\":\"g\"|\"ml\"|\"piece\",\
\"calories\":number,\"protein\":number,\"carbs\":number,\"fat\":number,\"fiber\":number,\
\"sugar\":number,\"sodium_mg\":number,\"confidence\":number}]}. Nutrient values are grams \
except calories (kcal) and sodium_mg. Use lowercase food names.";

/// Instruction for the vision step; its output feeds the text path.
pub const VISION_INSTRUCTION: &str = "List the foods visible in this photo as a short plain-text \
description with estimated portions, e.g. \"150g grilled chicken breast, 200g white rice\". \
Output only the description.";

const ANALYSIS_TEMPERATURE: f32 = 0.2;
const ANALYSIS_MAX_TOKENS: u32 = 800;

/// Build the completion request for a free-text food description.
pub fn analysis_request(query: &str, language: Option<&str>) -> CompletionRequest {
    let mut prompt = format!("Food description: {}", query.trim());
    if let Some(lang) = language.filter(|l| *l != "en" && *l != "other") {
        prompt.push_str(&format!(
            "\nThe description is written in language '{lang}'. Translate food names to English."
        ));
    }
    CompletionRequest {
        system: ANALYSIS_SYSTEM_PROMPT.to_string(),
        prompt,
        temperature: ANALYSIS_TEMPERATURE,
        max_tokens: ANALYSIS_MAX_TOKENS,
        seed: None,
    }
}

#[derive(Deserialize)]
struct AnalysisOutput {
    #[serde(default)]
    items: Vec<AnalysisItem>,
}

#[derive(Deserialize)]
struct AnalysisItem {
    #[serde(default)]
    name: String,
    quantity: Option<f64>,
    unit: Option<String>,
    #[serde(flatten)]
    nutrients: NutrientRecord,
    confidence: Option<f64>,
}

/// Parse model output into food items. Item confidence is `base` scaled by the
/// model's own (clamped) estimate when it gives one.
pub fn parse_analysis(raw: &str, base: f64) -> Result<Vec<FoodItem>, ProviderError> {
    let json = extract_json_object(raw)
        .ok_or_else(|| ProviderError::MalformedResponse("no JSON object in analysis".into()))?;
    let output: AnalysisOutput = serde_json::from_str(json)
        .map_err(|e| ProviderError::MalformedResponse(format!("analysis JSON: {e}")))?;

    let items: Vec<FoodItem> = output
        .items
        .into_iter()
        .filter(|item| !item.name.trim().is_empty())
        .map(|item| {
            let own = item.confidence.filter(|c| c.is_finite()).unwrap_or(1.0).clamp(0.0, 1.0);
            FoodItem {
                name: item.name.trim().to_lowercase(),
                brand: None,
                quantity: item
                    .quantity
                    .filter(|q| q.is_finite() && *q > 0.0)
                    .unwrap_or(DEFAULT_PORTION_GRAMS),
                unit: item
                    .unit
                    .map(|u| u.trim().to_lowercase())
                    .filter(|u| !u.is_empty())
                    .unwrap_or_else(|| "g".to_string()),
                confidence: (base * own).clamp(0.0, 1.0),
                nutrients: item.nutrients.sanitized(),
            }
        })
        .collect();

    if items.is_empty() {
        return Err(ProviderError::MalformedResponse("analysis has no food items".into()));
    }
    Ok(items)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_fenced_output_with_defaults() {
        let raw = "Here you go:\n```json\n{\"items\":[{\"name\":\" Chicken Curry \",\
                   \"calories\":320,\"protein\":25.5},{\"name\":\"naan\",\"quantity\":90,\
                   \"unit\":\"G\",\"calories\":-5,\"confidence\":0.5}]}\n```";
        let items = parse_analysis(raw, 0.7).expect("parse");
        assert_eq!(items.len(), 2);
        assert_eq!(items[0].name, "chicken curry");
        assert_eq!(items[0].quantity, DEFAULT_PORTION_GRAMS);
        assert_eq!(items[0].unit, "g");
        assert_eq!(items[0].nutrients.protein, 25.5);
        assert!((items[0].confidence - 0.7).abs() < 1e-9);
        assert_eq!(items[1].quantity, 90.0);
        assert_eq!(items[1].unit, "g");
        assert_eq!(items[1].nutrients.calories, 0.0);
        assert!((items[1].confidence - 0.35).abs() < 1e-9);
    }

    #[test]
    fn prose_only_is_malformed() {
        assert!(matches!(
            parse_analysis("I cannot help with that.", 0.7),
            Err(ProviderError::MalformedResponse(_))
        ));
    }

    #[test]
    fn nameless_items_are_dropped() {
        let err = parse_analysis(r#"{"items":[{"calories":100}]}"#, 0.7).expect_err("empty");
        assert!(matches!(err, ProviderError::MalformedResponse(_)));
    }

    #[test]
    fn language_hint_only_for_non_english() {
        let en = analysis_request("two boiled eggs", Some("en"));
        assert!(!en.prompt.contains("language"));
        let fr = analysis_request("deux oeufs durs", Some("fr"));
        assert!(fr.prompt.contains("'fr'"));
        assert_eq!(fr.seed, None);
    }
}
