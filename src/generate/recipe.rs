//! Recipe prompt composition and validation of generated recipes.

use std::fmt::Write as _;

use serde::{Deserialize, Serialize};

use super::RecipeSpec;
use crate::config::GenerationConfig;
use crate::error::ProviderError;
use crate::normalize::{canonicalize, extract_json_object};
use crate::nutrition::NutrientRecord;
use crate::provider::CompletionRequest;

const SYSTEM_PROMPT: &str = "You are a recipe developer for a nutrition app. Create one \
original recipe that satisfies every constraint. Respond with a single JSON object and \
nothing else: {\"title\":string,\"servings\":number,\"prep_minutes\":number,\
\"ingredients\":[string],\"steps\":[string],\"nutrition\":{\"calories\":number,\
\"protein\":number,\"carbs\":number,\"fat\":number,\"fiber\":number,\"sugar\":number,\
\"sodium_mg\":number}}. Nutrition is per serving.";

const MAX_TEMPERATURE: f32 = 1.5;

/// Build the prompt for one attempt. Later attempts sample hotter, every
/// attempt gets a fresh seed, and `avoid_titles` steers away from recipes
/// already in the window.
pub fn compose(
    spec: &RecipeSpec,
    attempt: u32,
    avoid_titles: &[String],
    config: &GenerationConfig,
) -> CompletionRequest {
    let mut prompt = String::from("Constraints:\n");
    let t = &spec.targets;
    for (label, value, unit) in [
        ("calories", t.calories, "kcal"),
        ("protein", t.protein, "g"),
        ("carbs", t.carbs, "g"),
        ("fat", t.fat, "g"),
    ] {
        if let Some(v) = value {
            let _ = writeln!(prompt, "- {label}: about {v:.0} {unit} per serving");
        }
    }
    if let Some(cuisine) = &spec.cuisine {
        let _ = writeln!(prompt, "- cuisine: {cuisine}");
    }
    if let Some(meal) = &spec.meal_type {
        let _ = writeln!(prompt, "- meal: {meal}");
    }
    if !spec.exclusions.is_empty() {
        let _ = writeln!(prompt, "- must not contain: {}", spec.exclusions.join(", "));
    }
    let _ = writeln!(prompt, "- servings: {}", spec.servings.max(1));
    if let Some(minutes) = spec.max_prep_minutes {
        let _ = writeln!(prompt, "- ready in at most {minutes} minutes");
    }
    if !avoid_titles.is_empty() {
        let _ = writeln!(
            prompt,
            "Do not repeat or closely imitate these recent recipes: {}",
            avoid_titles.join("; ")
        );
    }
    if attempt > 1 {
        let _ = writeln!(
            prompt,
            "Your previous suggestion was rejected as too similar to an existing recipe; \
             choose a clearly different dish."
        );
    }

    let step = config.temperature_step * attempt.saturating_sub(1) as f32;
    CompletionRequest {
        system: SYSTEM_PROMPT.to_string(),
        prompt,
        temperature: (config.base_temperature + step).min(MAX_TEMPERATURE),
        max_tokens: config.max_tokens,
        seed: Some(uuid::Uuid::new_v4().as_u128() as u64),
    }
}

/// A validated generated recipe, before fingerprinting.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecipeDraft {
    pub title: String,
    pub servings: u32,
    pub prep_minutes: Option<u32>,
    pub ingredients: Vec<String>,
    pub steps: Vec<String>,
    /// Per serving.
    pub nutrition: NutrientRecord,
}

impl RecipeDraft {
    /// Text the fingerprint and the artifact content are built from.
    pub fn content(&self) -> String {
        render_content(&self.title, &self.ingredients, &self.steps)
    }
}

pub(crate) fn render_content<S: AsRef<str>>(title: &str, ingredients: &[S], steps: &[S]) -> String {
    let mut out = format!("{title}\n\nIngredients:\n");
    for ingredient in ingredients {
        let _ = writeln!(out, "- {}", ingredient.as_ref());
    }
    out.push_str("\nSteps:\n");
    for (i, step) in steps.iter().enumerate() {
        let _ = writeln!(out, "{}. {}", i + 1, step.as_ref());
    }
    out
}

#[derive(Deserialize)]
struct RawRecipe {
    #[serde(default)]
    title: String,
    servings: Option<u32>,
    prep_minutes: Option<u32>,
    #[serde(default)]
    ingredients: Vec<String>,
    #[serde(default)]
    steps: Vec<String>,
    #[serde(default)]
    nutrition: NutrientRecord,
}

/// Validate model output against `spec`. Unusable output and recipes that
/// use an excluded ingredient are `MalformedResponse`.
pub fn parse(raw: &str, spec: &RecipeSpec) -> Result<RecipeDraft, ProviderError> {
    let json = extract_json_object(raw)
        .ok_or_else(|| ProviderError::MalformedResponse("no JSON object in recipe".into()))?;
    let recipe: RawRecipe = serde_json::from_str(json)
        .map_err(|e| ProviderError::MalformedResponse(format!("recipe JSON: {e}")))?;

    let clean = |v: Vec<String>| -> Vec<String> {
        v.into_iter()
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect()
    };
    let title = recipe.title.trim().to_string();
    let ingredients = clean(recipe.ingredients);
    let steps = clean(recipe.steps);
    if title.is_empty() || ingredients.is_empty() || steps.is_empty() {
        return Err(ProviderError::MalformedResponse(
            "recipe is missing a title, ingredients or steps".into(),
        ));
    }
    if let Some(term) = violated_exclusion(&ingredients, &spec.exclusions) {
        return Err(ProviderError::MalformedResponse(format!(
            "recipe uses excluded ingredient '{term}'"
        )));
    }

    Ok(RecipeDraft {
        title,
        servings: recipe.servings.filter(|s| *s > 0).unwrap_or(spec.servings.max(1)),
        prep_minutes: recipe.prep_minutes,
        ingredients,
        steps,
        nutrition: recipe.nutrition.sanitized(),
    })
}

/// First exclusion that appears as a whole word (or phrase) in any ingredient.
pub(crate) fn violated_exclusion<'a, S: AsRef<str>>(
    ingredients: &[S],
    exclusions: &'a [String],
) -> Option<&'a str> {
    let lines: Vec<String> = ingredients
        .iter()
        .map(|i| format!(" {} ", canonicalize(i.as_ref())))
        .collect();
    exclusions.iter().map(String::as_str).find(|term| {
        let needle = canonicalize(term);
        if needle.is_empty() {
            return false;
        }
        let singular = needle.strip_suffix('s').unwrap_or(&needle);
        lines.iter().any(|line| {
            line.contains(&format!(" {needle} "))
                || line.contains(&format!(" {singular} "))
                || line.contains(&format!(" {singular}s "))
        })
    })
}
