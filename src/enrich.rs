//! Result enrichment: nutrition score and diet/allergen verdicts.
//!
//! Scoring and rule matching are pure functions owned elsewhere; this module
//! only defines their traits and calls them with already-resolved data.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::nutrition::{FoodItem, NutrientRecord};
use crate::resolve::{RequesterContext, ResolvedResult};

/// What the requester eats and avoids.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DietaryPreferences {
    /// Named diets such as "vegan" or "keto".
    pub diets: Vec<String>,
    pub allergens: Vec<String>,
    pub excluded_ingredients: Vec<String>,
}

impl DietaryPreferences {
    pub fn is_empty(&self) -> bool {
        self.diets.is_empty() && self.allergens.is_empty() && self.excluded_ingredients.is_empty()
    }

    /// Every term a generated recipe must avoid.
    pub fn exclusions(&self) -> impl Iterator<Item = &str> {
        self.allergens
            .iter()
            .chain(self.excluded_ingredients.iter())
            .map(String::as_str)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NutritionScore {
    pub score: f64,
    /// Letter grade, "A" best.
    pub grade: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RestrictionVerdict {
    pub restriction: String,
    pub compatible: bool,
    pub reason: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Enrichment {
    pub score: Option<NutritionScore>,
    pub verdicts: Vec<RestrictionVerdict>,
}

impl Enrichment {
    /// True when any verdict marks the result incompatible.
    pub fn has_conflict(&self) -> bool {
        self.verdicts.iter().any(|v| !v.compatible)
    }
}

/// Pure nutrition scoring. None when the record cannot be scored.
pub trait NutritionScorer: Send + Sync {
    fn score(&self, totals: &NutrientRecord) -> Option<NutritionScore>;
}

/// Pure diet/allergen rule matching, one verdict per restriction.
pub trait DietChecker: Send + Sync {
    fn check(
        &self,
        items: &[FoodItem],
        preferences: &DietaryPreferences,
    ) -> Vec<RestrictionVerdict>;
}

/// Attaches score and verdicts to a resolved result for one requester.
///
/// Results are cached un-enriched since verdicts depend on who asks; the
/// enricher runs on the caller's owned copy.
#[derive(Clone, Default)]
pub struct ResultEnricher {
    scorer: Option<Arc<dyn NutritionScorer>>,
    checker: Option<Arc<dyn DietChecker>>,
}

impl ResultEnricher {
    pub fn new(
        scorer: Option<Arc<dyn NutritionScorer>>,
        checker: Option<Arc<dyn DietChecker>>,
    ) -> Self {
        Self { scorer, checker }
    }

    pub fn is_noop(&self) -> bool {
        self.scorer.is_none() && self.checker.is_none()
    }

    /// Degraded results carry no real nutrients and are returned untouched.
    pub fn enrich(
        &self,
        mut result: ResolvedResult,
        requester: &RequesterContext,
    ) -> ResolvedResult {
        if result.degraded || self.is_noop() {
            return result;
        }
        let score = self.scorer.as_ref().and_then(|s| s.score(&result.totals));
        let verdicts = match &self.checker {
            Some(checker) if !requester.preferences.is_empty() => {
                checker.check(&result.items, &requester.preferences)
            }
            _ => Vec::new(),
        };
        debug!(
            scored = score.is_some(),
            verdicts = verdicts.len(),
            "result enriched"
        );
        result.enrichment = Some(Enrichment { score, verdicts });
        result
    }
}
