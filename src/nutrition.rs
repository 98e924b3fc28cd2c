//! Nutrient records and resolved food items.

use std::ops::AddAssign;

use serde::{Deserialize, Serialize};

/// Macro and micronutrient amounts. Providers report these per 100 g; items
/// and totals carry them for the logged portion.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NutrientRecord {
    pub calories: f64,
    pub protein: f64,
    pub carbs: f64,
    pub fat: f64,
    pub fiber: f64,
    pub sugar: f64,
    pub sodium_mg: f64,
}

impl NutrientRecord {
    pub fn scaled(&self, factor: f64) -> Self {
        Self {
            calories: self.calories * factor,
            protein: self.protein * factor,
            carbs: self.carbs * factor,
            fat: self.fat * factor,
            fiber: self.fiber * factor,
            sugar: self.sugar * factor,
            sodium_mg: self.sodium_mg * factor,
        }
    }

    /// Replace NaN, infinite and negative values with zero. Upstream data
    /// (generative output in particular) is not trusted to be sane.
    pub fn sanitized(self) -> Self {
        fn clean(v: f64) -> f64 {
            if v.is_finite() && v > 0.0 {
                v
            } else {
                0.0
            }
        }
        Self {
            calories: clean(self.calories),
            protein: clean(self.protein),
            carbs: clean(self.carbs),
            fat: clean(self.fat),
            fiber: clean(self.fiber),
            sugar: clean(self.sugar),
            sodium_mg: clean(self.sodium_mg),
        }
    }

    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }
}

impl AddAssign for NutrientRecord {
    fn add_assign(&mut self, rhs: Self) {
        self.calories += rhs.calories;
        self.protein += rhs.protein;
        self.carbs += rhs.carbs;
        self.fat += rhs.fat;
        self.fiber += rhs.fiber;
        self.sugar += rhs.sugar;
        self.sodium_mg += rhs.sodium_mg;
    }
}

/// One recognised food with its portion.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FoodItem {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub brand: Option<String>,
    pub quantity: f64,
    pub unit: String,
    pub confidence: f64,
    pub nutrients: NutrientRecord,
}

/// Sum of item nutrients.
pub fn totals(items: &[FoodItem]) -> NutrientRecord {
    let mut sum = NutrientRecord::default();
    for item in items {
        sum += item.nutrients;
    }
    sum
}
