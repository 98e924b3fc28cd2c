//! Hand-authored recipes served when generation is exhausted or unavailable.
//! They are never inserted into the comparison window.

use super::RecipeSpec;
use crate::generate::recipe::violated_exclusion;
use crate::nutrition::NutrientRecord;

pub struct FallbackRecipe {
    pub title: &'static str,
    pub cuisine: &'static str,
    pub meal_types: &'static [&'static str],
    pub prep_minutes: u32,
    pub ingredients: &'static [&'static str],
    pub steps: &'static [&'static str],
    /// Per serving.
    pub nutrition: NutrientRecord,
}

const fn per_serving(
    calories: f64,
    protein: f64,
    carbs: f64,
    fat: f64,
    fiber: f64,
) -> NutrientRecord {
    NutrientRecord {
        calories,
        protein,
        carbs,
        fat,
        fiber,
        sugar: 0.0,
        sodium_mg: 0.0,
    }
}

pub static LIBRARY: &[FallbackRecipe] = &[
    FallbackRecipe {
        title: "Overnight Oats with Berries",
        cuisine: "american",
        meal_types: &["breakfast", "snack"],
        prep_minutes: 5,
        ingredients: &[
            "60g rolled oats",
            "150ml milk",
            "100g greek yogurt",
            "80g mixed berries",
            "1 tsp honey",
        ],
        steps: &[
            "Stir oats, milk and yogurt together in a jar.",
            "Refrigerate overnight.",
            "Top with berries and honey before serving.",
        ],
        nutrition: per_serving(390.0, 20.0, 58.0, 9.0, 7.0),
    },
    FallbackRecipe {
        title: "Spinach and Feta Omelette",
        cuisine: "mediterranean",
        meal_types: &["breakfast", "lunch"],
        prep_minutes: 10,
        ingredients: &[
            "3 eggs",
            "40g spinach",
            "30g feta cheese",
            "1 tsp olive oil",
            "salt and pepper",
        ],
        steps: &[
            "Whisk the eggs with salt and pepper.",
            "Wilt the spinach in the oil over medium heat.",
            "Pour in the eggs, scatter feta, fold once set.",
        ],
        nutrition: per_serving(340.0, 25.0, 3.0, 25.0, 1.0),
    },
    FallbackRecipe {
        title: "Chickpea and Quinoa Bowl",
        cuisine: "mediterranean",
        meal_types: &["lunch", "dinner"],
        prep_minutes: 25,
        ingredients: &[
            "80g quinoa",
            "120g cooked chickpeas",
            "1 cucumber",
            "10 cherry tomatoes",
            "1 tbsp olive oil",
            "juice of half a lemon",
        ],
        steps: &[
            "Simmer quinoa in twice its volume of water for 15 minutes.",
            "Dice cucumber and halve tomatoes.",
            "Toss everything with oil and lemon juice.",
        ],
        nutrition: per_serving(520.0, 20.0, 72.0, 16.0, 14.0),
    },
    FallbackRecipe {
        title: "Lemon Herb Chicken with Rice",
        cuisine: "american",
        meal_types: &["lunch", "dinner"],
        prep_minutes: 30,
        ingredients: &[
            "150g chicken breast",
            "75g white rice",
            "1 lemon",
            "1 tsp dried oregano",
            "1 tsp olive oil",
            "150g green beans",
        ],
        steps: &[
            "Cook rice according to the packet.",
            "Season chicken with lemon zest and oregano, pan-sear 6 minutes per side.",
            "Steam green beans for 5 minutes and serve with rice and sliced chicken.",
        ],
        nutrition: per_serving(560.0, 45.0, 66.0, 9.0, 5.0),
    },
    FallbackRecipe {
        title: "Tofu Vegetable Stir-fry",
        cuisine: "asian",
        meal_types: &["lunch", "dinner"],
        prep_minutes: 20,
        ingredients: &[
            "200g firm tofu",
            "1 red bell pepper",
            "150g broccoli",
            "1 tbsp soy sauce",
            "1 tsp sesame oil",
            "1 garlic clove",
        ],
        steps: &[
            "Press and cube the tofu, then brown it in sesame oil.",
            "Add garlic, pepper and broccoli and stir-fry for 5 minutes.",
            "Finish with soy sauce.",
        ],
        nutrition: per_serving(380.0, 28.0, 20.0, 21.0, 7.0),
    },
    FallbackRecipe {
        title: "Lentil and Vegetable Soup",
        cuisine: "mediterranean",
        meal_types: &["lunch", "dinner"],
        prep_minutes: 35,
        ingredients: &[
            "100g red lentils",
            "1 carrot",
            "1 onion",
            "1 celery stalk",
            "800ml vegetable stock",
            "1 tsp cumin",
        ],
        steps: &[
            "Soften diced onion, carrot and celery in a pot.",
            "Add lentils, cumin and stock and simmer 25 minutes.",
            "Blend half the soup for body and season to taste.",
        ],
        nutrition: per_serving(410.0, 25.0, 66.0, 3.0, 16.0),
    },
    FallbackRecipe {
        title: "Apple Slices with Almond Butter",
        cuisine: "american",
        meal_types: &["snack"],
        prep_minutes: 3,
        ingredients: &["1 apple", "2 tbsp almond butter"],
        steps: &["Core and slice the apple.", "Serve with almond butter for dipping."],
        nutrition: per_serving(290.0, 7.0, 28.0, 18.0, 7.0),
    },
];

/// Best fallback for `spec`: recipes using an excluded ingredient are never
/// chosen; among the rest, meal type and cuisine matches rank first, then
/// closeness to the calorie target, then prep time.
pub fn pick(spec: &RecipeSpec) -> Option<&'static FallbackRecipe> {
    LIBRARY
        .iter()
        .filter(|r| violated_exclusion(r.ingredients, &spec.exclusions).is_none())
        .min_by(|a, b| {
            rank(a, spec)
                .partial_cmp(&rank(b, spec))
                .unwrap_or(std::cmp::Ordering::Equal)
        })
}

fn rank(recipe: &FallbackRecipe, spec: &RecipeSpec) -> (u8, u8, f64, u32) {
    let meal_miss = match &spec.meal_type {
        Some(meal) => !recipe.meal_types.iter().any(|m| m.eq_ignore_ascii_case(meal)),
        None => false,
    };
    let cuisine_miss = match &spec.cuisine {
        Some(cuisine) => !recipe.cuisine.eq_ignore_ascii_case(cuisine),
        None => false,
    };
    let calorie_gap = spec
        .targets
        .calories
        .map(|target| (recipe.nutrition.calories - target).abs())
        .unwrap_or(0.0);
    let prep_over = match spec.max_prep_minutes {
        Some(max) => recipe.prep_minutes.saturating_sub(max),
        None => 0,
    };
    (meal_miss as u8, cuisine_miss as u8, calorie_gap, prep_over)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::generate::MacroTargets;

    #[test]
    fn prefers_meal_type_then_calories() {
        let spec = RecipeSpec {
            meal_type: Some("dinner".into()),
            targets: MacroTargets {
                calories: Some(550.0),
                ..MacroTargets::default()
            },
            ..RecipeSpec::default()
        };
        let pick = pick(&spec).expect("library is not empty");
        assert_eq!(pick.title, "Lemon Herb Chicken with Rice");
    }

    #[test]
    fn never_picks_excluded_ingredients() {
        let spec = RecipeSpec {
            meal_type: Some("breakfast".into()),
            exclusions: vec!["eggs".into(), "milk".into()],
            ..RecipeSpec::default()
        };
        let pick = pick(&spec).expect("something remains");
        assert!(pick.ingredients.iter().all(|i| !i.contains("egg") && !i.contains("milk")));
    }

    #[test]
    fn nothing_left_when_everything_is_excluded() {
        let exclusions: Vec<String> = LIBRARY
            .iter()
            .flat_map(|r| r.ingredients.iter())
            .map(|i| i.to_string())
            .collect();
        let spec = RecipeSpec {
            exclusions,
            ..RecipeSpec::default()
        };
        assert!(pick(&spec).is_none());
    }

    #[test]
    fn library_titles_are_unique() {
        let mut titles: Vec<_> = LIBRARY.iter().map(|r| r.title).collect();
        titles.sort_unstable();
        titles.dedup();
        assert_eq!(titles.len(), LIBRARY.len());
    }
}
