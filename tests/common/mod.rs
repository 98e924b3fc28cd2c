#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;

use nutrilens::cache::TtlCache;
use nutrilens::generate::GeneratedArtifact;
use nutrilens::nutrition::NutrientRecord;
use nutrilens::provider::{
    CompletionRequest, FoodMatch, GenerativeProvider, StructuredProvider, StructuredQuery,
};
use nutrilens::resolve::ResolvedResult;
use nutrilens::ProviderError;

pub const HOUR: Duration = Duration::from_secs(3600);

pub fn banana() -> FoodMatch {
    FoodMatch {
        name: "banana, raw".into(),
        brand: None,
        per_100g: NutrientRecord {
            calories: 89.0,
            protein: 1.09,
            carbs: 22.84,
            fat: 0.33,
            ..NutrientRecord::default()
        },
        serving_size_g: None,
    }
}

pub fn analysis_cache() -> Arc<TtlCache<ResolvedResult>> {
    Arc::new(TtlCache::new("analysis", 128, 7 * 24 * HOUR))
}

pub fn artifact_cache() -> Arc<TtlCache<GeneratedArtifact>> {
    Arc::new(TtlCache::new("artifacts", 128, 24 * HOUR))
}

/// Structured database stub with a call counter.
pub struct CountingDb {
    pub name: &'static str,
    rows: HashMap<String, FoodMatch>,
    delay: Duration,
    failure: Option<ProviderError>,
    calls: AtomicUsize,
    dropped_early: Arc<AtomicUsize>,
}

impl CountingDb {
    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            rows: HashMap::new(),
            delay: Duration::ZERO,
            failure: None,
            calls: AtomicUsize::new(0),
            dropped_early: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn row(mut self, query: &str, found: FoodMatch) -> Self {
        self.rows.insert(query.to_string(), found);
        self
    }

    pub fn delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn failing(mut self, error: ProviderError) -> Self {
        self.failure = Some(error);
        self
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    /// Lookups whose future was dropped before finishing.
    pub fn abandoned(&self) -> usize {
        self.dropped_early.load(Ordering::SeqCst)
    }
}

/// Counts a drop that happens while still armed.
struct AbandonGuard {
    counter: Arc<AtomicUsize>,
    armed: bool,
}

impl Drop for AbandonGuard {
    fn drop(&mut self) {
        if self.armed {
            self.counter.fetch_add(1, Ordering::SeqCst);
        }
    }
}

#[async_trait]
impl StructuredProvider for CountingDb {
    fn name(&self) -> &str {
        self.name
    }

    async fn lookup(&self, query: StructuredQuery<'_>) -> Result<FoodMatch, ProviderError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let mut guard = AbandonGuard {
            counter: Arc::clone(&self.dropped_early),
            armed: true,
        };
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        guard.armed = false;
        if let Some(error) = &self.failure {
            return Err(error.clone());
        }
        self.rows
            .get(query.as_str())
            .cloned()
            .ok_or(ProviderError::NotFoundUpstream)
    }
}

/// Generative stub: fixed analysis and vision answers, scripted completions.
pub struct StubLlm {
    completions: Mutex<Vec<Result<String, ProviderError>>>,
    vision: Result<String, ProviderError>,
    delay: Duration,
    complete_calls: AtomicUsize,
    vision_calls: AtomicUsize,
}

impl StubLlm {
    /// Every completion returns `output`.
    pub fn constant(output: &str) -> Self {
        Self::scripted(vec![Ok(output.to_string())])
    }

    /// Completions in order; the last one repeats.
    pub fn scripted(outputs: Vec<Result<String, ProviderError>>) -> Self {
        Self {
            completions: Mutex::new(outputs),
            vision: Err(ProviderError::Unavailable("no vision".into())),
            delay: Duration::ZERO,
            complete_calls: AtomicUsize::new(0),
            vision_calls: AtomicUsize::new(0),
        }
    }

    pub fn failing(error: ProviderError) -> Self {
        Self::scripted(vec![Err(error)])
    }

    pub fn vision(mut self, description: &str) -> Self {
        self.vision = Ok(description.to_string());
        self
    }

    pub fn delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn complete_calls(&self) -> usize {
        self.complete_calls.load(Ordering::SeqCst)
    }

    pub fn vision_calls(&self) -> usize {
        self.vision_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl GenerativeProvider for StubLlm {
    fn name(&self) -> &str {
        "stub-llm"
    }

    async fn complete(&self, _request: &CompletionRequest) -> Result<String, ProviderError> {
        self.complete_calls.fetch_add(1, Ordering::SeqCst);
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        let mut outputs = self.completions.lock();
        if outputs.len() > 1 {
            outputs.remove(0)
        } else {
            outputs
                .first()
                .cloned()
                .unwrap_or(Err(ProviderError::Unavailable("no script".into())))
        }
    }

    async fn describe_image(&self, _: &[u8], _: &str, _: &str) -> Result<String, ProviderError> {
        self.vision_calls.fetch_add(1, Ordering::SeqCst);
        self.vision.clone()
    }
}

pub fn recipe_json(title: &str, ingredients: &[&str]) -> String {
    serde_json::json!({
        "title": title,
        "servings": 2,
        "prep_minutes": 25,
        "ingredients": ingredients,
        "steps": ["Prep everything.", "Cook until done.", "Serve warm."],
        "nutrition": {"calories": 520, "protein": 35, "carbs": 50, "fat": 18}
    })
    .to_string()
}

pub fn analysis_json(name: &str, calories: f64) -> String {
    serde_json::json!({
        "items": [{"name": name, "quantity": 250, "unit": "g", "calories": calories, "protein": 12}]
    })
    .to_string()
}
