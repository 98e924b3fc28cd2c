//! Recipe generation with near-duplicate rejection.
//!
//! Each attempt composes a prompt, calls the generative provider under a
//! deadline, fingerprints the result and compares it against every artifact
//! in the window (the artifact cache). A near-duplicate or failed attempt is
//! retried; once attempts run out a static fallback recipe is returned, so
//! `generate` never fails and never returns a near-duplicate.

pub mod fallback;
pub mod recipe;
pub mod state;

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, info_span, warn, Instrument};

use crate::cache::KeyValueStore;
use crate::cancellation::guarded;
use crate::config::GenerationConfig;
use crate::error::{GenerationCancelled, GenerationExhausted, ProviderError};
use crate::metrics::{metric_names, MetricsRegistry, RequestIds};
use crate::nutrition::NutrientRecord;
use crate::provider::GenerativeProvider;
use crate::similarity::{Fingerprint, SimilarityHasher};

use self::recipe::{render_content, RecipeDraft};
use self::state::{GenerationRun, GenerationState};

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MacroTargets {
    pub calories: Option<f64>,
    pub protein: Option<f64>,
    pub carbs: Option<f64>,
    pub fat: Option<f64>,
}

/// What to generate.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RecipeSpec {
    pub targets: MacroTargets,
    pub cuisine: Option<String>,
    pub meal_type: Option<String>,
    /// Ingredients and allergens the recipe must not contain.
    pub exclusions: Vec<String>,
    pub servings: u32,
    pub max_prep_minutes: Option<u32>,
}

impl Default for RecipeSpec {
    fn default() -> Self {
        Self {
            targets: MacroTargets::default(),
            cuisine: None,
            meal_type: None,
            exclusions: Vec::new(),
            servings: 1,
            max_prep_minutes: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ArtifactProvider {
    Generative,
    Fallback,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GeneratedArtifact {
    pub id: String,
    pub title: String,
    /// Rendered recipe text; the fingerprint is computed over it.
    pub content: String,
    pub ingredients: Vec<String>,
    pub steps: Vec<String>,
    pub servings: u32,
    pub prep_minutes: Option<u32>,
    /// Per serving.
    pub nutrition_summary: NutrientRecord,
    pub fingerprint: Fingerprint,
    pub provider: ArtifactProvider,
    /// Generation attempts made before this artifact was produced.
    pub attempts: u32,
    /// Why generation gave up, on fallback artifacts.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exhausted: Option<GenerationExhausted>,
}

impl GeneratedArtifact {
    fn from_draft(
        draft: RecipeDraft,
        content: String,
        fingerprint: Fingerprint,
        attempts: u32,
    ) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            title: draft.title,
            content,
            ingredients: draft.ingredients,
            steps: draft.steps,
            servings: draft.servings,
            prep_minutes: draft.prep_minutes,
            nutrition_summary: draft.nutrition,
            fingerprint,
            provider: ArtifactProvider::Generative,
            attempts,
            exhausted: None,
        }
    }

    pub fn is_fallback(&self) -> bool {
        self.provider == ArtifactProvider::Fallback
    }
}

/// Drives the retry state machine. The window is any `KeyValueStore` of
/// artifacts; accepted artifacts are inserted with `artifact_ttl`.
pub struct GenerationRetryOrchestrator {
    generative: Option<Arc<dyn GenerativeProvider>>,
    window: Arc<dyn KeyValueStore<GeneratedArtifact>>,
    artifact_ttl: Duration,
    hasher: SimilarityHasher,
    config: GenerationConfig,
    /// Held across dedup check and window insert.
    accept_lock: tokio::sync::Mutex<()>,
    metrics: Arc<MetricsRegistry>,
}

enum AttemptOutcome {
    Accepted(GeneratedArtifact),
    Duplicate,
    Failed,
}

impl GenerationRetryOrchestrator {
    pub fn new(
        generative: Option<Arc<dyn GenerativeProvider>>,
        window: Arc<dyn KeyValueStore<GeneratedArtifact>>,
        artifact_ttl: Duration,
        config: GenerationConfig,
    ) -> Self {
        Self {
            generative,
            window,
            artifact_ttl,
            hasher: SimilarityHasher::new(config.similarity_threshold),
            config,
            accept_lock: tokio::sync::Mutex::new(()),
            metrics: Arc::new(MetricsRegistry::new()),
        }
    }

    pub fn with_metrics(mut self, metrics: Arc<MetricsRegistry>) -> Self {
        self.metrics = metrics;
        self
    }

    pub fn hasher(&self) -> &SimilarityHasher {
        &self.hasher
    }

    pub fn metrics(&self) -> &Arc<MetricsRegistry> {
        &self.metrics
    }

    /// Always returns an artifact: generated when possible, fallback otherwise.
    pub async fn generate(&self, spec: &RecipeSpec) -> GeneratedArtifact {
        match self.generate_traced(spec, &CancellationToken::new()).await {
            Ok((artifact, _)) => artifact,
            // An uncancelled token never fires.
            Err(GenerationCancelled) => self.fallback(spec, 0, None),
        }
    }

    pub async fn generate_with_cancel(
        &self,
        spec: &RecipeSpec,
        token: &CancellationToken,
    ) -> Result<GeneratedArtifact, GenerationCancelled> {
        self.generate_traced(spec, token).await.map(|(artifact, _)| artifact)
    }

    /// Like `generate_with_cancel`, also returning the run with its state trace.
    pub async fn generate_traced(
        &self,
        spec: &RecipeSpec,
        token: &CancellationToken,
    ) -> Result<(GeneratedArtifact, GenerationRun), GenerationCancelled> {
        let ids = RequestIds::new();
        let span = info_span!(
            "generate",
            trace_id = %ids.trace_id,
            request_id = %ids.request_id,
        );
        async move {
            let mut run = GenerationRun::new(ids);
            let total = self.metrics.span(metric_names::GENERATION_TOTAL);
            let max_attempts = self.config.max_attempts.max(1);

            if let Some(generative) = &self.generative {
                for attempt in 1..=max_attempts {
                    if attempt > 1 {
                        self.advance(&mut run, GenerationState::Composing);
                    }
                    let outcome = self.attempt(generative.as_ref(), spec, &mut run, token).await?;
                    match outcome {
                        AttemptOutcome::Accepted(artifact) => {
                            self.advance(&mut run, GenerationState::Accepted);
                            let elapsed_us = total.finish();
                            info!(
                                id = %artifact.id,
                                title = %artifact.title,
                                attempts = attempt,
                                elapsed_us,
                                "recipe accepted"
                            );
                            return Ok((artifact, run));
                        }
                        AttemptOutcome::Duplicate => run.duplicates += 1,
                        AttemptOutcome::Failed => run.failures += 1,
                    }
                    if attempt < max_attempts {
                        self.advance(&mut run, GenerationState::Retrying);
                    }
                }
            } else {
                debug!("no generative provider configured");
            }

            self.advance(&mut run, GenerationState::Fallback);
            let exhausted = GenerationExhausted {
                attempts: run.attempts(),
                duplicates: run.duplicates,
                failures: run.failures,
            };
            let artifact = self.fallback(spec, run.attempts(), Some(exhausted));
            let elapsed_us = total.finish();
            warn!(
                reason = %exhausted,
                title = %artifact.title,
                elapsed_us,
                "serving fallback recipe"
            );
            Ok((artifact, run))
        }
        .instrument(span)
        .await
    }

    /// One Invoking → Fingerprinting → DedupCheck pass.
    async fn attempt(
        &self,
        generative: &dyn GenerativeProvider,
        spec: &RecipeSpec,
        run: &mut GenerationRun,
        token: &CancellationToken,
    ) -> Result<AttemptOutcome, GenerationCancelled> {
        let recent = self.recent_titles().await;
        let request = recipe::compose(spec, run.attempts() + 1, &recent, &self.config);

        self.advance(run, GenerationState::Invoking);
        let attempt = run.attempts();
        let span = self.metrics.span(metric_names::GENERATION_ATTEMPT);
        let drafted = guarded(token, self.config.attempt_timeout(), async {
            let raw = generative.complete(&request).await?;
            recipe::parse(&raw, spec)
        })
        .await;
        span.finish();

        let draft = match drafted {
            Ok(draft) => draft,
            Err(ProviderError::Cancelled) if token.is_cancelled() => {
                info!(attempt, "generation cancelled by caller");
                return Err(GenerationCancelled);
            }
            Err(e) => {
                self.metrics.incr(metric_names::GENERATION_FAILURE);
                warn!(attempt, error = %e, "generation attempt failed");
                return Ok(AttemptOutcome::Failed);
            }
        };

        self.advance(run, GenerationState::Fingerprinting);
        let content = draft.content();
        let fingerprint = self.hasher.fingerprint(&content);

        self.advance(run, GenerationState::DedupCheck);
        let _accept = self.accept_lock.lock().await;
        let window = self.window.values().await;
        let nearest = self
            .hasher
            .nearest(fingerprint, window.iter().map(|a| &a.fingerprint));
        if let Some((idx, distance)) = nearest {
            let similar = &window[idx];
            if self.hasher.is_near_duplicate(fingerprint, similar.fingerprint) {
                self.metrics.incr(metric_names::GENERATION_DUPLICATE);
                info!(
                    attempt,
                    title = %draft.title,
                    similar_to = %similar.title,
                    distance,
                    "near-duplicate rejected"
                );
                return Ok(AttemptOutcome::Duplicate);
            }
        }

        let artifact = GeneratedArtifact::from_draft(draft, content, fingerprint, attempt);
        self.window
            .set(&artifact.id, artifact.clone(), self.artifact_ttl)
            .await;
        Ok(AttemptOutcome::Accepted(artifact))
    }

    /// Newest window titles, for the prompt's avoid list.
    async fn recent_titles(&self) -> Vec<String> {
        if self.config.avoid_recent_titles == 0 {
            return Vec::new();
        }
        self.window
            .values()
            .await
            .into_iter()
            .rev()
            .take(self.config.avoid_recent_titles)
            .map(|a| a.title)
            .collect()
    }

    fn advance(&self, run: &mut GenerationRun, next: GenerationState) {
        let moved = run.transition(next);
        debug_assert!(moved.is_ok(), "generation loop made an invalid transition to {next}");
    }

    /// Static recipe for `spec`. Not inserted into the window.
    fn fallback(
        &self,
        spec: &RecipeSpec,
        attempts: u32,
        exhausted: Option<GenerationExhausted>,
    ) -> GeneratedArtifact {
        self.metrics.incr(metric_names::GENERATION_FALLBACK);
        let (title, ingredients, steps, prep_minutes, nutrition) = match fallback::pick(spec) {
            Some(r) => (
                r.title.to_string(),
                r.ingredients.iter().map(|s| s.to_string()).collect::<Vec<_>>(),
                r.steps.iter().map(|s| s.to_string()).collect::<Vec<_>>(),
                Some(r.prep_minutes),
                r.nutrition,
            ),
            None => (
                "Build Your Own Plate".to_string(),
                Vec::new(),
                vec![
                    "Combine a lean protein, a whole grain and two vegetables you can eat."
                        .to_string(),
                    "Aim for half the plate vegetables and a palm-sized protein portion."
                        .to_string(),
                ],
                None,
                NutrientRecord::default(),
            ),
        };
        let content = render_content(&title, &ingredients, &steps);
        GeneratedArtifact {
            id: uuid::Uuid::new_v4().to_string(),
            fingerprint: self.hasher.fingerprint(&content),
            title,
            content,
            ingredients,
            steps,
            servings: spec.servings.max(1),
            prep_minutes,
            nutrition_summary: nutrition,
            provider: ArtifactProvider::Fallback,
            attempts,
            exhausted,
        }
    }
}
