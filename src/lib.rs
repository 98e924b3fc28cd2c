//! nutrilens: content resolution and deduplication engine for food logging.
//! Resolves photos, barcodes, text and voice transcripts to nutrition results
//! through a content-addressed cache and an ordered provider chain, and
//! generates recipes while rejecting near-duplicates.

pub mod cache;
pub mod cancellation;
pub mod config;
pub mod enrich;
pub mod error;
pub mod generate;
pub mod metrics;
pub mod normalize;
pub mod nutrition;
pub mod provider;
pub mod resolve;
pub mod similarity;

use std::collections::HashMap;
use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use cache::{CacheKeyEngine, CacheStats, KeyValueStore, SqliteStore, TtlCache};
use cancellation::BackgroundTasks;
use config::EngineConfig;
use enrich::{DietChecker, NutritionScorer, ResultEnricher};
use error::{EngineError, GenerationCancelled, ResolveError};
use generate::{GeneratedArtifact, GenerationRetryOrchestrator, RecipeSpec};
use metrics::{MetricSummary, MetricsRegistry};
use provider::{
    ChatCompletionsClient, GenerativeProvider, OpenFoodFactsClient, StructuredProvider, UsdaClient,
};
use resolve::{ResolutionRequest, ResolvedResult, SourceResolutionChain};

pub use error::ProviderError;

const ANALYSIS_TABLE: &str = "resolved_analyses";

/// Initialise tracing. `RUST_LOG` overrides the default `nutrilens=debug`
/// filter; `NUTRILENS_LOG_JSON=1` switches to JSON lines. Safe to call twice.
pub fn init_tracing() {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("nutrilens=debug"));
    let json = std::env::var("NUTRILENS_LOG_JSON")
        .map(|v| v == "1" || v.eq_ignore_ascii_case("true"))
        .unwrap_or(false);
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_thread_ids(true);
    let installed = if json {
        builder.json().try_init()
    } else {
        builder.try_init()
    };
    if installed.is_ok() {
        info!("nutrilens tracing initialised");
    }
}

/// Assembles an [`Engine`]. Providers are consulted in the order added.
pub struct EngineBuilder {
    config: EngineConfig,
    product_providers: Vec<Arc<dyn StructuredProvider>>,
    text_providers: Vec<Arc<dyn StructuredProvider>>,
    generative: Option<Arc<dyn GenerativeProvider>>,
    scorer: Option<Arc<dyn NutritionScorer>>,
    diet_checker: Option<Arc<dyn DietChecker>>,
}

impl EngineBuilder {
    pub fn new(config: EngineConfig) -> Self {
        Self {
            config,
            product_providers: Vec::new(),
            text_providers: Vec::new(),
            generative: None,
            scorer: None,
            diet_checker: None,
        }
    }

    /// Add the HTTP providers named in `config.providers`. A provider whose
    /// API key is missing is skipped with a warning.
    pub fn with_http_providers(mut self) -> Self {
        let providers = self.config.providers.clone();
        if let Some(endpoint) = &providers.open_food_facts {
            match OpenFoodFactsClient::new(endpoint) {
                Ok(client) => self.product_providers.push(Arc::new(client)),
                Err(e) => warn!(
                    error = %e,
                    "open food facts client init failed, barcode lookup disabled"
                ),
            }
        }
        if let Some(endpoint) = &providers.usda {
            match UsdaClient::from_endpoint(endpoint) {
                Ok(client) => self.text_providers.push(Arc::new(client)),
                Err(e) => warn!(error = %e, "usda client init failed (API key missing?), skipping"),
            }
        }
        if let Some(endpoint) = &providers.generative {
            match ChatCompletionsClient::from_endpoint(endpoint) {
                Ok(client) => {
                    info!(model = %endpoint.model, "generative client initialized");
                    self.generative = Some(Arc::new(client));
                }
                Err(e) => warn!(
                    error = %e,
                    "generative client init failed, analysis and recipes use fallbacks"
                ),
            }
        }
        self
    }

    pub fn product_provider(mut self, provider: Arc<dyn StructuredProvider>) -> Self {
        self.product_providers.push(provider);
        self
    }

    pub fn text_provider(mut self, provider: Arc<dyn StructuredProvider>) -> Self {
        self.text_providers.push(provider);
        self
    }

    pub fn generative(mut self, provider: Arc<dyn GenerativeProvider>) -> Self {
        self.generative = Some(provider);
        self
    }

    pub fn scorer(mut self, scorer: Arc<dyn NutritionScorer>) -> Self {
        self.scorer = Some(scorer);
        self
    }

    pub fn diet_checker(mut self, checker: Arc<dyn DietChecker>) -> Self {
        self.diet_checker = Some(checker);
        self
    }

    /// Build the engine and start its sweep loops. Must run inside a Tokio runtime.
    pub fn build(self) -> Result<Engine, EngineError> {
        let config = self.config;
        config.validate()?;
        let metrics = Arc::new(MetricsRegistry::new());
        let tasks = BackgroundTasks::new();
        let sweep = config.cache.sweep_interval();

        let analysis_store: Arc<dyn KeyValueStore<ResolvedResult>> =
            match &config.cache.persistent_path {
                Some(path) => {
                    let store: Arc<SqliteStore<ResolvedResult>> = Arc::new(
                        SqliteStore::open(path, ANALYSIS_TABLE)?
                            .with_capacity(config.cache.analysis_capacity),
                    );
                    let cleanup = SqliteStore::start_cleanup_loop(
                        Arc::clone(&store),
                        sweep,
                        tasks.child_token(),
                    );
                    tasks.track("analysis-cleanup", cleanup);
                    store
                }
                None => {
                    let cache: Arc<TtlCache<ResolvedResult>> = Arc::new(TtlCache::new(
                        "analysis",
                        config.cache.analysis_capacity,
                        config.cache.analysis_ttl(),
                    ));
                    tasks.track(
                        "analysis-sweep",
                        TtlCache::start_sweep_loop(Arc::clone(&cache), sweep, tasks.child_token()),
                    );
                    cache
                }
            };

        let artifacts: Arc<TtlCache<GeneratedArtifact>> = Arc::new(TtlCache::new(
            "artifacts",
            config.cache.artifact_capacity,
            config.cache.artifact_ttl(),
        ));
        tasks.track(
            "artifact-sweep",
            TtlCache::start_sweep_loop(Arc::clone(&artifacts), sweep, tasks.child_token()),
        );

        let mut chain = SourceResolutionChain::builder(analysis_store, config.cache.analysis_ttl())
            .key_engine(CacheKeyEngine::new(config.cache.key_hex_len))
            .config(config.resolution.clone())
            .metrics(Arc::clone(&metrics));
        for provider in self.product_providers {
            chain = chain.product_provider(provider);
        }
        for provider in self.text_providers {
            chain = chain.text_provider(provider);
        }
        if let Some(generative) = &self.generative {
            chain = chain.generative(Arc::clone(generative));
        }

        let generator = GenerationRetryOrchestrator::new(
            self.generative,
            artifacts.clone(),
            config.cache.artifact_ttl(),
            config.generation.clone(),
        )
        .with_metrics(Arc::clone(&metrics));

        info!(
            persistent = config.cache.persistent_path.is_some(),
            background_tasks = tasks.len(),
            "engine ready"
        );
        Ok(Engine {
            chain: chain.build(),
            generator,
            enricher: ResultEnricher::new(self.scorer, self.diet_checker),
            artifacts,
            metrics,
            tasks,
            config,
        })
    }
}

/// Resolution, generation and enrichment wired from one config.
pub struct Engine {
    chain: SourceResolutionChain,
    generator: GenerationRetryOrchestrator,
    enricher: ResultEnricher,
    artifacts: Arc<TtlCache<GeneratedArtifact>>,
    metrics: Arc<MetricsRegistry>,
    tasks: BackgroundTasks,
    config: EngineConfig,
}

impl Engine {
    pub fn builder(config: EngineConfig) -> EngineBuilder {
        EngineBuilder::new(config)
    }

    /// Engine with the HTTP providers from `config`.
    pub fn from_config(config: EngineConfig) -> Result<Self, EngineError> {
        EngineBuilder::new(config).with_http_providers().build()
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn chain(&self) -> &SourceResolutionChain {
        &self.chain
    }

    pub fn generator(&self) -> &GenerationRetryOrchestrator {
        &self.generator
    }

    /// Resolve and enrich for the request's requester.
    pub async fn resolve(
        &self,
        request: &ResolutionRequest,
    ) -> Result<ResolvedResult, ResolveError> {
        self.resolve_with_cancel(request, &CancellationToken::new()).await
    }

    pub async fn resolve_with_cancel(
        &self,
        request: &ResolutionRequest,
        token: &CancellationToken,
    ) -> Result<ResolvedResult, ResolveError> {
        let result = self.chain.resolve_with_cancel(request, token).await?;
        Ok(self.enricher.enrich(result, &request.requester))
    }

    pub async fn generate(&self, spec: &RecipeSpec) -> GeneratedArtifact {
        self.generator.generate(spec).await
    }

    pub async fn generate_with_cancel(
        &self,
        spec: &RecipeSpec,
        token: &CancellationToken,
    ) -> Result<GeneratedArtifact, GenerationCancelled> {
        self.generator.generate_with_cancel(spec, token).await
    }

    /// (resolved-analysis cache, generated-artifact cache)
    pub async fn cache_stats(&self) -> (CacheStats, CacheStats) {
        (self.chain.cache_stats().await, self.artifacts.stats())
    }

    pub fn metrics_summary(&self) -> HashMap<String, MetricSummary> {
        self.metrics.summary()
    }

    pub fn counters(&self) -> HashMap<String, u64> {
        self.metrics.counters()
    }

    /// Stop sweep loops. In-memory caches are simply dropped with the engine.
    pub async fn shutdown(&self) {
        self.tasks.shutdown().await;
        info!("engine shut down");
    }
}
