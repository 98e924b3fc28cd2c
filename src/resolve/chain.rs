//! Source resolution chain: cache first, then structured databases in order,
//! then the generative provider. First success wins and is cached.
//!
//! Barcode: product databases only, exhaustion is NotFound.
//! Text: nutrition databases, then generative analysis at lower confidence.
//! Voice: the transcript walks the text path, discounted.
//! Image: vision extraction produces a description that walks the text path,
//! discounted.

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{debug, info, info_span, warn, Instrument};

use super::analysis::{analysis_request, parse_analysis, VISION_INSTRUCTION};
use super::inflight::{InFlight, WalkOutput};
use super::{Provenance, RequestKind, ResolutionRequest, ResolvedResult};
use crate::cache::{CacheKey, CacheKeyEngine, CacheStats, KeyValueStore};
use crate::cancellation::bounded;
use crate::config::ResolutionConfig;
use crate::error::{ProviderError, ResolveError};
use crate::metrics::{metric_names, MetricsRegistry, RequestIds};
use crate::normalize::{detect_language, parse_portion, split_foods, DEFAULT_PORTION_GRAMS};
use crate::nutrition::{FoodItem, NutrientRecord};
use crate::provider::{FoodMatch, GenerativeProvider, StructuredProvider, StructuredQuery};

const DEGRADED_SOURCE: &str = "degraded";
const UNIDENTIFIED_FOOD: &str = "unidentified food";

/// Resolves requests to nutrition results. Cheap to clone; clones share
/// caches, providers and the in-flight table.
#[derive(Clone)]
pub struct SourceResolutionChain {
    inner: Arc<ChainInner>,
}

struct ChainInner {
    keys: CacheKeyEngine,
    cache: Arc<dyn KeyValueStore<ResolvedResult>>,
    analysis_ttl: Duration,
    product_providers: Vec<Arc<dyn StructuredProvider>>,
    text_providers: Vec<Arc<dyn StructuredProvider>>,
    generative: Option<Arc<dyn GenerativeProvider>>,
    config: ResolutionConfig,
    metrics: Arc<MetricsRegistry>,
    inflight: InFlight,
}

/// Builder for [`SourceResolutionChain`]. Providers are tried in the order added.
pub struct ChainBuilder {
    keys: CacheKeyEngine,
    cache: Arc<dyn KeyValueStore<ResolvedResult>>,
    analysis_ttl: Duration,
    product_providers: Vec<Arc<dyn StructuredProvider>>,
    text_providers: Vec<Arc<dyn StructuredProvider>>,
    generative: Option<Arc<dyn GenerativeProvider>>,
    config: ResolutionConfig,
    metrics: Option<Arc<MetricsRegistry>>,
}

impl ChainBuilder {
    pub fn new(cache: Arc<dyn KeyValueStore<ResolvedResult>>, analysis_ttl: Duration) -> Self {
        Self {
            keys: CacheKeyEngine::default(),
            cache,
            analysis_ttl,
            product_providers: Vec::new(),
            text_providers: Vec::new(),
            generative: None,
            config: ResolutionConfig::default(),
            metrics: None,
        }
    }

    pub fn key_engine(mut self, keys: CacheKeyEngine) -> Self {
        self.keys = keys;
        self
    }

    /// Product database consulted for barcodes.
    pub fn product_provider(mut self, provider: Arc<dyn StructuredProvider>) -> Self {
        self.product_providers.push(provider);
        self
    }

    /// Nutrition database consulted for text, voice and image descriptions.
    pub fn text_provider(mut self, provider: Arc<dyn StructuredProvider>) -> Self {
        self.text_providers.push(provider);
        self
    }

    pub fn generative(mut self, provider: Arc<dyn GenerativeProvider>) -> Self {
        self.generative = Some(provider);
        self
    }

    pub fn config(mut self, config: ResolutionConfig) -> Self {
        self.config = config;
        self
    }

    pub fn metrics(mut self, metrics: Arc<MetricsRegistry>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn build(self) -> SourceResolutionChain {
        info!(
            product_providers = self.product_providers.len(),
            text_providers = self.text_providers.len(),
            generative = self.generative.is_some(),
            "resolution chain built"
        );
        SourceResolutionChain {
            inner: Arc::new(ChainInner {
                keys: self.keys,
                cache: self.cache,
                analysis_ttl: self.analysis_ttl,
                product_providers: self.product_providers,
                text_providers: self.text_providers,
                generative: self.generative,
                config: self.config,
                metrics: self.metrics.unwrap_or_default(),
                inflight: InFlight::default(),
            }),
        }
    }
}

impl SourceResolutionChain {
    pub fn builder(
        cache: Arc<dyn KeyValueStore<ResolvedResult>>,
        analysis_ttl: Duration,
    ) -> ChainBuilder {
        ChainBuilder::new(cache, analysis_ttl)
    }

    pub async fn resolve(
        &self,
        request: &ResolutionRequest,
    ) -> Result<ResolvedResult, ResolveError> {
        self.resolve_with_cancel(request, &CancellationToken::new()).await
    }

    /// Resolve, giving up with `Cancelled` as soon as `token` fires. If no other
    /// caller is waiting on the same key the upstream call is aborted too.
    pub async fn resolve_with_cancel(
        &self,
        request: &ResolutionRequest,
        token: &CancellationToken,
    ) -> Result<ResolvedResult, ResolveError> {
        let ids = RequestIds::new();
        let span = info_span!(
            "resolve",
            trace_id = %ids.trace_id,
            request_id = %ids.request_id,
            kind = %request.kind,
        );
        async {
            if token.is_cancelled() {
                return Err(ResolveError::Cancelled);
            }
            let total = self.inner.metrics.span(metric_names::RESOLVE_TOTAL);
            let key = self.key_for(request);

            if let Some(mut hit) = self.inner.cache.get(key.as_str()).await {
                hit.provenance = Provenance::Cache;
                self.inner.metrics.incr(metric_names::RESOLVE_CACHE_HIT);
                debug!(key = %key, origin = %hit.origin, "cache hit");
                total.finish();
                return Ok(hit);
            }

            let (walk, joined) = self.inner.inflight.join_or_start(key.as_str(), || {
                let inner = Arc::clone(&self.inner);
                let request = request.clone();
                let key = key.clone();
                async move {
                    let result = inner.walk(&request, &key).await;
                    inner.inflight.finish(key.as_str());
                    result
                }
                .in_current_span()
            });
            if joined {
                self.inner.metrics.incr(metric_names::RESOLVE_COALESCED);
                debug!(key = %key, "joined in-flight resolution");
            }

            let outcome = tokio::select! {
                biased;
                _ = token.cancelled() => {
                    info!("resolve cancelled by caller");
                    Err(ResolveError::Cancelled)
                }
                result = walk => result,
            };
            let elapsed_us = total.finish();
            match &outcome {
                Ok(r) => info!(
                    provenance = %r.provenance,
                    source = %r.source,
                    confidence = r.confidence,
                    degraded = r.degraded,
                    elapsed_us,
                    "resolved"
                ),
                Err(ResolveError::NotFound { .. }) => {
                    self.inner.metrics.incr(metric_names::RESOLVE_NOT_FOUND);
                    info!(elapsed_us, "not found");
                }
                Err(ResolveError::Cancelled) => {}
            }
            outcome
        }
        .instrument(span)
        .await
    }

    /// Cache key a request maps to.
    pub fn key_for(&self, request: &ResolutionRequest) -> CacheKey {
        self.inner
            .keys
            .compute_key(request, &self.inner.config.key_params)
    }

    /// Drop the cached result for `request`. Returns true if one existed.
    pub async fn forget(&self, request: &ResolutionRequest) -> bool {
        let key = self.key_for(request);
        self.inner.cache.delete(key.as_str()).await
    }

    pub async fn cache_stats(&self) -> CacheStats {
        self.inner.cache.stats().await
    }

    pub fn metrics(&self) -> &Arc<MetricsRegistry> {
        &self.inner.metrics
    }
}

impl ChainInner {
    /// Provider walk for a cache miss. Successful results are cached before
    /// they are returned; degraded ones never are.
    async fn walk(&self, request: &ResolutionRequest, key: &CacheKey) -> WalkOutput {
        let kind = request.kind;
        let outcome = match kind {
            RequestKind::Barcode => self.walk_barcode(request).await,
            RequestKind::Text => {
                self.walk_text(kind, &payload_text(request), 1.0).await
            }
            RequestKind::Voice => {
                let discount = self.config.voice_discount;
                self.walk_text(kind, &payload_text(request), discount).await
            }
            RequestKind::Image => self.walk_image(request).await,
        }?;

        if !outcome.degraded {
            self.cache
                .set(key.as_str(), outcome.clone(), self.analysis_ttl)
                .await;
        }
        Ok(outcome)
    }

    async fn walk_barcode(&self, request: &ResolutionRequest) -> WalkOutput {
        let code = payload_text(request);
        let code = code.trim();
        for provider in &self.product_providers {
            if let Some(found) = self.lookup(provider, StructuredQuery::Barcode(code)).await {
                let quantity = found.serving_size_g.unwrap_or(DEFAULT_PORTION_GRAMS);
                let item = item_from_match(found, quantity, "g", self.config.structured_confidence);
                return Ok(ResolvedResult::new(
                    RequestKind::Barcode,
                    code,
                    vec![item],
                    Provenance::StructuredDb,
                    self.config.structured_confidence,
                    provider.name(),
                ));
            }
        }
        Err(ResolveError::NotFound {
            kind: RequestKind::Barcode,
        })
    }

    async fn walk_image(&self, request: &ResolutionRequest) -> WalkOutput {
        let Some(generative) = &self.generative else {
            return Err(ResolveError::NotFound {
                kind: RequestKind::Image,
            });
        };
        let media_type = request.media_type.as_deref().unwrap_or("image/jpeg");
        let span = self.metrics.span(metric_names::VISION_EXTRACT);
        let described = bounded(
            self.config.vision_timeout(),
            generative.describe_image(request.payload.as_bytes(), media_type, VISION_INSTRUCTION),
        )
        .await;
        span.finish();

        match described.map(|d| d.trim().to_string()) {
            Ok(description) if !description.is_empty() => {
                debug!(description = %description, "vision extraction done");
                self.walk_text(RequestKind::Image, &description, self.config.image_discount)
                    .await
            }
            Ok(_) => {
                let empty = ProviderError::MalformedResponse("empty image description".into());
                self.provider_failed(generative.name(), &empty);
                Ok(self.degraded(RequestKind::Image, UNIDENTIFIED_FOOD))
            }
            Err(e) => {
                self.provider_failed(generative.name(), &e);
                Ok(self.degraded(RequestKind::Image, UNIDENTIFIED_FOOD))
            }
        }
    }

    async fn walk_text(&self, kind: RequestKind, text: &str, discount: f64) -> WalkOutput {
        let text = text.trim();
        if text.is_empty() {
            return Err(ResolveError::NotFound { kind });
        }

        if let Some((items, source)) = self.structured_items(text).await {
            return Ok(ResolvedResult::new(
                kind,
                text,
                items,
                Provenance::StructuredDb,
                self.config.structured_confidence,
                source,
            )
            .discounted(discount));
        }

        let Some(generative) = &self.generative else {
            return Err(ResolveError::NotFound { kind });
        };
        let confidence = self.config.generative_confidence;
        let request = analysis_request(text, detect_language(text).as_deref());
        let span = self.metrics.span(metric_names::GENERATIVE_ANALYSIS);
        let analysed = bounded(self.config.provider_timeout(), async {
            let raw = generative.complete(&request).await?;
            parse_analysis(&raw, confidence)
        })
        .await;
        span.finish();

        match analysed {
            Ok(items) => Ok(ResolvedResult::new(
                kind,
                text,
                items,
                Provenance::Generative,
                confidence,
                generative.name(),
            )
            .discounted(discount)),
            Err(e) => {
                self.provider_failed(generative.name(), &e);
                Ok(self.degraded(kind, text))
            }
        }
    }

    /// Resolves every food in `text` through the text providers. A list of
    /// foods only counts as a hit when each part is found; a partial match
    /// leaves the whole description to generative analysis.
    async fn structured_items(&self, text: &str) -> Option<(Vec<FoodItem>, String)> {
        let parts = match split_foods(text) {
            parts if parts.len() > 1 => parts,
            _ => vec![text.to_string()],
        };
        let confidence = self.config.structured_confidence;
        let mut items = Vec::with_capacity(parts.len());
        let mut sources: Vec<&str> = Vec::new();

        for part in &parts {
            let portion = parse_portion(part);
            let mut hit = None;
            for provider in &self.text_providers {
                let query = StructuredQuery::Text(&portion.query);
                if let Some(found) = self.lookup(provider, query).await {
                    hit = Some((found, provider.name()));
                    break;
                }
            }
            let Some((found, source)) = hit else {
                if parts.len() > 1 {
                    debug!(part = %part, "food not found, analysing whole text");
                }
                return None;
            };
            items.push(item_from_match(found, portion.quantity, &portion.unit, confidence));
            if !sources.contains(&source) {
                sources.push(source);
            }
        }
        Some((items, sources.join("+")))
    }

    /// One structured lookup. Every error is that provider's failure.
    async fn lookup(
        &self,
        provider: &Arc<dyn StructuredProvider>,
        query: StructuredQuery<'_>,
    ) -> Option<FoodMatch> {
        let span = self.metrics.span(metric_names::PROVIDER_CALL);
        let result = bounded(self.config.provider_timeout(), provider.lookup(query)).await;
        span.finish();
        match result {
            Ok(found) => {
                debug!(provider = provider.name(), food = %found.name, "provider hit");
                Some(found)
            }
            Err(ProviderError::NotFoundUpstream) => {
                debug!(provider = provider.name(), query = query.as_str(), "provider miss");
                None
            }
            Err(e) => {
                self.provider_failed(provider.name(), &e);
                None
            }
        }
    }

    fn provider_failed(&self, provider: &str, error: &ProviderError) {
        self.metrics.incr(metric_names::PROVIDER_FAILURE);
        warn!(
            provider,
            error = %error,
            transient = error.is_transient(),
            "provider failed, advancing"
        );
    }

    /// Placeholder for when every source failed: caller still gets a loggable entry.
    fn degraded(&self, kind: RequestKind, text: &str) -> ResolvedResult {
        self.metrics.incr(metric_names::RESOLVE_DEGRADED);
        let portion = parse_portion(text);
        let item = FoodItem {
            name: portion.query.to_lowercase(),
            brand: None,
            quantity: portion.quantity,
            unit: portion.unit,
            confidence: self.config.degraded_confidence,
            nutrients: NutrientRecord::default(),
        };
        warn!(kind = %kind, "all sources failed, returning degraded result");
        ResolvedResult::new(
            kind,
            text,
            vec![item],
            Provenance::Generative,
            self.config.degraded_confidence,
            DEGRADED_SOURCE,
        )
        .with_degraded(true)
    }
}

/// Payload as text. Binary payloads on text kinds are decoded lossily.
fn payload_text(request: &ResolutionRequest) -> String {
    match request.payload.as_text() {
        Some(text) => text.to_string(),
        None => String::from_utf8_lossy(request.payload.as_bytes()).into_owned(),
    }
}

/// Per-100 g match scaled to the requested portion.
fn item_from_match(found: FoodMatch, quantity: f64, unit: &str, confidence: f64) -> FoodItem {
    FoodItem {
        name: found.name,
        brand: found.brand,
        quantity,
        unit: unit.to_string(),
        confidence,
        nutrients: found.per_100g.scaled(quantity / DEFAULT_PORTION_GRAMS),
    }
}
