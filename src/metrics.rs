//! Request IDs plus latency histograms and event counters.
//! Histograms keep the most recent samples and report p50/p95/p99.

use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Instant;

/// Identifiers attached to every resolve and generate call.
#[derive(Debug, Clone)]
pub struct RequestIds {
    pub trace_id: String,
    pub request_id: String,
}

impl RequestIds {
    pub fn new() -> Self {
        let trace_id = uuid::Uuid::new_v4().to_string();
        Self {
            request_id: trace_id[..8].to_string(),
            trace_id,
        }
    }
}

impl Default for RequestIds {
    fn default() -> Self {
        Self::new()
    }
}

/// Measures one operation; the sample is recorded when the timer is finished.
/// A timer dropped without `finish` (cancelled work) records nothing.
pub struct LatencyTimer {
    metric: &'static str,
    started: Instant,
    registry: Arc<MetricsRegistry>,
}

impl LatencyTimer {
    /// Record and return the elapsed microseconds.
    pub fn finish(self) -> f64 {
        let elapsed_us = self.started.elapsed().as_secs_f64() * 1e6;
        self.registry.record(self.metric, elapsed_us);
        elapsed_us
    }
}

/// Bounded window of the latest samples for one metric.
struct Window {
    samples: VecDeque<f64>,
    limit: usize,
}

impl Window {
    fn new(limit: usize) -> Self {
        Self {
            samples: VecDeque::with_capacity(limit.min(64)),
            limit,
        }
    }

    fn push(&mut self, value: f64) {
        if self.samples.len() == self.limit {
            self.samples.pop_front();
        }
        self.samples.push_back(value);
    }

    fn sorted(&self) -> Vec<f64> {
        let mut sorted: Vec<f64> = self.samples.iter().copied().collect();
        sorted.sort_by(f64::total_cmp);
        sorted
    }
}

/// Nearest-rank percentile over an ascending slice; 0 when empty.
fn nearest_rank(sorted: &[f64], p: f64) -> f64 {
    match sorted.len() {
        0 => 0.0,
        n => {
            let rank = ((p.clamp(0.0, 100.0) / 100.0) * (n - 1) as f64).round() as usize;
            sorted[rank.min(n - 1)]
        }
    }
}

/// Latency windows and event counters, keyed by the names in [`metric_names`].
pub struct MetricsRegistry {
    windows: Mutex<HashMap<&'static str, Window>>,
    counters: Mutex<HashMap<&'static str, u64>>,
    window_len: usize,
}

impl Default for MetricsRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl MetricsRegistry {
    pub fn new() -> Self {
        Self::with_window(1024)
    }

    /// Registry keeping the latest `window_len` samples per metric.
    pub fn with_window(window_len: usize) -> Self {
        Self {
            windows: Mutex::new(HashMap::new()),
            counters: Mutex::new(HashMap::new()),
            window_len: window_len.max(1),
        }
    }

    pub fn record(&self, metric: &'static str, value_us: f64) {
        self.windows
            .lock()
            .entry(metric)
            .or_insert_with(|| Window::new(self.window_len))
            .push(value_us);
        tracing::trace!(metric, value_us, "latency sample");
    }

    pub fn span(self: &Arc<Self>, metric: &'static str) -> LatencyTimer {
        LatencyTimer {
            metric,
            started: Instant::now(),
            registry: Arc::clone(self),
        }
    }

    pub fn incr(&self, counter: &'static str) {
        *self.counters.lock().entry(counter).or_default() += 1;
    }

    pub fn counter(&self, counter: &str) -> u64 {
        self.counters.lock().get(counter).copied().unwrap_or(0)
    }

    /// p in 0..=100, microseconds.
    pub fn percentile(&self, metric: &str, p: f64) -> f64 {
        self.windows
            .lock()
            .get(metric)
            .map(|w| nearest_rank(&w.sorted(), p))
            .unwrap_or(0.0)
    }

    pub fn summary(&self) -> HashMap<String, MetricSummary> {
        let windows = self.windows.lock();
        let mut out = HashMap::with_capacity(windows.len());
        for (&metric, window) in windows.iter() {
            let sorted = window.sorted();
            out.insert(
                metric.to_string(),
                MetricSummary {
                    p50_us: nearest_rank(&sorted, 50.0),
                    p95_us: nearest_rank(&sorted, 95.0),
                    p99_us: nearest_rank(&sorted, 99.0),
                    count: sorted.len(),
                },
            );
        }
        out
    }

    pub fn counters(&self) -> HashMap<String, u64> {
        self.counters
            .lock()
            .iter()
            .map(|(&name, &v)| (name.to_string(), v))
            .collect()
    }
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct MetricSummary {
    pub p50_us: f64,
    pub p95_us: f64,
    pub p99_us: f64,
    pub count: usize,
}

/// Histogram names start with `t_`; the rest are counters.
pub mod metric_names {
    pub const RESOLVE_TOTAL: &str = "t_resolve_total";
    pub const PROVIDER_CALL: &str = "t_provider_call";
    pub const GENERATIVE_ANALYSIS: &str = "t_generative_analysis";
    pub const VISION_EXTRACT: &str = "t_vision_extract";
    pub const GENERATION_ATTEMPT: &str = "t_generation_attempt";
    pub const GENERATION_TOTAL: &str = "t_generation_total";

    pub const RESOLVE_CACHE_HIT: &str = "resolve_cache_hit";
    pub const RESOLVE_COALESCED: &str = "resolve_coalesced";
    pub const RESOLVE_DEGRADED: &str = "resolve_degraded";
    pub const RESOLVE_NOT_FOUND: &str = "resolve_not_found";
    pub const PROVIDER_FAILURE: &str = "provider_failure";
    pub const GENERATION_DUPLICATE: &str = "generation_duplicate";
    pub const GENERATION_FAILURE: &str = "generation_failure";
    pub const GENERATION_FALLBACK: &str = "generation_fallback";
}
