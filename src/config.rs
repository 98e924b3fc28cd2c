//! Engine configuration: JSON file with serde defaults, then `NUTRILENS_*`
//! environment overrides. API keys are never read from the file, only from
//! the environment variables the endpoints name.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::ConfigError;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub cache: CacheConfig,
    pub resolution: ResolutionConfig,
    pub generation: GenerationConfig,
    pub providers: ProvidersConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Resolved-analysis TTL. Upstream nutrition facts rarely change.
    pub analysis_ttl_secs: u64,
    pub analysis_capacity: usize,
    /// Generated-artifact TTL; also the lifetime of the dedup window.
    pub artifact_ttl_secs: u64,
    pub artifact_capacity: usize,
    pub sweep_interval_secs: u64,
    pub key_hex_len: usize,
    /// When set, resolved analyses persist in SQLite at this path.
    pub persistent_path: Option<PathBuf>,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            analysis_ttl_secs: 7 * 24 * 3600,
            analysis_capacity: 10_000,
            artifact_ttl_secs: 24 * 3600,
            artifact_capacity: 1_000,
            sweep_interval_secs: 60,
            key_hex_len: crate::cache::key::DEFAULT_KEY_HEX_LEN,
            persistent_path: None,
        }
    }
}

impl CacheConfig {
    pub fn analysis_ttl(&self) -> Duration {
        Duration::from_secs(self.analysis_ttl_secs)
    }

    pub fn artifact_ttl(&self) -> Duration {
        Duration::from_secs(self.artifact_ttl_secs)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs.max(1))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ResolutionConfig {
    /// Per-call budget for structured and generative analysis calls.
    pub provider_timeout_ms: u64,
    /// Budget for the vision extraction step.
    pub vision_timeout_ms: u64,
    pub structured_confidence: f64,
    pub generative_confidence: f64,
    /// Multiplier for image requests (vision extraction is a second lossy step).
    pub image_discount: f64,
    /// Multiplier for voice transcripts.
    pub voice_discount: f64,
    /// Confidence of the placeholder returned when every source failed.
    pub degraded_confidence: f64,
    /// Mixed into every cache key; change it to invalidate resolved analyses.
    pub key_params: String,
}

impl Default for ResolutionConfig {
    fn default() -> Self {
        Self {
            provider_timeout_ms: 8_000,
            vision_timeout_ms: 20_000,
            structured_confidence: 0.9,
            generative_confidence: 0.7,
            image_discount: 0.8,
            voice_discount: 0.9,
            degraded_confidence: 0.1,
            key_params: "providers=v1".to_string(),
        }
    }
}

impl ResolutionConfig {
    pub fn provider_timeout(&self) -> Duration {
        Duration::from_millis(self.provider_timeout_ms)
    }

    pub fn vision_timeout(&self) -> Duration {
        Duration::from_millis(self.vision_timeout_ms)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GenerationConfig {
    pub max_attempts: u32,
    pub attempt_timeout_ms: u64,
    /// Hamming distance at or below which two recipes are near-duplicates.
    pub similarity_threshold: u32,
    pub base_temperature: f32,
    /// Added per retry so later attempts sample more widely.
    pub temperature_step: f32,
    pub max_tokens: u32,
    /// Recent titles listed in the prompt as things to avoid.
    pub avoid_recent_titles: usize,
}

impl Default for GenerationConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            attempt_timeout_ms: 30_000,
            similarity_threshold: crate::similarity::DEFAULT_SIMILARITY_THRESHOLD,
            base_temperature: 0.8,
            temperature_step: 0.15,
            max_tokens: 1_200,
            avoid_recent_titles: 10,
        }
    }
}

impl GenerationConfig {
    pub fn attempt_timeout(&self) -> Duration {
        Duration::from_millis(self.attempt_timeout_ms)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProvidersConfig {
    pub generative: Option<GenerativeEndpoint>,
    pub open_food_facts: Option<OpenFoodFactsEndpoint>,
    pub usda: Option<UsdaEndpoint>,
}

impl Default for ProvidersConfig {
    fn default() -> Self {
        Self {
            generative: Some(GenerativeEndpoint::default()),
            open_food_facts: Some(OpenFoodFactsEndpoint::default()),
            usda: Some(UsdaEndpoint::default()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GenerativeEndpoint {
    pub base_url: String,
    pub model: String,
    pub vision_model: Option<String>,
    pub api_key_env: String,
    pub request_timeout_ms: u64,
    pub min_interval_ms: u64,
}

impl Default for GenerativeEndpoint {
    fn default() -> Self {
        Self {
            base_url: "https://api.deepseek.com".to_string(),
            model: "deepseek-chat".to_string(),
            vision_model: None,
            api_key_env: "NUTRILENS_LLM_API_KEY".to_string(),
            request_timeout_ms: 30_000,
            min_interval_ms: 100,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OpenFoodFactsEndpoint {
    pub base_url: String,
    pub user_agent: String,
    pub request_timeout_ms: u64,
}

impl Default for OpenFoodFactsEndpoint {
    fn default() -> Self {
        Self {
            base_url: "https://world.openfoodfacts.org".to_string(),
            user_agent: concat!("nutrilens/", env!("CARGO_PKG_VERSION")).to_string(),
            request_timeout_ms: 8_000,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct UsdaEndpoint {
    pub base_url: String,
    pub api_key_env: String,
    pub request_timeout_ms: u64,
    pub data_types: Vec<String>,
}

impl Default for UsdaEndpoint {
    fn default() -> Self {
        Self {
            base_url: "https://api.nal.usda.gov/fdc".to_string(),
            api_key_env: "NUTRILENS_USDA_API_KEY".to_string(),
            request_timeout_ms: 8_000,
            data_types: vec!["Foundation".to_string(), "SR Legacy".to_string()],
        }
    }
}

impl EngineConfig {
    /// Load config from a JSON file. Missing fields take their defaults.
    pub fn load_from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        let config: Self = serde_json::from_str(&content)?;
        debug!(path = %path.display(), "config loaded");
        Ok(config)
    }

    /// Defaults plus environment overrides, or file plus environment
    /// overrides when `NUTRILENS_CONFIG` names a file. Unparseable override
    /// values are ignored with a warning.
    ///
    /// # Environment Variables
    /// - `NUTRILENS_ANALYSIS_TTL_SECS`, `NUTRILENS_ANALYSIS_CAPACITY`
    /// - `NUTRILENS_ARTIFACT_TTL_SECS`, `NUTRILENS_ARTIFACT_CAPACITY`
    /// - `NUTRILENS_SWEEP_INTERVAL_SECS`, `NUTRILENS_CACHE_PATH`
    /// - `NUTRILENS_PROVIDER_TIMEOUT_MS`, `NUTRILENS_VISION_TIMEOUT_MS`
    /// - `NUTRILENS_MAX_ATTEMPTS`, `NUTRILENS_ATTEMPT_TIMEOUT_MS`
    /// - `NUTRILENS_SIMILARITY_THRESHOLD`
    /// - `NUTRILENS_LLM_BASE_URL`, `NUTRILENS_LLM_MODEL`
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let mut config = match lookup("NUTRILENS_CONFIG").filter(|p| !p.is_empty()) {
            Some(path) => Self::load_from_file(Path::new(&path))?,
            None => Self::default(),
        };
        config.apply_overrides(lookup);
        config.validate()?;
        Ok(config)
    }

    fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        fn parsed<T: std::str::FromStr>(
            lookup: &impl Fn(&str) -> Option<String>,
            name: &str,
        ) -> Option<T> {
            let raw = lookup(name)?;
            match raw.trim().parse() {
                Ok(v) => Some(v),
                Err(_) => {
                    warn!(var = name, value = %raw, "ignoring unparseable override");
                    None
                }
            }
        }

        let c = &mut self.cache;
        if let Some(v) = parsed(&lookup, "NUTRILENS_ANALYSIS_TTL_SECS") {
            c.analysis_ttl_secs = v;
        }
        if let Some(v) = parsed(&lookup, "NUTRILENS_ANALYSIS_CAPACITY") {
            c.analysis_capacity = v;
        }
        if let Some(v) = parsed(&lookup, "NUTRILENS_ARTIFACT_TTL_SECS") {
            c.artifact_ttl_secs = v;
        }
        if let Some(v) = parsed(&lookup, "NUTRILENS_ARTIFACT_CAPACITY") {
            c.artifact_capacity = v;
        }
        if let Some(v) = parsed(&lookup, "NUTRILENS_SWEEP_INTERVAL_SECS") {
            c.sweep_interval_secs = v;
        }
        if let Some(v) = lookup("NUTRILENS_CACHE_PATH").filter(|s| !s.is_empty()) {
            c.persistent_path = Some(PathBuf::from(v));
        }

        let r = &mut self.resolution;
        if let Some(v) = parsed(&lookup, "NUTRILENS_PROVIDER_TIMEOUT_MS") {
            r.provider_timeout_ms = v;
        }
        if let Some(v) = parsed(&lookup, "NUTRILENS_VISION_TIMEOUT_MS") {
            r.vision_timeout_ms = v;
        }

        let g = &mut self.generation;
        if let Some(v) = parsed(&lookup, "NUTRILENS_MAX_ATTEMPTS") {
            g.max_attempts = v;
        }
        if let Some(v) = parsed(&lookup, "NUTRILENS_ATTEMPT_TIMEOUT_MS") {
            g.attempt_timeout_ms = v;
        }
        if let Some(v) = parsed(&lookup, "NUTRILENS_SIMILARITY_THRESHOLD") {
            g.similarity_threshold = v;
        }

        if let Some(endpoint) = self.providers.generative.as_mut() {
            if let Some(v) = lookup("NUTRILENS_LLM_BASE_URL") {
                endpoint.base_url = v;
            }
            if let Some(v) = lookup("NUTRILENS_LLM_MODEL") {
                endpoint.model = v;
            }
        }
    }

    /// Reject values that would make the engine misbehave rather than degrade.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let unit = |name: &str, v: f64| {
            if (0.0..=1.0).contains(&v) {
                Ok(())
            } else {
                Err(ConfigError::Invalid(format!("{name} must be within [0, 1], got {v}")))
            }
        };
        let r = &self.resolution;
        unit("structured_confidence", r.structured_confidence)?;
        unit("generative_confidence", r.generative_confidence)?;
        unit("image_discount", r.image_discount)?;
        unit("voice_discount", r.voice_discount)?;
        unit("degraded_confidence", r.degraded_confidence)?;

        if self.generation.max_attempts == 0 {
            return Err(ConfigError::Invalid("max_attempts must be at least 1".into()));
        }
        if self.generation.similarity_threshold as usize >= crate::similarity::FINGERPRINT_BITS {
            return Err(ConfigError::Invalid(
                "similarity_threshold would mark every recipe a duplicate".into(),
            ));
        }
        if self.cache.analysis_capacity == 0 || self.cache.artifact_capacity == 0 {
            return Err(ConfigError::Invalid("cache capacities must be positive".into()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn defaults_match_documented_values() {
        let c = EngineConfig::default();
        assert_eq!(c.cache.analysis_ttl(), Duration::from_secs(604_800));
        assert_eq!(c.cache.artifact_ttl(), Duration::from_secs(86_400));
        assert_eq!(c.generation.max_attempts, 3);
        assert_eq!(c.generation.similarity_threshold, 3);
        assert_eq!(c.resolution.structured_confidence, 0.9);
        assert_eq!(c.resolution.generative_confidence, 0.7);
        assert!(c.validate().is_ok());
    }

    #[test]
    fn partial_file_keeps_defaults() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("nutrilens.json");
        std::fs::write(
            &path,
            r#"{"generation": {"max_attempts": 5}, "providers": {"usda": null}}"#,
        )
        .expect("write config");

        let c = EngineConfig::load_from_file(&path).expect("load");
        assert_eq!(c.generation.max_attempts, 5);
        assert_eq!(c.generation.similarity_threshold, 3);
        assert!(c.providers.usda.is_none());
        assert!(c.providers.generative.is_some());
    }

    #[test]
    fn overrides_apply_and_ignore_garbage() {
        let vars: HashMap<&str, &str> = [
            ("NUTRILENS_MAX_ATTEMPTS", "7"),
            ("NUTRILENS_SIMILARITY_THRESHOLD", "five"),
            ("NUTRILENS_CACHE_PATH", "/tmp/nl.db"),
            ("NUTRILENS_LLM_MODEL", "gpt-4o-mini"),
        ]
        .into_iter()
        .collect();

        let mut c = EngineConfig::default();
        c.apply_overrides(|name| vars.get(name).map(|v| v.to_string()));
        assert_eq!(c.generation.max_attempts, 7);
        assert_eq!(c.generation.similarity_threshold, 3);
        assert_eq!(c.cache.persistent_path, Some(PathBuf::from("/tmp/nl.db")));
        assert_eq!(
            c.providers.generative.map(|g| g.model).as_deref(),
            Some("gpt-4o-mini")
        );
    }

    #[test]
    fn environment_layers_over_config_file() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("nutrilens.json");
        std::fs::write(&path, r#"{"generation": {"max_attempts": 5, "similarity_threshold": 6}}"#)
            .expect("write config");
        let path = path.display().to_string();
        let vars: HashMap<&str, &str> = [
            ("NUTRILENS_CONFIG", path.as_str()),
            ("NUTRILENS_MAX_ATTEMPTS", "4"),
        ]
        .into_iter()
        .collect();

        let c = EngineConfig::from_lookup(|name| vars.get(name).map(|v| v.to_string()))
            .expect("load");
        assert_eq!(c.generation.max_attempts, 4);
        assert_eq!(c.generation.similarity_threshold, 6);

        let c = EngineConfig::from_lookup(|_| None).expect("defaults");
        assert_eq!(c, EngineConfig::default());
    }

    #[test]
    fn environment_overrides_are_validated() {
        let c = EngineConfig::from_lookup(|name| {
            (name == "NUTRILENS_MAX_ATTEMPTS").then(|| "0".to_string())
        });
        assert!(matches!(c, Err(ConfigError::Invalid(_))));

        let c = EngineConfig::from_lookup(|name| {
            (name == "NUTRILENS_CONFIG").then(|| "/nonexistent/nutrilens.json".to_string())
        });
        assert!(matches!(c, Err(ConfigError::Io(_))));
    }

    #[test]
    fn validation_rejects_nonsense() {
        let mut c = EngineConfig::default();
        c.resolution.image_discount = 1.5;
        assert!(matches!(c.validate(), Err(ConfigError::Invalid(_))));

        let mut c = EngineConfig::default();
        c.generation.max_attempts = 0;
        assert!(c.validate().is_err());

        let mut c = EngineConfig::default();
        c.generation.similarity_threshold = 128;
        assert!(c.validate().is_err());
    }

    #[test]
    fn malformed_file_is_parse_error() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("bad.json");
        std::fs::write(&path, "{not json").expect("write");
        assert!(matches!(
            EngineConfig::load_from_file(&path),
            Err(ConfigError::Parse(_))
        ));
    }
}
