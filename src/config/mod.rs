//! Configuration management for Sift
//!
//! Settings live in a TOML file, can be overridden per profile and through
//! `SIFT_SECTION__KEY` environment variables, and are validated as a whole
//! before use.

use crate::embedding::EmbeddingConfig;
use crate::error::{Result, SiftError};
use crate::retrieval::{FusionEngine, RerankOptions, RetrievalMethod, SearchConfig, DEFAULT_RRF_K};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

mod validator;

pub use validator::ConfigValidator;

/// Main configuration structure
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(rename = "_meta", default)]
    pub meta: MetaConfig,
    #[serde(default)]
    pub retrieval: RetrievalConfig,
    #[serde(default)]
    pub fusion: FusionConfig,
    #[serde(default)]
    pub rerank: RerankConfig,
    #[serde(default)]
    pub embedding: EmbeddingConfig,
    #[serde(default)]
    pub profiles: HashMap<String, ProfileOverrides>,
}

/// Metadata about the configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetaConfig {
    pub schema_version: String,
    #[serde(default = "current_timestamp")]
    pub created_at: String,
    #[serde(default = "current_timestamp")]
    pub last_modified: String,
}

fn current_timestamp() -> String {
    chrono::Utc::now().to_rfc3339()
}

impl Default for MetaConfig {
    fn default() -> Self {
        Self {
            schema_version: "1.0.0".to_string(),
            created_at: current_timestamp(),
            last_modified: current_timestamp(),
        }
    }
}

/// Which retrieval methods run and how much each one counts
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetrievalConfig {
    pub enabled_methods: Vec<RetrievalMethod>,
    /// Budget for each adapter call
    pub per_method_timeout_ms: u64,
    /// Adapters fetch `limit * search_multiplier` candidates
    pub search_multiplier: usize,
    /// Result count when the caller does not give one
    pub default_limit: usize,
    pub weights: MethodWeights,
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self {
            enabled_methods: RetrievalMethod::ALL.to_vec(),
            per_method_timeout_ms: 2000,
            search_multiplier: 2,
            default_limit: 10,
            weights: MethodWeights::default(),
        }
    }
}

/// Fusion weight per retrieval method
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MethodWeights {
    pub fts: f32,
    pub dense: f32,
    pub sparse: f32,
}

impl MethodWeights {
    pub fn get(&self, method: RetrievalMethod) -> f32 {
        match method {
            RetrievalMethod::Fts => self.fts,
            RetrievalMethod::Dense => self.dense,
            RetrievalMethod::Sparse => self.sparse,
        }
    }

    pub fn set(&mut self, method: RetrievalMethod, weight: f32) {
        match method {
            RetrievalMethod::Fts => self.fts = weight,
            RetrievalMethod::Dense => self.dense = weight,
            RetrievalMethod::Sparse => self.sparse = weight,
        }
    }
}

impl Default for MethodWeights {
    fn default() -> Self {
        Self {
            fts: 1.0,
            dense: 1.0,
            sparse: 1.0,
        }
    }
}

/// Reciprocal Rank Fusion settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FusionConfig {
    pub rrf_k: f64,
}

impl Default for FusionConfig {
    fn default() -> Self {
        Self { rrf_k: DEFAULT_RRF_K }
    }
}

/// Cross-encoder reranking settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RerankConfig {
    pub enabled: bool,
    pub model: String,
    /// Size of the fused shortlist handed to the cross-encoder
    pub top_n: usize,
    pub timeout_ms: u64,
    pub max_text_chars: usize,
    pub batch_size: usize,
}

impl Default for RerankConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            model: "BAAI/bge-reranker-base".to_string(),
            top_n: 20,
            timeout_ms: 3000,
            max_text_chars: 512,
            batch_size: 32,
        }
    }
}

/// Profile-specific configuration overrides
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ProfileOverrides {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub enabled_methods: Option<Vec<RetrievalMethod>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rerank_enabled: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rerank_top_n: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rrf_k: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub embedding_model: Option<String>,
}

impl Config {
    /// Load configuration from a file
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Err(SiftError::ConfigNotFound {
                path: path.to_path_buf(),
            });
        }

        let content = std::fs::read_to_string(path).map_err(|e| SiftError::Io {
            source: e,
            context: format!("Failed to read config file: {:?}", path),
        })?;
        let mut config: Config = toml::from_str(&content)?;

        // Apply environment variable overrides
        config.apply_env_overrides();

        // Validate configuration
        ConfigValidator::validate(&config)?;

        Ok(config)
    }

    /// Save configuration to a file
    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| SiftError::Io {
                source: e,
                context: format!("Failed to create config directory: {:?}", parent),
            })?;
        }

        let content = toml::to_string_pretty(self)?;
        std::fs::write(path, content).map_err(|e| SiftError::Io {
            source: e,
            context: format!("Failed to write config file: {:?}", path),
        })?;
        Ok(())
    }

    /// Load configuration with a specific profile applied
    pub fn load_with_profile(path: &Path, profile: &str) -> Result<Self> {
        let mut config = Self::load(path)?;
        config.apply_profile(profile)?;
        ConfigValidator::validate(&config)?;
        Ok(config)
    }

    /// Apply a profile's overrides to the configuration
    pub fn apply_profile(&mut self, profile: &str) -> Result<()> {
        let overrides = self
            .profiles
            .get(profile)
            .cloned()
            .ok_or_else(|| SiftError::Config(format!("Unknown profile: {}", profile)))?;

        if let Some(methods) = overrides.enabled_methods {
            self.retrieval.enabled_methods = methods;
        }
        if let Some(enabled) = overrides.rerank_enabled {
            self.rerank.enabled = enabled;
        }
        if let Some(top_n) = overrides.rerank_top_n {
            self.rerank.top_n = top_n;
        }
        if let Some(k) = overrides.rrf_k {
            self.fusion.rrf_k = k;
        }
        if let Some(model) = overrides.embedding_model {
            self.embedding.model = model;
        }

        tracing::debug!("Applied profile: {}", profile);
        Ok(())
    }

    /// Apply environment variable overrides
    /// Environment variables in format: SIFT_SECTION__KEY=value
    pub fn apply_env_overrides(&mut self) {
        self.apply_overrides(std::env::vars());
    }

    /// Apply `SIFT_`-prefixed overrides from any key/value source
    pub fn apply_overrides<I>(&mut self, vars: I)
    where
        I: IntoIterator<Item = (String, String)>,
    {
        for (key, value) in vars {
            if let Some(config_key) = key.strip_prefix("SIFT_") {
                if let Err(e) = self.set_value_from_env(config_key, &value) {
                    tracing::warn!("Failed to apply env override {}: {}", key, e);
                }
            }
        }
    }

    fn set_value_from_env(&mut self, path: &str, value: &str) -> Result<()> {
        match path {
            "RETRIEVAL__ENABLED_METHODS" => {
                self.retrieval.enabled_methods = value
                    .split(',')
                    .map(str::trim)
                    .filter(|s| !s.is_empty())
                    .map(|s| s.parse::<RetrievalMethod>())
                    .collect::<std::result::Result<Vec<_>, _>>()
                    .map_err(|message| invalid(path, message))?;
            }
            "RETRIEVAL__PER_METHOD_TIMEOUT_MS" => {
                self.retrieval.per_method_timeout_ms = parse(path, value)?;
            }
            "RETRIEVAL__SEARCH_MULTIPLIER" => {
                self.retrieval.search_multiplier = parse(path, value)?;
            }
            "RETRIEVAL__DEFAULT_LIMIT" => {
                self.retrieval.default_limit = parse(path, value)?;
            }
            "FUSION__RRF_K" => {
                self.fusion.rrf_k = parse(path, value)?;
            }
            "RERANK__ENABLED" => {
                self.rerank.enabled = parse(path, value)?;
            }
            "RERANK__MODEL" => {
                self.rerank.model = value.to_string();
            }
            "RERANK__TOP_N" => {
                self.rerank.top_n = parse(path, value)?;
            }
            "RERANK__TIMEOUT_MS" => {
                self.rerank.timeout_ms = parse(path, value)?;
            }
            "RERANK__MAX_TEXT_CHARS" => {
                self.rerank.max_text_chars = parse(path, value)?;
            }
            "EMBEDDING__MODEL" => {
                self.embedding.model = value.to_string();
            }
            "EMBEDDING__BATCH_SIZE" => {
                self.embedding.batch_size = parse(path, value)?;
            }
            _ => match path.strip_prefix("RETRIEVAL__WEIGHTS__") {
                Some(method) => {
                    let method = method
                        .parse::<RetrievalMethod>()
                        .map_err(|message| invalid(path, message))?;
                    self.retrieval.weights.set(method, parse(path, value)?);
                }
                None => tracing::debug!("Unknown env config key: {}", path),
            },
        }
        Ok(())
    }

    /// Runtime settings for one orchestrated search
    pub fn search_config(&self) -> SearchConfig {
        SearchConfig {
            enabled_methods: self.retrieval.enabled_methods.iter().copied().collect(),
            method_weights: RetrievalMethod::ALL
                .into_iter()
                .map(|m| (m, self.retrieval.weights.get(m)))
                .collect(),
            per_method_timeout: Duration::from_millis(self.retrieval.per_method_timeout_ms),
            rerank: self.rerank.enabled,
            rerank_top_n: self.rerank.top_n,
            search_multiplier: self.retrieval.search_multiplier,
        }
    }

    pub fn fusion_engine(&self) -> Result<FusionEngine> {
        FusionEngine::new(self.fusion.rrf_k).map_err(|e| invalid("fusion.rrf_k", e.to_string()))
    }

    pub fn rerank_options(&self) -> RerankOptions {
        RerankOptions {
            timeout: Duration::from_millis(self.rerank.timeout_ms),
            max_text_chars: self.rerank.max_text_chars,
        }
    }

    /// Get the default configuration file path
    pub fn default_path() -> Result<PathBuf> {
        let config_dir = dirs::config_dir()
            .ok_or_else(|| SiftError::Config("Cannot determine config directory".to_string()))?;

        Ok(config_dir.join("sift").join("config.toml"))
    }
}

fn invalid(path: &str, message: impl Into<String>) -> SiftError {
    SiftError::InvalidConfigValue {
        path: path.to_string(),
        message: message.into(),
    }
}

fn parse<T: std::str::FromStr>(path: &str, value: &str) -> Result<T> {
    value
        .trim()
        .parse()
        .map_err(|_| invalid(path, format!("Cannot parse '{}'", value)))
}
