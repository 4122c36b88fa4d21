//! TOML configuration.
//!
//! Every section is optional and every field has a serde default equal to
//! the `balanced` preset, so an empty file is a valid configuration.
//! [`load_config`] parses, applies the optional `preset`, and validates.
//!
//! ```toml
//! preset = "quality"
//!
//! [cache]
//! path = ".cache/compression_cache.sqlite"
//!
//! [compression]
//! threshold = 0.6
//! ```

use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};

use context_squeeze_core::chunk::ChunkWindow;
use context_squeeze_core::error::SqueezeError;
use context_squeeze_core::policy::ReductionPolicy;
use context_squeeze_core::tokens::TokenCounter;

/// Upper bound for `limits.max_in_flight`.
pub const MAX_IN_FLIGHT_CEILING: usize = 64;

/// Bumped whenever a change would make cached results stale. Part of every
/// cache fingerprint.
pub const CONFIG_VERSION: u32 = 1;

#[derive(Debug, Deserialize, Clone, Default)]
pub struct Config {
    #[serde(default)]
    pub preset: Option<Preset>,
    #[serde(default)]
    pub cache: CacheConfig,
    #[serde(default)]
    pub chunking: ChunkingConfig,
    #[serde(default)]
    pub tokenizer: TokenizerConfig,
    #[serde(default)]
    pub models: ModelsConfig,
    #[serde(default)]
    pub rating: RatingConfig,
    #[serde(default)]
    pub compression: CompressionConfig,
    #[serde(default)]
    pub limits: LimitsConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Named bundles of model and throughput settings.
#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Preset {
    Fast,
    Balanced,
    Quality,
}

impl Preset {
    pub fn as_str(&self) -> &'static str {
        match self {
            Preset::Fast => "fast",
            Preset::Balanced => "balanced",
            Preset::Quality => "quality",
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct CacheConfig {
    #[serde(default = "default_cache_path")]
    pub path: PathBuf,
    #[serde(default = "default_true")]
    pub enabled: bool,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            path: default_cache_path(),
            enabled: true,
        }
    }
}

fn default_cache_path() -> PathBuf {
    PathBuf::from(".cache/compression_cache.sqlite")
}
fn default_true() -> bool {
    true
}

#[derive(Debug, Deserialize, Clone)]
pub struct ChunkingConfig {
    #[serde(default = "default_min_tokens")]
    pub min_tokens: usize,
    #[serde(default = "default_max_tokens")]
    pub max_tokens: usize,
}

impl Default for ChunkingConfig {
    fn default() -> Self {
        Self {
            min_tokens: default_min_tokens(),
            max_tokens: default_max_tokens(),
        }
    }
}

fn default_min_tokens() -> usize {
    2000
}
fn default_max_tokens() -> usize {
    4000
}

#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum TokenizerSetting {
    #[default]
    Auto,
    Exact,
    Heuristic,
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct TokenizerConfig {
    #[serde(default)]
    pub mode: TokenizerSetting,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ModelsConfig {
    #[serde(default = "default_provider")]
    pub provider: String,
    #[serde(default = "default_rating_model")]
    pub rating_model: String,
    #[serde(default = "default_compression_model")]
    pub compression_model: String,
    #[serde(default = "default_base_url")]
    pub base_url: String,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    /// Transport retries per call (429, 5xx, network) with exponential backoff.
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
}

impl Default for ModelsConfig {
    fn default() -> Self {
        Self {
            provider: default_provider(),
            rating_model: default_rating_model(),
            compression_model: default_compression_model(),
            base_url: default_base_url(),
            timeout_secs: default_timeout_secs(),
            max_retries: default_max_retries(),
        }
    }
}

impl ModelsConfig {
    pub fn is_enabled(&self) -> bool {
        self.provider != "disabled"
    }
}

fn default_provider() -> String {
    "openai".to_string()
}
fn default_rating_model() -> String {
    "gpt-4o-mini".to_string()
}
fn default_compression_model() -> String {
    "gpt-4o".to_string()
}
fn default_base_url() -> String {
    "https://api.openai.com/v1".to_string()
}
fn default_timeout_secs() -> u64 {
    30
}
fn default_max_retries() -> u32 {
    3
}

#[derive(Debug, Deserialize, Clone)]
pub struct RatingConfig {
    #[serde(default = "default_rating_concurrency")]
    pub concurrency: usize,
    /// Scoring attempts per chunk before falling back to `default_score`.
    #[serde(default = "default_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_score")]
    pub default_score: f32,
}

impl Default for RatingConfig {
    fn default() -> Self {
        Self {
            concurrency: default_rating_concurrency(),
            max_attempts: default_attempts(),
            default_score: default_score(),
        }
    }
}

fn default_rating_concurrency() -> usize {
    20
}
fn default_attempts() -> u32 {
    3
}
fn default_score() -> f32 {
    10.0
}

#[derive(Debug, Deserialize, Clone)]
pub struct CompressionConfig {
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default = "default_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_threshold")]
    pub threshold: f64,
    #[serde(default = "default_min_chunk_tokens")]
    pub min_chunk_tokens: usize,
    #[serde(default = "default_shrink_step")]
    pub shrink_step: f64,
    #[serde(default = "default_true")]
    pub protect_top_decile: bool,
    #[serde(default = "default_max_iterations")]
    pub max_iterations: u32,
}

impl Default for CompressionConfig {
    fn default() -> Self {
        Self {
            batch_size: default_batch_size(),
            max_attempts: default_attempts(),
            threshold: default_threshold(),
            min_chunk_tokens: default_min_chunk_tokens(),
            shrink_step: default_shrink_step(),
            protect_top_decile: true,
            max_iterations: default_max_iterations(),
        }
    }
}

fn default_batch_size() -> usize {
    5
}
fn default_threshold() -> f64 {
    0.7
}
fn default_min_chunk_tokens() -> usize {
    1
}
fn default_shrink_step() -> f64 {
    0.4
}
fn default_max_iterations() -> u32 {
    32
}

#[derive(Debug, Deserialize, Clone)]
pub struct LimitsConfig {
    /// Hard ceiling on simultaneous outbound model calls.
    #[serde(default = "default_max_in_flight")]
    pub max_in_flight: usize,
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            max_in_flight: default_max_in_flight(),
        }
    }
}

fn default_max_in_flight() -> usize {
    30
}

#[derive(Debug, Deserialize, Clone)]
pub struct LoggingConfig {
    #[serde(default = "default_level")]
    pub level: String,
    #[serde(default)]
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_level(),
            json: false,
        }
    }
}

fn default_level() -> String {
    "info".to_string()
}

impl Config {
    /// Overwrite model and throughput settings with the named preset.
    pub fn apply_preset(&mut self, preset: Preset) {
        let (rating, compression, concurrency, batch, attempts) = match preset {
            Preset::Fast => ("gpt-4o-mini", "gpt-4o-mini", 30, 8, 2),
            Preset::Balanced => ("gpt-4o-mini", "gpt-4o", 20, 5, 3),
            Preset::Quality => ("gpt-4o", "gpt-4o", 10, 3, 4),
        };
        self.models.rating_model = rating.to_string();
        self.models.compression_model = compression.to_string();
        self.rating.concurrency = concurrency;
        self.compression.batch_size = batch;
        self.compression.max_attempts = attempts;
        self.preset = Some(preset);
    }

    /// Check every knob against its allowed range.
    pub fn validate(&self) -> std::result::Result<(), SqueezeError> {
        let fail = |msg: String| Err(SqueezeError::Config(msg));

        if self.chunking.max_tokens == 0 {
            return fail("chunking.max_tokens must be > 0".into());
        }
        if self.chunking.min_tokens > self.chunking.max_tokens {
            return fail(format!(
                "chunking.min_tokens ({}) must be <= chunking.max_tokens ({})",
                self.chunking.min_tokens, self.chunking.max_tokens
            ));
        }

        let ceiling = self.limits.max_in_flight;
        if !(1..=MAX_IN_FLIGHT_CEILING).contains(&ceiling) {
            return fail(format!(
                "limits.max_in_flight must be in [1, {}]",
                MAX_IN_FLIGHT_CEILING
            ));
        }
        if !(1..=ceiling).contains(&self.rating.concurrency) {
            return fail(format!(
                "rating.concurrency ({}) must be in [1, limits.max_in_flight = {}]",
                self.rating.concurrency, ceiling
            ));
        }
        if !(1..=ceiling).contains(&self.compression.batch_size) {
            return fail(format!(
                "compression.batch_size ({}) must be in [1, limits.max_in_flight = {}]",
                self.compression.batch_size, ceiling
            ));
        }

        if !(self.compression.threshold > 0.0 && self.compression.threshold <= 1.0) {
            return fail("compression.threshold must be in (0.0, 1.0]".into());
        }
        if !(self.compression.shrink_step > 0.0 && self.compression.shrink_step <= 1.0) {
            return fail("compression.shrink_step must be in (0.0, 1.0]".into());
        }
        if !(0.0..=10.0).contains(&self.rating.default_score) {
            return fail("rating.default_score must be in [0.0, 10.0]".into());
        }
        if self.rating.max_attempts == 0 {
            return fail("rating.max_attempts must be >= 1".into());
        }
        if self.compression.max_attempts == 0 {
            return fail("compression.max_attempts must be >= 1".into());
        }
        if self.compression.max_iterations == 0 {
            return fail("compression.max_iterations must be >= 1".into());
        }

        match self.models.provider.as_str() {
            "openai" | "disabled" => {}
            other => {
                return fail(format!(
                    "Unknown model provider: '{}'. Must be openai or disabled.",
                    other
                ))
            }
        }

        Ok(())
    }

    pub fn chunk_window(&self) -> ChunkWindow {
        ChunkWindow {
            min_tokens: self.chunking.min_tokens,
            max_tokens: self.chunking.max_tokens,
        }
    }

    pub fn reduction_policy(&self) -> ReductionPolicy {
        ReductionPolicy {
            batch_size: self.compression.batch_size,
            max_attempts: self.compression.max_attempts,
            threshold: self.compression.threshold,
            min_chunk_tokens: self.compression.min_chunk_tokens,
            shrink_step: self.compression.shrink_step,
            protect_top_decile: self.compression.protect_top_decile,
            ..ReductionPolicy::default()
        }
    }

    /// Build the token counter named by `tokenizer.mode`.
    pub fn token_counter(&self) -> std::result::Result<TokenCounter, SqueezeError> {
        match self.tokenizer.mode {
            TokenizerSetting::Auto => Ok(TokenCounter::auto()),
            TokenizerSetting::Exact => TokenCounter::exact(),
            TokenizerSetting::Heuristic => Ok(TokenCounter::heuristic()),
        }
    }
}

/// Parse configuration from a TOML string, apply the preset and validate.
pub fn parse_config(content: &str) -> Result<Config> {
    let mut config: Config =
        toml::from_str(content).with_context(|| "Failed to parse config file")?;

    if let Some(preset) = config.preset {
        config.apply_preset(preset);
    }
    config.validate()?;

    Ok(config)
}

pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;
    parse_config(&content)
        .with_context(|| format!("Invalid config file: {}", path.display()))
}
