//! End-to-end compression.
//!
//! [`Compressor::compress`] runs the whole pipeline for one document:
//!
//! ```text
//! fingerprint → result cache ─hit─▶ return cached output
//!                    │miss
//!                    ▼
//!   parse + split → rate → plan → reduce → stitch → cache result
//! ```
//!
//! Unusable input (an unterminated fence) or a reduction outside (0, 1)
//! fails before any model call. Everything after that is absorbed: the
//! output always carries the best text reached and its statistics.

use std::sync::Arc;
use std::time::Instant;

use serde::{Deserialize, Serialize};

use context_squeeze_core::blocks;
use context_squeeze_core::cache::{self, normalize_text, CacheEntry, CacheKind, CacheStore, Fingerprint};
use context_squeeze_core::chunk::{self, ChunkWindow};
use context_squeeze_core::error::Result;
use context_squeeze_core::models::{Chunk, CompressionJob, CompressionStats, JobState};
use context_squeeze_core::plan::validate_reduction;
use context_squeeze_core::policy::{candidate_order, chunk_budget, relevance_cutoff};
use context_squeeze_core::stitch::{build_stats, stitch};
use context_squeeze_core::tokens::{TokenCounter, TokenizerMode};

use crate::config::{Config, CONFIG_VERSION};
use crate::engine::{self, CancelHandle, EngineOptions};
use crate::llm::{create_model, LanguageModel};
use crate::rater::{self, RatingOptions};
use crate::sqlite_cache::SqliteCache;

/// Compressed document plus the statistics of the run that produced it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompressionOutput {
    pub text: String,
    pub stats: CompressionStats,
}

/// One chunk the next batches would shrink, as reported by
/// [`Compressor::preview`].
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PreviewCandidate {
    pub chunk_id: String,
    pub index: usize,
    pub kind: String,
    pub tokens: usize,
    pub relevance: f32,
    pub budget: usize,
    /// Rated above the top decile; only touched once nothing else is left.
    pub protected: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Preview {
    pub original_tokens: usize,
    pub target_tokens: usize,
    pub chunks_total: usize,
    pub token_mode: TokenizerMode,
    pub candidates: Vec<PreviewCandidate>,
}

pub struct Compressor {
    model: Arc<dyn LanguageModel>,
    cache: Option<Arc<dyn CacheStore>>,
    counter: TokenCounter,
    window: ChunkWindow,
    rating: RatingOptions,
    engine: EngineOptions,
}

impl Compressor {
    /// Build a compressor from explicit collaborators.
    pub fn new(
        config: &Config,
        model: Arc<dyn LanguageModel>,
        cache: Option<Arc<dyn CacheStore>>,
    ) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            model,
            cache,
            counter: config.token_counter()?,
            window: config.chunk_window(),
            rating: RatingOptions::from(&config.rating),
            engine: EngineOptions::from(config),
        })
    }

    /// Build the model and SQLite cache named by `config`.
    ///
    /// A cache database that cannot be opened is logged and skipped; the
    /// compressor then runs uncached.
    pub async fn from_config(config: &Config) -> anyhow::Result<Self> {
        let model = create_model(&config.models)?;
        let cache: Option<Arc<dyn CacheStore>> = if config.cache.enabled {
            match SqliteCache::open(&config.cache.path).await {
                Ok(store) => Some(Arc::new(store) as Arc<dyn CacheStore>),
                Err(e) => {
                    tracing::warn!(
                        path = %config.cache.path.display(),
                        error = %format!("{:#}", e),
                        "cache unavailable, running uncached"
                    );
                    None
                }
            }
        } else {
            None
        };
        Ok(Self::new(config, model, cache)?)
    }

    pub fn token_mode(&self) -> TokenizerMode {
        self.counter.mode()
    }

    /// Fingerprint of a whole compression request under this configuration.
    pub fn fingerprint(&self, document: &str, intent: &str, reduction_fraction: f64) -> String {
        let policy = &self.engine.policy;
        Fingerprint::new(CacheKind::Result)
            .field("version", CONFIG_VERSION.to_string())
            .field("document", normalize_text(document))
            .field("intent", intent.trim())
            .float("reduction", reduction_fraction)
            .field("rating_model", self.model.rating_model())
            .field("compression_model", self.model.compression_model())
            .field("tokenizer", self.counter.mode().as_str())
            .field(
                "window",
                format!("{}-{}", self.window.min_tokens, self.window.max_tokens),
            )
            .field("batch_size", policy.batch_size.to_string())
            .field("max_attempts", policy.max_attempts.to_string())
            .float("threshold", policy.threshold)
            .field("min_chunk_tokens", policy.min_chunk_tokens.to_string())
            .float("shrink_step", policy.shrink_step)
            .field("protect_top_decile", policy.protect_top_decile.to_string())
            .field("max_iterations", self.engine.max_iterations.to_string())
            .field("rating_attempts", self.rating.max_attempts.to_string())
            .float("default_score", f64::from(self.rating.default_score))
            .finish()
    }

    /// Compress `document` by `reduction_fraction` of its tokens.
    ///
    /// # Errors
    ///
    /// [`SqueezeError::InvalidReduction`](context_squeeze_core::SqueezeError::InvalidReduction)
    /// for a fraction outside (0, 1) and
    /// [`SqueezeError::Structural`](context_squeeze_core::SqueezeError::Structural)
    /// for an unterminated code fence. Failing to reach the target is not an
    /// error: the output reports `Exhausted`.
    pub async fn compress(
        &self,
        document: &str,
        intent: &str,
        reduction_fraction: f64,
        cancel: &CancelHandle,
    ) -> Result<CompressionOutput> {
        let started = Instant::now();
        validate_reduction(reduction_fraction)?;

        let fingerprint = self.fingerprint(document, intent, reduction_fraction);
        if let Some(mut output) = self.cached_output(&fingerprint).await {
            output.stats.cache_hit = true;
            output.stats.elapsed_ms = started.elapsed().as_millis() as u64;
            tracing::info!(fingerprint = %cache::short(&fingerprint), "result cache hit");
            return Ok(output);
        }

        let mut job = self.prepare(document, intent, reduction_fraction, fingerprint)?;

        let mut rating_defaulted = 0;
        if !job.target_met() && !cancel.is_cancelled() {
            let report = rater::rate(
                &mut job.chunks,
                intent,
                Arc::clone(&self.model),
                self.cache.clone(),
                &self.rating,
            )
            .await;
            rating_defaulted = report.defaulted;
            job.anomalies = report.anomalies;
        }

        let report = engine::reduce(
            &mut job,
            Arc::clone(&self.model),
            self.cache.clone(),
            &self.counter,
            &self.engine,
            cancel,
        )
        .await;

        let output = CompressionOutput {
            text: stitch(&job.chunks),
            stats: build_stats(&job, false, started.elapsed().as_millis() as u64),
        };

        // Results shaped by failed calls or a cancellation are not final.
        let cacheable = match job.state {
            JobState::Converged => true,
            JobState::Exhausted => report.call_failures == 0 && rating_defaulted == 0,
            _ => false,
        };
        if cacheable {
            if let Some(store) = &self.cache {
                let payload = serde_json::to_string(&output)?;
                let entry = CacheEntry::new(job.fingerprint.clone(), CacheKind::Result, payload);
                cache::store(store.as_ref(), &entry).await;
            }
        }

        tracing::info!(
            state = output.stats.state.as_str(),
            original = output.stats.original_tokens,
            final_tokens = output.stats.final_tokens,
            target = output.stats.target_tokens,
            elapsed_ms = output.stats.elapsed_ms,
            "compression finished"
        );
        Ok(output)
    }

    /// Split, rate and plan without shortening anything. Returns up to
    /// `limit` chunks in the order the engine would pick them.
    pub async fn preview(
        &self,
        document: &str,
        intent: &str,
        reduction_fraction: f64,
        limit: usize,
    ) -> Result<Preview> {
        validate_reduction(reduction_fraction)?;
        let fingerprint = self.fingerprint(document, intent, reduction_fraction);
        let mut job = self.prepare(document, intent, reduction_fraction, fingerprint)?;

        let report = rater::rate(
            &mut job.chunks,
            intent,
            Arc::clone(&self.model),
            self.cache.clone(),
            &self.rating,
        )
        .await;
        job.anomalies = report.anomalies;

        let policy = &self.engine.policy;
        let cutoff = if policy.protect_top_decile {
            relevance_cutoff(&job.chunks)
        } else {
            None
        };
        let is_protected = |c: &Chunk| matches!((c.relevance, cutoff), (Some(r), Some(k)) if r > k);

        let (held, open): (Vec<usize>, Vec<usize>) = candidate_order(&job.chunks, policy)
            .into_iter()
            .partition(|&pos| is_protected(&job.chunks[pos]));

        let need = job.needed();
        let candidates = open
            .into_iter()
            .chain(held)
            .filter_map(|pos| {
                let c = &job.chunks[pos];
                let budget = chunk_budget(c, need, policy, &self.counter)?;
                Some(PreviewCandidate {
                    chunk_id: c.id.clone(),
                    index: c.index,
                    kind: c.kind_label().to_string(),
                    tokens: c.token_count,
                    relevance: c.relevance.unwrap_or(policy.default_relevance),
                    budget,
                    protected: is_protected(c),
                })
            })
            .take(limit)
            .collect();

        Ok(Preview {
            original_tokens: job.original_tokens,
            target_tokens: job.target_tokens,
            chunks_total: job.chunks.len(),
            token_mode: job.token_mode,
            candidates,
        })
    }

    /// Parse, split and plan.
    fn prepare(
        &self,
        document: &str,
        intent: &str,
        reduction_fraction: f64,
        fingerprint: String,
    ) -> Result<CompressionJob> {
        let parsed = blocks::parse(document)?;
        let chunks = chunk::split(&parsed, &self.window, &self.counter);
        let job = CompressionJob::new(
            fingerprint,
            intent.trim(),
            reduction_fraction,
            chunks,
            self.counter.mode(),
        )?;
        tracing::info!(
            chars = document.len(),
            blocks = parsed.blocks().len(),
            chunks = job.chunks.len(),
            tokens = job.original_tokens,
            target = job.target_tokens,
            token_mode = job.token_mode.as_str(),
            "planned"
        );
        Ok(job)
    }

    async fn cached_output(&self, fingerprint: &str) -> Option<CompressionOutput> {
        let store = self.cache.as_ref()?;
        let entry = cache::lookup(store.as_ref(), fingerprint, CacheKind::Result).await?;
        match serde_json::from_str(&entry.payload) {
            Ok(output) => Some(output),
            Err(e) => {
                tracing::warn!(
                    fingerprint = %cache::short(fingerprint),
                    error = %e,
                    "unreadable cached result, recomputing"
                );
                None
            }
        }
    }
}
