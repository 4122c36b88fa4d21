//! Relevance rating.
//!
//! One scoring request per chunk, issued through a `JoinSet` and bounded by
//! a semaphore. Results come back tagged with the chunk id and are written
//! back by id, so completion order does not matter.
//!
//! A chunk whose score cannot be obtained after `max_attempts` tries gets
//! the configured default score, which is high so failures keep text rather
//! than lose it. Out-of-range or non-finite scores are clamped into
//! `[0, 10]` and reported as [`RatingAnomaly`] records.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::Semaphore;
use tokio::task::JoinSet;

use context_squeeze_core::cache::{self, CacheEntry, CacheKind, CacheStore, Fingerprint};
use context_squeeze_core::models::{Chunk, RatingAnomaly};

use crate::config::{RatingConfig, CONFIG_VERSION};
use crate::llm::LanguageModel;

pub const MIN_SCORE: f32 = 0.0;
pub const MAX_SCORE: f32 = 10.0;

/// Knobs for [`rate`].
#[derive(Debug, Clone)]
pub struct RatingOptions {
    pub concurrency: usize,
    pub max_attempts: u32,
    pub default_score: f32,
}

impl From<&RatingConfig> for RatingOptions {
    fn from(config: &RatingConfig) -> Self {
        Self {
            concurrency: config.concurrency,
            max_attempts: config.max_attempts,
            default_score: config.default_score,
        }
    }
}

impl Default for RatingOptions {
    fn default() -> Self {
        Self::from(&RatingConfig::default())
    }
}

/// What happened while rating a document.
#[derive(Debug, Clone, Default)]
pub struct RatingReport {
    pub anomalies: Vec<RatingAnomaly>,
    /// Chunks that fell back to the default score.
    pub defaulted: usize,
    pub cache_hits: usize,
}

/// Fingerprint of one rating: chunk text, intent and rating model.
pub fn rating_fingerprint(text: &str, intent: &str, model: &str) -> String {
    Fingerprint::new(CacheKind::Rating)
        .field("version", CONFIG_VERSION.to_string())
        .field("text", text)
        .field("intent", intent.trim())
        .field("model", model)
        .finish()
}

/// Clamp a raw score into `[0, 10]`. Returns the clamped value and whether
/// it had to change. Non-finite scores become `fallback`.
pub fn clamp_score(raw: f64, fallback: f32) -> (f32, bool) {
    if !raw.is_finite() {
        return (fallback, true);
    }
    let clamped = raw.clamp(MIN_SCORE as f64, MAX_SCORE as f64);
    (clamped as f32, clamped != raw)
}

enum Source {
    Cache,
    Model,
    Default,
}

struct Rated {
    chunk_id: String,
    score: f32,
    anomaly: Option<f64>,
    source: Source,
}

/// Set `relevance` on every chunk.
pub async fn rate(
    chunks: &mut [Chunk],
    intent: &str,
    model: Arc<dyn LanguageModel>,
    cache: Option<Arc<dyn CacheStore>>,
    options: &RatingOptions,
) -> RatingReport {
    let semaphore = Arc::new(Semaphore::new(options.concurrency.max(1)));
    let mut join_set = JoinSet::new();

    tracing::info!(
        chunks = chunks.len(),
        concurrency = options.concurrency,
        model = model.rating_model(),
        "rating chunks"
    );

    for chunk in chunks.iter() {
        let chunk_id = chunk.id.clone();
        let text = chunk.text.clone();
        let intent = intent.to_string();
        let model = Arc::clone(&model);
        let cache = cache.clone();
        let semaphore = Arc::clone(&semaphore);
        let options = options.clone();

        join_set.spawn(async move {
            rate_one(chunk_id, text, intent, model, cache, semaphore, options).await
        });
    }

    let positions: HashMap<String, usize> = chunks
        .iter()
        .enumerate()
        .map(|(i, c)| (c.id.clone(), i))
        .collect();

    let mut report = RatingReport::default();
    let mut done = 0usize;
    while let Some(result) = join_set.join_next().await {
        let rated = match result {
            Ok(rated) => rated,
            Err(e) => {
                tracing::error!(error = %e, "rating task panicked");
                continue;
            }
        };
        done += 1;

        match rated.source {
            Source::Cache => report.cache_hits += 1,
            Source::Default => report.defaulted += 1,
            Source::Model => {}
        }
        if let Some(raw) = rated.anomaly {
            tracing::warn!(chunk = %rated.chunk_id, raw, clamped = rated.score, "rating out of range, clamped");
            report.anomalies.push(RatingAnomaly {
                chunk_id: rated.chunk_id.clone(),
                raw,
                clamped: rated.score,
            });
        }
        if let Some(&pos) = positions.get(&rated.chunk_id) {
            chunks[pos].relevance = Some(rated.score);
        }
        tracing::debug!(chunk = %rated.chunk_id, score = rated.score, done, "rated chunk");
    }

    // A panicked task leaves its chunk unrated; treat it like a failed call.
    for chunk in chunks.iter_mut().filter(|c| c.relevance.is_none()) {
        chunk.relevance = Some(options.default_score);
        report.defaulted += 1;
    }

    report.anomalies.sort_by(|a, b| a.chunk_id.cmp(&b.chunk_id));
    tracing::info!(
        rated = done,
        defaulted = report.defaulted,
        cache_hits = report.cache_hits,
        anomalies = report.anomalies.len(),
        "done rating"
    );
    report
}

async fn rate_one(
    chunk_id: String,
    text: String,
    intent: String,
    model: Arc<dyn LanguageModel>,
    cache: Option<Arc<dyn CacheStore>>,
    semaphore: Arc<Semaphore>,
    options: RatingOptions,
) -> Rated {
    let fingerprint = rating_fingerprint(&text, &intent, model.rating_model());

    if let Some(store) = &cache {
        if let Some(entry) = cache::lookup(store.as_ref(), &fingerprint, CacheKind::Rating).await {
            match entry.payload.trim().parse::<f32>() {
                Ok(score) if (MIN_SCORE..=MAX_SCORE).contains(&score) => {
                    return Rated {
                        chunk_id,
                        score,
                        anomaly: None,
                        source: Source::Cache,
                    };
                }
                _ => tracing::warn!(chunk = %chunk_id, "unreadable cached rating, rescoring"),
            }
        }
    }

    let _permit = match semaphore.acquire_owned().await {
        Ok(permit) => permit,
        Err(_) => {
            return Rated {
                chunk_id,
                score: options.default_score,
                anomaly: None,
                source: Source::Default,
            }
        }
    };

    for attempt in 1..=options.max_attempts {
        match model.score(&text, &intent).await {
            Ok(raw) => {
                let (score, changed) = clamp_score(raw, options.default_score);
                if let Some(store) = &cache {
                    let entry = CacheEntry::new(fingerprint, CacheKind::Rating, score.to_string());
                    cache::store(store.as_ref(), &entry).await;
                }
                return Rated {
                    chunk_id,
                    score,
                    anomaly: changed.then_some(raw),
                    source: Source::Model,
                };
            }
            Err(e) => {
                tracing::warn!(chunk = %chunk_id, attempt, error = %e, "rating call failed");
            }
        }
    }

    Rated {
        chunk_id,
        score: options.default_score,
        anomaly: None,
        source: Source::Default,
    }
}
