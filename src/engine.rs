//! The compression loop.
//!
//! Drives a [`CompressionJob`] from `Planning` through `Reducing` to one of
//! `Converged`, `Exhausted` or `Cancelled`:
//!
//! ```text
//! loop:
//!   target met          → Converged
//!   cancel requested    → Cancelled
//!   iteration cap hit   → Exhausted
//!   select_batch empty  → Exhausted
//!   shrink batch concurrently, then apply results one by one
//! ```
//!
//! Batch selection is a barrier: every call in a batch finishes and is
//! applied before the next batch is chosen, so `current_tokens` is only
//! ever touched from this task. Each call costs the chunk one attempt,
//! whatever its outcome. Failed calls and rejected rewrites are logged and
//! counted; they never abort the job.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::task::JoinSet;

use context_squeeze_core::blocks::{restore_margins, verify_structure};
use context_squeeze_core::cache::{self, CacheEntry, CacheKind, CacheStore, Fingerprint};
use context_squeeze_core::models::{CompressionJob, JobState};
use context_squeeze_core::policy::{select_batch, BatchItem, ReductionPolicy};
use context_squeeze_core::tokens::TokenCounter;

use crate::config::{Config, CONFIG_VERSION};
use crate::llm::{CallError, LanguageModel, ShortenOutcome, NOT_REDUCIBLE};

/// Cooperative cancellation, checked between batches.
///
/// Cloning shares the flag.
#[derive(Debug, Clone, Default)]
pub struct CancelHandle(Arc<AtomicBool>);

impl CancelHandle {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

#[derive(Debug, Clone)]
pub struct EngineOptions {
    pub policy: ReductionPolicy,
    /// Hard cap on batches per job.
    pub max_iterations: u32,
}

impl From<&Config> for EngineOptions {
    fn from(config: &Config) -> Self {
        Self {
            policy: config.reduction_policy(),
            max_iterations: config.compression.max_iterations,
        }
    }
}

impl Default for EngineOptions {
    fn default() -> Self {
        Self::from(&Config::default())
    }
}

/// Per-run counters, beyond what the job itself records.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EngineReport {
    /// Shrink calls that failed (transport, status, malformed reply).
    pub call_failures: usize,
    /// Rewrites dropped because they changed code fences or headings.
    pub rejected: usize,
    /// Shrink results served from the cache.
    pub cache_hits: usize,
}

/// Fingerprint of one shrink: chunk text, budget, intent and model.
pub fn shrink_fingerprint(text: &str, budget: usize, intent: &str, model: &str) -> String {
    Fingerprint::new(CacheKind::Shrink)
        .field("version", CONFIG_VERSION.to_string())
        .field("text", text)
        .field("budget", budget.to_string())
        .field("intent", intent.trim())
        .field("model", model)
        .finish()
}

struct ShrinkResult {
    item: BatchItem,
    fingerprint: String,
    from_cache: bool,
    outcome: Result<ShortenOutcome, CallError>,
}

/// Run the loop until the job reaches a terminal state.
pub async fn reduce(
    job: &mut CompressionJob,
    model: Arc<dyn LanguageModel>,
    cache: Option<Arc<dyn CacheStore>>,
    counter: &TokenCounter,
    options: &EngineOptions,
    cancel: &CancelHandle,
) -> EngineReport {
    let mut report = EngineReport::default();
    job.state = JobState::Reducing;

    tracing::info!(
        original = job.original_tokens,
        target = job.target_tokens,
        chunks = job.chunks.len(),
        "reducing"
    );

    loop {
        if job.target_met() {
            job.state = JobState::Converged;
            break;
        }
        if cancel.is_cancelled() {
            tracing::info!(iteration = job.iterations, "cancelled between batches");
            job.state = JobState::Cancelled;
            break;
        }
        if job.iterations >= options.max_iterations {
            tracing::warn!(
                iterations = job.iterations,
                current = job.current_tokens,
                target = job.target_tokens,
                "iteration cap reached"
            );
            job.state = JobState::Exhausted;
            break;
        }

        let batch = select_batch(job, &options.policy, counter);
        if batch.is_empty() {
            job.state = JobState::Exhausted;
            break;
        }

        job.iterations += 1;
        let before = job.current_tokens;
        let mut results = run_batch(job, &batch, &model, &cache).await;
        results.sort_by_key(|r| r.item.position);

        for result in results {
            apply(job, result, counter, &cache, &mut report).await;
        }

        tracing::info!(
            iteration = job.iterations,
            batch = batch.len(),
            before,
            after = job.current_tokens,
            target = job.target_tokens,
            "applied batch"
        );
    }

    tracing::info!(
        state = job.state.as_str(),
        final_tokens = job.current_tokens,
        target = job.target_tokens,
        iterations = job.iterations,
        call_failures = report.call_failures,
        rejected = report.rejected,
        "reduction finished"
    );
    report
}

/// Issue one shrink call per batch item concurrently, serving cached
/// results without a call.
async fn run_batch(
    job: &CompressionJob,
    batch: &[BatchItem],
    model: &Arc<dyn LanguageModel>,
    cache: &Option<Arc<dyn CacheStore>>,
) -> Vec<ShrinkResult> {
    let mut join_set = JoinSet::new();

    for &item in batch {
        let chunk = &job.chunks[item.position];
        let text = chunk.text.clone();
        let intent = job.intent.clone();
        let model = Arc::clone(model);
        let cache = cache.clone();

        join_set.spawn(async move {
            let fingerprint =
                shrink_fingerprint(&text, item.budget, &intent, model.compression_model());

            if let Some(store) = &cache {
                if let Some(entry) =
                    cache::lookup(store.as_ref(), &fingerprint, CacheKind::Shrink).await
                {
                    let outcome = if entry.payload == NOT_REDUCIBLE {
                        ShortenOutcome::NotReducible
                    } else {
                        ShortenOutcome::Shortened(entry.payload)
                    };
                    return ShrinkResult {
                        item,
                        fingerprint,
                        from_cache: true,
                        outcome: Ok(outcome),
                    };
                }
            }

            let outcome = model.shorten(&text, item.budget, &intent).await;
            ShrinkResult {
                item,
                fingerprint,
                from_cache: false,
                outcome,
            }
        });
    }

    let mut results = Vec::with_capacity(batch.len());
    let mut panicked = 0usize;
    while let Some(joined) = join_set.join_next().await {
        match joined {
            Ok(result) => results.push(result),
            Err(e) => {
                tracing::error!(error = %e, "shrink task panicked");
                panicked += 1;
            }
        }
    }

    // A panicked task still costs its chunk an attempt.
    if panicked > 0 {
        let missing: Vec<BatchItem> = batch
            .iter()
            .copied()
            .filter(|item| !results.iter().any(|r| r.item.position == item.position))
            .collect();
        for item in missing {
            results.push(ShrinkResult {
                item,
                fingerprint: String::new(),
                from_cache: false,
                outcome: Err(CallError::Transport("shrink task panicked".to_string())),
            });
        }
    }
    results
}

async fn apply(
    job: &mut CompressionJob,
    result: ShrinkResult,
    counter: &TokenCounter,
    cache: &Option<Arc<dyn CacheStore>>,
    report: &mut EngineReport,
) {
    let position = result.item.position;
    let chunk = &mut job.chunks[position];
    chunk.attempts += 1;
    let chunk_id = chunk.id.clone();
    let attempt = chunk.attempts;
    if result.from_cache {
        report.cache_hits += 1;
    }

    let text = match result.outcome {
        Err(e) => {
            tracing::warn!(chunk = %chunk_id, attempt, error = %e, "compression call failed");
            report.call_failures += 1;
            return;
        }
        Ok(ShortenOutcome::NotReducible) => {
            tracing::debug!(chunk = %chunk_id, "model reports chunk not reducible");
            chunk.reducible = false;
            if !result.from_cache {
                remember(cache, result.fingerprint, NOT_REDUCIBLE.to_string()).await;
            }
            return;
        }
        Ok(ShortenOutcome::Shortened(text)) => text,
    };

    if let Err(violation) = verify_structure(&chunk.original_text(), &text) {
        tracing::warn!(chunk = %chunk_id, attempt, reason = %violation, "rejected rewrite");
        report.rejected += 1;
        return;
    }

    let rewritten = restore_margins(&chunk.text, &text);
    let tokens = counter.count(&rewritten);
    let before = chunk.token_count;
    if !result.from_cache {
        remember(cache, result.fingerprint, text).await;
    }

    let removed = job.apply_shrink(position, rewritten, tokens);
    if removed == 0 {
        tracing::debug!(chunk = %chunk_id, before, after = tokens, "rewrite saved nothing");
    } else {
        tracing::debug!(chunk = %chunk_id, before, after = tokens, budget = result.item.budget, "shrunk chunk");
    }
}

async fn remember(cache: &Option<Arc<dyn CacheStore>>, fingerprint: String, payload: String) {
    if let Some(store) = cache {
        let entry = CacheEntry::new(fingerprint, CacheKind::Shrink, payload);
        cache::store(store.as_ref(), &entry).await;
    }
}
