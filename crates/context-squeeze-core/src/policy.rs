//! Reduction policy: which chunks to shrink next and by how much.
//!
//! Everything here is synchronous and side-effect free, so the rules that
//! decide when the compression loop stops can be tested without a model.
//!
//! # Selection
//!
//! 1. Drop ineligible chunks (see [`eligibility`]).
//! 2. Order the rest least-relevant first, then largest first, then by
//!    position in the document.
//! 3. With `protect_top_decile`, chunks rated above the 90th-percentile
//!    relevance are held back while any other chunk can still be shrunk.
//! 4. Give each chunk a budget: remove at most `shrink_step` of its size and
//!    no more than the tokens still needed, never going below the tokens of
//!    its code blocks and tables.
//! 5. Stop adding chunks once their expected savings cover the remaining
//!    gap, so a batch overshoots the target by at most one chunk's savings.

use std::cmp::Ordering;

use serde::{Deserialize, Serialize};

use crate::models::{Chunk, CompressionJob};
use crate::tokens::TokenCounter;

/// Knobs for the compression loop.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReductionPolicy {
    /// Maximum chunks shortened concurrently per batch.
    pub batch_size: usize,
    /// Shrink calls per chunk before it is given up on.
    pub max_attempts: u32,
    /// A chunk whose live/original ratio is below this is left alone.
    pub threshold: f64,
    /// Chunks smaller than this are not worth a call.
    pub min_chunk_tokens: usize,
    /// Largest fraction of a chunk removed by a single call.
    pub shrink_step: f64,
    pub protect_top_decile: bool,
    /// Relevance assumed for chunks that were never rated.
    pub default_relevance: f32,
}

impl Default for ReductionPolicy {
    fn default() -> Self {
        Self {
            batch_size: 5,
            max_attempts: 3,
            threshold: 0.7,
            min_chunk_tokens: 1,
            shrink_step: 0.4,
            protect_top_decile: true,
            default_relevance: 5.0,
        }
    }
}

/// Why a chunk is not considered for shrinking.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Ineligible {
    AttemptsExhausted,
    NotReducible,
    TooSmall,
    AlreadyCompressed,
}

/// Decide whether a chunk may be shrunk again.
pub fn eligibility(chunk: &Chunk, policy: &ReductionPolicy) -> Result<(), Ineligible> {
    if chunk.attempts >= policy.max_attempts {
        return Err(Ineligible::AttemptsExhausted);
    }
    if !chunk.reducible {
        return Err(Ineligible::NotReducible);
    }
    if chunk.token_count <= 1 || chunk.token_count < policy.min_chunk_tokens {
        return Err(Ineligible::TooSmall);
    }
    if chunk.compression_ratio() < policy.threshold {
        return Err(Ineligible::AlreadyCompressed);
    }
    Ok(())
}

/// Relevance strictly above which a chunk counts as top decile.
///
/// Returns `None` when no chunk has been rated.
pub fn relevance_cutoff(chunks: &[Chunk]) -> Option<f32> {
    let mut rated: Vec<f32> = chunks.iter().filter_map(|c| c.relevance).collect();
    if rated.is_empty() {
        return None;
    }
    rated.sort_by(|a, b| a.total_cmp(b));
    let idx = (0.9 * (rated.len() - 1) as f64).floor() as usize;
    Some(rated[idx])
}

/// Least relevant first, then largest, then document order.
pub fn compare_candidates(a: &Chunk, b: &Chunk, default_relevance: f32) -> Ordering {
    let ra = a.relevance.unwrap_or(default_relevance);
    let rb = b.relevance.unwrap_or(default_relevance);
    ra.total_cmp(&rb)
        .then_with(|| b.token_count.cmp(&a.token_count))
        .then_with(|| a.index.cmp(&b.index))
}

/// Positions of eligible chunks in selection order.
pub fn candidate_order(chunks: &[Chunk], policy: &ReductionPolicy) -> Vec<usize> {
    let mut positions: Vec<usize> = (0..chunks.len())
        .filter(|&i| eligibility(&chunks[i], policy).is_ok())
        .collect();
    positions.sort_by(|&a, &b| compare_candidates(&chunks[a], &chunks[b], policy.default_relevance));
    positions
}

/// Tokens of a chunk that no shortening may touch: code and tables.
pub fn protected_floor(chunk: &Chunk, counter: &TokenCounter) -> usize {
    chunk
        .blocks
        .iter()
        .filter(|b| b.is_protected())
        .map(|b| counter.count(&b.text))
        .sum()
}

/// Token budget for one shrink call, or `None` when the chunk cannot lose
/// anything without eating into its protected content.
pub fn chunk_budget(
    chunk: &Chunk,
    need: usize,
    policy: &ReductionPolicy,
    counter: &TokenCounter,
) -> Option<usize> {
    let current = chunk.token_count;
    let step = ((current as f64) * policy.shrink_step).ceil() as usize;
    let reduction = step.min(need).max(1);
    let floor = protected_floor(chunk, counter).max(1);
    let budget = current.saturating_sub(reduction).max(floor);
    (budget < current).then_some(budget)
}

/// One chunk scheduled for shortening.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BatchItem {
    /// Index into `job.chunks`.
    pub position: usize,
    pub budget: usize,
}

/// Select the next batch. An empty batch means no safe reduction remains.
pub fn select_batch(
    job: &CompressionJob,
    policy: &ReductionPolicy,
    counter: &TokenCounter,
) -> Vec<BatchItem> {
    let need = job.needed();
    if need == 0 {
        return Vec::new();
    }

    let order = candidate_order(&job.chunks, policy);
    let cutoff = if policy.protect_top_decile {
        relevance_cutoff(&job.chunks)
    } else {
        None
    };
    let is_protected =
        |pos: &usize| matches!((job.chunks[*pos].relevance, cutoff), (Some(r), Some(c)) if r > c);

    let (held, open): (Vec<usize>, Vec<usize>) = order.into_iter().partition(is_protected);

    let batch = fill_batch(job, &open, need, policy, counter);
    if !batch.is_empty() {
        return batch;
    }
    fill_batch(job, &held, need, policy, counter)
}

fn fill_batch(
    job: &CompressionJob,
    order: &[usize],
    need: usize,
    policy: &ReductionPolicy,
    counter: &TokenCounter,
) -> Vec<BatchItem> {
    let mut batch = Vec::new();
    let mut expected = 0usize;

    for &position in order {
        if batch.len() >= policy.batch_size || expected >= need {
            break;
        }
        let chunk = &job.chunks[position];
        if let Some(budget) = chunk_budget(chunk, need - expected, policy, counter) {
            expected += chunk.token_count - budget;
            batch.push(BatchItem { position, budget });
        }
    }
    batch
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Block, BlockKind};
    use crate::tokens::TokenizerMode;

    fn chunk(index: usize, tokens: usize, relevance: Option<f32>) -> Chunk {
        Chunk {
            id: format!("ch_{:05}_test", index),
            index,
            kind: Some(BlockKind::Paragraph),
            start: 0,
            end: 0,
            blocks: Vec::new(),
            text: String::new(),
            original_tokens: tokens,
            token_count: tokens,
            relevance,
            attempts: 0,
            compressed: false,
            reducible: true,
        }
    }

    fn job(chunks: Vec<Chunk>, fraction: f64) -> CompressionJob {
        CompressionJob::new("fp", "", fraction, chunks, TokenizerMode::Heuristic).unwrap()
    }

    #[test]
    fn largest_of_equally_relevant_goes_first() {
        let j = job(
            vec![
                chunk(0, 1000, Some(3.0)),
                chunk(1, 2000, Some(3.0)),
                chunk(2, 500, Some(3.0)),
            ],
            0.3,
        );
        assert_eq!(j.target_tokens, 2450);
        let counter = TokenCounter::heuristic();
        let batch = select_batch(&j, &ReductionPolicy::default(), &counter);
        assert_eq!(batch[0].position, 1);
    }

    #[test]
    fn least_relevant_beats_larger() {
        let chunks = vec![chunk(0, 1000, Some(2.0)), chunk(1, 2000, Some(6.0))];
        let order = candidate_order(&chunks, &ReductionPolicy::default());
        assert_eq!(order, vec![0, 1]);
    }

    #[test]
    fn ties_fall_back_to_document_order() {
        let chunks = vec![
            chunk(0, 100, Some(4.0)),
            chunk(1, 100, Some(4.0)),
            chunk(2, 100, Some(4.0)),
        ];
        assert_eq!(
            candidate_order(&chunks, &ReductionPolicy::default()),
            vec![0, 1, 2]
        );
    }

    #[test]
    fn chunk_below_threshold_is_skipped_even_if_least_relevant() {
        let mut squeezed = chunk(0, 1000, Some(0.0));
        squeezed.token_count = 650;
        squeezed.compressed = true;
        let policy = ReductionPolicy::default();
        assert_eq!(
            eligibility(&squeezed, &policy),
            Err(Ineligible::AlreadyCompressed)
        );

        let j = job(vec![squeezed, chunk(1, 1000, Some(9.0))], 0.5);
        let counter = TokenCounter::heuristic();
        let batch = select_batch(&j, &policy, &counter);
        assert_eq!(batch.len(), 1);
        assert_eq!(batch[0].position, 1);
    }

    #[test]
    fn attempts_and_reducibility_gate_eligibility() {
        let policy = ReductionPolicy::default();
        let mut c = chunk(0, 100, None);
        c.attempts = 3;
        assert_eq!(eligibility(&c, &policy), Err(Ineligible::AttemptsExhausted));
        let mut c = chunk(0, 100, None);
        c.reducible = false;
        assert_eq!(eligibility(&c, &policy), Err(Ineligible::NotReducible));
        assert_eq!(
            eligibility(&chunk(0, 1, None), &policy),
            Err(Ineligible::TooSmall)
        );
    }

    #[test]
    fn top_decile_is_held_back_while_others_remain() {
        let chunks = vec![
            chunk(0, 100, Some(1.0)),
            chunk(1, 100, Some(2.0)),
            chunk(2, 5000, Some(10.0)),
        ];
        let j = job(chunks, 0.9);
        let counter = TokenCounter::heuristic();
        let policy = ReductionPolicy::default();
        let batch = select_batch(&j, &policy, &counter);
        assert!(!batch.is_empty());
        assert!(batch.iter().all(|b| b.position != 2));

        // Once the others are spent, the protected chunk is fair game.
        let mut j = j;
        j.chunks[0].attempts = 3;
        j.chunks[1].attempts = 3;
        let batch = select_batch(&j, &policy, &counter);
        assert_eq!(batch.len(), 1);
        assert_eq!(batch[0].position, 2);
    }

    #[test]
    fn cutoff_ignores_uniform_ratings() {
        let chunks = vec![chunk(0, 10, Some(5.0)), chunk(1, 10, Some(5.0))];
        assert_eq!(relevance_cutoff(&chunks), Some(5.0));
        assert_eq!(relevance_cutoff(&[chunk(0, 10, None)]), None);
    }

    #[test]
    fn batch_stops_once_gap_is_covered() {
        // Need 100 tokens; the first chunk alone can give 400.
        let chunks = vec![
            chunk(0, 1000, Some(1.0)),
            chunk(1, 1000, Some(1.0)),
            chunk(2, 1000, Some(1.0)),
        ];
        let mut j = job(chunks, 0.1);
        j.target_tokens = 2900;
        let counter = TokenCounter::heuristic();
        let batch = select_batch(&j, &ReductionPolicy::default(), &counter);
        assert_eq!(batch, vec![BatchItem { position: 0, budget: 900 }]);
    }

    #[test]
    fn batch_respects_size_limit_and_step() {
        let chunks: Vec<Chunk> = (0..10).map(|i| chunk(i, 100, Some(1.0))).collect();
        let j = job(chunks, 0.9);
        let counter = TokenCounter::heuristic();
        let policy = ReductionPolicy {
            protect_top_decile: false,
            ..ReductionPolicy::default()
        };
        let batch = select_batch(&j, &policy, &counter);
        assert_eq!(batch.len(), 5);
        assert!(batch.iter().all(|b| b.budget == 60));
    }

    #[test]
    fn budget_never_cuts_into_code() {
        let counter = TokenCounter::heuristic();
        let code = "```\nlet a = 1; let b = 2; let c = 3;\n```\n".to_string();
        let code_tokens = counter.count(&code);
        let prose = "word ".repeat(6);
        let mut c = chunk(0, 0, None);
        c.blocks = vec![
            Block {
                kind: BlockKind::Code,
                start: 0,
                end: code.len(),
                line: 1,
                text: code.clone(),
            },
            Block {
                kind: BlockKind::Paragraph,
                start: code.len(),
                end: code.len() + prose.len(),
                line: 4,
                text: prose.clone(),
            },
        ];
        c.text = format!("{}{}", code, prose);
        c.token_count = counter.count(&c.text);
        c.original_tokens = c.token_count;

        let budget = chunk_budget(&c, 1000, &ReductionPolicy::default(), &counter).unwrap();
        assert_eq!(budget, code_tokens);

        // Pure code cannot shrink at all.
        c.blocks.truncate(1);
        c.token_count = code_tokens;
        assert_eq!(chunk_budget(&c, 1000, &ReductionPolicy::default(), &counter), None);
    }
}
