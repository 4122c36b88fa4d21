//! Core data models used throughout context-squeeze.
//!
//! A [`Document`] is parsed once into structural [`Block`]s and never
//! changes afterwards. Blocks are packed into [`Chunk`]s, which are the unit
//! of rating and shrinking. A [`CompressionJob`] owns its chunks for the
//! whole run and keeps `current_tokens` equal to the sum of their live
//! token counts.

use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::plan::plan;
use crate::tokens::TokenizerMode;

/// Structural kind of a Markdown block.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BlockKind {
    Heading,
    Code,
    List,
    Table,
    Paragraph,
}

impl BlockKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            BlockKind::Heading => "heading",
            BlockKind::Code => "code",
            BlockKind::List => "list",
            BlockKind::Table => "table",
            BlockKind::Paragraph => "paragraph",
        }
    }
}

/// A contiguous structural slice of the source document.
///
/// `text` is exactly `source[start..end]`, including any blank lines that
/// trail the block, so concatenating all blocks reproduces the document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Block {
    pub kind: BlockKind,
    /// Byte offset of the first character.
    pub start: usize,
    /// Byte offset one past the last character.
    pub end: usize,
    /// 1-based line number where the block starts.
    pub line: usize,
    pub text: String,
}

impl Block {
    /// Code and tables carry no prose to shorten.
    pub fn is_protected(&self) -> bool {
        matches!(self.kind, BlockKind::Code | BlockKind::Table)
    }
}

/// A parsed Markdown document. Immutable once parsed.
#[derive(Debug, Clone)]
pub struct Document {
    text: String,
    blocks: Vec<Block>,
}

impl Document {
    pub(crate) fn from_parts(text: String, blocks: Vec<Block>) -> Self {
        Self { text, blocks }
    }

    pub fn text(&self) -> &str {
        &self.text
    }

    pub fn blocks(&self) -> &[Block] {
        &self.blocks
    }
}

/// A chunk of the document: the unit that gets rated and shortened.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Chunk {
    /// Stable identifier (`ch_{index:05}_{hash10}`), assigned at split time
    /// and never changed by recompression.
    pub id: String,
    /// Position in the original document.
    pub index: usize,
    /// Uniform block kind, or `None` for a mixed section.
    pub kind: Option<BlockKind>,
    pub start: usize,
    pub end: usize,
    /// The original blocks this chunk was built from.
    pub blocks: Vec<Block>,
    /// Live text; starts as the concatenated block text.
    pub text: String,
    pub original_tokens: usize,
    pub token_count: usize,
    pub relevance: Option<f32>,
    pub attempts: u32,
    pub compressed: bool,
    /// Cleared when the model reports the chunk cannot be shortened safely.
    pub reducible: bool,
}

impl Chunk {
    pub fn original_text(&self) -> String {
        self.blocks.iter().map(|b| b.text.as_str()).collect()
    }

    /// Ratio of live tokens to the tokens the chunk started with.
    pub fn compression_ratio(&self) -> f64 {
        if self.original_tokens == 0 {
            return 1.0;
        }
        self.token_count as f64 / self.original_tokens as f64
    }

    pub fn kind_label(&self) -> &'static str {
        self.kind.map(|k| k.as_str()).unwrap_or("section")
    }
}

/// Lifecycle of a [`CompressionJob`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobState {
    Planning,
    Reducing,
    /// `current_tokens <= target_tokens`.
    Converged,
    /// No eligible chunk remains and the target was not met.
    Exhausted,
    /// Stopped between batches at the caller's request.
    Cancelled,
}

impl JobState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobState::Converged | JobState::Exhausted | JobState::Cancelled
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            JobState::Planning => "planning",
            JobState::Reducing => "reducing",
            JobState::Converged => "converged",
            JobState::Exhausted => "exhausted",
            JobState::Cancelled => "cancelled",
        }
    }
}

/// An out-of-range or non-finite relevance score that was clamped.
#[derive(Debug, Clone, PartialEq)]
pub struct RatingAnomaly {
    pub chunk_id: String,
    pub raw: f64,
    pub clamped: f32,
}

/// A single compression run over one document.
#[derive(Debug, Clone)]
pub struct CompressionJob {
    pub fingerprint: String,
    pub intent: String,
    pub reduction_fraction: f64,
    pub original_tokens: usize,
    pub target_tokens: usize,
    pub current_tokens: usize,
    pub chunks: Vec<Chunk>,
    pub state: JobState,
    pub iterations: u32,
    pub anomalies: Vec<RatingAnomaly>,
    pub token_mode: TokenizerMode,
}

impl CompressionJob {
    /// Build a job in the `Planning` state. Fails with
    /// [`SqueezeError::InvalidReduction`](crate::error::SqueezeError::InvalidReduction)
    /// for a fraction outside (0, 1).
    pub fn new(
        fingerprint: impl Into<String>,
        intent: impl Into<String>,
        reduction_fraction: f64,
        chunks: Vec<Chunk>,
        token_mode: TokenizerMode,
    ) -> Result<Self> {
        let original_tokens: usize = chunks.iter().map(|c| c.token_count).sum();
        let target_tokens = plan(original_tokens, reduction_fraction)?;
        Ok(Self {
            fingerprint: fingerprint.into(),
            intent: intent.into(),
            reduction_fraction,
            original_tokens,
            target_tokens,
            current_tokens: original_tokens,
            chunks,
            state: JobState::Planning,
            iterations: 0,
            anomalies: Vec::new(),
            token_mode,
        })
    }

    pub fn target_met(&self) -> bool {
        self.current_tokens <= self.target_tokens
    }

    /// Tokens still to remove before the target is met.
    pub fn needed(&self) -> usize {
        self.current_tokens.saturating_sub(self.target_tokens)
    }

    /// Sum of live chunk token counts.
    pub fn live_tokens(&self) -> usize {
        self.chunks.iter().map(|c| c.token_count).sum()
    }

    /// Replace a chunk's text and keep `current_tokens` in step.
    ///
    /// Returns the number of tokens removed (0 when the new text is not
    /// smaller, in which case nothing changes).
    pub fn apply_shrink(&mut self, position: usize, text: String, tokens: usize) -> usize {
        let Some(chunk) = self.chunks.get_mut(position) else {
            return 0;
        };
        if tokens >= chunk.token_count {
            return 0;
        }
        let delta = chunk.token_count - tokens;
        chunk.text = text;
        chunk.token_count = tokens;
        chunk.compressed = true;
        self.current_tokens -= delta;
        debug_assert_eq!(self.current_tokens, self.live_tokens());
        delta
    }
}

/// Before/after statistics for a compression run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompressionStats {
    pub original_tokens: usize,
    pub target_tokens: usize,
    pub final_tokens: usize,
    /// Fraction of the original tokens removed, `1 - final / original`.
    pub reduction_achieved: f64,
    pub chunks_modified: usize,
    pub chunks_skipped: usize,
    pub converged: bool,
    pub state: JobState,
    pub token_mode: TokenizerMode,
    pub cache_hit: bool,
    pub iterations: u32,
    pub chunks_total: usize,
    pub rating_anomalies: usize,
    pub elapsed_ms: u64,
}

impl CompressionStats {
    /// True when the run stopped short of its target.
    pub fn under_target(&self) -> bool {
        !self.converged
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn chunk(index: usize, tokens: usize) -> Chunk {
        Chunk {
            id: format!("ch_{:05}_test", index),
            index,
            kind: Some(BlockKind::Paragraph),
            start: 0,
            end: 0,
            blocks: Vec::new(),
            text: "x".repeat(tokens),
            original_tokens: tokens,
            token_count: tokens,
            relevance: None,
            attempts: 0,
            compressed: false,
            reducible: true,
        }
    }

    #[test]
    fn job_computes_target_from_fraction() {
        let chunks = vec![chunk(0, 1000), chunk(1, 2000), chunk(2, 500)];
        let job = CompressionJob::new("fp", "", 0.3, chunks, TokenizerMode::Heuristic).unwrap();
        assert_eq!(job.original_tokens, 3500);
        assert_eq!(job.target_tokens, 2450);
        assert_eq!(job.current_tokens, 3500);
        assert_eq!(job.needed(), 1050);
        assert_eq!(job.state, JobState::Planning);
    }

    #[test]
    fn apply_shrink_keeps_current_tokens_exact() {
        let chunks = vec![chunk(0, 100), chunk(1, 200)];
        let mut job = CompressionJob::new("fp", "", 0.5, chunks, TokenizerMode::Heuristic).unwrap();
        assert_eq!(job.apply_shrink(1, "short".into(), 120), 80);
        assert_eq!(job.current_tokens, 220);
        assert_eq!(job.current_tokens, job.live_tokens());
        assert!(job.chunks[1].compressed);
    }

    #[test]
    fn apply_shrink_ignores_growth() {
        let chunks = vec![chunk(0, 100)];
        let mut job = CompressionJob::new("fp", "", 0.5, chunks, TokenizerMode::Heuristic).unwrap();
        assert_eq!(job.apply_shrink(0, "longer".into(), 150), 0);
        assert_eq!(job.current_tokens, 100);
        assert!(!job.chunks[0].compressed);
    }

    #[test]
    fn compression_ratio_of_untouched_chunk_is_one() {
        let mut c = chunk(0, 100);
        assert!((c.compression_ratio() - 1.0).abs() < f64::EPSILON);
        c.token_count = 65;
        assert!((c.compression_ratio() - 0.65).abs() < 1e-9);
    }
}
