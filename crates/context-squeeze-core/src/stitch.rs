//! Reassembly and reporting.
//!
//! Chunks are always stitched by their document position, never by the
//! order in which they were rated or shortened.

use std::fmt;

use crate::models::{Chunk, CompressionJob, CompressionStats, JobState};

/// Concatenate chunk texts in document order.
pub fn stitch(chunks: &[Chunk]) -> String {
    let mut ordered: Vec<&Chunk> = chunks.iter().collect();
    ordered.sort_by_key(|c| c.index);
    ordered.iter().map(|c| c.text.as_str()).collect()
}

/// Summarize a finished job.
///
/// A chunk counts as skipped when it was left unmodified after the model
/// was asked to shorten it, or after it was reported as not reducible.
pub fn build_stats(job: &CompressionJob, cache_hit: bool, elapsed_ms: u64) -> CompressionStats {
    let final_tokens = job.current_tokens;
    let reduction_achieved = if job.original_tokens == 0 {
        0.0
    } else {
        1.0 - final_tokens as f64 / job.original_tokens as f64
    };
    let chunks_modified = job.chunks.iter().filter(|c| c.compressed).count();
    let chunks_skipped = job
        .chunks
        .iter()
        .filter(|c| !c.compressed && (!c.reducible || c.attempts > 0))
        .count();

    CompressionStats {
        original_tokens: job.original_tokens,
        target_tokens: job.target_tokens,
        final_tokens,
        reduction_achieved,
        chunks_modified,
        chunks_skipped,
        converged: job.state == JobState::Converged,
        state: job.state,
        token_mode: job.token_mode,
        cache_hit,
        iterations: job.iterations,
        chunks_total: job.chunks.len(),
        rating_anomalies: job.anomalies.len(),
        elapsed_ms,
    }
}

impl fmt::Display for CompressionStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(
            f,
            "  Tokens:      {} → {} (target {})",
            format_number(self.original_tokens as u64),
            format_number(self.final_tokens as u64),
            format_number(self.target_tokens as u64)
        )?;
        writeln!(f, "  Reduction:   {:.1}%", self.reduction_achieved * 100.0)?;
        writeln!(
            f,
            "  Chunks:      {} modified, {} skipped, {} total",
            self.chunks_modified, self.chunks_skipped, self.chunks_total
        )?;
        writeln!(
            f,
            "  State:       {}{}",
            self.state.as_str(),
            if self.cache_hit { " (cached)" } else { "" }
        )?;
        writeln!(f, "  Tokenizer:   {}", self.token_mode.as_str())?;
        if self.rating_anomalies > 0 {
            writeln!(f, "  Anomalies:   {} rating(s) clamped", self.rating_anomalies)?;
        }
        write!(
            f,
            "  Iterations:  {} in {} ms",
            self.iterations,
            format_number(self.elapsed_ms)
        )
    }
}

/// Format an integer with thousands separators.
pub fn format_number(n: u64) -> String {
    let s = n.to_string();
    let mut result = String::with_capacity(s.len() + (s.len() - 1) / 3);
    for (i, c) in s.chars().rev().enumerate() {
        if i > 0 && i % 3 == 0 {
            result.push(',');
        }
        result.push(c);
    }
    result.chars().rev().collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chunk::{split_text, ChunkWindow};
    use crate::tokens::{TokenCounter, TokenizerMode};

    const DOC: &str = "# Title\n\nIntro paragraph.\n\n```rust\nfn main() {}\n```\n\n- one\n- two\n\n| a | b |\n|---|---|\n| 1 | 2 |\n\n## Tail\n\nClosing words.\n";

    #[test]
    fn stitch_of_split_is_identity() {
        let counter = TokenCounter::heuristic();
        let window = ChunkWindow {
            min_tokens: 1,
            max_tokens: 4,
        };
        let chunks = split_text(DOC, &window, &counter).unwrap();
        assert!(chunks.len() > 3);
        assert_eq!(stitch(&chunks), DOC);
    }

    #[test]
    fn stitch_ignores_slice_order() {
        let counter = TokenCounter::heuristic();
        let window = ChunkWindow {
            min_tokens: 1,
            max_tokens: 4,
        };
        let mut chunks = split_text(DOC, &window, &counter).unwrap();
        chunks.reverse();
        assert_eq!(stitch(&chunks), DOC);
    }

    #[test]
    fn stats_reflect_job() {
        let counter = TokenCounter::heuristic();
        let window = ChunkWindow {
            min_tokens: 1,
            max_tokens: 4,
        };
        let chunks = split_text(DOC, &window, &counter).unwrap();
        let total = chunks.len();
        let mut job =
            CompressionJob::new("fp", "", 0.5, chunks, TokenizerMode::Heuristic).unwrap();
        let before = job.chunks[0].token_count;
        job.apply_shrink(0, "# T\n\n".into(), 1);
        job.chunks[1].attempts = 2;
        job.chunks[2].reducible = false;
        job.state = JobState::Exhausted;

        let stats = build_stats(&job, false, 42);
        assert_eq!(stats.final_tokens, job.original_tokens - (before - 1));
        assert_eq!(stats.chunks_modified, 1);
        assert_eq!(stats.chunks_skipped, 2);
        assert_eq!(stats.chunks_total, total);
        assert!(!stats.converged);
        assert!(stats.under_target());
        assert!(stats.reduction_achieved > 0.0);
    }

    #[test]
    fn empty_job_reports_zero_reduction() {
        let job = CompressionJob::new("fp", "", 0.5, Vec::new(), TokenizerMode::Heuristic).unwrap();
        let stats = build_stats(&job, false, 0);
        assert_eq!(stats.reduction_achieved, 0.0);
        assert_eq!(stats.final_tokens, 0);
    }

    #[test]
    fn display_uses_thousands_separators() {
        let stats = CompressionStats {
            original_tokens: 12_345,
            target_tokens: 8_642,
            final_tokens: 8_600,
            reduction_achieved: 0.3034,
            chunks_modified: 4,
            chunks_skipped: 1,
            converged: true,
            state: JobState::Converged,
            token_mode: TokenizerMode::Exact,
            cache_hit: true,
            iterations: 2,
            chunks_total: 7,
            rating_anomalies: 0,
            elapsed_ms: 1_500,
        };
        let out = stats.to_string();
        assert!(out.contains("12,345 → 8,600 (target 8,642)"));
        assert!(out.contains("30.3%"));
        assert!(out.contains("converged (cached)"));
        assert!(!out.contains("Anomalies"));
    }

    #[test]
    fn format_number_groups_digits() {
        assert_eq!(format_number(0), "0");
        assert_eq!(format_number(999), "999");
        assert_eq!(format_number(1000), "1,000");
        assert_eq!(format_number(1_234_567), "1,234,567");
    }
}
