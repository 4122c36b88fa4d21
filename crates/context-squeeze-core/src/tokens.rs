//! Token counting with an exact BPE tokenizer and a deterministic fallback.
//!
//! With the `exact-tokenizer` feature, counts come from the `cl100k_base`
//! encoding via `tiktoken-rs`. Without it, or when the encoding fails to
//! load, the counter falls back to `ceil(words × 4 / 3)`. The mode in use is
//! recorded on every job and in every cache fingerprint so totals from
//! different modes are never compared with each other.
//!
//! Counts are memoized by SHA-256 of the text, so identical text is counted
//! at most once per counter instance. Share one instance per process.

use std::collections::HashMap;
use std::sync::Mutex;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::error::{Result, SqueezeError};

/// Which counting strategy produced a token total.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TokenizerMode {
    Exact,
    Heuristic,
}

impl TokenizerMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            TokenizerMode::Exact => "exact",
            TokenizerMode::Heuristic => "heuristic",
        }
    }
}

/// Heuristic tokens-per-word ratio, as a fraction.
const TOKENS_PER_WORD_NUM: usize = 4;
const TOKENS_PER_WORD_DEN: usize = 3;

/// Whitespace-word count scaled by 4/3, rounded up.
pub fn heuristic_count(text: &str) -> usize {
    let words = text.split_whitespace().count();
    (words * TOKENS_PER_WORD_NUM + TOKENS_PER_WORD_DEN - 1) / TOKENS_PER_WORD_DEN
}

/// Memoizing token counter.
pub struct TokenCounter {
    mode: TokenizerMode,
    #[cfg(feature = "exact-tokenizer")]
    bpe: Option<tiktoken_rs::CoreBPE>,
    cache: Mutex<HashMap<[u8; 32], usize>>,
}

impl TokenCounter {
    /// Counter that always uses the word heuristic.
    pub fn heuristic() -> Self {
        Self {
            mode: TokenizerMode::Heuristic,
            #[cfg(feature = "exact-tokenizer")]
            bpe: None,
            cache: Mutex::new(HashMap::new()),
        }
    }

    /// Counter backed by `cl100k_base`. Fails when the exact tokenizer is
    /// not compiled in or cannot be loaded.
    pub fn exact() -> Result<Self> {
        #[cfg(feature = "exact-tokenizer")]
        {
            let bpe = tiktoken_rs::cl100k_base().map_err(|e| {
                SqueezeError::Config(format!("failed to load cl100k_base: {}", e))
            })?;
            Ok(Self {
                mode: TokenizerMode::Exact,
                bpe: Some(bpe),
                cache: Mutex::new(HashMap::new()),
            })
        }
        #[cfg(not(feature = "exact-tokenizer"))]
        {
            Err(SqueezeError::Config(
                "exact tokenizer requires the exact-tokenizer feature".to_string(),
            ))
        }
    }

    /// Exact when available, heuristic otherwise.
    pub fn auto() -> Self {
        match Self::exact() {
            Ok(counter) => counter,
            Err(e) => {
                tracing::debug!(error = %e, "exact tokenizer unavailable, using word heuristic");
                Self::heuristic()
            }
        }
    }

    pub fn mode(&self) -> TokenizerMode {
        self.mode
    }

    /// Count the tokens in `text`.
    pub fn count(&self, text: &str) -> usize {
        let mut key = [0u8; 32];
        key.copy_from_slice(&Sha256::digest(text.as_bytes()));
        if let Some(&n) = self.lock().get(&key) {
            return n;
        }
        let n = self.count_uncached(text);
        self.lock().insert(key, n);
        n
    }

    /// Number of distinct texts counted so far.
    pub fn cached_entries(&self) -> usize {
        self.lock().len()
    }

    fn count_uncached(&self, text: &str) -> usize {
        #[cfg(feature = "exact-tokenizer")]
        if let Some(bpe) = &self.bpe {
            return bpe.encode_with_special_tokens(text).len();
        }
        heuristic_count(text)
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<[u8; 32], usize>> {
        self.cache.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl std::fmt::Debug for TokenCounter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokenCounter")
            .field("mode", &self.mode)
            .field("cached_entries", &self.cached_entries())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn heuristic_scales_words() {
        assert_eq!(heuristic_count(""), 0);
        assert_eq!(heuristic_count("one"), 2);
        assert_eq!(heuristic_count("one two three"), 4);
        assert_eq!(heuristic_count("a b c d e f"), 8);
        assert_eq!(heuristic_count("  spaced\n\tout  words "), 4);
    }

    #[test]
    fn heuristic_counter_reports_mode() {
        let counter = TokenCounter::heuristic();
        assert_eq!(counter.mode(), TokenizerMode::Heuristic);
        assert_eq!(counter.count("one two three"), 4);
    }

    #[test]
    fn identical_text_is_counted_once() {
        let counter = TokenCounter::heuristic();
        counter.count("alpha beta");
        counter.count("alpha beta");
        counter.count("gamma");
        assert_eq!(counter.cached_entries(), 2);
    }

    #[cfg(feature = "exact-tokenizer")]
    #[test]
    fn exact_counter_uses_bpe() {
        let counter = TokenCounter::exact().unwrap();
        assert_eq!(counter.mode(), TokenizerMode::Exact);
        assert!(counter.count("hello world") > 0);
    }

    #[cfg(not(feature = "exact-tokenizer"))]
    #[test]
    fn auto_falls_back_without_feature() {
        assert_eq!(TokenCounter::auto().mode(), TokenizerMode::Heuristic);
    }
}
