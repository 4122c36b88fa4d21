//! Structure-aware chunker.
//!
//! Packs the blocks of a parsed [`Document`] into [`Chunk`]s sized for a
//! token window, without ever cutting through a block.
//!
//! # Algorithm
//!
//! 1. Group blocks into units: a heading (or run of headings) always travels
//!    with the block that follows it.
//! 2. Append units to the current chunk while it stays within `max_tokens`.
//!    Once the chunk holds at least `min_tokens`, a unit that opens with a
//!    heading starts a new chunk, so chunks tend to follow sections.
//! 3. When a unit does not fit, close the current chunk. A chunk still below
//!    `min_tokens` is folded into the previous chunk instead, if the two fit
//!    together.
//! 4. A unit larger than `max_tokens` becomes its own oversized chunk; it is
//!    never force-split.
//!
//! Each chunk gets a stable id `ch_{index:05}_{hash10}` where `hash10` is the
//! first ten hex digits of the SHA-256 of its whitespace-normalized,
//! lower-cased text.
//!
//! # Example
//!
//! ```rust
//! use context_squeeze_core::chunk::{split_text, ChunkWindow};
//! use context_squeeze_core::tokens::TokenCounter;
//!
//! let counter = TokenCounter::heuristic();
//! let chunks = split_text("# Hello\n\nSecond paragraph.\n", &ChunkWindow::default(), &counter).unwrap();
//! assert_eq!(chunks.len(), 1);
//! assert_eq!(chunks[0].index, 0);
//! assert!(chunks[0].id.starts_with("ch_00000_"));
//! ```

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::blocks;
use crate::error::Result;
use crate::models::{Block, BlockKind, Chunk, Document};
use crate::tokens::TokenCounter;

/// Target token window for chunk packing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ChunkWindow {
    pub min_tokens: usize,
    pub max_tokens: usize,
}

impl Default for ChunkWindow {
    fn default() -> Self {
        Self {
            min_tokens: 2000,
            max_tokens: 4000,
        }
    }
}

/// Parse and split `text` in one step. Fails with
/// [`SqueezeError::Structural`](crate::error::SqueezeError::Structural) on an
/// unterminated code fence.
pub fn split_text(text: &str, window: &ChunkWindow, counter: &TokenCounter) -> Result<Vec<Chunk>> {
    let document = blocks::parse(text)?;
    Ok(split(&document, window, counter))
}

/// Split a parsed document into chunks in document order.
pub fn split(document: &Document, window: &ChunkWindow, counter: &TokenCounter) -> Vec<Chunk> {
    let mut packed: Vec<Pending> = Vec::new();
    let mut current = Pending::default();

    for unit in units(document.blocks()) {
        let tokens: usize = unit.iter().map(|b| counter.count(&b.text)).sum();

        if current.blocks.is_empty() {
            current.push(unit, tokens);
            continue;
        }

        let opens_section = unit.first().map(|b| b.kind) == Some(BlockKind::Heading);
        if opens_section && current.tokens >= window.min_tokens {
            close(&mut packed, std::mem::take(&mut current), window);
            current.push(unit, tokens);
            continue;
        }

        if current.tokens + tokens <= window.max_tokens {
            current.push(unit, tokens);
            continue;
        }

        close(&mut packed, std::mem::take(&mut current), window);
        current.push(unit, tokens);
    }

    if !current.blocks.is_empty() {
        close(&mut packed, current, window);
    }

    packed
        .into_iter()
        .enumerate()
        .map(|(index, pending)| make_chunk(index, pending.blocks, counter))
        .collect()
}

#[derive(Default)]
struct Pending {
    blocks: Vec<Block>,
    tokens: usize,
}

impl Pending {
    fn push(&mut self, unit: Vec<Block>, tokens: usize) {
        self.blocks.extend(unit);
        self.tokens += tokens;
    }
}

/// Close a pending chunk, folding an undersized one into its predecessor.
fn close(packed: &mut Vec<Pending>, pending: Pending, window: &ChunkWindow) {
    if pending.tokens < window.min_tokens {
        if let Some(prev) = packed.last_mut() {
            if prev.tokens + pending.tokens <= window.max_tokens {
                prev.blocks.extend(pending.blocks);
                prev.tokens += pending.tokens;
                return;
            }
        }
    }
    packed.push(pending);
}

/// Group blocks so that headings stay attached to what follows them.
fn units(blocks: &[Block]) -> Vec<Vec<Block>> {
    let mut units = Vec::new();
    let mut current: Vec<Block> = Vec::new();
    for block in blocks {
        let is_heading = block.kind == BlockKind::Heading;
        current.push(block.clone());
        if !is_heading {
            units.push(std::mem::take(&mut current));
        }
    }
    if !current.is_empty() {
        units.push(current);
    }
    units
}

fn make_chunk(index: usize, blocks: Vec<Block>, counter: &TokenCounter) -> Chunk {
    let text: String = blocks.iter().map(|b| b.text.as_str()).collect();
    let tokens = counter.count(&text);
    let first_kind = blocks.first().map(|b| b.kind);
    let kind = if blocks.iter().all(|b| Some(b.kind) == first_kind) {
        first_kind
    } else {
        None
    };
    let start = blocks.first().map(|b| b.start).unwrap_or(0);
    let end = blocks.last().map(|b| b.end).unwrap_or(0);

    Chunk {
        id: chunk_id(index, &text),
        index,
        kind,
        start,
        end,
        blocks,
        text,
        original_tokens: tokens,
        token_count: tokens,
        relevance: None,
        attempts: 0,
        compressed: false,
        reducible: true,
    }
}

/// Stable chunk id from position and normalized content.
pub fn chunk_id(index: usize, text: &str) -> String {
    let normalized = text
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_lowercase();
    let digest = format!("{:x}", Sha256::digest(normalized.as_bytes()));
    format!("ch_{:05}_{}", index, &digest[..10])
}
