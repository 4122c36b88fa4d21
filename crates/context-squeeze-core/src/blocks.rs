//! Markdown block parser.
//!
//! Splits a document into headings, fenced code blocks, list items, tables
//! and paragraphs. The parser is deliberately small: it only needs to know
//! where it is safe to cut, not how to render anything.
//!
//! # Guarantees
//!
//! - Concatenating the text of all blocks reproduces the input byte for byte.
//!   Blank lines belong to the block before them; leading blank lines belong
//!   to the first block.
//! - A fenced code block is always a single block. An unterminated fence is a
//!   [`SqueezeError::Structural`] error.
//! - A list item keeps its continuation lines, nested items and indented
//!   fences.
//!
//! [`verify_structure`] checks that a rewritten chunk still carries every
//! fence, heading, table and list item of the original, which is how
//! shortened text is vetted before it replaces a chunk.

use thiserror::Error;

use crate::error::{Result, SqueezeError};
use crate::models::{Block, BlockKind, Document};

/// Parse `text` into a [`Document`].
pub fn parse(text: &str) -> Result<Document> {
    let lines = split_lines(text);
    let marks = scan(&lines)?.marks;

    let mut blocks = Vec::with_capacity(marks.len().max(1));
    for (n, &(line_idx, kind)) in marks.iter().enumerate() {
        let start = if n == 0 { 0 } else { lines[line_idx].0 };
        let end = marks
            .get(n + 1)
            .map(|&(next, _)| lines[next].0)
            .unwrap_or(text.len());
        blocks.push(Block {
            kind,
            start,
            end,
            line: line_idx + 1,
            text: text[start..end].to_string(),
        });
    }

    // Whitespace-only input still has to round-trip.
    if blocks.is_empty() && !text.is_empty() {
        blocks.push(Block {
            kind: BlockKind::Paragraph,
            start: 0,
            end: text.len(),
            line: 1,
            text: text.to_string(),
        });
    }

    Ok(Document::from_parts(text.to_string(), blocks))
}

/// Lines with their byte offsets; each line keeps its trailing `\n`.
fn split_lines(text: &str) -> Vec<(usize, &str)> {
    let mut offset = 0;
    text.split_inclusive('\n')
        .map(|line| {
            let start = offset;
            offset += line.len();
            (start, line)
        })
        .collect()
}

/// Line-level layout of a document.
#[derive(Debug, Default)]
struct Scan {
    /// First line and kind of every block.
    marks: Vec<(usize, BlockKind)>,
    /// Opening and closing line of every fence, including fences nested in
    /// list items.
    fences: Vec<(usize, usize)>,
    /// Marker indentation of every list item, one entry per run of
    /// consecutive list blocks.
    lists: Vec<Vec<usize>>,
}

fn scan(lines: &[(usize, &str)]) -> Result<Scan> {
    let n = lines.len();
    let mut out = Scan::default();
    let mut i = 0;

    while i < n {
        let line = lines[i].1;

        if is_blank(line) {
            i += 1;
            continue;
        }

        if let Some(fence) = fence_open(line, 3) {
            let close = close_fence(lines, i, fence)?;
            out.marks.push((i, BlockKind::Code));
            out.fences.push((i, close));
            i = close + 1;
            continue;
        }

        if is_heading(line) {
            out.marks.push((i, BlockKind::Heading));
            i += 1;
            continue;
        }

        if let Some(indent) = list_marker(line) {
            if indent <= 3 {
                if !matches!(out.marks.last(), Some((_, BlockKind::List))) {
                    out.lists.push(Vec::new());
                }
                out.marks.push((i, BlockKind::List));
                i = end_of_list_item(lines, i, indent, &mut out)?;
                continue;
            }
        }

        if is_table_row(line) {
            out.marks.push((i, BlockKind::Table));
            i = end_of_table(lines, i);
            continue;
        }

        out.marks.push((i, BlockKind::Paragraph));
        i += 1;
        while i < n && !is_blank(lines[i].1) && !starts_block(lines[i].1) {
            i += 1;
        }
    }

    Ok(out)
}

/// Exclusive end line of the table starting at `start`.
fn end_of_table(lines: &[(usize, &str)], start: usize) -> usize {
    let mut j = start + 1;
    while j < lines.len() && is_table_row(lines[j].1) {
        j += 1;
    }
    j
}

/// Exclusive end line of the list item starting at `start`. Records the
/// item, its nested items and its fences in `out`.
fn end_of_list_item(
    lines: &[(usize, &str)],
    start: usize,
    indent: usize,
    out: &mut Scan,
) -> Result<usize> {
    let n = lines.len();
    let mut items = vec![indent];
    let mut j = start + 1;

    while j < n {
        let line = lines[j].1;

        if is_blank(line) {
            let mut k = j;
            while k < n && is_blank(lines[k].1) {
                k += 1;
            }
            // A blank line only continues the item when indented content follows.
            if k < n && leading_spaces(lines[k].1) > indent {
                j = k;
                continue;
            }
            break;
        }

        let deeper = leading_spaces(line) > indent;

        if let Some(fence) = fence_open(line, usize::MAX) {
            if !deeper {
                break;
            }
            let close = close_fence(lines, j, fence)?;
            out.fences.push((j, close));
            j = close + 1;
            continue;
        }

        if is_heading(line) {
            break;
        }

        if let Some(nested) = list_marker(line) {
            if !deeper {
                break;
            }
            items.push(nested);
            j += 1;
            continue;
        }

        if is_table_row(line) {
            if deeper {
                j += 1;
                continue;
            }
            break;
        }

        // Lazy continuation.
        j += 1;
    }

    if let Some(list) = out.lists.last_mut() {
        list.extend(items);
    }
    Ok(j)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Fence {
    ch: char,
    len: usize,
    indent: usize,
}

fn fence_open(line: &str, max_indent: usize) -> Option<Fence> {
    let stripped = line.trim_start_matches(' ');
    let indent = line.len() - stripped.len();
    if indent > max_indent {
        return None;
    }
    let ch = stripped.chars().next()?;
    if ch != '`' && ch != '~' {
        return None;
    }
    let len = stripped.chars().take_while(|&c| c == ch).count();
    if len < 3 {
        return None;
    }
    // Backtick info strings may not contain backticks.
    if ch == '`' && stripped[len..].contains('`') {
        return None;
    }
    Some(Fence { ch, len, indent })
}

/// A closer may be indented up to three spaces, or as far as its opener
/// when that is deeper.
fn is_fence_close(line: &str, fence: Fence) -> bool {
    if leading_spaces(line) > fence.indent.max(3) {
        return false;
    }
    let stripped = line.trim_start_matches(' ');
    let run = stripped.chars().take_while(|&c| c == fence.ch).count();
    run >= fence.len && stripped[run..].trim().is_empty()
}

/// Index of the line closing the fence opened at `open`.
fn close_fence(lines: &[(usize, &str)], open: usize, fence: Fence) -> Result<usize> {
    lines
        .iter()
        .enumerate()
        .skip(open + 1)
        .find(|(_, (_, line))| is_fence_close(line, fence))
        .map(|(idx, _)| idx)
        .ok_or_else(|| SqueezeError::Structural {
            line: open + 1,
            message: "unterminated code fence".to_string(),
        })
}

fn is_blank(line: &str) -> bool {
    line.trim().is_empty()
}

fn leading_spaces(line: &str) -> usize {
    line.len() - line.trim_start_matches(' ').len()
}

fn is_heading(line: &str) -> bool {
    let stripped = line.trim_start_matches(' ');
    if line.len() - stripped.len() > 3 {
        return false;
    }
    let hashes = stripped.chars().take_while(|&c| c == '#').count();
    if !(1..=6).contains(&hashes) {
        return false;
    }
    match stripped[hashes..].chars().next() {
        None => true,
        Some(c) => c == ' ' || c == '\t' || c == '\n' || c == '\r',
    }
}

/// Indentation of a bullet or ordered list marker, if the line starts one.
fn list_marker(line: &str) -> Option<usize> {
    let stripped = line.trim_start_matches(' ');
    let indent = line.len() - stripped.len();
    let bytes = stripped.as_bytes();

    let after = match bytes.first()? {
        b'-' | b'*' | b'+' => 1,
        b'0'..=b'9' => {
            let digits = bytes.iter().take_while(|b| b.is_ascii_digit()).count();
            if digits > 9 {
                return None;
            }
            match bytes.get(digits) {
                Some(b'.') | Some(b')') => digits + 1,
                _ => return None,
            }
        }
        _ => return None,
    };

    match bytes.get(after) {
        Some(b' ') | Some(b'\t') => Some(indent),
        _ => None,
    }
}

fn is_table_row(line: &str) -> bool {
    line.trim_start().starts_with('|')
}

fn starts_block(line: &str) -> bool {
    fence_open(line, 3).is_some()
        || is_heading(line)
        || list_marker(line).map(|i| i <= 3).unwrap_or(false)
        || is_table_row(line)
}

/// The parts of a Markdown text that a rewrite has to carry over unchanged.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Outline {
    /// Fenced code blocks, trailing whitespace trimmed.
    pub fences: Vec<String>,
    /// Heading lines, trimmed.
    pub headings: Vec<String>,
    /// Tables, trimmed.
    pub tables: Vec<String>,
    /// Nesting depth of every list item, 0 for top level.
    pub list_depths: Vec<usize>,
}

impl Outline {
    /// Outline of `text`, using the same block rules as [`parse`]. An
    /// unterminated fence is an error.
    pub fn of(text: &str) -> Result<Self> {
        let lines = split_lines(text);
        let scan = scan(&lines)?;
        let span = |first: usize, last: usize| {
            let end = lines[last].0 + lines[last].1.len();
            text[lines[first].0..end].trim_end().to_string()
        };

        let fences = scan
            .fences
            .iter()
            .map(|&(open, close)| span(open, close))
            .collect();

        let mut headings = Vec::new();
        let mut tables = Vec::new();
        for &(line, kind) in &scan.marks {
            match kind {
                BlockKind::Heading => headings.push(lines[line].1.trim().to_string()),
                BlockKind::Table => {
                    tables.push(span(line, end_of_table(&lines, line) - 1).trim().to_string())
                }
                _ => {}
            }
        }

        let list_depths = scan.lists.iter().flat_map(|l| nesting_depths(l)).collect();

        Ok(Self {
            fences,
            headings,
            tables,
            list_depths,
        })
    }
}

/// Turn marker indentations into nesting depths, so re-indenting a list
/// consistently does not count as a change.
fn nesting_depths(indents: &[usize]) -> Vec<usize> {
    let mut open: Vec<usize> = Vec::new();
    indents
        .iter()
        .map(|&indent| {
            while open.last().is_some_and(|&top| top >= indent) {
                open.pop();
            }
            open.push(indent);
            open.len() - 1
        })
        .collect()
}

/// Ways a rewritten chunk can break the structure of the original.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum StructureViolation {
    #[error("rewritten text leaves a code fence unterminated")]
    UnterminatedFence,
    #[error("code fences changed: expected {expected}, found {found}")]
    FencesChanged { expected: usize, found: usize },
    #[error("headings changed: expected {expected:?}, found {found:?}")]
    HeadingsChanged {
        expected: Vec<String>,
        found: Vec<String>,
    },
    #[error("tables changed: expected {expected}, found {found}")]
    TablesChanged { expected: usize, found: usize },
    #[error("list nesting changed: expected depths {expected:?}, found {found:?}")]
    ListNestingChanged {
        expected: Vec<usize>,
        found: Vec<usize>,
    },
}

/// Check that `candidate` keeps every fenced code block and table of
/// `original` verbatim, the same heading lines in the same order, and the
/// same list items at the same nesting depths.
pub fn verify_structure(
    original: &str,
    candidate: &str,
) -> std::result::Result<(), StructureViolation> {
    let expected = Outline::of(original).unwrap_or_default();
    let found = Outline::of(candidate).map_err(|_| StructureViolation::UnterminatedFence)?;

    if expected.fences != found.fences {
        return Err(StructureViolation::FencesChanged {
            expected: expected.fences.len(),
            found: found.fences.len(),
        });
    }
    if expected.headings != found.headings {
        return Err(StructureViolation::HeadingsChanged {
            expected: expected.headings,
            found: found.headings,
        });
    }
    if expected.tables != found.tables {
        return Err(StructureViolation::TablesChanged {
            expected: expected.tables.len(),
            found: found.tables.len(),
        });
    }
    if expected.list_depths != found.list_depths {
        return Err(StructureViolation::ListNestingChanged {
            expected: expected.list_depths,
            found: found.list_depths,
        });
    }
    Ok(())
}

/// Give `candidate` the leading and trailing whitespace of `original`, so a
/// rewritten chunk keeps the blank-line separation from its neighbours.
pub fn restore_margins(original: &str, candidate: &str) -> String {
    let lead = &original[..original.len() - original.trim_start().len()];
    let trail = &original[original.trim_end().len()..];
    let body = candidate.trim();
    if body.is_empty() {
        return format!("{}{}", lead, trail);
    }
    format!("{}{}{}", lead, body, trail)
}
