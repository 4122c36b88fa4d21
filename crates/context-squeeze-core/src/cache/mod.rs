//! Content-addressed result cache.
//!
//! The [`CacheStore`] trait is the only state shared between concurrent
//! compression jobs. Entries are keyed by a [`Fingerprint`] and never
//! mutated in place: a changed input produces a different fingerprint, and
//! two writers racing on the same fingerprint store equivalent payloads, so
//! last-write-wins is fine and no locking beyond atomic get/put is needed.
//!
//! Three kinds of entries are stored:
//!
//! | Kind | Fingerprint over | Payload |
//! |------|------------------|---------|
//! | [`CacheKind::Result`] | document, intent, reduction, models, config version | full output + stats |
//! | [`CacheKind::Rating`] | chunk text, intent, rating model | relevance score |
//! | [`CacheKind::Shrink`] | chunk text, budget, intent, compression model | shortened text |
//!
//! Implementations must be `Send + Sync` to work with async runtimes.

pub mod memory;

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// What a cache entry holds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CacheKind {
    Result,
    Rating,
    Shrink,
}

impl CacheKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            CacheKind::Result => "result",
            CacheKind::Rating => "rating",
            CacheKind::Shrink => "shrink",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "result" => Some(CacheKind::Result),
            "rating" => Some(CacheKind::Rating),
            "shrink" => Some(CacheKind::Shrink),
            _ => None,
        }
    }
}

/// A stored payload. Read-only once written.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheEntry {
    pub fingerprint: String,
    pub kind: CacheKind,
    /// JSON or plain text, depending on `kind`.
    pub payload: String,
    pub created_at: DateTime<Utc>,
}

impl CacheEntry {
    pub fn new(fingerprint: impl Into<String>, kind: CacheKind, payload: impl Into<String>) -> Self {
        Self {
            fingerprint: fingerprint.into(),
            kind,
            payload: payload.into(),
            created_at: Utc::now(),
        }
    }
}

/// Abstract persistent key → payload store.
///
/// # Operations
///
/// | Method | Purpose |
/// |--------|---------|
/// | [`get`](CacheStore::get) | Look up a payload by fingerprint |
/// | [`put`](CacheStore::put) | Store a payload; overwriting the same fingerprint is allowed |
///
/// Callers treat any error from `get` as a miss; see [`lookup`].
#[async_trait]
pub trait CacheStore: Send + Sync {
    /// Retrieve the entry stored under `fingerprint`, if any.
    async fn get(&self, fingerprint: &str) -> Result<Option<CacheEntry>>;

    /// Store an entry. Idempotent for identical fingerprints.
    async fn put(&self, entry: &CacheEntry) -> Result<()>;
}

/// Read through the cache, treating errors and kind mismatches as misses.
pub async fn lookup(store: &dyn CacheStore, fingerprint: &str, kind: CacheKind) -> Option<CacheEntry> {
    match store.get(fingerprint).await {
        Ok(Some(entry)) if entry.kind == kind => Some(entry),
        Ok(Some(entry)) => {
            tracing::warn!(
                fingerprint = %short(fingerprint),
                expected = kind.as_str(),
                found = entry.kind.as_str(),
                "cache entry has unexpected kind, treating as miss"
            );
            None
        }
        Ok(None) => None,
        Err(e) => {
            tracing::warn!(fingerprint = %short(fingerprint), error = %e, "cache read failed, treating as miss");
            None
        }
    }
}

/// Write to the cache, logging instead of failing.
pub async fn store(store: &dyn CacheStore, entry: &CacheEntry) {
    if let Err(e) = store.put(entry).await {
        tracing::warn!(fingerprint = %short(&entry.fingerprint), error = %e, "cache write failed");
    }
}

/// First ten characters of a fingerprint, for logs.
pub fn short(fingerprint: &str) -> &str {
    &fingerprint[..fingerprint.len().min(10)]
}

/// Incremental SHA-256 fingerprint over named fields.
///
/// Each field is length-prefixed, so `("ab", "c")` and `("a", "bc")` hash
/// differently.
///
/// ```rust
/// use context_squeeze_core::cache::{CacheKind, Fingerprint};
///
/// let a = Fingerprint::new(CacheKind::Rating).field("text", "hello").finish();
/// let b = Fingerprint::new(CacheKind::Rating).field("text", "hello").finish();
/// assert_eq!(a, b);
/// assert_eq!(a.len(), 64);
/// ```
pub struct Fingerprint {
    hasher: Sha256,
}

impl Fingerprint {
    pub fn new(kind: CacheKind) -> Self {
        let mut fp = Self {
            hasher: Sha256::new(),
        };
        fp.write("kind", kind.as_str().as_bytes());
        fp
    }

    pub fn field(mut self, name: &str, value: impl AsRef<[u8]>) -> Self {
        self.write(name, value.as_ref());
        self
    }

    /// Floats are hashed through their shortest round-trip representation.
    pub fn float(self, name: &str, value: f64) -> Self {
        self.field(name, format!("{:?}", value))
    }

    pub fn finish(self) -> String {
        format!("{:x}", self.hasher.finalize())
    }

    fn write(&mut self, name: &str, value: &[u8]) {
        self.hasher.update((name.len() as u64).to_le_bytes());
        self.hasher.update(name.as_bytes());
        self.hasher.update((value.len() as u64).to_le_bytes());
        self.hasher.update(value);
    }
}

/// Normalize document text before fingerprinting: CRLF → LF, outer
/// whitespace trimmed.
pub fn normalize_text(text: &str) -> String {
    text.replace("\r\n", "\n").trim().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fields_are_unambiguous() {
        let a = Fingerprint::new(CacheKind::Result)
            .field("a", "ab")
            .field("b", "c")
            .finish();
        let b = Fingerprint::new(CacheKind::Result)
            .field("a", "a")
            .field("b", "bc")
            .finish();
        assert_ne!(a, b);
    }

    #[test]
    fn kind_is_part_of_fingerprint() {
        let a = Fingerprint::new(CacheKind::Rating).field("t", "x").finish();
        let b = Fingerprint::new(CacheKind::Shrink).field("t", "x").finish();
        assert_ne!(a, b);
    }

    #[test]
    fn floats_distinguish_close_values() {
        let a = Fingerprint::new(CacheKind::Result).float("r", 0.3).finish();
        let b = Fingerprint::new(CacheKind::Result).float("r", 0.30000001).finish();
        assert_ne!(a, b);
    }

    #[test]
    fn normalization_ignores_line_endings_and_margins() {
        assert_eq!(normalize_text("\r\n# A\r\nbody\r\n\r\n"), "# A\nbody");
    }

    #[test]
    fn kind_round_trips_through_str() {
        for kind in [CacheKind::Result, CacheKind::Rating, CacheKind::Shrink] {
            assert_eq!(CacheKind::parse(kind.as_str()), Some(kind));
        }
        assert_eq!(CacheKind::parse("other"), None);
    }
}
