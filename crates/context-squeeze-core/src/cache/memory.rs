//! In-memory [`CacheStore`] implementation for tests and WASM targets.
//!
//! Uses a `HashMap` behind `std::sync::RwLock`. Nothing survives the
//! process.

use std::collections::HashMap;
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use anyhow::Result;
use async_trait::async_trait;

use super::{CacheEntry, CacheKind, CacheStore};

/// In-memory cache for testing and WASM environments.
pub struct InMemoryCache {
    entries: RwLock<HashMap<String, CacheEntry>>,
}

impl InMemoryCache {
    pub fn new() -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
        }
    }

    pub fn len(&self) -> usize {
        self.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.read().is_empty()
    }

    /// Number of entries of one kind.
    pub fn count(&self, kind: CacheKind) -> usize {
        self.read().values().filter(|e| e.kind == kind).count()
    }

    fn read(&self) -> RwLockReadGuard<'_, HashMap<String, CacheEntry>> {
        self.entries.read().unwrap_or_else(|p| p.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, HashMap<String, CacheEntry>> {
        self.entries.write().unwrap_or_else(|p| p.into_inner())
    }
}

impl Default for InMemoryCache {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl CacheStore for InMemoryCache {
    async fn get(&self, fingerprint: &str) -> Result<Option<CacheEntry>> {
        Ok(self.read().get(fingerprint).cloned())
    }

    async fn put(&self, entry: &CacheEntry) -> Result<()> {
        self.write()
            .insert(entry.fingerprint.clone(), entry.clone());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::lookup;

    #[tokio::test]
    async fn put_then_get() {
        let cache = InMemoryCache::new();
        assert!(cache.get("fp").await.unwrap().is_none());
        cache
            .put(&CacheEntry::new("fp", CacheKind::Shrink, "short"))
            .await
            .unwrap();
        let entry = cache.get("fp").await.unwrap().unwrap();
        assert_eq!(entry.payload, "short");
        assert_eq!(cache.count(CacheKind::Shrink), 1);
    }

    #[tokio::test]
    async fn same_fingerprint_keeps_one_entry() {
        let cache = InMemoryCache::new();
        cache
            .put(&CacheEntry::new("fp", CacheKind::Rating, "3.0"))
            .await
            .unwrap();
        cache
            .put(&CacheEntry::new("fp", CacheKind::Rating, "3.0"))
            .await
            .unwrap();
        assert_eq!(cache.len(), 1);
    }

    #[tokio::test]
    async fn lookup_rejects_wrong_kind() {
        let cache = InMemoryCache::new();
        cache
            .put(&CacheEntry::new("fp", CacheKind::Rating, "3.0"))
            .await
            .unwrap();
        assert!(lookup(&cache, "fp", CacheKind::Shrink).await.is_none());
        assert!(lookup(&cache, "fp", CacheKind::Rating).await.is_some());
    }
}
