//! Integration tests for the SQLite cache store and its maintenance
//! operations.

use chrono::{Duration, Utc};
use context_squeeze::sqlite_cache::SqliteCache;
use context_squeeze_core::cache::{lookup, CacheEntry, CacheKind, CacheStore};
use tempfile::TempDir;

async fn open(tmp: &TempDir) -> SqliteCache {
    SqliteCache::open(&tmp.path().join("nested").join("cache.sqlite"))
        .await
        .unwrap()
}

#[tokio::test]
async fn put_get_and_overwrite() {
    let tmp = TempDir::new().unwrap();
    let cache = open(&tmp).await;

    assert!(cache.get("fp1").await.unwrap().is_none());

    let entry = CacheEntry::new("fp1", CacheKind::Shrink, "short text");
    cache.put(&entry).await.unwrap();
    let got = cache.get("fp1").await.unwrap().unwrap();
    assert_eq!(got.kind, CacheKind::Shrink);
    assert_eq!(got.payload, "short text");
    assert_eq!(got.created_at.timestamp(), entry.created_at.timestamp());

    cache
        .put(&CacheEntry::new("fp1", CacheKind::Shrink, "short text"))
        .await
        .unwrap();
    let stats = cache.stats().await.unwrap();
    assert_eq!(stats.total_entries, 1);
}

#[tokio::test]
async fn reopening_keeps_entries() {
    let tmp = TempDir::new().unwrap();
    {
        let cache = open(&tmp).await;
        cache
            .put(&CacheEntry::new("fp", CacheKind::Rating, "4.5"))
            .await
            .unwrap();
        cache.close().await;
    }
    let cache = open(&tmp).await;
    let entry = lookup(&cache, "fp", CacheKind::Rating).await.unwrap();
    assert_eq!(entry.payload, "4.5");
}

#[tokio::test]
async fn stats_count_per_kind() {
    let tmp = TempDir::new().unwrap();
    let cache = open(&tmp).await;
    for (fp, kind) in [
        ("a", CacheKind::Rating),
        ("b", CacheKind::Rating),
        ("c", CacheKind::Shrink),
        ("d", CacheKind::Result),
    ] {
        cache.put(&CacheEntry::new(fp, kind, "payload")).await.unwrap();
    }

    let stats = cache.stats().await.unwrap();
    assert_eq!(stats.total_entries, 4);
    assert_eq!(stats.payload_bytes, 4 * "payload".len() as i64);
    assert_eq!(stats.by_kind[0].kind, "rating");
    assert_eq!(stats.by_kind[0].entries, 2);
    assert!(stats.oldest.is_some());
    assert!(stats.db_size_bytes > 0);

    let report = stats.to_string();
    assert!(report.contains("Entries:     4"));
    assert!(report.contains("rating"));
}

#[tokio::test]
async fn prune_removes_only_old_entries() {
    let tmp = TempDir::new().unwrap();
    let cache = open(&tmp).await;

    let mut old = CacheEntry::new("old", CacheKind::Shrink, "x");
    old.created_at = Utc::now() - Duration::days(40);
    cache.put(&old).await.unwrap();
    cache
        .put(&CacheEntry::new("new", CacheKind::Shrink, "y"))
        .await
        .unwrap();

    assert_eq!(cache.prune_older_than(30).await.unwrap(), 1);
    assert!(cache.get("old").await.unwrap().is_none());
    assert!(cache.get("new").await.unwrap().is_some());
}

#[tokio::test]
async fn clear_empties_the_cache() {
    let tmp = TempDir::new().unwrap();
    let cache = open(&tmp).await;
    cache
        .put(&CacheEntry::new("a", CacheKind::Result, "{}"))
        .await
        .unwrap();
    cache
        .put(&CacheEntry::new("b", CacheKind::Rating, "1"))
        .await
        .unwrap();

    assert_eq!(cache.clear().await.unwrap(), 2);
    assert_eq!(cache.stats().await.unwrap().total_entries, 0);
}

#[tokio::test]
async fn export_writes_decodable_entries() {
    let tmp = TempDir::new().unwrap();
    let cache = open(&tmp).await;
    cache
        .put(&CacheEntry::new("a", CacheKind::Rating, "7"))
        .await
        .unwrap();
    cache
        .put(&CacheEntry::new("b", CacheKind::Shrink, "text"))
        .await
        .unwrap();
    sqlx::query("INSERT INTO cache_entries (fingerprint, kind, payload, created_at) VALUES ('c', 'bogus', 'x', 0)")
        .execute(cache.pool())
        .await
        .unwrap();

    let out = tmp.path().join("export.json");
    assert_eq!(cache.export_json(&out).await.unwrap(), 2);

    let exported: Vec<CacheEntry> =
        serde_json::from_str(&std::fs::read_to_string(&out).unwrap()).unwrap();
    let mut fingerprints: Vec<&str> = exported.iter().map(|e| e.fingerprint.as_str()).collect();
    fingerprints.sort();
    assert_eq!(fingerprints, vec!["a", "b"]);
}

#[tokio::test]
async fn undecodable_row_reads_as_miss() {
    let tmp = TempDir::new().unwrap();
    let cache = open(&tmp).await;
    sqlx::query("INSERT INTO cache_entries (fingerprint, kind, payload, created_at) VALUES ('fp', 'bogus', 'x', 0)")
        .execute(cache.pool())
        .await
        .unwrap();

    assert!(cache.get("fp").await.is_err());
    assert!(lookup(&cache, "fp", CacheKind::Result).await.is_none());
}
