//! SQLite-backed [`CacheStore`].
//!
//! One table, `cache_entries`, keyed by fingerprint. Writes are
//! `INSERT OR REPLACE`, so racing writers on the same fingerprint resolve to
//! last-write-wins. Rows that cannot be decoded are reported as errors,
//! which [`lookup`](context_squeeze_core::cache::lookup) turns into misses.
//!
//! Besides the trait, this module carries the maintenance operations a front
//! end needs: [`stats`](SqliteCache::stats),
//! [`prune_older_than`](SqliteCache::prune_older_than),
//! [`clear`](SqliteCache::clear) and [`export_json`](SqliteCache::export_json).

use std::fmt;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use sqlx::{Row, SqlitePool};

use context_squeeze_core::cache::{CacheEntry, CacheKind, CacheStore};
use context_squeeze_core::stitch::format_number;

use crate::{db, migrate};

pub struct SqliteCache {
    pool: SqlitePool,
    path: PathBuf,
}

impl SqliteCache {
    /// Open the cache database at `path`, creating the schema if needed.
    pub async fn open(path: &Path) -> Result<Self> {
        let pool = db::connect(path).await?;
        migrate::run_migrations(&pool)
            .await
            .with_context(|| format!("Failed to migrate cache database: {}", path.display()))?;
        Ok(Self {
            pool,
            path: path.to_path_buf(),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }

    /// Entry counts, payload size and age range.
    pub async fn stats(&self) -> Result<CacheStats> {
        let rows = sqlx::query(
            r#"
            SELECT kind, COUNT(*) AS entries, COALESCE(SUM(LENGTH(payload)), 0) AS bytes
            FROM cache_entries
            GROUP BY kind
            ORDER BY entries DESC
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        let mut by_kind = Vec::with_capacity(rows.len());
        let mut total_entries = 0i64;
        let mut payload_bytes = 0i64;
        for row in &rows {
            let entries: i64 = row.get("entries");
            let bytes: i64 = row.get("bytes");
            total_entries += entries;
            payload_bytes += bytes;
            by_kind.push(KindStats {
                kind: row.get("kind"),
                entries,
                payload_bytes: bytes,
            });
        }

        let (oldest, newest): (Option<i64>, Option<i64>) =
            sqlx::query_as("SELECT MIN(created_at), MAX(created_at) FROM cache_entries")
                .fetch_one(&self.pool)
                .await?;

        let db_size_bytes = std::fs::metadata(&self.path).map(|m| m.len()).unwrap_or(0);

        Ok(CacheStats {
            path: self.path.clone(),
            total_entries,
            payload_bytes,
            db_size_bytes,
            oldest,
            newest,
            by_kind,
        })
    }

    /// Delete entries created more than `days` days ago. Returns the number
    /// of rows removed.
    pub async fn prune_older_than(&self, days: u32) -> Result<u64> {
        let cutoff = Utc::now().timestamp() - i64::from(days) * 86_400;
        let result = sqlx::query("DELETE FROM cache_entries WHERE created_at < ?")
            .bind(cutoff)
            .execute(&self.pool)
            .await?;
        tracing::info!(days, removed = result.rows_affected(), "pruned cache");
        Ok(result.rows_affected())
    }

    /// Delete every entry. Returns the number of rows removed.
    pub async fn clear(&self) -> Result<u64> {
        let result = sqlx::query("DELETE FROM cache_entries")
            .execute(&self.pool)
            .await?;
        tracing::info!(removed = result.rows_affected(), "cleared cache");
        Ok(result.rows_affected())
    }

    /// Write every decodable entry to `path` as a JSON array, oldest first.
    /// Undecodable rows are skipped. Returns the number of entries written.
    pub async fn export_json(&self, path: &Path) -> Result<usize> {
        let rows = sqlx::query(
            "SELECT fingerprint, kind, payload, created_at FROM cache_entries ORDER BY created_at, fingerprint",
        )
        .fetch_all(&self.pool)
        .await?;

        let entries: Vec<CacheEntry> = rows
            .iter()
            .filter_map(|row| match decode_row(row) {
                Ok(entry) => Some(entry),
                Err(e) => {
                    tracing::warn!(error = %e, "skipping undecodable cache row");
                    None
                }
            })
            .collect();

        let json = serde_json::to_string_pretty(&entries)?;
        std::fs::write(path, json)
            .with_context(|| format!("Failed to write cache export: {}", path.display()))?;
        Ok(entries.len())
    }
}

fn decode_row(row: &sqlx::sqlite::SqliteRow) -> Result<CacheEntry> {
    let fingerprint: String = row.try_get("fingerprint")?;
    let kind_raw: String = row.try_get("kind")?;
    let kind = CacheKind::parse(&kind_raw)
        .ok_or_else(|| anyhow::anyhow!("unknown cache entry kind '{}'", kind_raw))?;
    let payload: String = row.try_get("payload")?;
    let created_at: i64 = row.try_get("created_at")?;
    let created_at = DateTime::from_timestamp(created_at, 0)
        .ok_or_else(|| anyhow::anyhow!("invalid created_at timestamp {}", created_at))?;
    Ok(CacheEntry {
        fingerprint,
        kind,
        payload,
        created_at,
    })
}

#[async_trait]
impl CacheStore for SqliteCache {
    async fn get(&self, fingerprint: &str) -> Result<Option<CacheEntry>> {
        let row = sqlx::query(
            "SELECT fingerprint, kind, payload, created_at FROM cache_entries WHERE fingerprint = ?",
        )
        .bind(fingerprint)
        .fetch_optional(&self.pool)
        .await?;

        row.as_ref().map(decode_row).transpose()
    }

    async fn put(&self, entry: &CacheEntry) -> Result<()> {
        sqlx::query(
            r#"
            INSERT OR REPLACE INTO cache_entries (fingerprint, kind, payload, created_at)
            VALUES (?, ?, ?, ?)
            "#,
        )
        .bind(&entry.fingerprint)
        .bind(entry.kind.as_str())
        .bind(&entry.payload)
        .bind(entry.created_at.timestamp())
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

/// Per-kind breakdown in [`CacheStats`].
#[derive(Debug, Clone, Serialize)]
pub struct KindStats {
    pub kind: String,
    pub entries: i64,
    pub payload_bytes: i64,
}

/// Summary of the cache database.
#[derive(Debug, Clone, Serialize)]
pub struct CacheStats {
    pub path: PathBuf,
    pub total_entries: i64,
    pub payload_bytes: i64,
    pub db_size_bytes: u64,
    /// Unix timestamps.
    pub oldest: Option<i64>,
    pub newest: Option<i64>,
    pub by_kind: Vec<KindStats>,
}

impl fmt::Display for CacheStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Compression Cache")?;
        writeln!(f, "=================")?;
        writeln!(f)?;
        writeln!(f, "  Database:    {}", self.path.display())?;
        writeln!(f, "  Size:        {}", format_bytes(self.db_size_bytes))?;
        writeln!(f, "  Entries:     {}", format_number(self.total_entries.max(0) as u64))?;
        writeln!(
            f,
            "  Payloads:    {}",
            format_bytes(self.payload_bytes.max(0) as u64)
        )?;
        if let (Some(oldest), Some(newest)) = (self.oldest, self.newest) {
            writeln!(f, "  Oldest:      {}", format_ts_relative(oldest))?;
            writeln!(f, "  Newest:      {}", format_ts_relative(newest))?;
        }

        if !self.by_kind.is_empty() {
            writeln!(f)?;
            writeln!(f, "  {:<10} {:>10} {:>12}", "KIND", "ENTRIES", "PAYLOAD")?;
            writeln!(f, "  {}", "-".repeat(34))?;
            for k in &self.by_kind {
                writeln!(
                    f,
                    "  {:<10} {:>10} {:>12}",
                    k.kind,
                    format_number(k.entries.max(0) as u64),
                    format_bytes(k.payload_bytes.max(0) as u64)
                )?;
            }
        }
        Ok(())
    }
}

/// Format a byte count as a human-readable string.
fn format_bytes(bytes: u64) -> String {
    if bytes < 1024 {
        format!("{} B", bytes)
    } else if bytes < 1024 * 1024 {
        format!("{:.1} KB", bytes as f64 / 1024.0)
    } else if bytes < 1024 * 1024 * 1024 {
        format!("{:.1} MB", bytes as f64 / (1024.0 * 1024.0))
    } else {
        format!("{:.2} GB", bytes as f64 / (1024.0 * 1024.0 * 1024.0))
    }
}

/// Format a Unix timestamp as a relative time string (e.g. "3 hours ago").
fn format_ts_relative(ts: i64) -> String {
    let delta = Utc::now().timestamp() - ts;

    if delta < 0 {
        return format_ts_iso(ts);
    }

    if delta < 60 {
        "just now".to_string()
    } else if delta < 3600 {
        let mins = delta / 60;
        format!("{} min{} ago", mins, if mins == 1 { "" } else { "s" })
    } else if delta < 86400 {
        let hours = delta / 3600;
        format!("{} hour{} ago", hours, if hours == 1 { "" } else { "s" })
    } else if delta < 86400 * 30 {
        let days = delta / 86400;
        format!("{} day{} ago", days, if days == 1 { "" } else { "s" })
    } else {
        format_ts_iso(ts)
    }
}

fn format_ts_iso(ts: i64) -> String {
    DateTime::from_timestamp(ts, 0)
        .map(|dt| dt.format("%Y-%m-%d %H:%M").to_string())
        .unwrap_or_else(|| ts.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bytes_are_humanized() {
        assert_eq!(format_bytes(512), "512 B");
        assert_eq!(format_bytes(2048), "2.0 KB");
        assert_eq!(format_bytes(5 * 1024 * 1024), "5.0 MB");
    }

    #[test]
    fn recent_timestamps_are_relative() {
        let now = Utc::now().timestamp();
        assert_eq!(format_ts_relative(now), "just now");
        assert_eq!(format_ts_relative(now - 7200), "2 hours ago");
        assert_eq!(format_ts_relative(now - 86400), "1 day ago");
    }
}
