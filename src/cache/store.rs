use std::path::Path;
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};

use anyhow::{Context, Result};
use rusqlite::{Connection, OptionalExtension, params};
use serde_json::Value;
use tracing::{debug, warn};

use super::CacheEntryRecord;

/// Persistent cache tier: a single SQLite file shared by co-located
/// runtime processes. Writes are durable before acknowledgement (WAL +
/// synchronous=NORMAL, matching the memory store's discipline); expired
/// and corrupt rows are removed opportunistically on read.
pub struct SqliteStore {
    conn: Mutex<Connection>,
    hits: AtomicU64,
    misses: AtomicU64,
}

impl SqliteStore {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).with_context(|| {
                format!("Failed to create cache parent directory: {}", parent.display())
            })?;
        }

        let conn = Connection::open(path)
            .with_context(|| format!("Failed to open cache database at: {}", path.display()))?;
        conn.execute_batch(
            "PRAGMA journal_mode=WAL;
             PRAGMA synchronous=NORMAL;
             PRAGMA busy_timeout=3000;",
        )?;
        conn.execute(
            "CREATE TABLE IF NOT EXISTS result_cache (
                namespace TEXT NOT NULL,
                version TEXT NOT NULL,
                key TEXT NOT NULL,
                value BLOB NOT NULL,
                created_at INTEGER NOT NULL,
                expires_at INTEGER NULL,
                hits INTEGER NOT NULL DEFAULT 0,
                PRIMARY KEY (namespace, version, key)
            )",
            [],
        )?;
        Ok(Self {
            conn: Mutex::new(conn),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        })
    }

    /// Look up a value and its expiry. Expired rows are deleted and
    /// reported as absent; rows that fail to parse are treated as corrupt
    /// and removed.
    pub fn get(
        &self,
        namespace: &str,
        version: &str,
        key: &str,
        now_ms: i64,
    ) -> Result<Option<(Value, Option<i64>)>> {
        let conn = self
            .conn
            .lock()
            .map_err(|e| anyhow::anyhow!("cache store lock poisoned: {}", e))?;

        let row: Option<(Vec<u8>, Option<i64>)> = conn
            .query_row(
                "SELECT value, expires_at FROM result_cache
                 WHERE namespace = ?1 AND version = ?2 AND key = ?3",
                params![namespace, version, key],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()?;

        let Some((raw, expires_at)) = row else {
            self.misses.fetch_add(1, Ordering::Relaxed);
            return Ok(None);
        };

        if expires_at.is_some_and(|at| now_ms > at) {
            conn.execute(
                "DELETE FROM result_cache WHERE namespace = ?1 AND version = ?2 AND key = ?3",
                params![namespace, version, key],
            )?;
            self.misses.fetch_add(1, Ordering::Relaxed);
            return Ok(None);
        }

        match serde_json::from_slice::<Value>(&raw) {
            Ok(value) => {
                conn.execute(
                    "UPDATE result_cache SET hits = hits + 1
                     WHERE namespace = ?1 AND version = ?2 AND key = ?3",
                    params![namespace, version, key],
                )?;
                self.hits.fetch_add(1, Ordering::Relaxed);
                Ok(Some((value, expires_at)))
            }
            Err(e) => {
                warn!(
                    "removing corrupt cache row for {}@{}: {}",
                    namespace, version, e
                );
                conn.execute(
                    "DELETE FROM result_cache WHERE namespace = ?1 AND version = ?2 AND key = ?3",
                    params![namespace, version, key],
                )?;
                self.misses.fetch_add(1, Ordering::Relaxed);
                Ok(None)
            }
        }
    }

    pub fn set(
        &self,
        namespace: &str,
        version: &str,
        key: &str,
        value: &Value,
        created_at_ms: i64,
        expires_at_ms: Option<i64>,
    ) -> Result<()> {
        let raw = serde_json::to_vec(value)?;
        let conn = self
            .conn
            .lock()
            .map_err(|e| anyhow::anyhow!("cache store lock poisoned: {}", e))?;
        conn.execute(
            "INSERT OR REPLACE INTO result_cache
                 (namespace, version, key, value, created_at, expires_at, hits)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, 0)",
            params![namespace, version, key, raw, created_at_ms, expires_at_ms],
        )?;
        Ok(())
    }

    /// Delete all rows, or only one namespace's rows when given.
    pub fn clear(&self, namespace: Option<&str>) -> Result<usize> {
        let conn = self
            .conn
            .lock()
            .map_err(|e| anyhow::anyhow!("cache store lock poisoned: {}", e))?;
        let removed = match namespace {
            Some(ns) => conn.execute("DELETE FROM result_cache WHERE namespace = ?1", params![ns])?,
            None => conn.execute("DELETE FROM result_cache", [])?,
        };
        debug!("cleared {} persistent cache rows", removed);
        Ok(removed)
    }

    /// All live (non-expired) entries, for ops tooling.
    pub fn dump(&self, now_ms: i64) -> Result<Vec<CacheEntryRecord>> {
        let conn = self
            .conn
            .lock()
            .map_err(|e| anyhow::anyhow!("cache store lock poisoned: {}", e))?;
        let mut stmt = conn.prepare(
            "SELECT namespace, version, key, value, created_at, expires_at, hits
             FROM result_cache
             WHERE expires_at IS NULL OR expires_at >= ?1
             ORDER BY namespace, created_at",
        )?;
        let rows = stmt.query_map(params![now_ms], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
                row.get::<_, Vec<u8>>(3)?,
                row.get::<_, i64>(4)?,
                row.get::<_, Option<i64>>(5)?,
                row.get::<_, i64>(6)?,
            ))
        })?;

        let mut entries = Vec::new();
        for row in rows {
            let (namespace, version, key, raw, created_at, expires_at, hits) = row?;
            let Ok(value) = serde_json::from_slice::<Value>(&raw) else {
                continue;
            };
            entries.push(CacheEntryRecord {
                namespace,
                version,
                key,
                value,
                created_at_ms: created_at,
                expires_at_ms: expires_at,
                hits: hits.max(0) as u64,
            });
        }
        Ok(entries)
    }

    pub fn len(&self) -> Result<usize> {
        let conn = self
            .conn
            .lock()
            .map_err(|e| anyhow::anyhow!("cache store lock poisoned: {}", e))?;
        let count: i64 = conn.query_row("SELECT COUNT(*) FROM result_cache", [], |row| row.get(0))?;
        Ok(count.max(0) as usize)
    }

    pub fn hit_count(&self) -> u64 {
        self.hits.load(Ordering::Relaxed)
    }

    pub fn miss_count(&self) -> u64 {
        self.misses.load(Ordering::Relaxed)
    }

    /// Flush the WAL so other processes sharing the file observe a compact
    /// database. Called from the manager's `close`.
    pub fn checkpoint(&self) {
        if let Ok(conn) = self.conn.lock()
            && let Err(e) = conn.execute_batch("PRAGMA wal_checkpoint(TRUNCATE);")
        {
            warn!("cache WAL checkpoint failed: {}", e);
        }
    }
}
