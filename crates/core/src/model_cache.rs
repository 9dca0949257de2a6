//! Persistent model-blob storage keyed by `ModelDescriptor::key`.
//!
//! Caches never fail to the caller: any storage error is logged and treated
//! as a miss (for reads) or a no-op (for writes).

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use sha2::{Digest, Sha256};
use tracing::{debug, warn};

pub trait ModelCache: Send + Sync {
    fn get(&self, key: &str) -> Option<Vec<u8>>;
    fn put(&self, key: &str, bytes: &[u8]);
}

/// Summary row for one cached blob.
#[derive(Debug, Clone, PartialEq)]
pub struct CachedBlobInfo {
    pub key: String,
    pub byte_len: u64,
    pub stored_at: DateTime<Utc>,
}

/// Single-file SQLite store, one row per key.
#[derive(Debug, Clone)]
pub struct SqliteModelCache {
    db_path: PathBuf,
}

impl SqliteModelCache {
    /// Open (or lazily create) the cache at `db_path`. Never fails; an
    /// unusable path makes every later operation a logged miss.
    pub fn open(db_path: impl Into<PathBuf>) -> Self {
        let cache = Self {
            db_path: db_path.into(),
        };
        if let Some(parent) = cache.db_path.parent() {
            if let Err(err) = std::fs::create_dir_all(parent) {
                warn!(path = %parent.display(), error = %err, "Failed to create model cache directory");
            }
        }
        if let Err(err) = cache.with_connection(|_| Ok(())) {
            warn!(error = %format!("{err:#}"), "Model cache unavailable, continuing without it");
        }
        cache
    }

    pub fn db_path(&self) -> &Path {
        &self.db_path
    }

    pub fn entries(&self) -> Result<Vec<CachedBlobInfo>> {
        self.with_connection(|conn| {
            let mut stmt = conn
                .prepare("SELECT key, byte_len, stored_at FROM model_blobs ORDER BY key ASC")?;
            let rows = stmt.query_map([], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, i64>(1)?,
                    row.get::<_, String>(2)?,
                ))
            })?;

            let mut entries = Vec::new();
            for row in rows {
                let (key, byte_len, stored_at) = row?;
                let stored_at = match DateTime::parse_from_rfc3339(&stored_at) {
                    Ok(ts) => ts.with_timezone(&Utc),
                    Err(err) => {
                        warn!(key = %key, error = %err, "Skipping cached blob with invalid timestamp");
                        continue;
                    }
                };
                entries.push(CachedBlobInfo {
                    key,
                    byte_len: byte_len.max(0) as u64,
                    stored_at,
                });
            }
            Ok(entries)
        })
    }

    fn try_get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        self.with_connection(|conn| {
            let row = conn
                .query_row(
                    "SELECT bytes, byte_len, sha256 FROM model_blobs WHERE key = ?1",
                    params![key],
                    |row| {
                        Ok((
                            row.get::<_, Vec<u8>>(0)?,
                            row.get::<_, i64>(1)?,
                            row.get::<_, String>(2)?,
                        ))
                    },
                )
                .optional()
                .with_context(|| format!("failed to read cached model {key}"))?;

            let Some((bytes, byte_len, digest)) = row else {
                return Ok(None);
            };

            if bytes.len() as i64 != byte_len {
                warn!(key = %key, expected = byte_len, actual = bytes.len(), "Cached model length mismatch, treating as miss");
                return Ok(None);
            }
            if sha256_hex(&bytes) != digest {
                warn!(key = %key, "Cached model digest mismatch, treating as miss");
                return Ok(None);
            }

            Ok(Some(bytes))
        })
    }

    fn try_put(&self, key: &str, bytes: &[u8]) -> Result<()> {
        self.with_connection(|conn| {
            conn.execute(
                "INSERT INTO model_blobs (key, bytes, byte_len, sha256, stored_at)
                 VALUES (?1, ?2, ?3, ?4, ?5)
                 ON CONFLICT(key) DO UPDATE SET
                    bytes = excluded.bytes,
                    byte_len = excluded.byte_len,
                    sha256 = excluded.sha256,
                    stored_at = excluded.stored_at",
                params![
                    key,
                    bytes,
                    bytes.len() as i64,
                    sha256_hex(bytes),
                    Utc::now().to_rfc3339(),
                ],
            )
            .with_context(|| format!("failed to store model {key}"))?;
            Ok(())
        })
    }

    fn with_connection<T>(&self, op: impl FnOnce(&Connection) -> Result<T>) -> Result<T> {
        let conn = Connection::open(&self.db_path).with_context(|| {
            format!("failed to open model cache: {}", self.db_path.display())
        })?;
        conn.busy_timeout(Duration::from_secs(5))
            .context("failed to set model cache busy timeout")?;
        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             CREATE TABLE IF NOT EXISTS model_blobs (
                key TEXT PRIMARY KEY,
                bytes BLOB NOT NULL,
                byte_len INTEGER NOT NULL,
                sha256 TEXT NOT NULL,
                stored_at TEXT NOT NULL
             );",
        )
        .with_context(|| {
            format!(
                "failed to initialize model cache schema: {}",
                self.db_path.display()
            )
        })?;
        op(&conn)
    }
}

impl ModelCache for SqliteModelCache {
    fn get(&self, key: &str) -> Option<Vec<u8>> {
        match self.try_get(key) {
            Ok(Some(bytes)) => {
                debug!(key = %key, bytes = bytes.len(), "Model cache hit");
                Some(bytes)
            }
            Ok(None) => {
                debug!(key = %key, "Model cache miss");
                None
            }
            Err(err) => {
                warn!(key = %key, error = %format!("{err:#}"), "Model cache read failed, treating as miss");
                None
            }
        }
    }

    fn put(&self, key: &str, bytes: &[u8]) {
        if let Err(err) = self.try_put(key, bytes) {
            warn!(key = %key, error = %format!("{err:#}"), "Model cache write failed, continuing without caching");
        }
    }
}

/// Process-local cache. Contents are lost on drop.
#[derive(Debug, Default)]
pub struct MemoryModelCache {
    blobs: Mutex<HashMap<String, Vec<u8>>>,
}

impl MemoryModelCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.blobs.lock().map(|b| b.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl ModelCache for MemoryModelCache {
    fn get(&self, key: &str) -> Option<Vec<u8>> {
        match self.blobs.lock() {
            Ok(blobs) => blobs.get(key).cloned(),
            Err(_) => {
                warn!(key = %key, "Memory model cache poisoned, treating as miss");
                None
            }
        }
    }

    fn put(&self, key: &str, bytes: &[u8]) {
        match self.blobs.lock() {
            Ok(mut blobs) => {
                blobs.insert(key.to_string(), bytes.to_vec());
            }
            Err(_) => warn!(key = %key, "Memory model cache poisoned, skipping write"),
        }
    }
}

pub(crate) fn sha256_hex(bytes: &[u8]) -> String {
    format!("{:x}", Sha256::digest(bytes))
}
