use std::path::{Path, PathBuf};

use rusqlite::{Connection, params};
use sha2::{Digest, Sha256};
use thiserror::Error;

use crate::model::TrackFact;
use crate::resolve::ResolvedTarget;

#[derive(Error, Debug)]
pub enum CacheError {
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, CacheError>;

/// A cache row proving "this source was built with these exact settings".
#[derive(Debug, Clone)]
pub struct CacheEntry {
    pub output_path: PathBuf,
    pub verified_at: String,
    pub tool_version: String,
}

/// Per-track record of the last successful verified build, keyed by a
/// hash over (source path, full resolved target, tool version). A key
/// mismatch from any settings or tool-version change is an implicit miss;
/// stale entries are simply never looked up again.
pub struct FingerprintCache {
    conn: Connection,
}

impl FingerprintCache {
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(path)?;
        let cache = Self { conn };
        cache.init()?;
        Ok(cache)
    }

    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        let cache = Self { conn };
        cache.init()?;
        Ok(cache)
    }

    fn init(&self) -> Result<()> {
        self.conn.pragma_update(None, "journal_mode", "WAL")?;
        self.conn.pragma_update(None, "synchronous", "NORMAL")?;

        let version: i32 = self
            .conn
            .pragma_query_value(None, "user_version", |row| row.get(0))
            .unwrap_or(0);

        if version < 1 {
            self.conn.execute_batch(
                "
                CREATE TABLE IF NOT EXISTS cache (
                    key_hash        TEXT PRIMARY KEY,
                    source_path     TEXT NOT NULL,
                    source_size     INTEGER NOT NULL,
                    source_mtime    INTEGER NOT NULL,
                    output_path     TEXT NOT NULL,
                    tool_version    TEXT NOT NULL,
                    verified_at     TEXT NOT NULL
                );
                CREATE INDEX IF NOT EXISTS idx_cache_source ON cache(source_path);
                CREATE INDEX IF NOT EXISTS idx_cache_output ON cache(output_path);
                ",
            )?;
        }

        self.conn.pragma_update(None, "user_version", 1)?;
        Ok(())
    }

    /// Look up an entry for (source, resolved target). Returns Some only
    /// when the stored fingerprint matches the file's current size+mtime.
    /// Callers must still re-verify the recorded output before trusting
    /// the hit; presence alone is never enough.
    pub fn lookup(
        &self,
        fact: &TrackFact,
        target: &ResolvedTarget,
        tool_version: &str,
    ) -> Result<Option<CacheEntry>> {
        let key = cache_key(&fact.path, target, tool_version);

        let row: Option<(i64, i64, String, String, String)> = self
            .conn
            .query_row(
                "SELECT source_size, source_mtime, output_path, tool_version, verified_at
                 FROM cache WHERE key_hash = ?1",
                params![key],
                |row| {
                    Ok((
                        row.get(0)?,
                        row.get(1)?,
                        row.get(2)?,
                        row.get(3)?,
                        row.get(4)?,
                    ))
                },
            )
            .map(Some)
            .or_else(|e| match e {
                rusqlite::Error::QueryReturnedNoRows => Ok(None),
                other => Err(other),
            })?;

        let Some((size, mtime, output_path, tool, verified_at)) = row else {
            return Ok(None);
        };

        // Source drifted since the recorded build → miss
        if size as u64 != fact.size_bytes || mtime != fact.mtime_unix {
            return Ok(None);
        }

        Ok(Some(CacheEntry {
            output_path: PathBuf::from(output_path),
            verified_at,
            tool_version: tool,
        }))
    }

    /// Record a successful verified build. Failures never reach this.
    pub fn record_success(
        &self,
        fact: &TrackFact,
        target: &ResolvedTarget,
        tool_version: &str,
        output_path: &Path,
    ) -> Result<()> {
        let key = cache_key(&fact.path, target, tool_version);
        self.conn.execute(
            "INSERT OR REPLACE INTO cache
             (key_hash, source_path, source_size, source_mtime, output_path, tool_version, verified_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                key,
                fact.path.to_string_lossy().into_owned(),
                fact.size_bytes as i64,
                fact.mtime_unix,
                output_path.to_string_lossy().into_owned(),
                tool_version,
                chrono::Utc::now().to_rfc3339(),
            ],
        )?;
        Ok(())
    }

    /// Drop every entry for a source file, regardless of settings.
    pub fn invalidate(&self, source_path: &Path) -> Result<usize> {
        let n = self.conn.execute(
            "DELETE FROM cache WHERE source_path = ?1",
            params![source_path.to_string_lossy().into_owned()],
        )?;
        Ok(n)
    }

    pub fn entry_count(&self) -> Result<i64> {
        let n = self
            .conn
            .query_row("SELECT COUNT(*) FROM cache", [], |row| row.get(0))?;
        Ok(n)
    }
}

/// Structurally complete cache key: the path, every resolved-target field,
/// and the tool version. Policy changes can never be served stale output.
fn cache_key(source_path: &Path, target: &ResolvedTarget, tool_version: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(source_path.to_string_lossy().as_bytes());
    hasher.update(b"|");
    hasher.update(target.settings_hash(tool_version).as_bytes());
    let digest = hasher.finalize();
    digest.iter().take(16).map(|b| format!("{b:02x}")).collect()
}
