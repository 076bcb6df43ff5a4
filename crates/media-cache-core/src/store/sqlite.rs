//! SQLite metadata backend.

use super::{AliasEntry, AliasTable, CacheEntry, ContentStore, MetadataStore};
use crate::error::{MediaCacheError, Result};
use crate::key::{EntryKind, Variant};
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};
use tracing::{debug, warn};

const ENTRY_COLUMNS: &str = "key, content_hash, kind, variant, path, size_bytes, last_access_us";

/// SQLite-backed content store and alias table.
///
/// A single connection in WAL mode, guarded by a mutex. Every statement runs in
/// its own implicit transaction, which is the atomicity each operation needs.
pub struct SqliteStore {
    conn: Mutex<Connection>,
}

impl SqliteStore {
    /// Open or create the database at `db_path`.
    ///
    /// A file that SQLite refuses to read is moved aside to `<name>.corrupt`
    /// and replaced with an empty database.
    pub fn open(db_path: impl AsRef<Path>) -> Result<Self> {
        let db_path = db_path.as_ref();

        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| MediaCacheError::Io {
                message: format!("Failed to create cache directory: {}", e),
                path: Some(parent.to_path_buf()),
                source: Some(e),
            })?;
        }

        let conn = match Self::connect(db_path) {
            Ok(conn) => conn,
            Err(e) => {
                warn!(
                    path = %db_path.display(),
                    error = %e,
                    "Metadata database unreadable, starting empty"
                );
                Self::quarantine(db_path);
                Self::connect(db_path)?
            }
        };

        debug!(path = %db_path.display(), "Opened SQLite metadata store");
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// In-memory database, for tests and ephemeral caches.
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        Self::init_schema(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn connect(db_path: &Path) -> Result<Connection> {
        let conn = Connection::open(db_path).map_err(|e| MediaCacheError::Database {
            message: format!("Failed to open metadata database: {}", e),
            source: Some(e),
        })?;

        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA synchronous=NORMAL;")
            .map_err(|e| MediaCacheError::Database {
                message: format!("Failed to set pragmas: {}", e),
                source: Some(e),
            })?;

        Self::init_schema(&conn)?;
        Ok(conn)
    }

    fn quarantine(db_path: &Path) {
        let mut name = db_path.file_name().unwrap_or_default().to_os_string();
        name.push(".corrupt");
        let target = db_path.with_file_name(name);
        if let Err(e) = std::fs::rename(db_path, &target) {
            warn!(
                path = %db_path.display(),
                error = %e,
                "Failed to move corrupt database aside, removing it"
            );
            let _ = std::fs::remove_file(db_path);
        }
        for suffix in ["-wal", "-shm"] {
            let mut side = db_path.as_os_str().to_os_string();
            side.push(suffix);
            let _ = std::fs::remove_file(PathBuf::from(side));
        }
    }

    fn init_schema(conn: &Connection) -> Result<()> {
        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS entries (
                key TEXT PRIMARY KEY,
                content_hash TEXT NOT NULL,
                kind TEXT NOT NULL,
                variant TEXT NOT NULL,
                path TEXT NOT NULL,
                size_bytes INTEGER NOT NULL,
                last_access_us INTEGER NOT NULL
            );

            -- Dedup lookups
            CREATE INDEX IF NOT EXISTS idx_entries_hash
                ON entries(content_hash, variant);

            -- LRU eviction
            CREATE INDEX IF NOT EXISTS idx_entries_access
                ON entries(last_access_us);

            CREATE TABLE IF NOT EXISTS aliases (
                alias TEXT PRIMARY KEY,
                canonical TEXT NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_aliases_canonical
                ON aliases(canonical);
            "#,
        )
        .map_err(|e| MediaCacheError::Database {
            message: format!("Failed to initialize metadata schema: {}", e),
            source: Some(e),
        })
    }

    fn lock(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn.lock().map_err(|e| MediaCacheError::Database {
            message: format!("Failed to lock database: {}", e),
            source: None,
        })
    }

    fn query_entries(&self, sql: &str, limit: i64) -> Result<Vec<CacheEntry>> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(sql)?;
        let rows = stmt.query_map(params![limit], row_to_entry)?;
        let mut entries = Vec::new();
        for row in rows {
            entries.push(row??);
        }
        Ok(entries)
    }
}

fn micros(ts: DateTime<Utc>) -> i64 {
    ts.timestamp_micros()
}

fn from_micros(us: i64) -> DateTime<Utc> {
    DateTime::from_timestamp_micros(us).unwrap_or(DateTime::<Utc>::MIN_UTC)
}

/// Decode a row. The outer result is SQLite's, the inner one flags rows whose
/// `kind` column this build does not recognise.
fn row_to_entry(row: &Row<'_>) -> rusqlite::Result<Result<CacheEntry>> {
    let key: String = row.get(0)?;
    let content_hash: String = row.get(1)?;
    let kind: String = row.get(2)?;
    let path: String = row.get(4)?;
    let size_bytes: i64 = row.get(5)?;
    let last_access_us: i64 = row.get(6)?;

    let Some(kind) = EntryKind::from_str(&kind) else {
        return Ok(Err(MediaCacheError::Database {
            message: format!("Unknown entry kind '{}' for {}", kind, key),
            source: None,
        }));
    };

    Ok(Ok(CacheEntry {
        key,
        content_hash,
        kind,
        path: PathBuf::from(path),
        size_bytes: size_bytes.max(0) as u64,
        last_access: from_micros(last_access_us),
    }))
}

impl ContentStore for SqliteStore {
    fn get_by_key(&self, key: &str) -> Result<Option<CacheEntry>> {
        let conn = self.lock()?;
        let row = conn
            .query_row(
                &format!("SELECT {ENTRY_COLUMNS} FROM entries WHERE key = ?1"),
                params![key],
                row_to_entry,
            )
            .optional()
            .map_err(|e| MediaCacheError::Database {
                message: format!("Failed to query entry: {}", e),
                source: Some(e),
            })?;
        row.transpose()
    }

    fn get_by_hash(&self, hash: &str, variant: Variant) -> Result<Option<CacheEntry>> {
        let conn = self.lock()?;
        let row = conn
            .query_row(
                &format!(
                    "SELECT {ENTRY_COLUMNS} FROM entries \
                     WHERE content_hash = ?1 AND variant = ?2 \
                     ORDER BY last_access_us DESC LIMIT 1"
                ),
                params![hash, variant.as_str()],
                row_to_entry,
            )
            .optional()
            .map_err(|e| MediaCacheError::Database {
                message: format!("Failed to query entry by hash: {}", e),
                source: Some(e),
            })?;
        row.transpose()
    }

    fn touch(&self, key: &str, now: DateTime<Utc>) -> Result<bool> {
        let conn = self.lock()?;
        let updated = conn
            .execute(
                "UPDATE entries SET last_access_us = MAX(last_access_us, ?1) WHERE key = ?2",
                params![micros(now), key],
            )
            .map_err(|e| MediaCacheError::Database {
                message: format!("Failed to touch entry: {}", e),
                source: Some(e),
            })?;
        Ok(updated > 0)
    }

    fn upsert(&self, entry: &CacheEntry) -> Result<()> {
        let conn = self.lock()?;
        conn.execute(
            r#"
            INSERT OR REPLACE INTO entries
            (key, content_hash, kind, variant, path, size_bytes, last_access_us)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
            "#,
            params![
                entry.key,
                entry.content_hash,
                entry.kind.as_str(),
                entry.variant().as_str(),
                entry.path.to_string_lossy(),
                entry.size_bytes as i64,
                micros(entry.last_access),
            ],
        )
        .map_err(|e| MediaCacheError::Database {
            message: format!("Failed to upsert entry: {}", e),
            source: Some(e),
        })?;
        Ok(())
    }

    fn delete(&self, key: &str) -> Result<Option<CacheEntry>> {
        let conn = self.lock()?;
        let row = conn
            .query_row(
                &format!("DELETE FROM entries WHERE key = ?1 RETURNING {ENTRY_COLUMNS}"),
                params![key],
                row_to_entry,
            )
            .optional()
            .map_err(|e| MediaCacheError::Database {
                message: format!("Failed to delete entry: {}", e),
                source: Some(e),
            })?;
        row.transpose()
    }

    fn list_oldest(&self, limit: usize) -> Result<Vec<CacheEntry>> {
        self.query_entries(
            &format!(
                "SELECT {ENTRY_COLUMNS} FROM entries ORDER BY last_access_us ASC, key ASC LIMIT ?1"
            ),
            i64::try_from(limit).unwrap_or(i64::MAX),
        )
    }

    fn list_all(&self) -> Result<Vec<CacheEntry>> {
        // LIMIT -1 means unbounded in SQLite.
        self.query_entries(
            &format!(
                "SELECT {ENTRY_COLUMNS} FROM entries ORDER BY last_access_us ASC, key ASC LIMIT ?1"
            ),
            -1,
        )
    }

    fn total_bytes(&self) -> Result<u64> {
        let conn = self.lock()?;
        let total: i64 = conn.query_row(
            "SELECT COALESCE(SUM(size_bytes), 0) FROM entries",
            [],
            |row| row.get(0),
        )?;
        Ok(total.max(0) as u64)
    }

    fn entry_count(&self) -> Result<usize> {
        let conn = self.lock()?;
        let count: i64 = conn.query_row("SELECT COUNT(*) FROM entries", [], |row| row.get(0))?;
        Ok(count.max(0) as usize)
    }
}

impl AliasTable for SqliteStore {
    fn resolve_alias(&self, alias: &str) -> Result<Option<String>> {
        let conn = self.lock()?;
        conn.query_row(
            "SELECT canonical FROM aliases WHERE alias = ?1",
            params![alias],
            |row| row.get(0),
        )
        .optional()
        .map_err(|e| MediaCacheError::Database {
            message: format!("Failed to resolve alias: {}", e),
            source: Some(e),
        })
    }

    fn register_alias(&self, alias: &str, canonical: &str) -> Result<()> {
        let conn = self.lock()?;
        conn.execute(
            r#"
            INSERT INTO aliases (alias, canonical) VALUES (?1, ?2)
            ON CONFLICT(alias) DO UPDATE SET canonical = excluded.canonical
            "#,
            params![alias, canonical],
        )
        .map_err(|e| MediaCacheError::Database {
            message: format!("Failed to register alias: {}", e),
            source: Some(e),
        })?;
        Ok(())
    }

    fn remove_alias(&self, alias: &str) -> Result<bool> {
        let conn = self.lock()?;
        let deleted = conn.execute("DELETE FROM aliases WHERE alias = ?1", params![alias])?;
        Ok(deleted > 0)
    }

    fn remove_aliases_to(&self, canonical: &str) -> Result<usize> {
        let conn = self.lock()?;
        let deleted = conn.execute(
            "DELETE FROM aliases WHERE canonical = ?1",
            params![canonical],
        )?;
        Ok(deleted)
    }

    fn list_aliases(&self) -> Result<Vec<AliasEntry>> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare("SELECT alias, canonical FROM aliases ORDER BY alias")?;
        let rows = stmt.query_map([], |row| {
            Ok(AliasEntry {
                alias: row.get(0)?,
                canonical: row.get(1)?,
            })
        })?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }
}

impl MetadataStore for SqliteStore {
    fn clear(&self) -> Result<()> {
        let conn = self.lock()?;
        conn.execute_batch("DELETE FROM entries; DELETE FROM aliases;")
            .map_err(|e| MediaCacheError::Database {
                message: format!("Failed to clear metadata: {}", e),
                source: Some(e),
            })
    }
}
