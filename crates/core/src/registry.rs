//! The registry: a single-writer, many-reader persistent store for
//! remembered paths, per-file discovery, staged analysis state, and the
//! critical-event queue.
//!
//! Storage is a single SQLite file in WAL mode. Every public method is
//! individually atomic; the registry performs no background work of its
//! own — the only exception is the condition variable backing
//! [`Registry::dequeue_blocking`], which exists purely to let a caller block
//! without polling.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::{Condvar, Mutex};
use rusqlite::{params, Connection, OptionalExtension};
use tokio_util::sync::CancellationToken;

use crate::error::RegistryError;
use crate::types::{
    CriticalEvent, FileDiscovery, FileState, PathConfig, PathStatus, RememberedPath,
    SchemaMigration,
};

type Result<T> = std::result::Result<T, RegistryError>;

/// Default ring-buffer capacity for the critical-event queue.
pub const DEFAULT_CRITICAL_EVENT_CAP: i64 = 100;

const MIGRATIONS: &[(i64, &str, &str)] = &[(
    1,
    "init",
    r#"
    CREATE TABLE remembered_paths (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        path TEXT UNIQUE NOT NULL,
        config_json TEXT,
        last_walk_at TEXT,
        created_at TEXT NOT NULL,
        updated_at TEXT NOT NULL
    );
    CREATE INDEX idx_remembered_paths_path ON remembered_paths(path);

    CREATE TABLE file_state (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        path TEXT UNIQUE NOT NULL,
        content_hash TEXT,
        metadata_hash TEXT,
        size INTEGER,
        mod_time TEXT,
        last_analyzed_at TEXT,
        analysis_version TEXT,
        metadata_analyzed_at TEXT,
        semantic_analyzed_at TEXT,
        semantic_error TEXT,
        semantic_retry_count INTEGER NOT NULL DEFAULT 0,
        embeddings_analyzed_at TEXT,
        embeddings_error TEXT,
        embeddings_retry_count INTEGER NOT NULL DEFAULT 0,
        created_at TEXT NOT NULL,
        updated_at TEXT NOT NULL
    );
    CREATE INDEX idx_file_state_content_hash ON file_state(content_hash);
    CREATE INDEX idx_file_state_path ON file_state(path);
    CREATE INDEX idx_file_state_semantic_error ON file_state(semantic_error);
    CREATE INDEX idx_file_state_embeddings_error ON file_state(embeddings_error);

    CREATE TABLE file_discovery (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        path TEXT UNIQUE NOT NULL,
        content_hash TEXT,
        size INTEGER,
        mod_time TEXT,
        created_at TEXT NOT NULL,
        updated_at TEXT NOT NULL
    );
    CREATE INDEX idx_file_discovery_path ON file_discovery(path);

    CREATE TABLE critical_events (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        type TEXT NOT NULL,
        timestamp TEXT NOT NULL,
        payload BLOB
    );
    "#,
)];

/// A transactional store of remembered paths, per-file discovery, staged
/// analysis state, and the critical-event queue.
pub struct Registry {
    conn: Mutex<Connection>,
    queue_cap: i64,
    queue_signal: Arc<(Mutex<u64>, Condvar)>,
}

fn now() -> DateTime<Utc> {
    Utc::now()
}

fn to_ts(dt: DateTime<Utc>) -> String {
    dt.to_rfc3339()
}

fn from_ts(s: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(s).map(|dt| dt.with_timezone(&Utc)).unwrap_or_else(|_| Utc::now())
}

fn from_ts_opt(s: Option<String>) -> Option<DateTime<Utc>> {
    s.map(|s| from_ts(&s))
}

/// Normalize a path the way every registry entry point requires: absolute,
/// `.`/`..` components resolved, trailing separators stripped.
pub fn normalize_path(p: &Path) -> PathBuf {
    let absolute = if p.is_absolute() {
        p.to_path_buf()
    } else {
        std::env::current_dir().unwrap_or_default().join(p)
    };
    let mut out = PathBuf::new();
    for component in absolute.components() {
        use std::path::Component;
        match component {
            Component::ParentDir => {
                out.pop();
            }
            Component::CurDir => {}
            other => out.push(other.as_os_str()),
        }
    }
    out
}

/// Escape `%` and `_` for a SQL `LIKE` pattern, so a path containing either
/// character doesn't act as a wildcard in prefix queries.
fn escape_like(s: &str) -> String {
    s.replace('\\', "\\\\").replace('%', "\\%").replace('_', "\\_")
}

fn prefix_pattern(parent: &str) -> String {
    format!("{}{}%", escape_like(parent), std::path::MAIN_SEPARATOR)
}

impl Registry {
    /// Open (creating if absent) the registry at `db_path`, run pending
    /// migrations inside a single transaction each, and configure WAL mode
    /// with foreign keys on. Migration failure rolls back and aborts
    /// startup.
    pub fn open(db_path: &Path) -> Result<Self> {
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent).map_err(RegistryError::io("create db dir"))?;
        }
        let conn = Connection::open(db_path).map_err(RegistryError::sqlite("open"))?;
        conn.pragma_update(None, "journal_mode", "WAL").map_err(RegistryError::sqlite("wal"))?;
        conn.pragma_update(None, "foreign_keys", "ON").map_err(RegistryError::sqlite("fk"))?;
        let registry = Self {
            conn: Mutex::new(conn),
            queue_cap: DEFAULT_CRITICAL_EVENT_CAP,
            queue_signal: Arc::new((Mutex::new(0), Condvar::new())),
        };
        registry.run_migrations()?;
        Ok(registry)
    }

    /// Open an in-memory registry — used by tests that don't need durability
    /// across process restarts.
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().map_err(RegistryError::sqlite("open"))?;
        conn.pragma_update(None, "foreign_keys", "ON").map_err(RegistryError::sqlite("fk"))?;
        let registry = Self {
            conn: Mutex::new(conn),
            queue_cap: DEFAULT_CRITICAL_EVENT_CAP,
            queue_signal: Arc::new((Mutex::new(0), Condvar::new())),
        };
        registry.run_migrations()?;
        Ok(registry)
    }

    pub fn with_queue_cap(mut self, cap: i64) -> Self {
        self.queue_cap = cap;
        self
    }

    fn run_migrations(&self) -> Result<()> {
        let mut conn = self.conn.lock();
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS schema_migrations (
                version INTEGER PRIMARY KEY,
                description TEXT NOT NULL,
                applied_at TEXT NOT NULL
            )",
        )
        .map_err(RegistryError::sqlite("create schema_migrations"))?;

        let applied: i64 = conn
            .query_row("SELECT COALESCE(MAX(version), 0) FROM schema_migrations", [], |r| r.get(0))
            .map_err(RegistryError::sqlite("read schema version"))?;

        for (version, description, sql) in MIGRATIONS {
            if *version <= applied {
                continue;
            }
            let tx = conn.transaction().map_err(RegistryError::sqlite("begin migration"))?;
            tx.execute_batch(sql).map_err(RegistryError::sqlite("apply migration"))?;
            tx.execute(
                "INSERT INTO schema_migrations (version, description, applied_at) VALUES (?1, ?2, ?3)",
                params![version, description, to_ts(now())],
            )
            .map_err(RegistryError::sqlite("record migration"))?;
            tx.commit().map_err(RegistryError::sqlite("commit migration"))?;
        }
        Ok(())
    }

    pub fn schema_version(&self) -> Result<i64> {
        let conn = self.conn.lock();
        conn.query_row("SELECT COALESCE(MAX(version), 0) FROM schema_migrations", [], |r| r.get(0))
            .map_err(RegistryError::sqlite("read schema version"))
    }

    pub fn migrations(&self) -> Result<Vec<SchemaMigration>> {
        let conn = self.conn.lock();
        let mut stmt = conn
            .prepare("SELECT version, description, applied_at FROM schema_migrations ORDER BY version")
            .map_err(RegistryError::sqlite("prepare"))?;
        let rows = stmt
            .query_map([], |r| {
                Ok(SchemaMigration {
                    version: r.get(0)?,
                    description: r.get(1)?,
                    applied_at: from_ts(&r.get::<_, String>(2)?),
                })
            })
            .map_err(RegistryError::sqlite("query"))?;
        rows.collect::<std::result::Result<Vec<_>, _>>().map_err(RegistryError::from)
    }

    // -----------------------------------------------------------------
    // Path management
    // -----------------------------------------------------------------

    /// Normalize, insert, and return the new remembered path. Fails with
    /// `AlreadyExists` on a duplicate (unique on `path`).
    pub fn add_path(&self, path: &Path, config: Option<PathConfig>) -> Result<RememberedPath> {
        let normalized = normalize_path(path);
        let path_str = normalized.to_string_lossy().to_string();
        let config_json = config.as_ref().map(|c| c.to_json()).transpose().map_err(|e| {
            RegistryError::Validation { message: format!("invalid config: {e}") }
        })?;
        let ts = to_ts(now());

        let conn = self.conn.lock();
        let result = conn.execute(
            "INSERT INTO remembered_paths (path, config_json, last_walk_at, created_at, updated_at)
             VALUES (?1, ?2, NULL, ?3, ?3)",
            params![path_str, config_json, ts],
        );
        match result {
            Ok(_) => {}
            Err(rusqlite::Error::SqliteFailure(e, _))
                if e.code == rusqlite::ErrorCode::ConstraintViolation =>
            {
                return Err(RegistryError::AlreadyExists { path: path_str });
            }
            Err(e) => return Err(RegistryError::Sqlite { op: "insert remembered_path", source: e }),
        }
        let id = conn.last_insert_rowid();
        Ok(RememberedPath {
            id,
            path: path_str,
            config,
            last_walk_at: None,
            created_at: from_ts(&ts),
            updated_at: from_ts(&ts),
        })
    }

    /// Fails with `NotFound` when absent. Cascading deletion of dependent
    /// `file_discovery`/`file_state` rows is the caller's (cleaner's)
    /// responsibility.
    pub fn remove_path(&self, path: &Path) -> Result<()> {
        let normalized = normalize_path(path);
        let path_str = normalized.to_string_lossy().to_string();
        let conn = self.conn.lock();
        let affected = conn
            .execute("DELETE FROM remembered_paths WHERE path = ?1", params![path_str])
            .map_err(RegistryError::sqlite("delete remembered_path"))?;
        if affected == 0 {
            return Err(RegistryError::not_found("remembered_path", path_str));
        }
        Ok(())
    }

    pub fn get_path(&self, path: &Path) -> Result<RememberedPath> {
        let normalized = normalize_path(path);
        let path_str = normalized.to_string_lossy().to_string();
        let conn = self.conn.lock();
        conn.query_row(
            "SELECT id, path, config_json, last_walk_at, created_at, updated_at
             FROM remembered_paths WHERE path = ?1",
            params![path_str],
            Self::row_to_remembered_path,
        )
        .optional()
        .map_err(RegistryError::sqlite("get remembered_path"))?
        .ok_or_else(|| RegistryError::not_found("remembered_path", path_str))
    }

    pub fn list_paths(&self) -> Result<Vec<RememberedPath>> {
        let conn = self.conn.lock();
        let mut stmt = conn
            .prepare(
                "SELECT id, path, config_json, last_walk_at, created_at, updated_at
                 FROM remembered_paths ORDER BY path",
            )
            .map_err(RegistryError::sqlite("prepare"))?;
        let rows = stmt
            .query_map([], Self::row_to_remembered_path)
            .map_err(RegistryError::sqlite("query"))?;
        rows.collect::<std::result::Result<Vec<_>, _>>().map_err(RegistryError::from)
    }

    pub fn update_path_config(&self, path: &Path, config: Option<PathConfig>) -> Result<()> {
        let normalized = normalize_path(path);
        let path_str = normalized.to_string_lossy().to_string();
        let config_json = config.as_ref().map(|c| c.to_json()).transpose().map_err(|e| {
            RegistryError::Validation { message: format!("invalid config: {e}") }
        })?;
        let conn = self.conn.lock();
        let affected = conn
            .execute(
                "UPDATE remembered_paths SET config_json = ?1, updated_at = ?2 WHERE path = ?3",
                params![config_json, to_ts(now()), path_str],
            )
            .map_err(RegistryError::sqlite("update config"))?;
        if affected == 0 {
            return Err(RegistryError::not_found("remembered_path", path_str));
        }
        Ok(())
    }

    pub fn update_path_last_walk(&self, path: &Path, at: DateTime<Utc>) -> Result<()> {
        let normalized = normalize_path(path);
        let path_str = normalized.to_string_lossy().to_string();
        let conn = self.conn.lock();
        let affected = conn
            .execute(
                "UPDATE remembered_paths SET last_walk_at = ?1, updated_at = ?2 WHERE path = ?3",
                params![to_ts(at), to_ts(now()), path_str],
            )
            .map_err(RegistryError::sqlite("update last_walk"))?;
        if affected == 0 {
            return Err(RegistryError::not_found("remembered_path", path_str));
        }
        Ok(())
    }

    /// Deepest remembered ancestor by longest-prefix match: returns the
    /// remembered path `r` maximizing `len(r.path)` such that `f == r.path`
    /// or `f` starts with `r.path + separator`.
    pub fn find_containing_path(&self, file_path: &Path) -> Result<Option<RememberedPath>> {
        let normalized = normalize_path(file_path);
        let target = normalized.to_string_lossy().to_string();
        let all = self.list_paths()?;
        let sep = std::path::MAIN_SEPARATOR;
        Ok(all
            .into_iter()
            .filter(|r| target == r.path || target.starts_with(&format!("{}{}", r.path, sep)))
            .max_by_key(|r| r.path.len()))
    }

    /// Thin wrapper over `find_containing_path` returning just the config.
    pub fn get_effective_config(&self, file_path: &Path) -> Result<Option<PathConfig>> {
        Ok(self.find_containing_path(file_path)?.and_then(|r| r.config))
    }

    fn row_to_remembered_path(row: &rusqlite::Row) -> rusqlite::Result<RememberedPath> {
        let config_json: Option<String> = row.get(2)?;
        let config = config_json.and_then(|j| PathConfig::from_json(&j).ok());
        Ok(RememberedPath {
            id: row.get(0)?,
            path: row.get(1)?,
            config,
            last_walk_at: from_ts_opt(row.get(3)?),
            created_at: from_ts(&row.get::<_, String>(4)?),
            updated_at: from_ts(&row.get::<_, String>(5)?),
        })
    }

    // -----------------------------------------------------------------
    // File discovery state
    // -----------------------------------------------------------------

    pub fn upsert_discovery(
        &self,
        path: &str,
        content_hash: &str,
        size: i64,
        mod_time: DateTime<Utc>,
    ) -> Result<()> {
        let conn = self.conn.lock();
        let ts = to_ts(now());
        conn.execute(
            "INSERT INTO file_discovery (path, content_hash, size, mod_time, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?5)
             ON CONFLICT(path) DO UPDATE SET
                content_hash = excluded.content_hash,
                size = excluded.size,
                mod_time = excluded.mod_time,
                updated_at = excluded.updated_at",
            params![path, content_hash, size, to_ts(mod_time), ts],
        )
        .map_err(RegistryError::sqlite("upsert discovery"))?;
        Ok(())
    }

    pub fn get_discovery(&self, path: &str) -> Result<Option<FileDiscovery>> {
        let conn = self.conn.lock();
        conn.query_row(
            "SELECT path, content_hash, size, mod_time, created_at, updated_at
             FROM file_discovery WHERE path = ?1",
            params![path],
            Self::row_to_discovery,
        )
        .optional()
        .map_err(RegistryError::sqlite("get discovery"))
    }

    pub fn delete_discovery(&self, path: &str) -> Result<bool> {
        let conn = self.conn.lock();
        let affected = conn
            .execute("DELETE FROM file_discovery WHERE path = ?1", params![path])
            .map_err(RegistryError::sqlite("delete discovery"))?;
        Ok(affected > 0)
    }

    pub fn bulk_delete_discovery_by_prefix(&self, parent: &str) -> Result<i64> {
        let conn = self.conn.lock();
        let affected = conn
            .execute(
                "DELETE FROM file_discovery WHERE path = ?1 OR path LIKE ?2 ESCAPE '\\'",
                params![parent, prefix_pattern(parent)],
            )
            .map_err(RegistryError::sqlite("bulk delete discovery"))?;
        Ok(affected as i64)
    }

    pub fn list_discovery_by_prefix(&self, parent: &str) -> Result<Vec<FileDiscovery>> {
        let conn = self.conn.lock();
        let mut stmt = conn
            .prepare(
                "SELECT path, content_hash, size, mod_time, created_at, updated_at
                 FROM file_discovery WHERE path = ?1 OR path LIKE ?2 ESCAPE '\\'
                 ORDER BY path",
            )
            .map_err(RegistryError::sqlite("prepare"))?;
        let rows = stmt
            .query_map(params![parent, prefix_pattern(parent)], Self::row_to_discovery)
            .map_err(RegistryError::sqlite("query"))?;
        rows.collect::<std::result::Result<Vec<_>, _>>().map_err(RegistryError::from)
    }

    pub fn count_discovery(&self) -> Result<i64> {
        let conn = self.conn.lock();
        conn.query_row("SELECT COUNT(*) FROM file_discovery", [], |r| r.get(0))
            .map_err(RegistryError::sqlite("count discovery"))
    }

    fn row_to_discovery(row: &rusqlite::Row) -> rusqlite::Result<FileDiscovery> {
        Ok(FileDiscovery {
            path: row.get(0)?,
            content_hash: row.get(1)?,
            size: row.get(2)?,
            mod_time: from_ts(&row.get::<_, String>(3)?),
            created_at: from_ts(&row.get::<_, String>(4)?),
            updated_at: from_ts(&row.get::<_, String>(5)?),
        })
    }

    // -----------------------------------------------------------------
    // File state
    // -----------------------------------------------------------------

    pub fn get_file_state(&self, path: &str) -> Result<Option<FileState>> {
        let conn = self.conn.lock();
        conn.query_row(
            "SELECT path, content_hash, metadata_hash, size, mod_time, last_analyzed_at,
                    analysis_version, metadata_analyzed_at, semantic_analyzed_at,
                    semantic_error, semantic_retry_count, embeddings_analyzed_at,
                    embeddings_error, embeddings_retry_count, created_at, updated_at
             FROM file_state WHERE path = ?1",
            params![path],
            Self::row_to_file_state,
        )
        .optional()
        .map_err(RegistryError::sqlite("get file_state"))
    }

    pub fn delete_file_state(&self, path: &str) -> Result<bool> {
        let conn = self.conn.lock();
        let affected = conn
            .execute("DELETE FROM file_state WHERE path = ?1", params![path])
            .map_err(RegistryError::sqlite("delete file_state"))?;
        Ok(affected > 0)
    }

    pub fn bulk_delete_file_state_by_prefix(&self, parent: &str) -> Result<i64> {
        let conn = self.conn.lock();
        let affected = conn
            .execute(
                "DELETE FROM file_state WHERE path = ?1 OR path LIKE ?2 ESCAPE '\\'",
                params![parent, prefix_pattern(parent)],
            )
            .map_err(RegistryError::sqlite("bulk delete file_state"))?;
        Ok(affected as i64)
    }

    pub fn list_file_state_by_prefix(&self, parent: &str) -> Result<Vec<FileState>> {
        let conn = self.conn.lock();
        let mut stmt = conn
            .prepare(
                "SELECT path, content_hash, metadata_hash, size, mod_time, last_analyzed_at,
                        analysis_version, metadata_analyzed_at, semantic_analyzed_at,
                        semantic_error, semantic_retry_count, embeddings_analyzed_at,
                        embeddings_error, embeddings_retry_count, created_at, updated_at
                 FROM file_state WHERE path = ?1 OR path LIKE ?2 ESCAPE '\\'
                 ORDER BY path",
            )
            .map_err(RegistryError::sqlite("prepare"))?;
        let rows = stmt
            .query_map(params![parent, prefix_pattern(parent)], Self::row_to_file_state)
            .map_err(RegistryError::sqlite("query"))?;
        rows.collect::<std::result::Result<Vec<_>, _>>().map_err(RegistryError::from)
    }

    pub fn count_file_state(&self) -> Result<i64> {
        let conn = self.conn.lock();
        conn.query_row("SELECT COUNT(*) FROM file_state", [], |r| r.get(0))
            .map_err(RegistryError::sqlite("count file_state"))
    }

    fn row_to_file_state(row: &rusqlite::Row) -> rusqlite::Result<FileState> {
        Ok(FileState {
            path: row.get(0)?,
            content_hash: row.get(1)?,
            metadata_hash: row.get(2)?,
            size: row.get(3)?,
            mod_time: from_ts_opt(row.get(4)?),
            last_analyzed_at: from_ts_opt(row.get(5)?),
            analysis_version: row.get(6)?,
            metadata_analyzed_at: from_ts_opt(row.get(7)?),
            semantic_analyzed_at: from_ts_opt(row.get(8)?),
            semantic_error: row.get(9)?,
            semantic_retry_count: row.get(10)?,
            embeddings_analyzed_at: from_ts_opt(row.get(11)?),
            embeddings_error: row.get(12)?,
            embeddings_retry_count: row.get(13)?,
            created_at: from_ts(&row.get::<_, String>(14)?),
            updated_at: from_ts(&row.get::<_, String>(15)?),
        })
    }

    fn ensure_file_state_row(conn: &Connection, path: &str) -> rusqlite::Result<()> {
        let ts = to_ts(now());
        conn.execute(
            "INSERT INTO file_state (path, created_at, updated_at) VALUES (?1, ?2, ?2)
             ON CONFLICT(path) DO NOTHING",
            params![path, ts],
        )?;
        Ok(())
    }

    // -----------------------------------------------------------------
    // Staged transitions
    // -----------------------------------------------------------------

    /// Upserts the row and sets `metadata_analyzed_at = now`.
    pub fn update_metadata_state(
        &self,
        path: &str,
        content_hash: &str,
        metadata_hash: &str,
        size: i64,
        mod_time: DateTime<Utc>,
    ) -> Result<()> {
        let conn = self.conn.lock();
        Self::ensure_file_state_row(&conn, path).map_err(RegistryError::sqlite("ensure row"))?;
        let ts = to_ts(now());
        conn.execute(
            "UPDATE file_state SET content_hash = ?1, metadata_hash = ?2, size = ?3, mod_time = ?4,
                metadata_analyzed_at = ?5, updated_at = ?5
             WHERE path = ?6",
            params![content_hash, metadata_hash, size, to_ts(mod_time), ts, path],
        )
        .map_err(RegistryError::sqlite("update metadata state"))?;
        Ok(())
    }

    /// `error = None` advances the stage and resets retry accounting;
    /// `Some(e)` records the failure and increments the retry count without
    /// advancing the timestamp.
    pub fn update_semantic_state(
        &self,
        path: &str,
        analysis_version: &str,
        error: Option<&str>,
    ) -> Result<()> {
        let conn = self.conn.lock();
        Self::ensure_file_state_row(&conn, path).map_err(RegistryError::sqlite("ensure row"))?;
        let ts = to_ts(now());
        match error {
            None => {
                conn.execute(
                    "UPDATE file_state SET semantic_analyzed_at = ?1, last_analyzed_at = ?1,
                        analysis_version = ?2, semantic_error = NULL, semantic_retry_count = 0,
                        updated_at = ?1
                     WHERE path = ?3",
                    params![ts, analysis_version, path],
                )
                .map_err(RegistryError::sqlite("update semantic state"))?;
            }
            Some(e) => {
                conn.execute(
                    "UPDATE file_state SET semantic_error = ?1, semantic_retry_count = semantic_retry_count + 1,
                        updated_at = ?2
                     WHERE path = ?3",
                    params![e, ts, path],
                )
                .map_err(RegistryError::sqlite("record semantic failure"))?;
            }
        }
        Ok(())
    }

    /// Symmetric with [`Registry::update_semantic_state`].
    pub fn update_embeddings_state(&self, path: &str, error: Option<&str>) -> Result<()> {
        let conn = self.conn.lock();
        Self::ensure_file_state_row(&conn, path).map_err(RegistryError::sqlite("ensure row"))?;
        let ts = to_ts(now());
        match error {
            None => {
                conn.execute(
                    "UPDATE file_state SET embeddings_analyzed_at = ?1, embeddings_error = NULL,
                        embeddings_retry_count = 0, updated_at = ?1
                     WHERE path = ?2",
                    params![ts, path],
                )
                .map_err(RegistryError::sqlite("update embeddings state"))?;
            }
            Some(e) => {
                conn.execute(
                    "UPDATE file_state SET embeddings_error = ?1, embeddings_retry_count = embeddings_retry_count + 1,
                        updated_at = ?2
                     WHERE path = ?3",
                    params![e, ts, path],
                )
                .map_err(RegistryError::sqlite("record embeddings failure"))?;
            }
        }
        Ok(())
    }

    /// Null out all stage timestamps and reset both retry counts — called
    /// whenever a file's content hash changes.
    pub fn clear_analysis_state(&self, path: &str) -> Result<()> {
        let conn = self.conn.lock();
        Self::ensure_file_state_row(&conn, path).map_err(RegistryError::sqlite("ensure row"))?;
        conn.execute(
            "UPDATE file_state SET
                metadata_analyzed_at = NULL, semantic_analyzed_at = NULL,
                embeddings_analyzed_at = NULL, last_analyzed_at = NULL,
                semantic_error = NULL, semantic_retry_count = 0,
                embeddings_error = NULL, embeddings_retry_count = 0,
                updated_at = ?1
             WHERE path = ?2",
            params![to_ts(now()), path],
        )
        .map_err(RegistryError::sqlite("clear analysis state"))?;
        Ok(())
    }

    // -----------------------------------------------------------------
    // Scheduling queries
    // -----------------------------------------------------------------

    pub fn list_files_needing_metadata(&self, parent_path: &str) -> Result<Vec<FileState>> {
        let conn = self.conn.lock();
        let mut stmt = conn
            .prepare(
                "SELECT path, content_hash, metadata_hash, size, mod_time, last_analyzed_at,
                        analysis_version, metadata_analyzed_at, semantic_analyzed_at,
                        semantic_error, semantic_retry_count, embeddings_analyzed_at,
                        embeddings_error, embeddings_retry_count, created_at, updated_at
                 FROM file_state
                 WHERE (path = ?1 OR path LIKE ?2 ESCAPE '\\') AND metadata_analyzed_at IS NULL
                 ORDER BY path",
            )
            .map_err(RegistryError::sqlite("prepare"))?;
        let rows = stmt
            .query_map(params![parent_path, prefix_pattern(parent_path)], Self::row_to_file_state)
            .map_err(RegistryError::sqlite("query"))?;
        rows.collect::<std::result::Result<Vec<_>, _>>().map_err(RegistryError::from)
    }

    pub fn list_files_needing_semantic(
        &self,
        parent_path: &str,
        max_retries: Option<i64>,
    ) -> Result<Vec<FileState>> {
        let conn = self.conn.lock();
        let mut stmt = conn
            .prepare(
                "SELECT path, content_hash, metadata_hash, size, mod_time, last_analyzed_at,
                        analysis_version, metadata_analyzed_at, semantic_analyzed_at,
                        semantic_error, semantic_retry_count, embeddings_analyzed_at,
                        embeddings_error, embeddings_retry_count, created_at, updated_at
                 FROM file_state
                 WHERE (path = ?1 OR path LIKE ?2 ESCAPE '\\')
                   AND metadata_analyzed_at IS NOT NULL
                   AND semantic_analyzed_at IS NULL
                   AND semantic_retry_count < ?3
                 ORDER BY path",
            )
            .map_err(RegistryError::sqlite("prepare"))?;
        let rows = stmt
            .query_map(
                params![parent_path, prefix_pattern(parent_path), max_retries.unwrap_or(i64::MAX)],
                Self::row_to_file_state,
            )
            .map_err(RegistryError::sqlite("query"))?;
        rows.collect::<std::result::Result<Vec<_>, _>>().map_err(RegistryError::from)
    }

    pub fn list_files_needing_embeddings(
        &self,
        parent_path: &str,
        max_retries: Option<i64>,
    ) -> Result<Vec<FileState>> {
        let conn = self.conn.lock();
        let mut stmt = conn
            .prepare(
                "SELECT path, content_hash, metadata_hash, size, mod_time, last_analyzed_at,
                        analysis_version, metadata_analyzed_at, semantic_analyzed_at,
                        semantic_error, semantic_retry_count, embeddings_analyzed_at,
                        embeddings_error, embeddings_retry_count, created_at, updated_at
                 FROM file_state
                 WHERE (path = ?1 OR path LIKE ?2 ESCAPE '\\')
                   AND semantic_analyzed_at IS NOT NULL
                   AND embeddings_analyzed_at IS NULL
                   AND embeddings_retry_count < ?3
                 ORDER BY path",
            )
            .map_err(RegistryError::sqlite("prepare"))?;
        let rows = stmt
            .query_map(
                params![parent_path, prefix_pattern(parent_path), max_retries.unwrap_or(i64::MAX)],
                Self::row_to_file_state,
            )
            .map_err(RegistryError::sqlite("query"))?;
        rows.collect::<std::result::Result<Vec<_>, _>>().map_err(RegistryError::from)
    }

    // -----------------------------------------------------------------
    // Health
    // -----------------------------------------------------------------

    /// Stats every remembered path against the live filesystem.
    pub fn check_path_health(&self) -> Result<Vec<(RememberedPath, PathStatus)>> {
        let paths = self.list_paths()?;
        Ok(paths
            .into_iter()
            .map(|p| {
                let status = match std::fs::metadata(&p.path) {
                    Ok(meta) if meta.is_dir() => PathStatus::Ok,
                    Ok(_) => PathStatus::Error { error: "not a directory".into() },
                    Err(e) if e.kind() == std::io::ErrorKind::NotFound => PathStatus::Missing,
                    Err(e) if e.kind() == std::io::ErrorKind::PermissionDenied => {
                        PathStatus::Denied { error: e.to_string() }
                    }
                    Err(e) => PathStatus::Error { error: e.to_string() },
                };
                (p, status)
            })
            .collect())
    }

    /// Removes only `missing` entries, cascading deletion of subtree state
    /// first.
    pub fn validate_and_clean_paths(&self) -> Result<Vec<String>> {
        let mut removed = Vec::new();
        for (path, status) in self.check_path_health()? {
            if status == PathStatus::Missing {
                self.bulk_delete_file_state_by_prefix(&path.path)?;
                self.bulk_delete_discovery_by_prefix(&path.path)?;
                self.remove_path(Path::new(&path.path))?;
                removed.push(path.path);
            }
        }
        Ok(removed)
    }

    // -----------------------------------------------------------------
    // Critical-event queue
    // -----------------------------------------------------------------

    /// Atomic under cap `C`: insert, and if the running count exceeds `C`,
    /// delete the smallest-id row, all within one transaction.
    pub fn enqueue(&self, event_type: &str, payload: &[u8]) -> Result<i64> {
        let id = {
            let mut conn = self.conn.lock();
            let tx = conn.transaction().map_err(RegistryError::sqlite("begin enqueue"))?;
            tx.execute(
                "INSERT INTO critical_events (type, timestamp, payload) VALUES (?1, ?2, ?3)",
                params![event_type, to_ts(now()), payload],
            )
            .map_err(RegistryError::sqlite("insert critical_event"))?;
            let id = tx.last_insert_rowid();

            let count: i64 = tx
                .query_row("SELECT COUNT(*) FROM critical_events", [], |r| r.get(0))
                .map_err(RegistryError::sqlite("count critical_events"))?;
            if count > self.queue_cap {
                tx.execute(
                    "DELETE FROM critical_events WHERE id = (SELECT MIN(id) FROM critical_events)",
                    [],
                )
                .map_err(RegistryError::sqlite("evict critical_event"))?;
            }
            tx.commit().map_err(RegistryError::sqlite("commit enqueue"))?;
            id
        };

        let (lock, cvar) = &*self.queue_signal;
        {
            let mut generation = lock.lock();
            *generation = generation.wrapping_add(1);
        }
        cvar.notify_all();
        Ok(id)
    }

    /// Selects the smallest-id row, deletes it, and returns the payload in
    /// one transaction — non-blocking. `None` if the queue is empty.
    pub fn try_dequeue(&self) -> Result<Option<CriticalEvent>> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction().map_err(RegistryError::sqlite("begin dequeue"))?;
        let row = tx
            .query_row(
                "SELECT id, type, timestamp, payload FROM critical_events ORDER BY id ASC LIMIT 1",
                [],
                |r| {
                    Ok(CriticalEvent {
                        id: r.get(0)?,
                        event_type: r.get(1)?,
                        timestamp: from_ts(&r.get::<_, String>(2)?),
                        payload: r.get(3)?,
                    })
                },
            )
            .optional()
            .map_err(RegistryError::sqlite("select critical_event"))?;

        if let Some(ref event) = row {
            tx.execute("DELETE FROM critical_events WHERE id = ?1", params![event.id])
                .map_err(RegistryError::sqlite("delete critical_event"))?;
        }
        tx.commit().map_err(RegistryError::sqlite("commit dequeue"))?;
        Ok(row)
    }

    /// Blocks on a condition variable signalled by every successful
    /// [`Registry::enqueue`], until an event is available or `cancel` fires.
    pub fn dequeue_blocking(&self, cancel: &CancellationToken) -> Result<Option<CriticalEvent>> {
        loop {
            if let Some(event) = self.try_dequeue()? {
                return Ok(Some(event));
            }
            if cancel.is_cancelled() {
                return Ok(None);
            }
            let (lock, cvar) = &*self.queue_signal;
            let mut generation = lock.lock();
            let seen = *generation;
            let timed_out = cvar.wait_for(&mut generation, Duration::from_millis(200)).timed_out();
            if timed_out && *generation == seen && cancel.is_cancelled() {
                return Ok(None);
            }
        }
    }

    pub fn len(&self) -> Result<i64> {
        let conn = self.conn.lock();
        conn.query_row("SELECT COUNT(*) FROM critical_events", [], |r| r.get(0))
            .map_err(RegistryError::sqlite("count critical_events"))
    }

    pub fn is_empty(&self) -> Result<bool> {
        Ok(self.len()? == 0)
    }

    pub fn cap(&self) -> i64 {
        self.queue_cap
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    fn registry() -> Registry {
        Registry::open_in_memory().unwrap()
    }

    #[test]
    fn add_then_get_round_trips() {
        let reg = registry();
        let cfg = PathConfig { skip_hidden: Some(false), ..Default::default() };
        let added = reg.add_path(Path::new("/tmp/demo"), Some(cfg.clone())).unwrap();
        let fetched = reg.get_path(Path::new("/tmp/demo")).unwrap();
        assert_eq!(added.path, fetched.path);
        assert_eq!(fetched.config, Some(cfg));
    }

    #[test]
    fn add_path_duplicate_fails() {
        let reg = registry();
        reg.add_path(Path::new("/tmp/demo"), None).unwrap();
        let err = reg.add_path(Path::new("/tmp/demo"), None).unwrap_err();
        assert!(matches!(err, RegistryError::AlreadyExists { .. }));
    }

    #[test]
    fn remove_path_missing_fails() {
        let reg = registry();
        let err = reg.remove_path(Path::new("/tmp/nope")).unwrap_err();
        assert!(err.is_not_found());
    }

    #[test]
    fn find_containing_path_prefers_deepest() {
        let reg = registry();
        reg.add_path(Path::new("/tmp"), None).unwrap();
        reg.add_path(Path::new("/tmp/demo"), None).unwrap();
        let found = reg.find_containing_path(Path::new("/tmp/demo/file.rs")).unwrap().unwrap();
        assert_eq!(found.path, PathBuf::from("/tmp/demo").to_string_lossy());
    }

    #[test]
    fn find_containing_path_none_when_unrelated() {
        let reg = registry();
        reg.add_path(Path::new("/tmp/demo"), None).unwrap();
        assert!(reg.find_containing_path(Path::new("/other/file.rs")).unwrap().is_none());
    }

    #[test]
    fn staged_transitions_clear_then_redo() {
        let reg = registry();
        reg.update_metadata_state("/f", "h1", "m1", 10, Utc::now()).unwrap();
        reg.update_semantic_state("/f", "v1", Some("rate")).unwrap();
        reg.update_semantic_state("/f", "v1", Some("rate")).unwrap();
        reg.update_semantic_state("/f", "v1", None).unwrap();

        let row = reg.get_file_state("/f").unwrap().unwrap();
        assert!(row.metadata_analyzed_at.is_some());
        assert!(row.semantic_analyzed_at.is_some());
        assert_eq!(row.semantic_error, None);
        assert_eq!(row.semantic_retry_count, 0);
        assert_eq!(row.analysis_version.as_deref(), Some("v1"));
    }

    #[test]
    fn clear_analysis_state_nulls_everything() {
        let reg = registry();
        reg.update_metadata_state("/f", "h1", "m1", 10, Utc::now()).unwrap();
        reg.update_semantic_state("/f", "v1", None).unwrap();
        reg.clear_analysis_state("/f").unwrap();
        let row = reg.get_file_state("/f").unwrap().unwrap();
        assert!(row.metadata_analyzed_at.is_none());
        assert!(row.semantic_analyzed_at.is_none());
        assert!(row.embeddings_analyzed_at.is_none());
        assert_eq!(row.semantic_retry_count, 0);
        assert_eq!(row.embeddings_retry_count, 0);
    }

    #[test]
    fn invariant_semantic_implies_metadata() {
        let reg = registry();
        reg.update_metadata_state("/f", "h1", "m1", 10, Utc::now()).unwrap();
        reg.update_semantic_state("/f", "v1", None).unwrap();
        let row = reg.get_file_state("/f").unwrap().unwrap();
        assert!(row.metadata_analyzed_at.is_some());
    }

    #[test]
    fn critical_event_cap_drops_oldest() {
        let reg = registry().with_queue_cap(5);
        for payload in 0u8..=6 {
            reg.enqueue("evt", &[payload]).unwrap();
        }
        assert_eq!(reg.len().unwrap(), 5);
        let mut seen = Vec::new();
        for _ in 0..6 {
            if let Some(event) = reg.try_dequeue().unwrap() {
                seen.push(event.payload[0]);
            }
        }
        assert_eq!(seen, vec![2, 3, 4, 5, 6]);
    }

    #[test]
    fn scheduling_queries_respect_stage_order() {
        let reg = registry();
        reg.update_metadata_state("/a", "h1", "m1", 1, Utc::now()).unwrap();
        reg.update_metadata_state("/b", "h1", "m1", 1, Utc::now()).unwrap();
        reg.update_semantic_state("/a", "v1", None).unwrap();

        let needing_metadata = reg.list_files_needing_metadata("/").unwrap();
        assert!(needing_metadata.is_empty());

        let needing_semantic = reg.list_files_needing_semantic("/", Some(3)).unwrap();
        assert_eq!(needing_semantic.len(), 1);
        assert_eq!(needing_semantic[0].path, "/b");

        let needing_embeddings = reg.list_files_needing_embeddings("/", Some(3)).unwrap();
        assert_eq!(needing_embeddings.len(), 1);
        assert_eq!(needing_embeddings[0].path, "/a");
    }

    #[test]
    fn restart_preserves_rows_and_schema_version() {
        let dir = tempfile::tempdir().unwrap();
        let db_path = dir.path().join("registry.db");
        {
            let reg = Registry::open(&db_path).unwrap();
            reg.add_path(Path::new("/tmp/demo"), None).unwrap();
        }
        let reg = Registry::open(&db_path).unwrap();
        assert!(reg.get_path(Path::new("/tmp/demo")).is_ok());
        assert_eq!(reg.schema_version().unwrap(), 1);
    }
}
