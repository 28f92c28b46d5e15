//! SQLite baseline store: one row per observed file plus the `meta` iteration
//! counter.
//!
//! Every operation is a single statement, so atomicity is per record. The
//! connection is not shared: callers that need concurrent access wrap the
//! store in a mutex (see [`crate::store::SharedStore`]).
//!
//! Transient open/busy/locked failures (another process holding the file) are
//! retried with linear backoff before surfacing as `StoreUnavailable`. Each
//! retry is reported as an `ActivityEvent::StoreRetry` on the store's logger.

#![allow(missing_docs)]
#![allow(clippy::cast_possible_wrap, clippy::cast_sign_loss)]

use std::path::{Path, PathBuf};
use std::thread;
use std::time::Duration;

use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::types::Type;
use rusqlite::{Connection, ErrorCode, OpenFlags, OptionalExtension, Row, params};

use crate::core::errors::{BrsError, Result};
use crate::logger::activity::{ActivityEvent, ActivityLoggerHandle};

const ITERATION_KEY: &str = "iteration";

/// Last-known-good state of one file path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileRecord {
    pub id: i64,
    pub path: String,
    pub content_hash: String,
    pub mtime: DateTime<Utc>,
    pub iteration: u64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Fields for a first observation.
#[derive(Debug, Clone)]
pub struct NewRecord<'a> {
    pub path: &'a str,
    pub content_hash: &'a str,
    pub mtime: DateTime<Utc>,
    pub iteration: u64,
}

/// Fields overwritten when a file is re-baselined.
#[derive(Debug, Clone)]
pub struct RecordUpdate<'a> {
    pub content_hash: &'a str,
    pub mtime: DateTime<Utc>,
    pub iteration: u64,
}

/// Bounded retry for transient SQLite failures.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub attempts: u32,
    pub backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            attempts: 5,
            backoff: Duration::from_millis(200),
        }
    }
}

/// Persisted baseline of file hashes.
pub struct BaselineStore {
    conn: Connection,
    path: PathBuf,
    retry: RetryPolicy,
    logger: ActivityLoggerHandle,
}

impl BaselineStore {
    /// Open (or create) the baseline at `path`, applying schema and PRAGMAs.
    pub fn open(path: &Path, retry: RetryPolicy, busy_timeout: Duration) -> Result<Self> {
        Self::open_logged(path, retry, busy_timeout, ActivityLoggerHandle::disconnected())
    }

    /// Like [`BaselineStore::open`], reporting transient failures to `logger`.
    pub fn open_logged(
        path: &Path,
        retry: RetryPolicy,
        busy_timeout: Duration,
        logger: ActivityLoggerHandle,
    ) -> Result<Self> {
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent).map_err(|source| BrsError::Io {
                path: parent.to_path_buf(),
                source,
            })?;
        }

        let conn = retry_transient(retry, &logger, "open", || {
            let conn = Connection::open_with_flags(
                path,
                OpenFlags::SQLITE_OPEN_READ_WRITE
                    | OpenFlags::SQLITE_OPEN_CREATE
                    | OpenFlags::SQLITE_OPEN_NO_MUTEX,
            )?;
            conn.busy_timeout(busy_timeout)?;
            apply_pragmas(&conn)?;
            apply_schema(&conn)?;
            Ok(conn)
        })
        .map_err(|failure| failure.into_error())?;

        Ok(Self {
            conn,
            path: path.to_path_buf(),
            retry,
            logger,
        })
    }

    /// In-memory baseline, used by tests and dry runs.
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        apply_schema(&conn)?;
        Ok(Self {
            conn,
            path: PathBuf::from(":memory:"),
            retry: RetryPolicy::default(),
            logger: ActivityLoggerHandle::disconnected(),
        })
    }

    /// Path to the database file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    // ──────────────────── meta ────────────────────

    /// Current global iteration counter.
    pub fn iteration(&self) -> Result<u64> {
        let raw: String = self.run("iteration", |conn| {
            conn.query_row(
                "SELECT value FROM meta WHERE key = ?1",
                params![ITERATION_KEY],
                |row| row.get(0),
            )
        })?;
        parse_iteration(&raw)
    }

    pub fn set_iteration(&self, value: u64) -> Result<()> {
        self.run("set_iteration", |conn| {
            conn.prepare_cached(
                "INSERT INTO meta (key, value) VALUES (?1, ?2)
                 ON CONFLICT(key) DO UPDATE SET value = excluded.value",
            )?
            .execute(params![ITERATION_KEY, value.to_string()])
        })?;
        Ok(())
    }

    /// Bump the iteration counter in one statement and return the new value.
    pub fn increment_iteration(&self) -> Result<u64> {
        let raw: String = self.run("increment_iteration", |conn| {
            conn.query_row(
                "UPDATE meta SET value = CAST(CAST(value AS INTEGER) + 1 AS TEXT)
                 WHERE key = ?1 RETURNING value",
                params![ITERATION_KEY],
                |row| row.get(0),
            )
        })?;
        parse_iteration(&raw)
    }

    // ──────────────────── files ────────────────────

    pub fn find_by_path(&self, path: &str) -> Result<Option<FileRecord>> {
        self.run("find_by_path", |conn| {
            conn.prepare_cached(
                "SELECT id, path, hash, mtime, iteration, created_at, updated_at
                 FROM files WHERE path = ?1",
            )?
            .query_row(params![path], record_from_row)
            .optional()
        })
    }

    /// Insert a first observation. Fails with `DuplicatePath` when the unique
    /// path (or path+hash) index already holds the path.
    pub fn insert(&self, record: &NewRecord<'_>) -> Result<i64> {
        let now = format_ts(Utc::now());
        let mtime = format_ts(record.mtime);
        let outcome = retry_transient(self.retry, &self.logger, "insert", || {
            self.conn
                .prepare_cached(
                    "INSERT INTO files (path, hash, mtime, iteration, created_at, updated_at)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?5)",
                )?
                .execute(params![
                    record.path,
                    record.content_hash,
                    mtime,
                    record.iteration as i64,
                    now,
                ])?;
            Ok(self.conn.last_insert_rowid())
        });
        match outcome {
            Ok(id) => Ok(id),
            Err(StoreFailure::Sql(err)) if is_constraint_violation(&err) => {
                Err(BrsError::DuplicatePath {
                    path: record.path.to_string(),
                })
            }
            Err(failure) => Err(failure.into_error()),
        }
    }

    /// Overwrite hash, mtime and iteration for `path`. Returns whether a row
    /// was touched.
    pub fn update(&self, path: &str, fields: &RecordUpdate<'_>) -> Result<bool> {
        let now = format_ts(Utc::now());
        let mtime = format_ts(fields.mtime);
        let changed = self.run("update", |conn| {
            conn.prepare_cached(
                "UPDATE files SET hash = ?2, mtime = ?3, iteration = ?4, updated_at = ?5
                 WHERE path = ?1",
            )?
            .execute(params![
                path,
                fields.content_hash,
                mtime,
                fields.iteration as i64,
                now
            ])
        })?;
        Ok(changed > 0)
    }

    pub fn delete(&self, id: i64) -> Result<bool> {
        let deleted = self.run("delete", |conn| {
            conn.prepare_cached("DELETE FROM files WHERE id = ?1")?
                .execute(params![id])
        })?;
        Ok(deleted > 0)
    }

    /// Visit every record, in no particular order, and collect those the
    /// predicate accepts.
    pub fn for_each<P>(&self, mut predicate: P) -> Result<Vec<FileRecord>>
    where
        P: FnMut(&FileRecord) -> bool,
    {
        self.run("for_each", |conn| {
            let mut stmt = conn.prepare_cached(
                "SELECT id, path, hash, mtime, iteration, created_at, updated_at FROM files",
            )?;
            let mut rows = stmt.query([])?;
            let mut selected = Vec::new();
            while let Some(row) = rows.next()? {
                let record = record_from_row(row)?;
                if predicate(&record) {
                    selected.push(record);
                }
            }
            Ok(selected)
        })
    }

    pub fn count(&self) -> Result<u64> {
        let count: i64 = self.run("count", |conn| {
            conn.query_row("SELECT COUNT(*) FROM files", [], |row| row.get(0))
        })?;
        Ok(count as u64)
    }

    /// Check that WAL mode is active (for diagnostics).
    pub fn is_wal_mode(&self) -> bool {
        self.conn
            .query_row("PRAGMA journal_mode", [], |row| row.get::<_, String>(0))
            .is_ok_and(|mode| mode.eq_ignore_ascii_case("wal"))
    }

    fn run<T, F>(&self, context: &'static str, mut op: F) -> Result<T>
    where
        F: FnMut(&Connection) -> rusqlite::Result<T>,
    {
        retry_transient(self.retry, &self.logger, context, || op(&self.conn))
            .map_err(StoreFailure::into_error)
    }
}

// ──────────────────── retry ────────────────────

enum StoreFailure {
    Sql(rusqlite::Error),
    Exhausted {
        attempts: u32,
        last: rusqlite::Error,
    },
}

impl StoreFailure {
    fn into_error(self) -> BrsError {
        match self {
            Self::Sql(err) => err.into(),
            Self::Exhausted { attempts, last } => BrsError::StoreUnavailable {
                attempts,
                details: last.to_string(),
            },
        }
    }
}

fn retry_transient<T, F>(
    policy: RetryPolicy,
    logger: &ActivityLoggerHandle,
    context: &'static str,
    mut op: F,
) -> std::result::Result<T, StoreFailure>
where
    F: FnMut() -> rusqlite::Result<T>,
{
    let attempts = policy.attempts.max(1);
    let mut attempt = 1;
    loop {
        match op() {
            Ok(value) => return Ok(value),
            Err(err) if is_transient(&err) => {
                if attempt >= attempts {
                    return Err(StoreFailure::Exhausted {
                        attempts: attempt,
                        last: err,
                    });
                }
                logger.send(ActivityEvent::StoreRetry {
                    operation: context.to_string(),
                    attempt,
                    attempts,
                    message: err.to_string(),
                });
                thread::sleep(policy.backoff * attempt);
                attempt += 1;
            }
            Err(err) => return Err(StoreFailure::Sql(err)),
        }
    }
}

fn sqlite_code(err: &rusqlite::Error) -> Option<ErrorCode> {
    match err {
        rusqlite::Error::SqliteFailure(inner, _) => Some(inner.code),
        _ => None,
    }
}

fn is_transient(err: &rusqlite::Error) -> bool {
    matches!(
        sqlite_code(err),
        Some(ErrorCode::CannotOpen | ErrorCode::DatabaseBusy | ErrorCode::DatabaseLocked)
    )
}

fn is_constraint_violation(err: &rusqlite::Error) -> bool {
    sqlite_code(err) == Some(ErrorCode::ConstraintViolation)
}

// ──────────────────── row mapping ────────────────────

fn record_from_row(row: &Row<'_>) -> rusqlite::Result<FileRecord> {
    let iteration: i64 = row.get(4)?;
    Ok(FileRecord {
        id: row.get(0)?,
        path: row.get(1)?,
        content_hash: row.get(2)?,
        mtime: ts_column(row, 3)?,
        iteration: iteration.max(0) as u64,
        created_at: ts_column(row, 5)?,
        updated_at: ts_column(row, 6)?,
    })
}

fn ts_column(row: &Row<'_>, idx: usize) -> rusqlite::Result<DateTime<Utc>> {
    let raw: String = row.get(idx)?;
    parse_ts(&raw)
        .map_err(|err| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(err)))
}

/// RFC 3339 with nanoseconds, so a stored mtime round-trips exactly.
pub(crate) fn format_ts(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Nanos, true)
}

pub(crate) fn parse_ts(raw: &str) -> std::result::Result<DateTime<Utc>, chrono::ParseError> {
    DateTime::parse_from_rfc3339(raw).map(|ts| ts.with_timezone(&Utc))
}

fn parse_iteration(raw: &str) -> Result<u64> {
    raw.trim().parse::<u64>().map_err(|err| BrsError::Sql {
        context: "meta.iteration",
        details: format!("corrupt iteration value {raw:?}: {err}"),
    })
}

// ──────────────────── schema & pragmas ────────────────────

fn apply_pragmas(conn: &Connection) -> rusqlite::Result<()> {
    conn.execute_batch(
        "PRAGMA journal_mode = WAL;
         PRAGMA synchronous = NORMAL;
         PRAGMA temp_store = MEMORY;",
    )
}

fn apply_schema(conn: &Connection) -> rusqlite::Result<()> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS meta (
            key TEXT NOT NULL UNIQUE,
            value TEXT
        );

        CREATE TABLE IF NOT EXISTS files (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            path TEXT NOT NULL,
            hash TEXT NOT NULL,
            mtime DATETIME NOT NULL,
            iteration INTEGER NOT NULL DEFAULT 0,
            created_at DATETIME NOT NULL,
            updated_at DATETIME NOT NULL
        );

        CREATE UNIQUE INDEX IF NOT EXISTS idx_files_path ON files(path);
        CREATE UNIQUE INDEX IF NOT EXISTS idx_files_path_hash ON files(path, hash);

        INSERT OR IGNORE INTO meta (key, value) VALUES ('iteration', '0');",
    )
}

// ──────────────────── tests ────────────────────
