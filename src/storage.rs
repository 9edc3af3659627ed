//! SQLite-backed idempotency store.
//!
//! Durable record of every job id the worker has answered, so a job is
//! executed at most once no matter how many times its queue line is read.
//! Bounded: once the capacity is exceeded the oldest entries (by
//! `processed_at`) are pruned in the same transaction as the commit.
//!
//! The store is owned by exactly one worker. Two workers sharing a file
//! would need coordination this module does not provide.

use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::{Connection, OptionalExtension, params};
use std::path::Path;
use tracing::{debug, warn};

use crate::error::{Error, Result};
use crate::model::{ProcessedJobRecord, ResultStatus};

/// What a commit did to the store.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Commit {
    /// First time this job id was recorded.
    Inserted,
    /// Job id was already recorded; only its occurrence count moved.
    OccurrenceAdded,
}

/// Idempotency store. Owns the SQLite connection.
pub struct IdempotencyStore {
    conn: Connection,
    capacity: usize,
}

impl IdempotencyStore {
    /// Open or create a store at the given path, creating parent directories.
    pub fn open(path: impl AsRef<Path>, capacity: usize) -> Result<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(path)?;
        let mut store = Self { conn, capacity };
        store.init()?;
        Ok(store)
    }

    /// Create an in-memory store (for testing).
    pub fn in_memory(capacity: usize) -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        let mut store = Self { conn, capacity };
        store.init()?;
        Ok(store)
    }

    fn init(&mut self) -> Result<()> {
        if self.capacity == 0 {
            return Err(Error::Config(
                "idempotency store capacity must be greater than zero".to_string(),
            ));
        }

        self.conn.execute_batch("PRAGMA journal_mode=WAL;")?;

        self.conn.execute_batch(
            "
            CREATE TABLE IF NOT EXISTS processed_jobs (
                job_id          TEXT PRIMARY KEY,
                processed_at    TEXT NOT NULL,
                status          TEXT NOT NULL
            );
            ",
        )?;

        // Stores written by earlier worker versions lack the occurrence column.
        if !self.has_column("processed_jobs", "occurrences")? {
            self.conn.execute_batch(
                "ALTER TABLE processed_jobs ADD COLUMN occurrences INTEGER NOT NULL DEFAULT 1;",
            )?;
        }

        self.conn.execute_batch(
            "CREATE INDEX IF NOT EXISTS idx_processed_at ON processed_jobs(processed_at);",
        )?;

        // Earlier workers recorded successful jobs as "ok".
        let migrated = self.conn.execute(
            "UPDATE processed_jobs SET status = 'created' WHERE status = 'ok'",
            [],
        )?;
        if migrated > 0 {
            debug!(migrated, "renamed legacy 'ok' statuses to 'created'");
        }

        Ok(())
    }

    fn has_column(&self, table: &str, column: &str) -> Result<bool> {
        let mut stmt = self.conn.prepare(&format!("PRAGMA table_info({table})"))?;
        let names = stmt
            .query_map([], |row| row.get::<_, String>(1))?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(names.iter().any(|n| n == column))
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    // -----------------------------------------------------------------------
    // Reads
    // -----------------------------------------------------------------------

    /// Look up a job id.
    ///
    /// A row whose status or timestamp cannot be read still counts as
    /// recorded; see [`parse_record`].
    pub fn lookup(&self, job_id: &str) -> Result<Option<ProcessedJobRecord>> {
        Ok(self
            .conn
            .query_row(
                "SELECT job_id, processed_at, status, occurrences FROM processed_jobs WHERE job_id = ?1",
                params![job_id],
                row_to_record,
            )
            .optional()?)
    }

    /// Most recently processed entries first.
    pub fn list_recent(&self, limit: usize) -> Result<Vec<ProcessedJobRecord>> {
        let mut stmt = self.conn.prepare(
            "SELECT job_id, processed_at, status, occurrences FROM processed_jobs
             ORDER BY processed_at DESC, rowid DESC LIMIT ?1",
        )?;
        let rows = stmt
            .query_map(params![limit as i64], row_to_record)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    /// Number of recorded job ids.
    pub fn len(&self) -> Result<usize> {
        let n: i64 = self
            .conn
            .query_row("SELECT COUNT(*) FROM processed_jobs", [], |row| row.get(0))?;
        Ok(n as usize)
    }

    pub fn is_empty(&self) -> Result<bool> {
        Ok(self.len()? == 0)
    }

    // -----------------------------------------------------------------------
    // Writes
    // -----------------------------------------------------------------------

    /// Record that one more queue line carrying `job_id` has been answered.
    ///
    /// A fresh job id is inserted with `status` and `processed_at`. A known
    /// one keeps its original status and timestamp; only its occurrence
    /// count is incremented, so a duplicate never re-persists as a new entry.
    pub fn commit(
        &mut self,
        job_id: &str,
        status: ResultStatus,
        processed_at: DateTime<Utc>,
    ) -> Result<Commit> {
        let tx = self.conn.transaction()?;

        let updated = tx.execute(
            "UPDATE processed_jobs SET occurrences = occurrences + 1 WHERE job_id = ?1",
            params![job_id],
        )?;

        let commit = if updated > 0 {
            Commit::OccurrenceAdded
        } else {
            tx.execute(
                "INSERT INTO processed_jobs (job_id, processed_at, status, occurrences)
                 VALUES (?1, ?2, ?3, 1)",
                params![job_id, format_timestamp(processed_at), status.to_string()],
            )?;
            Commit::Inserted
        };

        let pruned = prune_on(&tx, self.capacity)?;
        tx.commit()?;

        if pruned > 0 {
            debug!(pruned, capacity = self.capacity, "pruned idempotency store");
        }
        Ok(commit)
    }
}

// ---------------------------------------------------------------------------
// Inner functions
// ---------------------------------------------------------------------------

/// Delete the oldest entries beyond `capacity`. Returns how many went.
fn prune_on(conn: &Connection, capacity: usize) -> Result<usize> {
    let count: i64 = conn.query_row("SELECT COUNT(*) FROM processed_jobs", [], |row| row.get(0))?;
    let excess = count - capacity as i64;
    if excess <= 0 {
        return Ok(0);
    }
    let deleted = conn.execute(
        "DELETE FROM processed_jobs WHERE rowid IN (
             SELECT rowid FROM processed_jobs ORDER BY processed_at ASC, rowid ASC LIMIT ?1
         )",
        params![excess],
    )?;
    Ok(deleted)
}

fn format_timestamp(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn row_to_record(row: &rusqlite::Row) -> rusqlite::Result<ProcessedJobRecord> {
    Ok(parse_record(
        row.get(0)?,
        row.get(1)?,
        row.get(2)?,
        row.get(3)?,
    ))
}

/// Build a record from raw column values.
///
/// The row's existence is what keeps a job from running twice, so an
/// unreadable status reads as `error` and an unreadable timestamp as the
/// Unix epoch rather than failing the lookup.
fn parse_record(
    job_id: String,
    processed_at: String,
    status: String,
    occurrences: i64,
) -> ProcessedJobRecord {
    let processed_at = match DateTime::parse_from_rfc3339(&processed_at) {
        Ok(ts) => ts.with_timezone(&Utc),
        Err(e) => {
            warn!(job_id = %job_id, error = %e, "unreadable processed_at in idempotency store");
            DateTime::<Utc>::UNIX_EPOCH
        }
    };
    let status = status.parse::<ResultStatus>().unwrap_or_else(|e| {
        warn!(job_id = %job_id, error = %e, "unreadable status in idempotency store");
        ResultStatus::Error
    });
    ProcessedJobRecord {
        job_id,
        processed_at,
        status,
        occurrences: occurrences.max(0) as u32,
    }
}
