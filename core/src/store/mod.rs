//! SQLite persistence layer.
//!
//! RULE: Only the store talks to the database.
//! Engine components call store methods, they never execute SQL directly.
//!
//! Concurrency: every worker owns its own `Store` (one connection each,
//! see `reopen`). A unit of work is a `BEGIN IMMEDIATE` transaction, which
//! takes the database write lock up front and waits up to the configured
//! busy timeout for it. Inside a unit of work, store methods run against
//! the same connection and so join the open transaction.

mod approval_log;
mod bucket;
mod claim_log;
mod file_history;

use crate::{
    config::StoreConfig,
    error::{EngineError, EngineResult},
    event::{EventLogEntry, LifecycleEvent},
    types::to_millis,
};
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, Transaction, TransactionBehavior};
use std::time::Duration;

const MIGRATIONS: &[(i64, &str)] = &[
    (1, include_str!("../../../migrations/001_foundation.sql")),
    (2, include_str!("../../../migrations/002_buckets.sql")),
    (3, include_str!("../../../migrations/003_audit_logs.sql")),
    (4, include_str!("../../../migrations/004_file_generation.sql")),
];

pub struct Store {
    conn: Connection,
    path: Option<String>, // None for :memory:, Some(path) for file
    busy_timeout: Duration,
}

impl Store {
    pub fn open(path: &str) -> EngineResult<Self> {
        Self::open_with(path, &StoreConfig::default())
    }

    pub fn open_with(path: &str, config: &StoreConfig) -> EngineResult<Self> {
        let conn = Connection::open_with_flags(
            path,
            rusqlite::OpenFlags::SQLITE_OPEN_READ_WRITE
                | rusqlite::OpenFlags::SQLITE_OPEN_CREATE
                | rusqlite::OpenFlags::SQLITE_OPEN_URI,
        )?;
        // WAL mode only for real files; :memory: ignores it.
        let _ = conn.execute_batch("PRAGMA journal_mode=WAL;");
        conn.execute_batch("PRAGMA foreign_keys=ON;")?;
        let busy_timeout = Duration::from_millis(config.busy_timeout_ms);
        conn.busy_timeout(busy_timeout)?;
        Ok(Self {
            conn,
            path: Some(path.to_string()),
            busy_timeout,
        })
    }

    /// Open an in-memory database (used in tests). Cannot be reopened.
    pub fn in_memory() -> EngineResult<Self> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch("PRAGMA foreign_keys=ON;")?;
        Ok(Self {
            conn,
            path: None,
            busy_timeout: Duration::from_millis(StoreConfig::default().busy_timeout_ms),
        })
    }

    /// A second connection to the same database file, for another worker.
    pub fn reopen(&self) -> EngineResult<Self> {
        match &self.path {
            Some(path) => Self::open_with(
                path,
                &StoreConfig {
                    busy_timeout_ms: self.busy_timeout.as_millis() as u64,
                },
            ),
            None => Err(EngineError::InMemoryStore),
        }
    }

    pub fn path(&self) -> Option<&str> {
        self.path.as_deref()
    }

    /// Apply all schema migrations in order. Safe to run repeatedly.
    pub fn migrate(&self) -> EngineResult<()> {
        for (version, sql) in MIGRATIONS {
            self.conn.execute_batch(sql)?;
            self.conn.execute(
                "INSERT OR IGNORE INTO schema_version (version, applied_at) VALUES (?1, ?2)",
                params![version, to_millis(Utc::now())],
            )?;
        }
        Ok(())
    }

    pub fn schema_version(&self) -> EngineResult<i64> {
        let version = self.conn.query_row(
            "SELECT COALESCE(MAX(version), 0) FROM schema_version",
            [],
            |row| row.get(0),
        )?;
        Ok(version)
    }

    /// Begin a unit of work holding the database write lock. Dropping the
    /// returned transaction without committing rolls everything back.
    pub fn unit_of_work(&self) -> EngineResult<Transaction<'_>> {
        Ok(Transaction::new_unchecked(
            &self.conn,
            TransactionBehavior::Immediate,
        )?)
    }

    // ── Event log ──────────────────────────────────────────────

    pub fn append_event(&self, event: &LifecycleEvent, at: DateTime<Utc>) -> EngineResult<()> {
        let payload = serde_json::to_string(event)?;
        self.conn.execute(
            "INSERT INTO event_log (subject, event_type, payload, created_at)
             VALUES (?1, ?2, ?3, ?4)",
            params![event.subject(), event.event_type(), payload, to_millis(at)],
        )?;
        Ok(())
    }

    pub fn events_for_subject(&self, subject: &str) -> EngineResult<Vec<EventLogEntry>> {
        let mut stmt = self.conn.prepare(
            "SELECT id, subject, event_type, payload, created_at
             FROM event_log WHERE subject = ?1
             ORDER BY id ASC",
        )?;
        let entries = stmt
            .query_map(params![subject], |row| {
                Ok(EventLogEntry {
                    id: Some(row.get(0)?),
                    subject: row.get(1)?,
                    event_type: row.get(2)?,
                    payload: row.get(3)?,
                    created_at: row.get(4)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(entries)
    }

    /// Decoded lifecycle events for one bucket or file, oldest first.
    pub fn lifecycle_events(&self, subject: &str) -> EngineResult<Vec<LifecycleEvent>> {
        self.events_for_subject(subject)?
            .iter()
            .map(|entry| serde_json::from_str(&entry.payload).map_err(EngineError::from))
            .collect()
    }

    pub fn event_count(&self, event_type: &str) -> EngineResult<i64> {
        let count = self.conn.query_row(
            "SELECT COUNT(*) FROM event_log WHERE event_type = ?1",
            params![event_type],
            |row| row.get(0),
        )?;
        Ok(count)
    }
}

// ── Row helpers ────────────────────────────────────────────────────

fn ts(ms: i64) -> rusqlite::Result<DateTime<Utc>> {
    DateTime::from_timestamp_millis(ms).ok_or_else(|| {
        rusqlite::Error::FromSqlConversionFailure(
            0,
            rusqlite::types::Type::Integer,
            format!("timestamp out of range: {ms}").into(),
        )
    })
}

fn opt_ts(ms: Option<i64>) -> rusqlite::Result<Option<DateTime<Utc>>> {
    ms.map(ts).transpose()
}

fn opt_millis(at: Option<DateTime<Utc>>) -> Option<i64> {
    at.map(to_millis)
}
