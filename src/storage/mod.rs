//! SQLite persistence for runs and events.
//!
//! One database file shared sequentially by the backtest (writer) process and
//! the query server. Schema initialization is idempotent so either process can
//! open the file first.
//!
//! Optimizations follow the signal store:
//! - WAL mode for concurrent reads during writes
//! - Prepared statement caching
//! - Batch inserts in a single IMMEDIATE transaction
//! - Pre-serialization outside the connection lock

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rusqlite::{params, Connection, OpenFlags, TransactionBehavior};
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::events::model::{
    BacktestEvent, Category, EventType, Run, RunSummary, Severity, ValidationError,
};

const SCHEMA_SQL: &str = r#"
PRAGMA journal_mode = WAL;
PRAGMA synchronous = NORMAL;
PRAGMA cache_size = -32000;
PRAGMA temp_store = MEMORY;
PRAGMA foreign_keys = ON;

CREATE TABLE IF NOT EXISTS backtest_runs (
    id TEXT PRIMARY KEY,
    start_time TEXT NOT NULL,
    end_time TEXT NOT NULL,
    strategy_config_hash TEXT NOT NULL,
    created_at TEXT NOT NULL
) WITHOUT ROWID;

CREATE TABLE IF NOT EXISTS events (
    event_id TEXT PRIMARY KEY,
    run_id TEXT NOT NULL REFERENCES backtest_runs(id) ON DELETE CASCADE,
    timestamp TEXT NOT NULL,
    event_type TEXT NOT NULL,
    severity TEXT NOT NULL,
    category TEXT NOT NULL,
    properties TEXT NOT NULL,
    parent_event_id TEXT,
    validation_errors TEXT
) WITHOUT ROWID;

CREATE INDEX IF NOT EXISTS idx_events_run_type
    ON events(run_id, event_type);

CREATE INDEX IF NOT EXISTS idx_events_run_timestamp
    ON events(run_id, timestamp);
"#;

// =============================================================================
// Query parameters and paging
// =============================================================================

pub const DEFAULT_PAGE_SIZE: u32 = 100;

/// Conjunctive event filter. `run_id` is the only required field.
#[derive(Debug, Clone)]
pub struct EventQuery {
    pub run_id: String,
    pub event_type: Option<EventType>,
    pub severity: Option<Severity>,
    pub category: Option<Category>,
    pub start_time: Option<DateTime<Utc>>,
    pub end_time: Option<DateTime<Utc>>,
    pub page_size: u32,
    pub page_index: u32,
}

impl EventQuery {
    pub fn for_run(run_id: impl Into<String>) -> Self {
        Self {
            run_id: run_id.into(),
            event_type: None,
            severity: None,
            category: None,
            start_time: None,
            end_time: None,
            page_size: DEFAULT_PAGE_SIZE,
            page_index: 0,
        }
    }

    pub fn with_type(mut self, event_type: EventType) -> Self {
        self.event_type = Some(event_type);
        self
    }

    pub fn with_page(mut self, page_index: u32, page_size: u32) -> Self {
        self.page_index = page_index;
        self.page_size = page_size;
        self
    }
}

/// One page of results plus the total match count for pagination UI.
#[derive(Debug, Clone)]
pub struct EventPage {
    pub events: Vec<BacktestEvent>,
    pub total_count: u64,
    pub page_index: u32,
    pub page_size: u32,
}

// =============================================================================
// Event store
// =============================================================================

/// Repository over the shared database file.
pub struct EventStore {
    conn: Arc<Mutex<Connection>>,
}

impl EventStore {
    /// Open or create the database at `path`, initializing the schema.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();

        if let Some(parent) = path.parent() {
            if !parent.exists() && !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).with_context(|| {
                    format!("Failed to create database directory {}", parent.display())
                })?;
            }
        }

        let flags = OpenFlags::SQLITE_OPEN_READ_WRITE
            | OpenFlags::SQLITE_OPEN_CREATE
            | OpenFlags::SQLITE_OPEN_NO_MUTEX;

        let conn = Connection::open_with_flags(path, flags)
            .with_context(|| format!("Failed to open database at {}", path.display()))?;

        conn.execute_batch(SCHEMA_SQL)
            .context("Failed to initialize event log schema")?;

        let journal_mode: String = conn
            .query_row("PRAGMA journal_mode", [], |row| row.get(0))
            .unwrap_or_default();
        if journal_mode.to_lowercase() != "wal" {
            warn!("WAL mode not active, journal_mode = {}", journal_mode);
        }

        info!(path = %path.display(), "Event log database opened");

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// In-memory store for tests.
    pub fn open_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch(SCHEMA_SQL)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    // -------------------------------------------------------------------------
    // Runs
    // -------------------------------------------------------------------------

    /// Insert the run record. Runs are immutable; inserting an existing id is
    /// an error.
    pub fn create_run(&self, run: &Run) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO backtest_runs (id, start_time, end_time, strategy_config_hash, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                run.id,
                run.start_time.to_rfc3339(),
                run.end_time.to_rfc3339(),
                run.strategy_config_hash,
                run.created_at.to_rfc3339(),
            ],
        )
        .with_context(|| format!("Failed to create run {}", run.id))?;
        Ok(())
    }

    pub fn get_run(&self, id: &str) -> Result<Option<Run>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare_cached(
            "SELECT id, start_time, end_time, strategy_config_hash, created_at
             FROM backtest_runs WHERE id = ?1",
        )?;
        let run = stmt
            .query_map(params![id], |row| {
                Ok(RawRun {
                    id: row.get(0)?,
                    start_time: row.get(1)?,
                    end_time: row.get(2)?,
                    strategy_config_hash: row.get(3)?,
                    created_at: row.get(4)?,
                })
            })?
            .next()
            .transpose()?
            .map(RawRun::into_run)
            .transpose()?;
        Ok(run)
    }

    /// All runs, newest first, with per-run event counts.
    pub fn list_runs(&self) -> Result<Vec<RunSummary>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare_cached(
            "SELECT r.id, r.start_time, r.end_time, r.strategy_config_hash, r.created_at,
                    (SELECT COUNT(*) FROM events e WHERE e.run_id = r.id)
             FROM backtest_runs r
             ORDER BY r.created_at DESC, r.id",
        )?;
        let rows = stmt.query_map([], |row| {
            Ok((
                RawRun {
                    id: row.get(0)?,
                    start_time: row.get(1)?,
                    end_time: row.get(2)?,
                    strategy_config_hash: row.get(3)?,
                    created_at: row.get(4)?,
                },
                row.get::<_, i64>(5)?,
            ))
        })?;

        let mut summaries = Vec::new();
        for row in rows {
            let (raw, count) = row?;
            let run = raw.into_run()?;
            summaries.push(RunSummary {
                id: run.id,
                start_time: run.start_time,
                end_time: run.end_time,
                strategy_config_hash: run.strategy_config_hash,
                created_at: run.created_at,
                event_count: count as u64,
            });
        }
        Ok(summaries)
    }

    /// Delete a run and, via the cascade, all of its events.
    pub fn delete_run(&self, id: &str) -> Result<bool> {
        let conn = self.conn.lock();
        let changes = conn.execute("DELETE FROM backtest_runs WHERE id = ?1", params![id])?;
        Ok(changes > 0)
    }

    // -------------------------------------------------------------------------
    // Events
    // -------------------------------------------------------------------------

    /// Insert a batch in one transaction. Duplicate event ids are ignored
    /// (uniqueness is enforced here; the id space is caller-generated UUIDs).
    /// Returns the number of rows actually inserted.
    ///
    /// The transaction is scoped: any statement failure rolls it back on drop,
    /// so a failed batch leaves the shared connection clean for the writer's
    /// retry (a dangling open transaction would make every later
    /// `BEGIN IMMEDIATE` fail and turn one bad batch into permanent loss).
    pub fn insert_events(&self, events: &[BacktestEvent]) -> Result<usize> {
        if events.is_empty() {
            return Ok(0);
        }

        // Pre-serialize outside the lock.
        let serialized: Vec<_> = events
            .iter()
            .map(|e| {
                let properties = serde_json::to_string(&e.properties).unwrap_or_default();
                let validation_errors = e
                    .validation_errors
                    .as_ref()
                    .map(|v| serde_json::to_string(v).unwrap_or_default());
                (e, properties, validation_errors)
            })
            .collect();

        let mut conn = self.conn.lock();
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        let mut inserted = 0usize;
        for (event, properties, validation_errors) in &serialized {
            let changes = tx.execute(
                "INSERT OR IGNORE INTO events
                 (event_id, run_id, timestamp, event_type, severity, category,
                  properties, parent_event_id, validation_errors)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
                params![
                    event.event_id,
                    event.run_id,
                    event.timestamp.to_rfc3339(),
                    event.event_type.as_str(),
                    event.severity.as_str(),
                    event.category.as_str(),
                    properties,
                    event.parent_event_id,
                    validation_errors,
                ],
            )?;
            inserted += changes;
        }

        tx.commit()?;
        debug!(inserted, batch = events.len(), "Event batch persisted");
        Ok(inserted)
    }

    /// Paged conjunctive filter query, ordered by (timestamp, event_id) for a
    /// deterministic page sequence.
    pub fn query_events(&self, query: &EventQuery) -> Result<EventPage> {
        let mut clauses = vec!["run_id = ?".to_string()];
        let mut args: Vec<String> = vec![query.run_id.clone()];

        if let Some(event_type) = query.event_type {
            clauses.push("event_type = ?".to_string());
            args.push(event_type.as_str().to_string());
        }
        if let Some(severity) = query.severity {
            clauses.push("severity = ?".to_string());
            args.push(severity.as_str().to_string());
        }
        if let Some(category) = query.category {
            clauses.push("category = ?".to_string());
            args.push(category.as_str().to_string());
        }
        if let Some(start) = query.start_time {
            clauses.push("timestamp >= ?".to_string());
            args.push(start.to_rfc3339());
        }
        if let Some(end) = query.end_time {
            clauses.push("timestamp <= ?".to_string());
            args.push(end.to_rfc3339());
        }

        let where_clause = clauses.join(" AND ");
        let page_size = query.page_size.max(1);

        let conn = self.conn.lock();

        let total_count: i64 = conn.query_row(
            &format!("SELECT COUNT(*) FROM events WHERE {}", where_clause),
            rusqlite::params_from_iter(args.iter()),
            |row| row.get(0),
        )?;

        let sql = format!(
            "SELECT event_id, run_id, timestamp, event_type, severity, category,
                    properties, parent_event_id, validation_errors
             FROM events WHERE {}
             ORDER BY timestamp ASC, event_id ASC
             LIMIT {} OFFSET {}",
            where_clause,
            page_size,
            page_size as u64 * query.page_index as u64,
        );

        let mut stmt = conn.prepare(&sql)?;
        let raw_rows = stmt
            .query_map(rusqlite::params_from_iter(args.iter()), Self::row_to_raw)?
            .collect::<Result<Vec<_>, _>>()?;
        drop(stmt);
        drop(conn);

        let mut events = Vec::with_capacity(raw_rows.len());
        for raw in raw_rows {
            events.push(raw.into_event()?);
        }

        Ok(EventPage {
            events,
            total_count: total_count as u64,
            page_index: query.page_index,
            page_size,
        })
    }

    /// All events for a run in timestamp order, unpaged. Used by replay-style
    /// consumers (snapshot, sequence traversal) that need the full stream.
    pub fn load_run_events(&self, run_id: &str) -> Result<Vec<BacktestEvent>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare_cached(
            "SELECT event_id, run_id, timestamp, event_type, severity, category,
                    properties, parent_event_id, validation_errors
             FROM events WHERE run_id = ?1
             ORDER BY timestamp ASC, event_id ASC",
        )?;
        let raw_rows = stmt
            .query_map(params![run_id], Self::row_to_raw)?
            .collect::<Result<Vec<_>, _>>()?;
        drop(stmt);
        drop(conn);

        let mut events = Vec::with_capacity(raw_rows.len());
        for raw in raw_rows {
            events.push(raw.into_event()?);
        }
        Ok(events)
    }

    pub fn count_run_events(&self, run_id: &str) -> Result<u64> {
        let conn = self.conn.lock();
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM events WHERE run_id = ?1",
            params![run_id],
            |row| row.get(0),
        )?;
        Ok(count as u64)
    }

    fn row_to_raw(row: &rusqlite::Row<'_>) -> rusqlite::Result<RawEvent> {
        Ok(RawEvent {
            event_id: row.get(0)?,
            run_id: row.get(1)?,
            timestamp: row.get(2)?,
            event_type: row.get(3)?,
            severity: row.get(4)?,
            category: row.get(5)?,
            properties: row.get(6)?,
            parent_event_id: row.get(7)?,
            validation_errors: row.get(8)?,
        })
    }
}

// =============================================================================
// Row decoding
// =============================================================================

struct RawRun {
    id: String,
    start_time: String,
    end_time: String,
    strategy_config_hash: String,
    created_at: String,
}

impl RawRun {
    fn into_run(self) -> Result<Run> {
        Ok(Run {
            id: self.id,
            start_time: parse_timestamp(&self.start_time)?,
            end_time: parse_timestamp(&self.end_time)?,
            strategy_config_hash: self.strategy_config_hash,
            created_at: parse_timestamp(&self.created_at)?,
        })
    }
}

struct RawEvent {
    event_id: String,
    run_id: String,
    timestamp: String,
    event_type: String,
    severity: String,
    category: String,
    properties: String,
    parent_event_id: Option<String>,
    validation_errors: Option<String>,
}

impl RawEvent {
    fn into_event(self) -> Result<BacktestEvent> {
        let event_type = EventType::parse(&self.event_type)
            .with_context(|| format!("Unknown event_type in storage: {}", self.event_type))?;
        let severity = Severity::parse(&self.severity)
            .with_context(|| format!("Unknown severity in storage: {}", self.severity))?;
        let category = Category::parse(&self.category)
            .with_context(|| format!("Unknown category in storage: {}", self.category))?;
        let validation_errors: Option<Vec<ValidationError>> = match self.validation_errors {
            Some(json) => Some(serde_json::from_str(&json).with_context(|| {
                format!("Corrupt validation_errors for event {}", self.event_id)
            })?),
            None => None,
        };

        Ok(BacktestEvent {
            event_id: self.event_id,
            run_id: self.run_id,
            timestamp: parse_timestamp(&self.timestamp)?,
            event_type,
            severity,
            category,
            properties: serde_json::from_str(&self.properties).unwrap_or(serde_json::Value::Null),
            parent_event_id: self.parent_event_id,
            validation_errors,
        })
    }
}

fn parse_timestamp(s: &str) -> Result<DateTime<Utc>> {
    Ok(DateTime::parse_from_rfc3339(s)
        .with_context(|| format!("Invalid timestamp in storage: {}", s))?
        .with_timezone(&Utc))
}
