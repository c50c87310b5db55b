//! SQLite-backed durable store
//!
//! Source of truth for process records. Timestamps are RFC 3339 text; restart
//! attempts use epoch milliseconds so the rolling-window query is a plain
//! integer comparison.

use chrono::{DateTime, Utc};
use rusqlite::types::Type;
use rusqlite::{params, Connection, OptionalExtension, Row};
use serde::de::DeserializeOwned;
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};

use super::record::{HealthSnapshot, ProcessRecord, ProcessStatus};
use super::schema;
use crate::error::Result;

const SELECT_COLUMNS: &str = "name, command, options, status, pid, started_at, stopped_at, \
     restart_count, last_health_check, error_log";

/// Durable store with thread-safe access
#[derive(Clone)]
pub struct SqliteStore {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteStore {
    /// Open or create the database at a specific path
    pub fn open_at(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let conn = Connection::open(path)?;
        let store = Self::from_connection(conn)?;
        tracing::info!("Process store opened at {:?}", path);
        Ok(store)
    }

    /// Private in-memory database
    pub fn open_in_memory() -> Result<Self> {
        Self::from_connection(Connection::open_in_memory()?)
    }

    fn from_connection(conn: Connection) -> Result<Self> {
        schema::create_tables(&conn)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    fn lock(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn get(&self, name: &str) -> Result<Option<ProcessRecord>> {
        let conn = self.lock();
        let sql = format!("SELECT {} FROM processes WHERE name = ?1", SELECT_COLUMNS);
        let record = conn.query_row(&sql, params![name], row_to_record).optional()?;
        Ok(record)
    }

    /// Insert or update the row for `record.name`
    ///
    /// The health columns only move forward: a record read before a newer
    /// `update_health` keeps the stored snapshot.
    pub fn put(&self, record: &ProcessRecord) -> Result<()> {
        let command = serde_json::to_string(&record.command)?;
        let options = serde_json::to_string(&record.options)?;
        let health = record
            .last_health_check
            .as_ref()
            .map(serde_json::to_string)
            .transpose()?;
        let health_at = record
            .last_health_check
            .as_ref()
            .map(|h| h.checked_at.timestamp_millis());

        let conn = self.lock();
        conn.execute(
            r#"
            INSERT INTO processes
                (name, command, options, status, pid, started_at, stopped_at,
                 restart_count, last_health_check, health_checked_at, error_log)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)
            ON CONFLICT(name) DO UPDATE SET
                command = excluded.command,
                options = excluded.options,
                status = excluded.status,
                pid = excluded.pid,
                started_at = excluded.started_at,
                stopped_at = excluded.stopped_at,
                restart_count = excluded.restart_count,
                last_health_check = CASE
                    WHEN excluded.health_checked_at > COALESCE(processes.health_checked_at, -1)
                    THEN excluded.last_health_check
                    ELSE processes.last_health_check END,
                health_checked_at = CASE
                    WHEN excluded.health_checked_at > COALESCE(processes.health_checked_at, -1)
                    THEN excluded.health_checked_at
                    ELSE processes.health_checked_at END,
                error_log = excluded.error_log
            "#,
            params![
                record.name,
                command,
                options,
                record.status.to_string(),
                record.pid,
                record.started_at.map(|t| t.to_rfc3339()),
                record.stopped_at.map(|t| t.to_rfc3339()),
                record.restart_count,
                health,
                health_at,
                record.error_log,
            ],
        )?;
        Ok(())
    }

    pub fn list(&self) -> Result<Vec<ProcessRecord>> {
        let conn = self.lock();
        let sql = format!("SELECT {} FROM processes ORDER BY name", SELECT_COLUMNS);
        let mut stmt = conn.prepare(&sql)?;
        let records = stmt
            .query_map([], row_to_record)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(records)
    }

    /// Records whose status implies a live OS process
    pub fn list_live(&self) -> Result<Vec<ProcessRecord>> {
        Ok(self
            .list()?
            .into_iter()
            .filter(ProcessRecord::is_live)
            .collect())
    }

    /// Update only the health columns; returns false if no row exists
    pub fn update_health(&self, name: &str, snapshot: &HealthSnapshot) -> Result<bool> {
        let health = serde_json::to_string(snapshot)?;
        let conn = self.lock();
        let changed = conn.execute(
            "UPDATE processes SET last_health_check = ?1, health_checked_at = ?2 WHERE name = ?3",
            params![health, snapshot.checked_at.timestamp_millis(), name],
        )?;
        Ok(changed > 0)
    }

    pub fn record_restart_attempt(&self, name: &str, at: DateTime<Utc>) -> Result<()> {
        let conn = self.lock();
        conn.execute(
            "INSERT INTO restart_attempts (name, attempted_at) VALUES (?1, ?2)",
            params![name, at.timestamp_millis()],
        )?;
        Ok(())
    }

    /// Attempts recorded for `name` at or after `since`
    pub fn restart_attempts_since(&self, name: &str, since: DateTime<Utc>) -> Result<u32> {
        let conn = self.lock();
        let count: u32 = conn.query_row(
            "SELECT COUNT(*) FROM restart_attempts WHERE name = ?1 AND attempted_at >= ?2",
            params![name, since.timestamp_millis()],
            |row| row.get(0),
        )?;
        Ok(count)
    }

    /// Forget every attempt for `name`; returns how many were removed
    pub fn clear_restart_attempts(&self, name: &str) -> Result<usize> {
        let conn = self.lock();
        let removed = conn.execute(
            "DELETE FROM restart_attempts WHERE name = ?1",
            params![name],
        )?;
        Ok(removed)
    }

    /// Drop attempts older than `before`; they can no longer count toward a quota
    pub fn prune_restart_attempts(&self, before: DateTime<Utc>) -> Result<usize> {
        let conn = self.lock();
        let removed = conn.execute(
            "DELETE FROM restart_attempts WHERE attempted_at < ?1",
            params![before.timestamp_millis()],
        )?;
        Ok(removed)
    }
}

fn conversion_error(
    idx: usize,
    err: impl std::error::Error + Send + Sync + 'static,
) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(err))
}

fn json_column<T: DeserializeOwned>(row: &Row<'_>, idx: usize) -> rusqlite::Result<T> {
    let text: String = row.get(idx)?;
    serde_json::from_str(&text).map_err(|e| conversion_error(idx, e))
}

fn time_column(row: &Row<'_>, idx: usize) -> rusqlite::Result<Option<DateTime<Utc>>> {
    let text: Option<String> = row.get(idx)?;
    text.map(|t| {
        DateTime::parse_from_rfc3339(&t)
            .map(|dt| dt.with_timezone(&Utc))
            .map_err(|e| conversion_error(idx, e))
    })
    .transpose()
}

fn row_to_record(row: &Row<'_>) -> rusqlite::Result<ProcessRecord> {
    let status: String = row.get(3)?;
    let status: ProcessStatus = status.parse().map_err(|e: String| {
        conversion_error(
            3,
            std::io::Error::new(std::io::ErrorKind::InvalidData, e),
        )
    })?;

    let health: Option<String> = row.get(8)?;
    let last_health_check = health
        .map(|h| serde_json::from_str(&h).map_err(|e| conversion_error(8, e)))
        .transpose()?;

    Ok(ProcessRecord {
        name: row.get(0)?,
        command: json_column(row, 1)?,
        options: json_column(row, 2)?,
        status,
        pid: row.get(4)?,
        started_at: time_column(row, 5)?,
        stopped_at: time_column(row, 6)?,
        restart_count: row.get(7)?,
        last_health_check,
        error_log: row.get(9)?,
    })
}
