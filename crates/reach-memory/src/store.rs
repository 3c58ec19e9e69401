use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use rusqlite::{params, Connection, OptionalExtension};
use std::path::Path;
use std::sync::Mutex;
use tracing::debug;

use reach_core::error::{ReachError, Result};
use reach_core::traits::StorageDriver;
use reach_core::types::{Event, RunId};

const SCHEMA: &str = "CREATE TABLE IF NOT EXISTS events (
        run_id TEXT NOT NULL,
        seq INTEGER NOT NULL,
        type TEXT NOT NULL,
        payload TEXT NOT NULL,
        timestamp TEXT,
        PRIMARY KEY (run_id, seq)
    );";

fn db_err(e: impl std::fmt::Display) -> ReachError {
    ReachError::Storage(e.to_string())
}

/// One row per stored run.
#[derive(Debug, Clone, PartialEq)]
pub struct RunSummary {
    pub run_id: RunId,
    pub events: u64,
    pub last_type: Option<String>,
}

/// SQLite-backed event storage.
///
/// Events are keyed by `(run_id, seq)`. A second write of the same key is
/// ignored, so retrying a failed flush never duplicates history.
pub struct SqliteStorage {
    conn: Mutex<Connection>,
}

impl SqliteStorage {
    /// Open or create a database at `path`.
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| db_err(format!("Failed to create db directory: {}", e)))?;
        }

        let conn = Connection::open(path).map_err(db_err)?;
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA synchronous=NORMAL;")
            .map_err(db_err)?;
        conn.execute_batch(SCHEMA).map_err(db_err)?;

        debug!(path = %path.display(), "Event storage opened");
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Open an in-memory database (for testing).
    pub fn in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().map_err(db_err)?;
        conn.execute_batch(SCHEMA).map_err(db_err)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Stored runs, ordered by run id.
    pub fn list_runs(&self) -> Result<Vec<RunSummary>> {
        let conn = self.conn.lock().map_err(db_err)?;
        let mut stmt = conn
            .prepare(
                "SELECT e.run_id, COUNT(*),
                        (SELECT type FROM events l WHERE l.run_id = e.run_id ORDER BY seq DESC LIMIT 1)
                 FROM events e GROUP BY e.run_id ORDER BY e.run_id",
            )
            .map_err(db_err)?;
        let rows = stmt
            .query_map([], |row| {
                let run_id: String = row.get(0)?;
                let events: i64 = row.get(1)?;
                let last_type: Option<String> = row.get(2)?;
                Ok(RunSummary {
                    run_id: RunId::from(run_id.as_str()),
                    events: events as u64,
                    last_type,
                })
            })
            .map_err(db_err)?;
        let runs = rows
            .collect::<std::result::Result<Vec<_>, _>>()
            .map_err(db_err)?;
        Ok(runs)
    }

    /// Highest stored sequence number for a run.
    pub fn last_seq(&self, run_id: &RunId) -> Result<Option<u64>> {
        let conn = self.conn.lock().map_err(db_err)?;
        let seq: Option<i64> = conn
            .query_row(
                "SELECT MAX(seq) FROM events WHERE run_id = ?1",
                params![run_id.as_str()],
                |row| row.get(0),
            )
            .optional()
            .map_err(db_err)?
            .flatten();
        Ok(seq.map(|s| s as u64))
    }

    /// Remove every event of a run. Returns the number of rows deleted.
    pub fn delete_run(&self, run_id: &RunId) -> Result<usize> {
        let conn = self.conn.lock().map_err(db_err)?;
        let n = conn
            .execute(
                "DELETE FROM events WHERE run_id = ?1",
                params![run_id.as_str()],
            )
            .map_err(db_err)?;
        debug!(run_id = %run_id, deleted = n, "Run events deleted");
        Ok(n)
    }
}

impl StorageDriver for SqliteStorage {
    fn put(&self, run_id: &RunId, event: &Event) -> BoxFuture<'_, Result<()>> {
        let run_id = run_id.to_string();
        let seq = event.seq as i64;
        let event_type = event.event_type.clone();
        let payload = serde_json::to_string(&event.payload);
        let timestamp = event.timestamp.map(|t| t.to_rfc3339());

        Box::pin(async move {
            let payload = payload?;
            let conn = self.conn.lock().map_err(db_err)?;
            conn.execute(
                "INSERT OR IGNORE INTO events (run_id, seq, type, payload, timestamp)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![run_id, seq, event_type, payload, timestamp],
            )
            .map_err(db_err)?;
            Ok(())
        })
    }

    fn get_events(&self, run_id: &RunId) -> BoxFuture<'_, Result<Vec<Event>>> {
        let run_id = run_id.to_string();

        Box::pin(async move {
            let conn = self.conn.lock().map_err(db_err)?;
            let mut stmt = conn
                .prepare(
                    "SELECT seq, type, payload, timestamp FROM events
                     WHERE run_id = ?1
                     ORDER BY seq ASC",
                )
                .map_err(db_err)?;

            let rows = stmt
                .query_map(params![run_id], |row| {
                    let seq: i64 = row.get(0)?;
                    let event_type: String = row.get(1)?;
                    let payload: String = row.get(2)?;
                    let ts: Option<String> = row.get(3)?;
                    Ok((seq, event_type, payload, ts))
                })
                .map_err(db_err)?;

            let mut events = Vec::new();
            for row in rows {
                let (seq, event_type, payload, ts) = row.map_err(db_err)?;
                let timestamp = ts
                    .as_deref()
                    .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
                    .map(|dt| dt.with_timezone(&Utc));
                events.push(Event {
                    seq: seq as u64,
                    event_type,
                    payload: serde_json::from_str(&payload)?,
                    timestamp,
                });
            }

            if events.is_empty() {
                return Err(ReachError::RunNotFound(run_id));
            }
            Ok(events)
        })
    }
}
