use std::path::Path;
use std::sync::{Mutex, MutexGuard};

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use tracing::debug;

use reach_core::canon::Canonicalizer;
use reach_core::error::{ReachError, Result};
use reach_core::types::RunId;

use crate::machine::{Machine, MachineState, RunStatus, STATE_MAX_DEPTH};

/// Serialized machine state plus its canonical hash.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunSnapshot {
    pub run_id: RunId,
    pub hash: String,
    pub taken_at: DateTime<Utc>,
    pub state: MachineState,
}

impl RunSnapshot {
    /// Capture `machine`. Undelivered outbox events are not part of the
    /// snapshot, so take it after the outbox has been flushed.
    pub fn capture(machine: &Machine) -> Result<Self> {
        let state = machine.state().clone();
        Ok(Self {
            run_id: state.run_id.clone(),
            hash: Self::state_hash(&state)?,
            taken_at: Utc::now(),
            state,
        })
    }

    pub fn state_hash(state: &MachineState) -> Result<String> {
        let value = serde_json::to_value(state)?;
        Canonicalizer::new(STATE_MAX_DEPTH).hash(&value)
    }

    pub fn status(&self) -> RunStatus {
        self.state.status
    }
}

/// Summary row for listing checkpoints.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CheckpointInfo {
    pub run_id: RunId,
    pub status: String,
    pub hash: String,
    pub taken_at: DateTime<Utc>,
}

fn storage(context: &str, e: impl std::fmt::Display) -> ReachError {
    ReachError::Storage(format!("{}: {}", context, e))
}

/// Persistent checkpoint store backed by SQLite. One row per run; saving
/// again replaces the previous snapshot.
pub struct CheckpointStore {
    conn: Mutex<Connection>,
}

impl CheckpointStore {
    /// Open or create the checkpoint database.
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| storage("Failed to create checkpoint directory", e))?;
        }
        let conn = Connection::open(path).map_err(|e| storage("Failed to open checkpoint store", e))?;
        Self::init(conn, true)
    }

    pub fn in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()
            .map_err(|e| storage("Failed to open checkpoint store", e))?;
        Self::init(conn, false)
    }

    fn init(conn: Connection, wal: bool) -> Result<Self> {
        if wal {
            conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA synchronous=NORMAL;")
                .map_err(|e| storage("Failed to configure checkpoint store", e))?;
        }
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS checkpoints (
                 run_id TEXT PRIMARY KEY,
                 status TEXT NOT NULL,
                 state_hash TEXT NOT NULL,
                 state_json TEXT NOT NULL,
                 taken_at TEXT NOT NULL
             );",
        )
        .map_err(|e| storage("Failed to initialize checkpoint schema", e))?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn lock(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn save(&self, snapshot: &RunSnapshot) -> Result<()> {
        let state_json = serde_json::to_string(&snapshot.state)?;
        self.lock()
            .execute(
                "INSERT OR REPLACE INTO checkpoints (run_id, status, state_hash, state_json, taken_at)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![
                    snapshot.run_id.as_str(),
                    snapshot.status().as_str(),
                    snapshot.hash,
                    state_json,
                    snapshot.taken_at.to_rfc3339(),
                ],
            )
            .map_err(|e| storage("Failed to save checkpoint", e))?;
        debug!(run_id = %snapshot.run_id, status = %snapshot.status(), "Checkpoint saved");
        Ok(())
    }

    /// Latest snapshot for `run_id`. The stored hash is returned as-is;
    /// callers decide whether to trust it.
    pub fn load(&self, run_id: &RunId) -> Result<Option<RunSnapshot>> {
        let conn = self.lock();
        let row = conn
            .query_row(
                "SELECT state_hash, state_json, taken_at FROM checkpoints WHERE run_id = ?1",
                params![run_id.as_str()],
                |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, String>(2)?,
                    ))
                },
            )
            .optional()
            .map_err(|e| storage("Failed to load checkpoint", e))?;

        let Some((hash, state_json, taken_at)) = row else {
            return Ok(None);
        };
        let state: MachineState = serde_json::from_str(&state_json)
            .map_err(|e| ReachError::Schema(format!("corrupt checkpoint for {}: {}", run_id, e)))?;
        let taken_at = DateTime::parse_from_rfc3339(&taken_at)
            .map(|dt| dt.with_timezone(&Utc))
            .unwrap_or_else(|_| Utc::now());
        Ok(Some(RunSnapshot {
            run_id: run_id.clone(),
            hash,
            taken_at,
            state,
        }))
    }

    pub fn delete(&self, run_id: &RunId) -> Result<usize> {
        self.lock()
            .execute(
                "DELETE FROM checkpoints WHERE run_id = ?1",
                params![run_id.as_str()],
            )
            .map_err(|e| storage("Failed to delete checkpoint", e))
    }

    pub fn list(&self) -> Result<Vec<CheckpointInfo>> {
        let conn = self.lock();
        let mut stmt = conn
            .prepare("SELECT run_id, status, state_hash, taken_at FROM checkpoints ORDER BY taken_at DESC")
            .map_err(|e| storage("Failed to prepare query", e))?;
        let rows = stmt
            .query_map([], |row| {
                let taken_at: String = row.get(3)?;
                Ok(CheckpointInfo {
                    run_id: RunId(row.get(0)?),
                    status: row.get(1)?,
                    hash: row.get(2)?,
                    taken_at: DateTime::parse_from_rfc3339(&taken_at)
                        .map(|dt| dt.with_timezone(&Utc))
                        .unwrap_or_else(|_| Utc::now()),
                })
            })
            .map_err(|e| storage("Failed to list checkpoints", e))?;
        rows.collect::<std::result::Result<Vec<_>, _>>()
            .map_err(|e| storage("Failed to read checkpoint row", e))
    }
}
