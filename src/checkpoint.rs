//! Checkpoint persistence: sqlite-backed per-field task state
//!
//! Every (batch, entity, field) task has exactly one row whose state moves
//! pending -> in_progress -> done | failed. The row is upserted before the
//! browser exchange starts and finalized right after the workbook commit, so
//! a crash at any point leaves a consistent picture: `in_progress` rows are
//! tasks the process died inside of, and get requeued on resume.
//!
//! A second table, `query_log`, is an append-only audit trail of every
//! exchange attempt; nothing reads it at runtime.

use std::fmt;
use std::path::Path;
use std::sync::{Mutex, MutexGuard};

use chrono::Utc;
use rusqlite::{params, Connection, OptionalExtension};
use tracing::{debug, info};

use crate::error::ExtractError;
use crate::parser::Confidence;

/// Lifecycle state of one field task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskState {
    Pending,
    InProgress,
    Done,
    Failed,
}

impl TaskState {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskState::Pending => "pending",
            TaskState::InProgress => "in_progress",
            TaskState::Done => "done",
            TaskState::Failed => "failed",
        }
    }

    fn parse(s: &str) -> Result<Self, ExtractError> {
        match s {
            "pending" => Ok(TaskState::Pending),
            "in_progress" => Ok(TaskState::InProgress),
            "done" => Ok(TaskState::Done),
            "failed" => Ok(TaskState::Failed),
            other => Err(ExtractError::Persistence(format!(
                "unknown task state in checkpoint: {other}"
            ))),
        }
    }
}

impl fmt::Display for TaskState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One checkpointed field task row.
#[derive(Debug, Clone)]
pub struct CheckpointRecord {
    pub batch_id: String,
    pub entity_key: String,
    pub entity_name: String,
    pub field_name: String,
    pub state: TaskState,
    pub value: Option<String>,
    pub url: Option<String>,
    pub confidence: Option<Confidence>,
    pub attempts: u32,
    pub last_error: Option<String>,
}

/// Per-state row counts for one batch.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TaskCounts {
    pub pending: usize,
    pub in_progress: usize,
    pub done: usize,
    pub failed: usize,
}

impl TaskCounts {
    pub fn total(&self) -> usize {
        self.pending + self.in_progress + self.done + self.failed
    }
}

/// Sqlite-backed checkpoint store.
///
/// The connection sits behind a mutex so the store can be shared by the
/// spawned batch task; rusqlite's statement cache is not thread-safe.
pub struct CheckpointStore {
    conn: Mutex<Connection>,
}

impl CheckpointStore {
    /// Open (or create) the checkpoint database at `path`.
    pub fn open(path: &Path) -> Result<Self, ExtractError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| ExtractError::Persistence(format!("create {parent:?}: {e}")))?;
        }
        let conn = Connection::open(path)?;
        Self::from_connection(conn)
    }

    /// In-memory store for tests.
    pub fn in_memory() -> Result<Self, ExtractError> {
        Self::from_connection(Connection::open_in_memory()?)
    }

    fn from_connection(conn: Connection) -> Result<Self, ExtractError> {
        // Concurrent batches open their own connections to the same file.
        conn.busy_timeout(std::time::Duration::from_secs(5))?;
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.pragma_update(None, "synchronous", "NORMAL")?;
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS field_tasks (
                batch_id    TEXT NOT NULL,
                entity_key  TEXT NOT NULL,
                entity_name TEXT NOT NULL,
                field_name  TEXT NOT NULL,
                state       TEXT NOT NULL,
                value       TEXT,
                url         TEXT,
                confidence  TEXT,
                attempts    INTEGER NOT NULL DEFAULT 0,
                last_error  TEXT,
                updated_at  TEXT NOT NULL,
                PRIMARY KEY (batch_id, entity_key, field_name)
            );
            CREATE INDEX IF NOT EXISTS idx_field_tasks_state
                ON field_tasks (batch_id, state);
            CREATE TABLE IF NOT EXISTS query_log (
                id         INTEGER PRIMARY KEY AUTOINCREMENT,
                batch_id   TEXT NOT NULL,
                entity_key TEXT NOT NULL,
                prompt     TEXT NOT NULL,
                response   TEXT NOT NULL,
                outcome    TEXT NOT NULL,
                logged_at  TEXT NOT NULL
            );",
        )?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn lock(&self) -> MutexGuard<'_, Connection> {
        match self.conn.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Register a task as pending if it has no row yet. Existing rows keep
    /// their state, which is what makes re-running a batch idempotent.
    pub fn ensure_task(
        &self,
        batch_id: &str,
        entity_key: &str,
        entity_name: &str,
        field_name: &str,
    ) -> Result<(), ExtractError> {
        self.lock().execute(
            "INSERT INTO field_tasks
                 (batch_id, entity_key, entity_name, field_name, state, attempts, updated_at)
             VALUES (?1, ?2, ?3, ?4, 'pending', 0, ?5)
             ON CONFLICT (batch_id, entity_key, field_name) DO NOTHING",
            params![batch_id, entity_key, entity_name, field_name, now()],
        )?;
        Ok(())
    }

    pub fn mark_in_progress(
        &self,
        batch_id: &str,
        entity_key: &str,
        field_name: &str,
        attempts: u32,
    ) -> Result<(), ExtractError> {
        self.lock().execute(
            "UPDATE field_tasks
                SET state = 'in_progress', attempts = ?4, updated_at = ?5
              WHERE batch_id = ?1 AND entity_key = ?2 AND field_name = ?3",
            params![batch_id, entity_key, field_name, attempts, now()],
        )?;
        Ok(())
    }

    /// Finalize a task with its extracted value. Overwriting an already-done
    /// row with the same data is harmless, so retried commits stay safe.
    pub fn mark_done(
        &self,
        batch_id: &str,
        entity_key: &str,
        field_name: &str,
        value: Option<&str>,
        url: Option<&str>,
        confidence: Confidence,
    ) -> Result<(), ExtractError> {
        self.lock().execute(
            "UPDATE field_tasks
                SET state = 'done', value = ?4, url = ?5, confidence = ?6,
                    last_error = NULL, updated_at = ?7
              WHERE batch_id = ?1 AND entity_key = ?2 AND field_name = ?3",
            params![batch_id, entity_key, field_name, value, url, confidence.as_str(), now()],
        )?;
        Ok(())
    }

    pub fn mark_failed(
        &self,
        batch_id: &str,
        entity_key: &str,
        field_name: &str,
        attempts: u32,
        error: &str,
    ) -> Result<(), ExtractError> {
        self.lock().execute(
            "UPDATE field_tasks
                SET state = 'failed', attempts = ?4, last_error = ?5, updated_at = ?6
              WHERE batch_id = ?1 AND entity_key = ?2 AND field_name = ?3",
            params![batch_id, entity_key, field_name, attempts, error, now()],
        )?;
        Ok(())
    }

    pub fn get(
        &self,
        batch_id: &str,
        entity_key: &str,
        field_name: &str,
    ) -> Result<Option<CheckpointRecord>, ExtractError> {
        self.lock()
            .query_row(
                "SELECT batch_id, entity_key, entity_name, field_name, state,
                        value, url, confidence, attempts, last_error
                   FROM field_tasks
                  WHERE batch_id = ?1 AND entity_key = ?2 AND field_name = ?3",
                params![batch_id, entity_key, field_name],
                row_to_record,
            )
            .optional()?
            .map(record_from_row)
            .transpose()
    }

    /// All done rows for a batch, ordered by entity then field. Used to
    /// rebuild the workbook grid on resume.
    pub fn list_done(&self, batch_id: &str) -> Result<Vec<CheckpointRecord>, ExtractError> {
        self.list_in_state(batch_id, TaskState::Done)
    }

    pub fn list_pending(&self, batch_id: &str) -> Result<Vec<CheckpointRecord>, ExtractError> {
        self.list_in_state(batch_id, TaskState::Pending)
    }

    /// Rows a previous process died inside of.
    pub fn list_crashed(&self, batch_id: &str) -> Result<Vec<CheckpointRecord>, ExtractError> {
        self.list_in_state(batch_id, TaskState::InProgress)
    }

    pub fn list_in_state(
        &self,
        batch_id: &str,
        state: TaskState,
    ) -> Result<Vec<CheckpointRecord>, ExtractError> {
        let conn = self.lock();
        let mut stmt = conn.prepare(
            "SELECT batch_id, entity_key, entity_name, field_name, state,
                    value, url, confidence, attempts, last_error
               FROM field_tasks
              WHERE batch_id = ?1 AND state = ?2
              ORDER BY entity_key, field_name",
        )?;
        let rows = stmt.query_map(params![batch_id, state.as_str()], row_to_record)?;
        let mut records = Vec::new();
        for row in rows {
            records.push(record_from_row(row?)?);
        }
        Ok(records)
    }

    /// Requeue rows the process died inside of. Returns how many moved.
    pub fn requeue_crashed(&self, batch_id: &str) -> Result<usize, ExtractError> {
        let moved = self.lock().execute(
            "UPDATE field_tasks SET state = 'pending', updated_at = ?2
              WHERE batch_id = ?1 AND state = 'in_progress'",
            params![batch_id, now()],
        )?;
        if moved > 0 {
            info!(batch_id, moved, "requeued tasks interrupted by a previous run");
        }
        Ok(moved)
    }

    /// Give failed tasks whose attempt count is below the ceiling another
    /// chance on resume. Tasks at or over the ceiling stay failed.
    pub fn requeue_failed_below(
        &self,
        batch_id: &str,
        max_attempts: u32,
    ) -> Result<usize, ExtractError> {
        let moved = self.lock().execute(
            "UPDATE field_tasks SET state = 'pending', updated_at = ?3
              WHERE batch_id = ?1 AND state = 'failed' AND attempts < ?2",
            params![batch_id, max_attempts, now()],
        )?;
        if moved > 0 {
            debug!(batch_id, moved, "requeued failed tasks below attempt ceiling");
        }
        Ok(moved)
    }

    pub fn counts(&self, batch_id: &str) -> Result<TaskCounts, ExtractError> {
        let conn = self.lock();
        let mut stmt = conn.prepare(
            "SELECT state, COUNT(*) FROM field_tasks WHERE batch_id = ?1 GROUP BY state",
        )?;
        let rows = stmt.query_map(params![batch_id], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?))
        })?;

        let mut counts = TaskCounts::default();
        for row in rows {
            let (state, n) = row?;
            let n = n as usize;
            match TaskState::parse(&state)? {
                TaskState::Pending => counts.pending = n,
                TaskState::InProgress => counts.in_progress = n,
                TaskState::Done => counts.done = n,
                TaskState::Failed => counts.failed = n,
            }
        }
        Ok(counts)
    }

    /// Append one exchange attempt to the audit log. Nothing reads this at
    /// runtime; it exists for after-the-fact debugging of prompt drift.
    pub fn log_query(
        &self,
        batch_id: &str,
        entity_key: &str,
        prompt: &str,
        response: &str,
        outcome: &str,
    ) -> Result<(), ExtractError> {
        self.lock().execute(
            "INSERT INTO query_log
                 (batch_id, entity_key, prompt, response, outcome, logged_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![batch_id, entity_key, prompt, response, outcome, now()],
        )?;
        Ok(())
    }

    #[cfg(test)]
    pub fn query_log_len(&self, batch_id: &str) -> Result<usize, ExtractError> {
        let n: i64 = self.lock().query_row(
            "SELECT COUNT(*) FROM query_log WHERE batch_id = ?1",
            params![batch_id],
            |row| row.get(0),
        )?;
        Ok(n as usize)
    }
}

fn now() -> String {
    Utc::now().to_rfc3339()
}

type RawRow = (
    String,
    String,
    String,
    String,
    String,
    Option<String>,
    Option<String>,
    Option<String>,
    u32,
    Option<String>,
);

fn row_to_record(row: &rusqlite::Row<'_>) -> rusqlite::Result<RawRow> {
    Ok((
        row.get(0)?,
        row.get(1)?,
        row.get(2)?,
        row.get(3)?,
        row.get(4)?,
        row.get(5)?,
        row.get(6)?,
        row.get(7)?,
        row.get(8)?,
        row.get(9)?,
    ))
}

fn record_from_row(raw: RawRow) -> Result<CheckpointRecord, ExtractError> {
    let (batch_id, entity_key, entity_name, field_name, state, value, url, confidence, attempts, last_error) =
        raw;
    let confidence = match confidence {
        Some(ref s) => Some(Confidence::parse(s).ok_or_else(|| {
            ExtractError::Persistence(format!("unknown confidence in checkpoint: {s}"))
        })?),
        None => None,
    };
    Ok(CheckpointRecord {
        batch_id,
        entity_key,
        entity_name,
        field_name,
        state: TaskState::parse(&state)?,
        value,
        url,
        confidence,
        attempts,
        last_error,
    })
}
