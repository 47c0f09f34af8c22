//! Shared progress state for a running batch
//!
//! The orchestrator updates a reporter as it works; the control surface and
//! the CLI progress bar read snapshots from it concurrently. A bounded log
//! ring keeps the most recent activity lines for status output without
//! growing with the batch.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::checkpoint::TaskCounts;

/// Number of recent activity lines retained for status output.
const LOG_RING_CAPACITY: usize = 50;

/// Lifecycle of one batch run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BatchStatus {
    Pending,
    Running,
    Stopping,
    Stopped,
    Completed,
    Failed,
}

impl BatchStatus {
    /// Terminal states accept no further work.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            BatchStatus::Stopped | BatchStatus::Completed | BatchStatus::Failed
        )
    }
}

/// Point-in-time view of a batch, serializable for the status operation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProgressSnapshot {
    pub batch_id: String,
    pub status: BatchStatus,
    pub total: usize,
    pub pending: usize,
    pub in_progress: usize,
    pub done: usize,
    pub failed: usize,
    pub current_entity: Option<String>,
    pub current_field: Option<String>,
    pub last_error: Option<String>,
    pub started_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub recent_log: Vec<String>,
}

impl ProgressSnapshot {
    pub fn finished(&self) -> usize {
        self.done + self.failed
    }
}

struct Inner {
    batch_id: String,
    status: BatchStatus,
    total: usize,
    counts: TaskCounts,
    current_entity: Option<String>,
    current_field: Option<String>,
    last_error: Option<String>,
    started_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
    log: VecDeque<String>,
}

/// Cloneable handle to shared batch progress.
#[derive(Clone)]
pub struct ProgressReporter {
    inner: Arc<Mutex<Inner>>,
}

impl ProgressReporter {
    pub fn new(batch_id: &str, total: usize) -> Self {
        let now = Utc::now();
        Self {
            inner: Arc::new(Mutex::new(Inner {
                batch_id: batch_id.to_string(),
                status: BatchStatus::Pending,
                total,
                counts: TaskCounts::default(),
                current_entity: None,
                current_field: None,
                last_error: None,
                started_at: now,
                updated_at: now,
                log: VecDeque::with_capacity(LOG_RING_CAPACITY),
            })),
        }
    }

    fn update<F: FnOnce(&mut Inner)>(&self, f: F) {
        // A poisoned lock means a panicking writer; the state is still
        // usable for read-mostly progress data.
        let mut inner = match self.inner.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        f(&mut inner);
        inner.updated_at = Utc::now();
    }

    pub fn set_status(&self, status: BatchStatus) {
        self.update(|i| i.status = status);
    }

    pub fn set_counts(&self, counts: TaskCounts) {
        self.update(|i| i.counts = counts);
    }

    pub fn set_current(&self, entity: &str, field: &str) {
        self.update(|i| {
            i.current_entity = Some(entity.to_string());
            i.current_field = Some(field.to_string());
        });
    }

    pub fn set_last_error(&self, error: impl Into<String>) {
        self.update(|i| i.last_error = Some(error.into()));
    }

    pub fn clear_current(&self) {
        self.update(|i| {
            i.current_entity = None;
            i.current_field = None;
        });
    }

    /// Append one activity line, evicting the oldest beyond capacity.
    pub fn log(&self, line: impl Into<String>) {
        self.update(|i| {
            if i.log.len() == LOG_RING_CAPACITY {
                i.log.pop_front();
            }
            i.log
                .push_back(format!("[{}] {}", Utc::now().format("%H:%M:%S"), line.into()));
        });
    }

    pub fn snapshot(&self) -> ProgressSnapshot {
        let inner = match self.inner.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        ProgressSnapshot {
            batch_id: inner.batch_id.clone(),
            status: inner.status,
            total: inner.total,
            pending: inner.counts.pending,
            in_progress: inner.counts.in_progress,
            done: inner.counts.done,
            failed: inner.counts.failed,
            current_entity: inner.current_entity.clone(),
            current_field: inner.current_field.clone(),
            last_error: inner.last_error.clone(),
            started_at: inner.started_at,
            updated_at: inner.updated_at,
            recent_log: inner.log.iter().cloned().collect(),
        }
    }
}
