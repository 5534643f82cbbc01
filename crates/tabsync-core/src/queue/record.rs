//! Queued task record: the persisted unit of the send queue.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::domain::{BillTask, TaskId};

/// One pending mutation plus its retry bookkeeping.
///
/// Persisted as `{ id, task: { kind, payload }, tries, nextAt, ... }`.
/// Running is never persisted: a crash mid-run leaves the record due again.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueuedTask {
    pub id: TaskId,
    pub task: BillTask,

    /// Failed attempts so far.
    #[serde(default)]
    pub tries: u32,

    /// Earliest time the engine may run this task.
    pub next_at: DateTime<Utc>,

    pub enqueued_at: DateTime<Utc>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
}

impl QueuedTask {
    /// New record, due immediately.
    pub fn new(id: TaskId, task: BillTask, now: DateTime<Utc>) -> Self {
        Self {
            id,
            task,
            tries: 0,
            next_at: now,
            enqueued_at: now,
            last_error: None,
        }
    }

    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.next_at <= now
    }

    /// Record a failure and push `next_at` out by `delay`.
    pub fn schedule_retry(&mut self, now: DateTime<Utc>, delay: std::time::Duration, error: String) {
        let delay = chrono::Duration::from_std(delay).unwrap_or(chrono::Duration::MAX);
        self.next_at = now.checked_add_signed(delay).unwrap_or(DateTime::<Utc>::MAX_UTC);
        self.last_error = Some(error);
    }
}
