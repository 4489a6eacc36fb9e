//! Task record model stored in the tasks table

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::error::{QueueError, Result};

// ============================================================================
// Task ids
// ============================================================================

/// Opaque task identifier (UUID v4 text).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TaskId(String);

impl TaskId {
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<String> for TaskId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl From<&str> for TaskId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

// ============================================================================
// Task status
// ============================================================================

/// Task lifecycle status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    Pending,
    Queued,
    Processing,
    Retrying,
    Complete,
    Error,
}

impl TaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Pending => "pending",
            TaskStatus::Queued => "queued",
            TaskStatus::Processing => "processing",
            TaskStatus::Retrying => "retrying",
            TaskStatus::Complete => "complete",
            TaskStatus::Error => "error",
        }
    }

    pub fn from_db(value: &str) -> Result<Self> {
        match value {
            "pending" => Ok(TaskStatus::Pending),
            "queued" => Ok(TaskStatus::Queued),
            "processing" => Ok(TaskStatus::Processing),
            "retrying" => Ok(TaskStatus::Retrying),
            "complete" => Ok(TaskStatus::Complete),
            "error" => Ok(TaskStatus::Error),
            other => Err(QueueError::InvalidStatus(other.to_string())),
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, TaskStatus::Complete | TaskStatus::Error)
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ============================================================================
// Tasks
// ============================================================================

/// Task - one row of the tasks table.
///
/// `id` and `status` live in their own columns; everything else is carried
/// in the JSON payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    pub id: TaskId,
    pub status: TaskStatus,
    pub task_type: String,
    pub target_id: i64,
    /// Lower value runs first
    pub priority: i32,
    #[serde(default)]
    pub metadata: serde_json::Value,
    #[serde(default)]
    pub depends_on: Option<TaskId>,
    #[serde(default)]
    pub batch_id: Option<String>,
    #[serde(default)]
    pub attempts: u32,
    pub max_attempts: u32,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub queued_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub failed_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub retry_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub last_error: Option<String>,
}

impl Task {
    /// Whether a worker may claim this task at `now`, ignoring dependencies.
    pub fn is_claimable(&self, now: DateTime<Utc>) -> bool {
        match self.status {
            TaskStatus::Pending => true,
            TaskStatus::Retrying => self.retry_at.map_or(true, |at| at <= now),
            _ => false,
        }
    }
}

/// NewTask - request to create a task
#[derive(Debug, Clone, PartialEq)]
pub struct NewTask {
    pub task_type: String,
    pub target_id: i64,
    pub priority: i32,
    pub metadata: serde_json::Value,
    pub depends_on: Option<TaskId>,
    pub batch_id: Option<String>,
    /// Falls back to the queue's configured default when unset
    pub max_attempts: Option<u32>,
}

pub const DEFAULT_PRIORITY: i32 = 5;

impl NewTask {
    pub fn new(task_type: impl Into<String>, target_id: i64) -> Self {
        Self {
            task_type: task_type.into(),
            target_id,
            priority: DEFAULT_PRIORITY,
            metadata: serde_json::Value::Object(Default::default()),
            depends_on: None,
            batch_id: None,
            max_attempts: None,
        }
    }

    pub fn priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    pub fn metadata(mut self, metadata: serde_json::Value) -> Self {
        self.metadata = metadata;
        self
    }

    pub fn depends_on(mut self, id: TaskId) -> Self {
        self.depends_on = Some(id);
        self
    }

    pub fn batch(mut self, batch_id: impl Into<String>) -> Self {
        self.batch_id = Some(batch_id.into());
        self
    }

    pub fn max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = Some(max_attempts);
        self
    }

    /// Build the Pending record for this request.
    pub fn into_task(self, default_max_attempts: u32, now: DateTime<Utc>) -> Task {
        Task {
            id: TaskId::generate(),
            status: TaskStatus::Pending,
            task_type: self.task_type,
            target_id: self.target_id,
            priority: self.priority,
            metadata: self.metadata,
            depends_on: self.depends_on,
            batch_id: self.batch_id,
            attempts: 0,
            // at least one run, so attempts <= max_attempts holds after the first claim
            max_attempts: self.max_attempts.unwrap_or(default_max_attempts).max(1),
            created_at: now,
            queued_at: None,
            started_at: None,
            completed_at: None,
            failed_at: None,
            retry_at: None,
            last_error: None,
        }
    }
}

// ============================================================================
// Queries
// ============================================================================

/// Filter for `TaskStore::query`
#[derive(Debug, Clone, Default)]
pub struct TaskFilter {
    /// Empty means any status
    pub statuses: Vec<TaskStatus>,
    pub task_type: Option<String>,
    pub target_id: Option<i64>,
    pub batch_id: Option<String>,
    pub depends_on: Option<TaskId>,
    pub limit: Option<usize>,
    pub newest_first: bool,
}

impl TaskFilter {
    pub fn with_statuses(statuses: &[TaskStatus]) -> Self {
        Self {
            statuses: statuses.to_vec(),
            ..Default::default()
        }
    }

    pub fn batch(batch_id: &str) -> Self {
        Self {
            batch_id: Some(batch_id.to_string()),
            ..Default::default()
        }
    }

    pub fn dependents_of(id: &TaskId) -> Self {
        Self {
            depends_on: Some(id.clone()),
            ..Default::default()
        }
    }

    /// Payload-level checks that SQL does not cover
    pub fn matches(&self, task: &Task) -> bool {
        if !self.statuses.is_empty() && !self.statuses.contains(&task.status) {
            return false;
        }
        if let Some(task_type) = &self.task_type {
            if &task.task_type != task_type {
                return false;
            }
        }
        if let Some(target_id) = self.target_id {
            if task.target_id != target_id {
                return false;
            }
        }
        if let Some(batch_id) = &self.batch_id {
            if task.batch_id.as_ref() != Some(batch_id) {
                return false;
            }
        }
        if let Some(dep) = &self.depends_on {
            if task.depends_on.as_ref() != Some(dep) {
                return false;
            }
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[test]
    fn test_status_round_trips_through_db_text() {
        for status in [
            TaskStatus::Pending,
            TaskStatus::Queued,
            TaskStatus::Processing,
            TaskStatus::Retrying,
            TaskStatus::Complete,
            TaskStatus::Error,
        ] {
            assert_eq!(TaskStatus::from_db(status.as_str()).unwrap(), status);
        }
        assert!(TaskStatus::from_db("done").is_err());
    }

    #[test]
    fn test_retrying_task_claimable_only_after_retry_at() {
        let now = Utc::now();
        let mut task = NewTask::new("summary", 1).into_task(3, now);
        assert!(task.is_claimable(now));

        task.status = TaskStatus::Retrying;
        task.retry_at = Some(now + Duration::seconds(30));
        assert!(!task.is_claimable(now));
        assert!(task.is_claimable(now + Duration::seconds(30)));

        task.status = TaskStatus::Queued;
        assert!(!task.is_claimable(now + Duration::hours(1)));
    }

    #[test]
    fn test_filter_matches_payload_fields() {
        let now = Utc::now();
        let task = NewTask::new("podcast", 7).batch("b1").into_task(3, now);

        assert!(TaskFilter::batch("b1").matches(&task));
        assert!(!TaskFilter::batch("b2").matches(&task));
        assert!(TaskFilter::with_statuses(&[TaskStatus::Pending]).matches(&task));
        assert!(!TaskFilter::with_statuses(&[TaskStatus::Error]).matches(&task));

        let filter = TaskFilter {
            target_id: Some(8),
            ..Default::default()
        };
        assert!(!filter.matches(&task));
    }
}
