//! Read-only status views returned to pollers

use crate::db::{Task, TaskId, TaskStatus};
use chrono::{DateTime, Utc};
use serde::Serialize;

/// Status of a single task
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TaskStatusView {
    pub id: TaskId,
    pub status: TaskStatus,
    pub task_type: String,
    pub target_id: i64,
    pub attempts: u32,
    pub max_attempts: u32,
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub retry_at: Option<DateTime<Utc>>,
    pub depends_on: Option<TaskId>,
    pub batch_id: Option<String>,
}

impl From<&Task> for TaskStatusView {
    fn from(task: &Task) -> Self {
        Self {
            id: task.id.clone(),
            status: task.status,
            task_type: task.task_type.clone(),
            target_id: task.target_id,
            attempts: task.attempts,
            max_attempts: task.max_attempts,
            error: task.last_error.clone(),
            created_at: task.created_at,
            completed_at: task.completed_at,
            retry_at: task.retry_at,
            depends_on: task.depends_on.clone(),
            batch_id: task.batch_id.clone(),
        }
    }
}

/// Per-task line of a batch report
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BatchTaskDetail {
    pub id: TaskId,
    pub status: TaskStatus,
    pub task_type: String,
    pub target_id: i64,
    pub error: Option<String>,
    pub attempts: u32,
}

/// Aggregate progress of all tasks sharing a batch id
///
/// `complete + error + processing + pending == total` always holds: Queued
/// and Retrying tasks count as pending.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct BatchStatus {
    pub total: usize,
    pub complete: usize,
    pub error: usize,
    pub processing: usize,
    pub pending: usize,
    pub tasks: Vec<BatchTaskDetail>,
}

impl BatchStatus {
    /// Aggregate one snapshot of the batch members
    pub fn from_tasks(tasks: &[Task]) -> Self {
        let mut status = BatchStatus {
            total: tasks.len(),
            ..Default::default()
        };

        for task in tasks {
            match task.status {
                TaskStatus::Complete => status.complete += 1,
                TaskStatus::Error => status.error += 1,
                TaskStatus::Processing => status.processing += 1,
                TaskStatus::Pending | TaskStatus::Queued | TaskStatus::Retrying => {
                    status.pending += 1
                }
            }

            status.tasks.push(BatchTaskDetail {
                id: task.id.clone(),
                status: task.status,
                task_type: task.task_type.clone(),
                target_id: task.target_id,
                error: task.last_error.clone(),
                attempts: task.attempts,
            });
        }

        status
    }

    pub fn is_finished(&self) -> bool {
        self.complete + self.error == self.total
    }
}
