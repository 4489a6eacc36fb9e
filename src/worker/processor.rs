//! Task processor - dispatches one claimed task to its handler

use crate::db::{Task, TaskStatus};
use crate::error::{Result, TaskFailure};
use crate::handler::HandlerContext;
use crate::queue::TaskQueue;
use std::sync::Arc;
use tracing::{error, info, warn};

/// What happened to a dispatched task
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchOutcome {
    Completed,
    /// Failed, another attempt is scheduled
    Retrying,
    /// Failed for good
    Failed,
    /// The task was no longer Queued when we tried to start it
    Skipped,
}

/// Runs claimed tasks through the handler registry
pub struct TaskProcessor {
    queue: Arc<TaskQueue>,
}

impl TaskProcessor {
    pub fn new(queue: Arc<TaskQueue>) -> Self {
        Self { queue }
    }

    /// Process a single claimed (Queued) task
    ///
    /// Handler errors and panics become state transitions; only store
    /// failures are returned as `Err`.
    pub async fn process(&self, task: Task) -> Result<DispatchOutcome> {
        let task_id = task.id.clone();

        let Some(handler) = self.queue.handler_for(&task.task_type) else {
            error!(
                "Task {}: no handler registered for type '{}'",
                task_id, task.task_type
            );
            self.queue
                .mark_failed(&task_id, TaskFailure::MissingHandler(task.task_type.clone()))
                .await?;
            return Ok(DispatchOutcome::Failed);
        };

        let Some(task) = self.queue.mark_processing(&task_id).await? else {
            warn!("Task {} was no longer queued, skipping", task_id);
            return Ok(DispatchOutcome::Skipped);
        };

        info!(
            "Task {}: running {} for target {} (attempt {}/{})",
            task_id, task.task_type, task.target_id, task.attempts, task.max_attempts
        );

        // Own task so a panicking handler cannot take the worker loop down
        let ctx = HandlerContext::for_task(&task);
        let target_id = task.target_id;
        let handler_task_id = task_id.clone();
        let joined =
            tokio::spawn(async move { handler.handle(ctx, handler_task_id, target_id).await })
                .await;

        let failure = match joined {
            Ok(Ok(())) => {
                if self.queue.mark_complete(&task_id).await?.is_none() {
                    warn!(
                        "Task {} finished but was no longer processing; result discarded",
                        task_id
                    );
                    return Ok(DispatchOutcome::Skipped);
                }
                return Ok(DispatchOutcome::Completed);
            }
            // Alternate form keeps the whole context chain
            Ok(Err(e)) => TaskFailure::Handler(format!("{:#}", e)),
            Err(join_error) => TaskFailure::Panicked(panic_message(join_error)),
        };

        let updated = self.queue.mark_failed(&task_id, failure).await?;
        match updated.map(|task| task.status) {
            Some(TaskStatus::Retrying) => Ok(DispatchOutcome::Retrying),
            Some(_) => Ok(DispatchOutcome::Failed),
            None => {
                warn!(
                    "Task {} failed but was no longer processing; failure not recorded",
                    task_id
                );
                Ok(DispatchOutcome::Skipped)
            }
        }
    }
}

fn panic_message(join_error: tokio::task::JoinError) -> String {
    if join_error.is_cancelled() {
        return "handler task was cancelled".to_string();
    }

    let payload = join_error.into_panic();
    if let Some(message) = payload.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic payload".to_string()
    }
}
