//! Task runner - one worker loop

use crate::error::Result;
use crate::queue::TaskQueue;
use crate::worker::{DispatchOutcome, TaskProcessor};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::time::sleep;
use tracing::{debug, error, info};

/// Worker loop that polls the queue and processes claimed tasks
pub struct TaskRunner {
    worker_id: usize,
    queue: Arc<TaskQueue>,
    processor: TaskProcessor,
    shutdown: Arc<AtomicBool>,
}

impl TaskRunner {
    /// Create a new task runner
    pub fn new(worker_id: usize, queue: Arc<TaskQueue>, shutdown: Arc<AtomicBool>) -> Self {
        let processor = TaskProcessor::new(Arc::clone(&queue));
        Self {
            worker_id,
            queue,
            processor,
            shutdown,
        }
    }

    /// Main worker loop
    ///
    /// Polls for eligible tasks and processes them until shutdown is signaled
    pub async fn run(&self) {
        let config = self.queue.config();
        info!(
            "Worker {} started (poll interval {:?})",
            self.worker_id, config.poll_interval
        );

        loop {
            // Check for shutdown signal
            if self.shutdown.load(Ordering::Relaxed) {
                break;
            }

            match self.process_one_task().await {
                Ok(true) => {
                    // Task processed, continue immediately
                }
                Ok(false) => {
                    debug!("Worker {}: no eligible tasks", self.worker_id);
                    sleep(config.poll_interval).await;
                }
                Err(e) => {
                    error!("Worker {} error: {}", self.worker_id, e);
                    // Back off so a broken store does not spin the loop
                    sleep(config.error_backoff).await;
                }
            }
        }

        info!("Worker {} stopped", self.worker_id);
    }

    /// Claim and process a single task
    ///
    /// Returns:
    /// - Ok(true) if a task was processed
    /// - Ok(false) if no tasks were eligible
    /// - Err on store errors
    pub async fn process_one_task(&self) -> Result<bool> {
        let task = match self.queue.dequeue_next().await? {
            Some(t) => t,
            None => return Ok(false),
        };

        debug!(
            "Worker {} claimed task {} ({})",
            self.worker_id, task.id, task.task_type
        );

        let outcome = self.processor.process(task).await?;
        if outcome == DispatchOutcome::Skipped {
            debug!("Worker {}: task skipped", self.worker_id);
        }

        Ok(true)
    }
}
