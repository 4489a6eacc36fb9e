//! The scheduler
//!
//! [`TaskQueue`] owns the store, the handler registry and the worker pool.
//! Every coordination decision (claim, retry scheduling, dependency gating)
//! is a conditional update against the store, so any number of workers, in
//! this process or another one sharing the database, can poll it safely.

use crate::db::{NewTask, Task, TaskFilter, TaskId, TaskStatus, TaskStore};
use crate::error::{QueueError, Result, TaskFailure};
use crate::handler::{HandlerRegistry, TaskHandler};
use crate::status::{BatchStatus, TaskStatusView};
use crate::worker::{QueueConfig, WorkerPool};
use chrono::{DateTime, Utc};
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// Unfiltered `list_tasks` returns at most this many tasks
const LIST_LIMIT: usize = 100;

/// Statuses a worker may claim from
const CLAIMABLE: &[TaskStatus] = &[TaskStatus::Pending, TaskStatus::Retrying];

/// Persistent task scheduler
pub struct TaskQueue {
    store: TaskStore,
    config: QueueConfig,
    handlers: RwLock<HandlerRegistry>,
    workers: Mutex<Option<WorkerPool>>,
}

impl TaskQueue {
    pub fn new(store: TaskStore, config: QueueConfig) -> Self {
        Self {
            store,
            config,
            handlers: RwLock::new(HandlerRegistry::new()),
            workers: Mutex::new(None),
        }
    }

    /// Open (or create) the database at `database_url` and build a queue on it
    pub async fn open(database_url: &str, config: QueueConfig) -> Result<Self> {
        let pool = crate::db::create_pool(database_url).await?;
        let store = TaskStore::new(pool).await?;
        Ok(Self::new(store, config))
    }

    pub fn store(&self) -> &TaskStore {
        &self.store
    }

    pub fn config(&self) -> &QueueConfig {
        &self.config
    }

    // ------------------------------------------------------------------
    // Handlers
    // ------------------------------------------------------------------

    /// Bind a handler to a task type. Must happen before workers start.
    pub fn register_handler<H>(&self, task_type: impl Into<String>, handler: H) -> Result<()>
    where
        H: TaskHandler + 'static,
    {
        if self.workers_running() {
            return Err(QueueError::WorkersRunning);
        }

        let task_type = task_type.into();
        debug!("Registering handler for task type '{}'", task_type);
        self.handlers
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .register(task_type, Arc::new(handler));
        Ok(())
    }

    /// Look up the handler for a task type; the registry lock is released on return
    pub fn handler_for(&self, task_type: &str) -> Option<Arc<dyn TaskHandler>> {
        self.handlers
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .get(task_type)
    }

    pub fn registered_types(&self) -> Vec<String> {
        self.handlers
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .task_types()
    }

    // ------------------------------------------------------------------
    // Producers
    // ------------------------------------------------------------------

    /// Create a Pending task and return its id
    pub async fn enqueue(
        &self,
        task_type: &str,
        target_id: i64,
        priority: i32,
        metadata: Option<serde_json::Value>,
        depends_on: Option<TaskId>,
    ) -> Result<TaskId> {
        let mut request = NewTask::new(task_type, target_id).priority(priority);
        if let Some(metadata) = metadata {
            request = request.metadata(metadata);
        }
        if let Some(dep) = depends_on {
            request = request.depends_on(dep);
        }
        self.enqueue_task(request).await
    }

    /// Create a Pending task from a full request
    pub async fn enqueue_task(&self, request: NewTask) -> Result<TaskId> {
        if let Some(dep) = &request.depends_on {
            self.ensure_exists(dep).await?;
        }

        let task = request.into_task(self.config.max_attempts, Utc::now());
        let id = self.store.create(&task).await?;
        info!(
            "Enqueued task {} ({} for target {}, priority {})",
            id, task.task_type, task.target_id, task.priority
        );
        Ok(id)
    }

    /// Create a pipeline where each step depends on the previous one.
    ///
    /// The first step keeps its own `depends_on`, if any, so a chain can be
    /// appended after an existing task. All steps are stored atomically.
    pub async fn enqueue_chain(&self, steps: Vec<NewTask>) -> Result<Vec<TaskId>> {
        if steps.is_empty() {
            return Ok(Vec::new());
        }
        if let Some(dep) = &steps[0].depends_on {
            self.ensure_exists(dep).await?;
        }

        let now = Utc::now();
        let mut tasks: Vec<Task> = Vec::with_capacity(steps.len());
        for mut step in steps {
            if let Some(previous) = tasks.last() {
                step.depends_on = Some(previous.id.clone());
            }
            tasks.push(step.into_task(self.config.max_attempts, now));
        }

        let ids = self.store.create_many(&tasks).await?;
        info!(
            "Enqueued chain of {} tasks: {}",
            ids.len(),
            tasks
                .iter()
                .map(|t| t.task_type.as_str())
                .collect::<Vec<_>>()
                .join(" -> ")
        );
        Ok(ids)
    }

    async fn ensure_exists(&self, id: &TaskId) -> Result<()> {
        match self.store.get(id).await? {
            Some(_) => Ok(()),
            None => Err(QueueError::NotFound(id.clone())),
        }
    }

    // ------------------------------------------------------------------
    // Claiming
    // ------------------------------------------------------------------

    /// Claim the next eligible task, moving it to Queued.
    ///
    /// Eligible means Pending, or Retrying with `retry_at` elapsed, and with
    /// its dependency (if any) Complete. Among those the lowest priority
    /// wins, then the earliest `created_at`. Tasks whose dependency failed
    /// are moved to Error on the way.
    pub async fn dequeue_next(&self) -> Result<Option<Task>> {
        let now = Utc::now();
        let candidates = self
            .store
            .query(&TaskFilter::with_statuses(CLAIMABLE))
            .await?;

        let mut dependency_status: HashMap<TaskId, Option<Task>> = HashMap::new();
        let mut eligible = Vec::new();

        for task in candidates {
            if !task.is_claimable(now) {
                continue;
            }

            if let Some(dep_id) = &task.depends_on {
                if !dependency_status.contains_key(dep_id) {
                    let dep = self.store.get(dep_id).await?;
                    dependency_status.insert(dep_id.clone(), dep);
                }

                match dependency_status.get(dep_id).and_then(|dep| dep.as_ref()) {
                    Some(dep) if dep.status == TaskStatus::Complete => {}
                    Some(dep) if dep.status == TaskStatus::Error => {
                        let failure = dependency_failure(dep);
                        self.fail_unclaimed(&task.id, failure).await?;
                        continue;
                    }
                    Some(_) => continue,
                    None => {
                        let failure = TaskFailure::DependencyMissing(dep_id.clone());
                        self.fail_unclaimed(&task.id, failure).await?;
                        continue;
                    }
                }
            }

            eligible.push(task);
        }

        // Stable sort keeps insertion order among equal keys
        eligible.sort_by_key(|task| (task.priority, task.created_at));

        for candidate in eligible {
            let claimed = skip_deleted(
                self.store
                    .transition(&candidate.id, CLAIMABLE, |task| {
                        if !task.is_claimable(now) {
                            return false;
                        }
                        task.status = TaskStatus::Queued;
                        task.queued_at = Some(now);
                        true
                    })
                    .await,
            )?;

            if let Some(task) = claimed {
                debug!("Claimed task {} ({})", task.id, task.task_type);
                return Ok(Some(task));
            }
            // Claimed or deleted by someone else, try the next
        }

        Ok(None)
    }

    // ------------------------------------------------------------------
    // Transitions
    // ------------------------------------------------------------------

    /// Queued -> Processing; counts one attempt
    pub async fn mark_processing(&self, id: &TaskId) -> Result<Option<Task>> {
        let now = Utc::now();
        self.store
            .transition(id, &[TaskStatus::Queued], |task| {
                task.status = TaskStatus::Processing;
                task.attempts += 1;
                task.started_at = Some(now);
                task.retry_at = None;
                true
            })
            .await
    }

    /// Processing -> Complete
    pub async fn mark_complete(&self, id: &TaskId) -> Result<Option<Task>> {
        let now = Utc::now();
        let task = self
            .store
            .transition(id, &[TaskStatus::Processing], |task| {
                task.status = TaskStatus::Complete;
                task.completed_at = Some(now);
                task.last_error = None;
                true
            })
            .await?;

        if let Some(task) = &task {
            info!("Task {} ({}) complete", task.id, task.task_type);
        }
        Ok(task)
    }

    /// Record a failure of a claimed task.
    ///
    /// Retryable failures move to Retrying while attempts remain, with
    /// exponential backoff; everything else moves to Error, and tasks
    /// chained after it are failed too.
    pub async fn mark_failed(&self, id: &TaskId, failure: TaskFailure) -> Result<Option<Task>> {
        let now = Utc::now();
        let config = &self.config;
        let task = self
            .store
            .transition(id, &[TaskStatus::Queued, TaskStatus::Processing], |task| {
                apply_failure(task, &failure, now, config);
                true
            })
            .await?;

        let Some(task) = task else {
            return Ok(None);
        };

        if task.status == TaskStatus::Retrying {
            warn!(
                "Task {} ({}) failed on attempt {}/{}: {}; retrying at {}",
                task.id,
                task.task_type,
                task.attempts,
                task.max_attempts,
                failure,
                task.retry_at.map(|t| t.to_rfc3339()).unwrap_or_default()
            );
        } else {
            error!(
                "Task {} ({}) failed permanently after {} attempt(s): {}",
                task.id, task.task_type, task.attempts, failure
            );
            self.cascade_failure(&task).await?;
        }

        Ok(Some(task))
    }

    /// Fail a task that was never claimed (dependency problems)
    async fn fail_unclaimed(&self, id: &TaskId, failure: TaskFailure) -> Result<Option<Task>> {
        let now = Utc::now();
        let config = &self.config;
        let task = skip_deleted(
            self.store
                .transition(id, CLAIMABLE, |task| {
                    apply_failure(task, &failure, now, config);
                    true
                })
                .await,
        )?;

        if let Some(task) = &task {
            error!("Task {} ({}) failed: {}", task.id, task.task_type, failure);
            self.cascade_failure(task).await?;
        }
        Ok(task)
    }

    /// Move everything chained after `failed` to Error, transitively
    async fn cascade_failure(&self, failed: &Task) -> Result<()> {
        let now = Utc::now();
        let mut stack = vec![failed.clone()];

        while let Some(failed) = stack.pop() {
            let dependents = self
                .store
                .query(&TaskFilter {
                    statuses: CLAIMABLE.to_vec(),
                    ..TaskFilter::dependents_of(&failed.id)
                })
                .await?;

            for dependent in dependents {
                let failure = dependency_failure(&failed);
                let config = &self.config;
                let updated = skip_deleted(
                    self.store
                        .transition(&dependent.id, CLAIMABLE, |task| {
                            apply_failure(task, &failure, now, config);
                            true
                        })
                        .await,
                )?;

                if let Some(task) = updated {
                    warn!("Task {} ({}) cancelled: {}", task.id, task.task_type, failure);
                    stack.push(task);
                }
            }
        }

        Ok(())
    }

    // ------------------------------------------------------------------
    // Status polling
    // ------------------------------------------------------------------

    pub async fn get_task(&self, id: &TaskId) -> Result<Option<Task>> {
        self.store.get(id).await
    }

    pub async fn get_status(&self, id: &TaskId) -> Result<Option<TaskStatusView>> {
        Ok(self.store.get(id).await?.as_ref().map(TaskStatusView::from))
    }

    pub async fn get_batch_status(&self, batch_id: &str) -> Result<BatchStatus> {
        let tasks = self.store.query(&TaskFilter::batch(batch_id)).await?;
        Ok(BatchStatus::from_tasks(&tasks))
    }

    /// All tasks of one target, or the newest tasks overall, newest first
    pub async fn list_tasks(&self, target_id: Option<i64>) -> Result<Vec<TaskStatusView>> {
        let filter = TaskFilter {
            target_id,
            limit: target_id.is_none().then_some(LIST_LIMIT),
            newest_first: true,
            ..Default::default()
        };
        let tasks = self.store.query(&filter).await?;
        Ok(tasks.iter().map(TaskStatusView::from).collect())
    }

    // ------------------------------------------------------------------
    // Operator actions
    // ------------------------------------------------------------------

    /// Reset an Error task to Pending with a fresh attempt budget.
    ///
    /// Returns `false` when the task is not in Error.
    pub async fn retry(&self, id: &TaskId) -> Result<bool> {
        let task = self
            .store
            .transition(id, &[TaskStatus::Error], |task| {
                task.status = TaskStatus::Pending;
                task.attempts = 0;
                task.last_error = None;
                task.retry_at = None;
                task.queued_at = None;
                task.started_at = None;
                task.completed_at = None;
                task.failed_at = None;
                true
            })
            .await?;

        match task {
            Some(task) => {
                info!("Task {} ({}) reset for manual retry", task.id, task.task_type);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    pub async fn delete_task(&self, id: &TaskId) -> Result<bool> {
        self.store.delete(id).await
    }

    /// Delete Complete/Error tasks that finished more than `older_than` ago.
    ///
    /// Tasks a live dependent still points at are kept.
    pub async fn prune_finished(&self, older_than: Duration) -> Result<usize> {
        let cutoff = Utc::now() - to_chrono(older_than);

        let (finished, live): (Vec<Task>, Vec<Task>) = self
            .store
            .query(&TaskFilter::default())
            .await?
            .into_iter()
            .partition(|task| task.status.is_terminal());
        let referenced: HashSet<TaskId> =
            live.into_iter().filter_map(|task| task.depends_on).collect();

        let mut removed = 0;
        for task in finished {
            let finished_at = task
                .completed_at
                .or(task.failed_at)
                .unwrap_or(task.created_at);
            if finished_at >= cutoff || referenced.contains(&task.id) {
                continue;
            }
            if self.store.delete(&task.id).await? {
                removed += 1;
            }
        }

        info!("Pruned {} finished task(s)", removed);
        Ok(removed)
    }

    /// Recover tasks orphaned by a dead worker.
    ///
    /// Queued tasks claimed before the cut-off go back to Pending. Processing
    /// tasks started before the cut-off count as a failed attempt, so this must
    /// only run while no worker anywhere is using the database. Refused with
    /// `WorkersRunning` while this queue's own workers are active.
    pub async fn recover_orphaned(&self, stale_after: Duration) -> Result<usize> {
        if self.workers_running() {
            return Err(QueueError::WorkersRunning);
        }

        let cutoff = Utc::now() - to_chrono(stale_after);
        let stuck = self
            .store
            .query(&TaskFilter::with_statuses(&[
                TaskStatus::Queued,
                TaskStatus::Processing,
            ]))
            .await?;

        let mut recovered = 0;
        for task in stuck {
            let is_stale = |at: Option<DateTime<Utc>>| at.map_or(true, |at| at < cutoff);

            let updated = match task.status {
                TaskStatus::Queued if is_stale(task.queued_at) => self
                    .store
                    .transition(&task.id, &[TaskStatus::Queued], |task| {
                        if !is_stale(task.queued_at) {
                            return false;
                        }
                        task.status = TaskStatus::Pending;
                        task.queued_at = None;
                        true
                    })
                    .await?
                    .is_some(),
                TaskStatus::Processing if is_stale(task.started_at) => self
                    .mark_failed(&task.id, TaskFailure::WorkerLost)
                    .await?
                    .is_some(),
                _ => false,
            };

            if updated {
                recovered += 1;
            }
        }

        if recovered > 0 {
            warn!("Recovered {} orphaned task(s)", recovered);
        }
        Ok(recovered)
    }

    // ------------------------------------------------------------------
    // Workers
    // ------------------------------------------------------------------

    /// Start `count` worker loops (config default when `None`).
    ///
    /// Returns `false` if workers were already running. Must be called from
    /// within a tokio runtime.
    pub fn start_workers(self: &Arc<Self>, count: Option<usize>) -> bool {
        let mut workers = self
            .workers
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if let Some(pool) = workers.as_ref() {
            debug!("{} worker(s) already running", pool.size());
            return false;
        }

        let count = count.unwrap_or(self.config.max_workers).max(1);
        *workers = Some(WorkerPool::start(Arc::clone(self), count));
        true
    }

    /// Stop claiming new tasks and wait (bounded) for in-flight ones.
    ///
    /// Returns `false` if no workers were running.
    pub async fn stop_workers(&self) -> bool {
        let pool = self
            .workers
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take();

        match pool {
            Some(pool) => {
                pool.stop(self.config.shutdown_timeout).await;
                true
            }
            None => false,
        }
    }

    pub fn workers_running(&self) -> bool {
        self.workers
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .is_some()
    }
}

/// Apply the retry/error rule for `failure` to a task
fn apply_failure(task: &mut Task, failure: &TaskFailure, now: DateTime<Utc>, config: &QueueConfig) {
    task.last_error = Some(failure.to_string());

    if failure.is_retryable() && task.attempts < task.max_attempts {
        task.status = TaskStatus::Retrying;
        task.retry_at = Some(now + to_chrono(config.retry_delay(task.attempts)));
    } else {
        task.status = TaskStatus::Error;
        task.failed_at = Some(now);
        task.retry_at = None;
    }
}

/// A task deleted between a scan and its transition is skipped, not an error
fn skip_deleted(result: Result<Option<Task>>) -> Result<Option<Task>> {
    match result {
        Err(QueueError::NotFound(id)) => {
            debug!("Task {} was deleted mid-scan, skipping", id);
            Ok(None)
        }
        other => other,
    }
}

fn dependency_failure(dep: &Task) -> TaskFailure {
    TaskFailure::DependencyFailed {
        dependency: dep.id.clone(),
        reason: dep
            .last_error
            .clone()
            .unwrap_or_else(|| "unknown error".to_string()),
    }
}

fn to_chrono(duration: Duration) -> chrono::Duration {
    chrono::Duration::from_std(duration).unwrap_or_else(|_| chrono::Duration::weeks(52 * 100))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn task_with_attempts(attempts: u32, max_attempts: u32) -> Task {
        let mut task = NewTask::new("summary", 1)
            .max_attempts(max_attempts)
            .into_task(3, Utc::now());
        task.status = TaskStatus::Processing;
        task.attempts = attempts;
        task
    }

    #[test]
    fn test_apply_failure_schedules_backoff() {
        let config = QueueConfig::default();
        let now = Utc::now();
        let mut task = task_with_attempts(1, 3);

        apply_failure(&mut task, &TaskFailure::Handler("timeout".into()), now, &config);
        assert_eq!(task.status, TaskStatus::Retrying);
        assert_eq!(task.retry_at, Some(now + chrono::Duration::seconds(120)));
        assert_eq!(task.last_error.as_deref(), Some("timeout"));
        assert!(task.failed_at.is_none());
    }

    #[test]
    fn test_apply_failure_exhausted() {
        let config = QueueConfig::default();
        let now = Utc::now();
        let mut task = task_with_attempts(3, 3);

        apply_failure(&mut task, &TaskFailure::Handler("timeout".into()), now, &config);
        assert_eq!(task.status, TaskStatus::Error);
        assert_eq!(task.failed_at, Some(now));
        assert_eq!(task.attempts, 3);
    }

    #[test]
    fn test_apply_failure_non_retryable() {
        let config = QueueConfig::default();
        let now = Utc::now();
        let mut task = task_with_attempts(0, 3);

        apply_failure(
            &mut task,
            &TaskFailure::MissingHandler("summary".into()),
            now,
            &config,
        );
        assert_eq!(task.status, TaskStatus::Error);
        assert_eq!(task.attempts, 0);
        assert_eq!(
            task.last_error.as_deref(),
            Some("No handler for task type: summary")
        );
    }

    #[test]
    fn test_skip_deleted_only_swallows_not_found() {
        let gone = skip_deleted(Err(QueueError::NotFound(TaskId::from("gone"))));
        assert!(matches!(gone, Ok(None)));

        let conflict = skip_deleted(Err(QueueError::Conflict(TaskId::from("busy"))));
        assert!(matches!(conflict, Err(QueueError::Conflict(_))));

        let task = task_with_attempts(0, 3);
        let kept = skip_deleted(Ok(Some(task.clone()))).unwrap();
        assert_eq!(kept.map(|t| t.id), Some(task.id));
    }
}
