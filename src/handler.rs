//! Handler registry
//!
//! Handlers do the actual work for one task type. They signal success by
//! returning `Ok(())` and failure by returning an error, whose message is
//! recorded verbatim. A handler is re-run from scratch on retry, so it must be
//! safe to execute more than once.

use crate::db::{Task, TaskId};
use async_trait::async_trait;
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

/// What a handler knows about the task it is running
#[derive(Debug, Clone)]
pub struct HandlerContext {
    pub task_type: String,
    pub metadata: serde_json::Value,
    pub batch_id: Option<String>,
    /// 1-based number of the current attempt
    pub attempt: u32,
    pub max_attempts: u32,
}

impl HandlerContext {
    pub fn for_task(task: &Task) -> Self {
        Self {
            task_type: task.task_type.clone(),
            metadata: task.metadata.clone(),
            batch_id: task.batch_id.clone(),
            attempt: task.attempts,
            max_attempts: task.max_attempts,
        }
    }
}

/// Performs the work for one task type
#[async_trait]
pub trait TaskHandler: Send + Sync {
    async fn handle(
        &self,
        ctx: HandlerContext,
        task_id: TaskId,
        target_id: i64,
    ) -> anyhow::Result<()>;
}

/// Adapter for async closures, see [`handler_fn`]
pub struct FnHandler<F>(F);

#[async_trait]
impl<F, Fut> TaskHandler for FnHandler<F>
where
    F: Fn(HandlerContext, TaskId, i64) -> Fut + Send + Sync,
    Fut: Future<Output = anyhow::Result<()>> + Send,
{
    async fn handle(
        &self,
        ctx: HandlerContext,
        task_id: TaskId,
        target_id: i64,
    ) -> anyhow::Result<()> {
        (self.0)(ctx, task_id, target_id).await
    }
}

/// Wrap an async closure as a handler
///
/// # Example
/// ```ignore
/// queue.register_handler("summary", handler_fn(|_ctx, id, file_id| async move {
///     summarize(file_id).await?;
///     Ok(())
/// }))?;
/// ```
pub fn handler_fn<F, Fut>(f: F) -> FnHandler<F>
where
    F: Fn(HandlerContext, TaskId, i64) -> Fut + Send + Sync,
    Fut: Future<Output = anyhow::Result<()>> + Send,
{
    FnHandler(f)
}

/// Adapter for synchronous handlers, see [`blocking_fn`]
pub struct BlockingHandler<F>(Arc<F>);

#[async_trait]
impl<F> TaskHandler for BlockingHandler<F>
where
    F: Fn(HandlerContext, TaskId, i64) -> anyhow::Result<()> + Send + Sync + 'static,
{
    async fn handle(
        &self,
        ctx: HandlerContext,
        task_id: TaskId,
        target_id: i64,
    ) -> anyhow::Result<()> {
        let f = Arc::clone(&self.0);
        tokio::task::spawn_blocking(move || f(ctx, task_id, target_id)).await?
    }
}

/// Wrap a blocking closure; it runs on tokio's blocking thread pool so long
/// network calls do not stall other workers.
pub fn blocking_fn<F>(f: F) -> BlockingHandler<F>
where
    F: Fn(HandlerContext, TaskId, i64) -> anyhow::Result<()> + Send + Sync + 'static,
{
    BlockingHandler(Arc::new(f))
}

/// Maps task-type tags to handlers
#[derive(Default, Clone)]
pub struct HandlerRegistry {
    handlers: HashMap<String, Arc<dyn TaskHandler>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Bind a handler; a second registration for the same type replaces the first
    pub fn register(&mut self, task_type: impl Into<String>, handler: Arc<dyn TaskHandler>) {
        self.handlers.insert(task_type.into(), handler);
    }

    pub fn get(&self, task_type: &str) -> Option<Arc<dyn TaskHandler>> {
        self.handlers.get(task_type).cloned()
    }

    pub fn task_types(&self) -> Vec<String> {
        let mut types: Vec<String> = self.handlers.keys().cloned().collect();
        types.sort();
        types
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}
