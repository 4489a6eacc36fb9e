//! taskq - a persistent task queue for long-running background jobs
//!
//! Jobs such as document summarization, transcript generation or audio
//! synthesis are recorded in SQLite, claimed atomically by a pool of worker
//! loops, dispatched to the handler registered for their type, and retried
//! with exponential backoff when the handler fails.
//!
//! Features:
//! - Priority ordering (lower = runs first), FIFO within a priority
//! - Automatic retry with capped exponential backoff
//! - Single-predecessor chains; a failed step fails everything after it
//! - Batch progress queries
//! - Restart-safe: all state lives in the database
//!
//! # Example
//! ```ignore
//! use std::sync::Arc;
//! use taskq::{handler_fn, NewTask, QueueConfig, TaskQueue};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let queue = Arc::new(TaskQueue::open("sqlite://tasks.db", QueueConfig::default()).await?);
//!     queue.register_handler("transcript", handler_fn(|_ctx, _id, file_id| async move {
//!         println!("writing transcript for {}", file_id);
//!         Ok(())
//!     }))?;
//!     queue.register_handler("podcast", handler_fn(|_ctx, _id, file_id| async move {
//!         println!("synthesizing audio for {}", file_id);
//!         Ok(())
//!     }))?;
//!
//!     let ids = queue
//!         .enqueue_chain(vec![NewTask::new("transcript", 42), NewTask::new("podcast", 42)])
//!         .await?;
//!
//!     queue.start_workers(None);
//!     // ... later
//!     println!("{:?}", queue.get_status(&ids[1]).await?);
//!     queue.stop_workers().await;
//!     Ok(())
//! }
//! ```

pub mod db;
pub mod error;
pub mod handler;
pub mod queue;
pub mod status;
pub mod worker;

pub use db::{NewTask, Task, TaskFilter, TaskId, TaskStatus, TaskStore};
pub use error::{QueueError, Result, TaskFailure};
pub use handler::{blocking_fn, handler_fn, HandlerContext, HandlerRegistry, TaskHandler};
pub use queue::TaskQueue;
pub use status::{BatchStatus, BatchTaskDetail, TaskStatusView};
pub use worker::{DispatchOutcome, QueueConfig, QueueConfigBuilder, WorkerPool};
