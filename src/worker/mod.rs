//! Worker module for polling and processing tasks
//!
//! This module provides:
//! - WorkerPool: N concurrent worker loops sharing one shutdown flag
//! - TaskRunner: one worker loop that polls the queue for eligible tasks
//! - TaskProcessor: dispatches a claimed task to its handler
//! - QueueConfig: configuration for the queue and its workers

pub mod config;
pub mod pool;
pub mod processor;
pub mod task_runner;

pub use config::{QueueConfig, QueueConfigBuilder};
pub use pool::WorkerPool;
pub use processor::{DispatchOutcome, TaskProcessor};
pub use task_runner::TaskRunner;
