//! Fixed-size pool of worker loops

use crate::queue::TaskQueue;
use crate::worker::TaskRunner;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{info, warn};

/// Running worker loops and their shared shutdown flag
pub struct WorkerPool {
    shutdown: Arc<AtomicBool>,
    handles: Vec<JoinHandle<()>>,
}

impl WorkerPool {
    /// Spawn `count` worker loops on the current tokio runtime
    pub fn start(queue: Arc<TaskQueue>, count: usize) -> Self {
        let shutdown = Arc::new(AtomicBool::new(false));
        let handles = (0..count)
            .map(|worker_id| {
                let runner = TaskRunner::new(worker_id, Arc::clone(&queue), Arc::clone(&shutdown));
                tokio::spawn(async move { runner.run().await })
            })
            .collect();

        info!("Started {} worker(s)", count);
        Self { shutdown, handles }
    }

    pub fn size(&self) -> usize {
        self.handles.len()
    }

    /// Signal every loop to exit and wait up to `timeout` for them.
    ///
    /// In-flight handlers are never cancelled; loops still busy after the
    /// timeout are left to finish on their own. Returns whether all loops
    /// exited in time.
    pub async fn stop(self, timeout: Duration) -> bool {
        self.shutdown.store(true, Ordering::Relaxed);
        let count = self.size();

        match tokio::time::timeout(timeout, futures::future::join_all(self.handles)).await {
            Ok(_) => {
                info!("All {} worker(s) stopped", count);
                true
            }
            Err(_) => {
                warn!(
                    "Workers still busy after {:?}; leaving them to finish in the background",
                    timeout
                );
                false
            }
        }
    }
}
