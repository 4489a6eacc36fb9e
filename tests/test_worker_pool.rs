//! Worker pool tests: real worker loops polling a shared queue

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use taskq::db::create_pool;
use taskq::{
    blocking_fn, handler_fn, NewTask, QueueConfig, QueueError, TaskId, TaskQueue, TaskStatus,
    TaskStore,
};

fn pool_config() -> QueueConfig {
    QueueConfig::builder()
        .max_workers(4)
        .poll_interval(Duration::from_millis(10))
        .error_backoff(Duration::from_millis(50))
        .retry_delays(Duration::from_millis(1), Duration::from_millis(5))
        .shutdown_timeout(Duration::from_secs(5))
        .build()
}

async fn file_queue(dir: &tempfile::TempDir) -> Arc<TaskQueue> {
    let url = format!("sqlite://{}", dir.path().join("tasks.db").display());
    Arc::new(TaskQueue::open(&url, pool_config()).await.expect("open queue"))
}

async fn memory_queue() -> Arc<TaskQueue> {
    let pool = create_pool("sqlite::memory:").await.expect("sqlite memory");
    let store = TaskStore::new(pool).await.expect("task store");
    Arc::new(TaskQueue::new(store, pool_config()))
}

/// Poll until `check` holds or five seconds pass
async fn wait_for<F, Fut>(mut check: F)
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while !check().await {
        assert!(
            tokio::time::Instant::now() < deadline,
            "condition not reached in time"
        );
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_summary_completes_under_worker_pool() {
    let queue = memory_queue().await;
    queue
        .register_handler(
            "summary",
            handler_fn(|_, _, _| async {
                tokio::time::sleep(Duration::from_millis(10)).await;
                anyhow::Ok(())
            }),
        )
        .unwrap();

    let id = queue.enqueue("summary", 42, 5, None, None).await.unwrap();
    assert_eq!(
        queue.get_status(&id).await.unwrap().unwrap().status,
        TaskStatus::Pending
    );

    assert!(queue.start_workers(Some(2)));
    wait_for(|| {
        let queue = Arc::clone(&queue);
        let id = id.clone();
        async move {
            queue.get_status(&id).await.unwrap().unwrap().status == TaskStatus::Complete
        }
    })
    .await;
    assert!(queue.stop_workers().await);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 8)]
async fn test_no_task_runs_on_two_workers_at_once() {
    let dir = tempfile::tempdir().unwrap();
    let queue = file_queue(&dir).await;

    let in_flight: Arc<Mutex<HashSet<TaskId>>> = Arc::new(Mutex::new(HashSet::new()));
    let runs: Arc<Mutex<HashMap<TaskId, usize>>> = Arc::new(Mutex::new(HashMap::new()));
    let violations = Arc::new(Mutex::new(Vec::<TaskId>::new()));

    {
        let in_flight = Arc::clone(&in_flight);
        let runs = Arc::clone(&runs);
        let violations = Arc::clone(&violations);
        queue
            .register_handler(
                "summary",
                handler_fn(move |_, task_id: TaskId, _| {
                    let in_flight = Arc::clone(&in_flight);
                    let runs = Arc::clone(&runs);
                    let violations = Arc::clone(&violations);
                    async move {
                        if !in_flight.lock().unwrap().insert(task_id.clone()) {
                            violations.lock().unwrap().push(task_id.clone());
                        }
                        *runs.lock().unwrap().entry(task_id.clone()).or_default() += 1;
                        tokio::time::sleep(Duration::from_millis(2)).await;
                        in_flight.lock().unwrap().remove(&task_id);
                        anyhow::Ok(())
                    }
                }),
            )
            .unwrap();
    }

    let mut ids = Vec::new();
    for target in 0..60 {
        ids.push(
            queue
                .enqueue_task(NewTask::new("summary", target).batch("stress"))
                .await
                .unwrap(),
        );
    }

    assert!(queue.start_workers(Some(8)));
    wait_for(|| {
        let queue = Arc::clone(&queue);
        async move {
            let batch = queue.get_batch_status("stress").await.unwrap();
            assert_eq!(
                batch.complete + batch.error + batch.processing + batch.pending,
                batch.total
            );
            batch.complete == batch.total
        }
    })
    .await;
    queue.stop_workers().await;

    assert!(violations.lock().unwrap().is_empty());
    let runs = runs.lock().unwrap();
    assert_eq!(runs.len(), ids.len());
    assert!(runs.values().all(|count| *count == 1));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 8)]
async fn test_concurrent_dequeue_claims_each_task_once() {
    let dir = tempfile::tempdir().unwrap();
    let queue = file_queue(&dir).await;
    for target in 0..40 {
        queue.enqueue("summary", target, 5, None, None).await.unwrap();
    }

    let mut claimers = Vec::new();
    for _ in 0..8 {
        let queue = Arc::clone(&queue);
        claimers.push(tokio::spawn(async move {
            let mut claimed = Vec::new();
            loop {
                match queue.dequeue_next().await {
                    Ok(Some(task)) => claimed.push(task.id),
                    Ok(None) => break,
                    // SQLite lock contention surfaces as a store error; poll again
                    Err(QueueError::Database(_)) | Err(QueueError::Conflict(_)) => continue,
                    Err(e) => panic!("unexpected error: {}", e),
                }
            }
            claimed
        }));
    }

    let mut all = Vec::new();
    for claimer in claimers {
        all.extend(claimer.await.unwrap());
    }
    let unique: HashSet<_> = all.iter().cloned().collect();
    assert_eq!(all.len(), 40);
    assert_eq!(unique.len(), 40);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_chain_runs_in_order_on_single_worker() {
    let queue = memory_queue().await;
    for task_type in ["summary", "transcript", "podcast"] {
        queue
            .register_handler(
                task_type,
                handler_fn(|_, _, _| async {
                    tokio::time::sleep(Duration::from_millis(5)).await;
                    anyhow::Ok(())
                }),
            )
            .unwrap();
    }

    let ids = queue
        .enqueue_chain(vec![
            NewTask::new("summary", 1).batch("pipeline"),
            NewTask::new("transcript", 1).batch("pipeline"),
            NewTask::new("podcast", 1).batch("pipeline"),
        ])
        .await
        .unwrap();

    queue.start_workers(Some(1));
    wait_for(|| {
        let queue = Arc::clone(&queue);
        async move { queue.get_batch_status("pipeline").await.unwrap().complete == 3 }
    })
    .await;
    queue.stop_workers().await;

    let mut tasks = Vec::new();
    for id in &ids {
        tasks.push(queue.get_task(id).await.unwrap().unwrap());
    }
    for pair in tasks.windows(2) {
        let predecessor_done = pair[0].completed_at.unwrap();
        let started = pair[1].started_at.unwrap();
        assert!(started >= predecessor_done);
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_retrying_task_is_picked_up_by_workers() {
    let queue = memory_queue().await;
    let attempts_seen = Arc::new(Mutex::new(Vec::new()));
    let seen = Arc::clone(&attempts_seen);
    queue
        .register_handler(
            "podcast",
            blocking_fn(move |ctx, _, _| {
                seen.lock().unwrap().push(ctx.attempt);
                anyhow::ensure!(ctx.attempt >= 2, "TTS provider returned 503");
                Ok(())
            }),
        )
        .unwrap();

    let id = queue.enqueue("podcast", 5, 5, None, None).await.unwrap();
    queue.start_workers(None);
    wait_for(|| {
        let queue = Arc::clone(&queue);
        let id = id.clone();
        async move {
            queue.get_status(&id).await.unwrap().unwrap().status == TaskStatus::Complete
        }
    })
    .await;
    queue.stop_workers().await;

    assert_eq!(*attempts_seen.lock().unwrap(), vec![1, 2]);
    assert_eq!(queue.get_status(&id).await.unwrap().unwrap().attempts, 2);
}

#[tokio::test]
async fn test_start_and_stop_are_idempotent() {
    let queue = memory_queue().await;

    assert!(!queue.stop_workers().await);
    assert!(!queue.workers_running());

    assert!(queue.start_workers(Some(2)));
    assert!(!queue.start_workers(Some(2)));
    assert!(queue.workers_running());

    // Handlers are fixed once workers run
    let err = queue
        .register_handler("summary", handler_fn(|_, _, _| async { anyhow::Ok(()) }))
        .unwrap_err();
    assert!(matches!(err, QueueError::WorkersRunning));

    // Recovery would steal in-flight tasks from our own workers
    let err = queue.recover_orphaned(Duration::ZERO).await.unwrap_err();
    assert!(matches!(err, QueueError::WorkersRunning));

    assert!(queue.stop_workers().await);
    assert!(!queue.stop_workers().await);
    assert_eq!(queue.recover_orphaned(Duration::ZERO).await.unwrap(), 0);

    // Can be restarted after a stop
    queue
        .register_handler("summary", handler_fn(|_, _, _| async { anyhow::Ok(()) }))
        .unwrap();
    assert!(queue.start_workers(None));
    assert!(queue.stop_workers().await);
    assert_eq!(queue.registered_types(), vec!["summary"]);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_stop_waits_for_in_flight_task() {
    let queue = memory_queue().await;
    queue
        .register_handler(
            "summary",
            handler_fn(|_, _, _| async {
                tokio::time::sleep(Duration::from_millis(100)).await;
                anyhow::Ok(())
            }),
        )
        .unwrap();

    let id = queue.enqueue("summary", 1, 5, None, None).await.unwrap();
    queue.start_workers(Some(1));
    wait_for(|| {
        let queue = Arc::clone(&queue);
        let id = id.clone();
        async move {
            queue.get_status(&id).await.unwrap().unwrap().status == TaskStatus::Processing
        }
    })
    .await;

    assert!(queue.stop_workers().await);
    // The handler was allowed to finish, not cancelled
    assert_eq!(
        queue.get_status(&id).await.unwrap().unwrap().status,
        TaskStatus::Complete
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_dequeue_tolerates_concurrent_deletes() {
    let dir = tempfile::tempdir().unwrap();
    let queue = file_queue(&dir).await;
    let mut ids = Vec::new();
    for target in 0..40 {
        ids.push(queue.enqueue("summary", target, 5, None, None).await.unwrap());
    }

    // Delete every other task while claimers scan the same rows
    let deleter = {
        let queue = Arc::clone(&queue);
        let doomed: Vec<TaskId> = ids.iter().step_by(2).cloned().collect();
        tokio::spawn(async move {
            for id in doomed {
                while let Err(QueueError::Database(_)) = queue.delete_task(&id).await {
                    tokio::task::yield_now().await;
                }
            }
        })
    };

    let mut claimers = Vec::new();
    for _ in 0..4 {
        let queue = Arc::clone(&queue);
        claimers.push(tokio::spawn(async move {
            let mut claimed = Vec::new();
            loop {
                match queue.dequeue_next().await {
                    Ok(Some(task)) => claimed.push(task.id),
                    Ok(None) => break,
                    Err(QueueError::Database(_)) | Err(QueueError::Conflict(_)) => continue,
                    Err(e) => panic!("unexpected error: {}", e),
                }
            }
            claimed
        }));
    }

    deleter.await.unwrap();
    let mut claimed = HashSet::new();
    for claimer in claimers {
        for id in claimer.await.unwrap() {
            assert!(claimed.insert(id));
        }
    }

    // Whatever survived the deletes was claimed exactly once
    for (index, id) in ids.iter().enumerate() {
        if index % 2 == 1 {
            assert!(claimed.contains(id));
        }
    }
}
