//! taskq CLI
//!
//! Operator tool for the task queue: enqueue work, inspect task and batch
//! status, retry or prune tasks, recover orphans, and run a dry-run worker
//! pool that drains the queue.

use anyhow::Result;
use async_trait::async_trait;
use clap::{Parser, Subcommand};
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use taskq::{HandlerContext, NewTask, QueueConfig, TaskHandler, TaskId, TaskQueue};
use tracing::{info, Level};
use tracing_subscriber::FmtSubscriber;

#[derive(Parser)]
#[command(name = "taskq")]
#[command(about = "Persistent task queue for background generation jobs")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// SQLite database URL
    #[arg(long, env = "DATABASE_URL", default_value = taskq::db::connection::DEFAULT_DATABASE_URL, global = true)]
    database_url: String,

    /// Output as JSON
    #[arg(long, global = true)]
    json: bool,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Enqueue a single task
    Enqueue {
        /// Task type, e.g. summary, transcript, podcast
        #[arg(short = 't', long)]
        task_type: String,

        /// Id of the object to process
        #[arg(long)]
        target: i64,

        /// Lower runs first
        #[arg(short, long, default_value = "5")]
        priority: i32,

        /// Task metadata as a JSON object
        #[arg(short, long)]
        metadata: Option<String>,

        /// Only run after this task completes
        #[arg(long)]
        depends_on: Option<String>,

        /// Batch id for grouped progress
        #[arg(short, long)]
        batch: Option<String>,
    },

    /// Enqueue a chain of task types for one target, each waiting on the previous
    Chain {
        /// Task types in execution order
        #[arg(required = true)]
        task_types: Vec<String>,

        /// Id of the object to process
        #[arg(long)]
        target: i64,

        /// Lower runs first
        #[arg(short, long, default_value = "5")]
        priority: i32,

        /// Batch id for grouped progress
        #[arg(short, long)]
        batch: Option<String>,
    },

    /// Show the status of a task
    Status { id: String },

    /// Show aggregate progress of a batch
    Batch { batch_id: String },

    /// List tasks, optionally for one target
    List {
        #[arg(long)]
        target: Option<i64>,
    },

    /// Reset a failed task so it runs again
    Retry { id: String },

    /// Delete a task record
    Delete { id: String },

    /// Delete finished tasks older than the given age
    Prune {
        /// Age in hours (default: 168 = one week)
        #[arg(long, default_value = "168")]
        older_than_hours: u64,
    },

    /// Return tasks stuck in queued/processing after a crash
    ///
    /// Never run this while any worker process is live: a long-running task
    /// would be counted as a lost attempt and run a second time.
    Recover {
        /// Consider tasks stale after this many seconds (default: 600)
        #[arg(long, default_value = "600")]
        stale_after: u64,
    },

    /// Run a worker pool that completes tasks of the accepted types without doing any work
    Worker {
        /// Task types to accept
        #[arg(short, long, value_delimiter = ',', required = true)]
        accept: Vec<String>,

        /// Number of worker loops (default: from TASKQ_MAX_WORKERS or 3)
        #[arg(short, long)]
        workers: Option<usize>,

        /// Recover orphaned tasks older than this many seconds before starting
        #[arg(long)]
        recover_after: Option<u64>,
    },
}

/// Logs the task and reports success
struct DryRunHandler;

#[async_trait]
impl TaskHandler for DryRunHandler {
    async fn handle(&self, ctx: HandlerContext, task_id: TaskId, target_id: i64) -> Result<()> {
        info!(
            "[dry-run] {} task {} for target {} (attempt {}/{}) metadata={}",
            ctx.task_type, task_id, target_id, ctx.attempt, ctx.max_attempts, ctx.metadata
        );
        Ok(())
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env file if present
    dotenvy::dotenv().ok();

    let cli = Cli::parse();

    // Initialize logging
    let level = if cli.verbose {
        Level::DEBUG
    } else {
        Level::INFO
    };
    let subscriber = FmtSubscriber::builder().with_max_level(level).finish();
    tracing::subscriber::set_global_default(subscriber)?;

    let config = QueueConfig::from_env()?;
    let queue = Arc::new(TaskQueue::open(&cli.database_url, config).await?);
    let json = cli.json;

    match cli.command {
        Commands::Enqueue {
            task_type,
            target,
            priority,
            metadata,
            depends_on,
            batch,
        } => {
            let mut request = NewTask::new(task_type, target).priority(priority);
            if let Some(raw) = metadata {
                request = request.metadata(serde_json::from_str(&raw)?);
            }
            if let Some(dep) = depends_on {
                request = request.depends_on(TaskId::from(dep));
            }
            if let Some(batch) = batch {
                request = request.batch(batch);
            }

            let id = queue.enqueue_task(request).await?;
            print_output(json, &id, || println!("{}", id))?;
        }

        Commands::Chain {
            task_types,
            target,
            priority,
            batch,
        } => {
            let steps = task_types
                .into_iter()
                .map(|task_type| {
                    let step = NewTask::new(task_type, target).priority(priority);
                    match &batch {
                        Some(batch) => step.batch(batch.clone()),
                        None => step,
                    }
                })
                .collect();

            let ids = queue.enqueue_chain(steps).await?;
            print_output(json, &ids, || {
                for id in &ids {
                    println!("{}", id);
                }
            })?;
        }

        Commands::Status { id } => match queue.get_status(&TaskId::from(id.clone())).await? {
            Some(status) => print_output(json, &status, || {
                println!("Task:      {}", status.id);
                println!("Status:    {}", status.status);
                println!("Type:      {} (target {})", status.task_type, status.target_id);
                println!("Attempts:  {}/{}", status.attempts, status.max_attempts);
                println!("Created:   {}", status.created_at.to_rfc3339());
                if let Some(completed) = status.completed_at {
                    println!("Completed: {}", completed.to_rfc3339());
                }
                if let Some(retry_at) = status.retry_at {
                    println!("Retry at:  {}", retry_at.to_rfc3339());
                }
                if let Some(error) = &status.error {
                    println!("Error:     {}", error);
                }
            })?,
            None => anyhow::bail!("Task {} not found", id),
        },

        Commands::Batch { batch_id } => {
            let batch = queue.get_batch_status(&batch_id).await?;
            print_output(json, &batch, || {
                println!("=== Batch {} ===", batch_id);
                println!(
                    "Total: {}  complete: {}  error: {}  processing: {}  pending: {}",
                    batch.total, batch.complete, batch.error, batch.processing, batch.pending
                );
                for task in &batch.tasks {
                    println!(
                        "  - {} [{}] {} target={} attempts={}{}",
                        task.id,
                        task.status,
                        task.task_type,
                        task.target_id,
                        task.attempts,
                        task.error
                            .as_deref()
                            .map(|e| format!(" error={}", e))
                            .unwrap_or_default()
                    );
                }
            })?;
        }

        Commands::List { target } => {
            let tasks = queue.list_tasks(target).await?;
            print_output(json, &tasks, || {
                println!("=== Tasks ({}) ===", tasks.len());
                for task in &tasks {
                    println!(
                        "  - {} [{}] {} target={} created={}",
                        task.id,
                        task.status,
                        task.task_type,
                        task.target_id,
                        task.created_at.to_rfc3339()
                    );
                }
            })?;
        }

        Commands::Retry { id } => {
            if queue.retry(&TaskId::from(id.clone())).await? {
                println!("Task {} reset to pending", id);
            } else {
                anyhow::bail!("Task {} is not in error state", id);
            }
        }

        Commands::Delete { id } => {
            if queue.delete_task(&TaskId::from(id.clone())).await? {
                println!("Task {} deleted", id);
            } else {
                anyhow::bail!("Task {} not found", id);
            }
        }

        Commands::Prune { older_than_hours } => {
            let removed = queue
                .prune_finished(Duration::from_secs(older_than_hours * 3600))
                .await?;
            println!("Pruned {} task(s)", removed);
        }

        Commands::Recover { stale_after } => {
            let recovered = queue
                .recover_orphaned(Duration::from_secs(stale_after))
                .await?;
            println!("Recovered {} task(s)", recovered);
        }

        Commands::Worker {
            accept,
            workers,
            recover_after,
        } => {
            for task_type in &accept {
                queue.register_handler(task_type.clone(), DryRunHandler)?;
            }

            if let Some(secs) = recover_after {
                queue.recover_orphaned(Duration::from_secs(secs)).await?;
            }

            info!("Accepting task types: {}", accept.join(", "));
            queue.start_workers(workers);

            tokio::signal::ctrl_c().await?;
            info!("Received Ctrl+C, initiating shutdown...");
            queue.stop_workers().await;
        }
    }

    Ok(())
}

fn print_output<T: Serialize>(json: bool, value: &T, human: impl FnOnce()) -> Result<()> {
    if json {
        println!("{}", serde_json::to_string_pretty(value)?);
    } else {
        human();
    }
    Ok(())
}
