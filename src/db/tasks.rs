//! Tasks table operations
//!
//! Every state change goes through [`TaskStore::update`], which is an
//! optimistic compare-and-set on the row's `version` column. Two workers that
//! race to claim the same row both read version N; only one `UPDATE ... WHERE
//! version = N` touches a row, the other re-reads and sees the task already
//! claimed.

use crate::db::models::{Task, TaskFilter, TaskId, TaskStatus};
use crate::db::DbPool;
use crate::error::{QueueError, Result};
use sqlx::sqlite::SqliteRow;
use sqlx::Row;
use tracing::debug;

/// Read-modify-write rounds before `update` reports a conflict
const MAX_UPDATE_ROUNDS: usize = 16;

/// Durable task persistence
#[derive(Clone)]
pub struct TaskStore {
    pool: DbPool,
}

impl TaskStore {
    /// Wrap a pool and make sure the schema exists
    pub async fn new(pool: DbPool) -> Result<Self> {
        let store = Self { pool };
        store.init_schema().await?;
        Ok(store)
    }

    async fn init_schema(&self) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS tasks (
                id TEXT PRIMARY KEY,
                status TEXT NOT NULL,
                payload TEXT NOT NULL,
                version INTEGER NOT NULL DEFAULT 0
            );

            CREATE INDEX IF NOT EXISTS idx_tasks_status ON tasks(status);
            "#,
        )
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Insert a new task record
    pub async fn create(&self, task: &Task) -> Result<TaskId> {
        let payload = serde_json::to_string(task)?;

        sqlx::query("INSERT INTO tasks (id, status, payload, version) VALUES (?, ?, ?, 0)")
            .bind(task.id.as_str())
            .bind(task.status.as_str())
            .bind(payload)
            .execute(&self.pool)
            .await?;

        Ok(task.id.clone())
    }

    /// Insert several records in one transaction; either all land or none do
    pub async fn create_many(&self, tasks: &[Task]) -> Result<Vec<TaskId>> {
        let mut tx = self.pool.begin().await?;
        let mut ids = Vec::with_capacity(tasks.len());

        for task in tasks {
            let payload = serde_json::to_string(task)?;
            sqlx::query("INSERT INTO tasks (id, status, payload, version) VALUES (?, ?, ?, 0)")
                .bind(task.id.as_str())
                .bind(task.status.as_str())
                .bind(payload)
                .execute(&mut *tx)
                .await?;
            ids.push(task.id.clone());
        }

        tx.commit().await?;
        Ok(ids)
    }

    /// Get a task by ID
    pub async fn get(&self, id: &TaskId) -> Result<Option<Task>> {
        Ok(self.get_versioned(id).await?.map(|(task, _)| task))
    }

    async fn get_versioned(&self, id: &TaskId) -> Result<Option<(Task, i64)>> {
        let row = sqlx::query("SELECT id, status, payload, version FROM tasks WHERE id = ?")
            .bind(id.as_str())
            .fetch_optional(&self.pool)
            .await?;

        match row {
            Some(row) => {
                let version: i64 = row.try_get("version")?;
                Ok(Some((Self::row_to_task(&row)?, version)))
            }
            None => Ok(None),
        }
    }

    /// Apply `mutator` to the current record and persist it atomically.
    ///
    /// The mutator sees the freshest stored copy and returns `false` to leave
    /// the record untouched, in which case `Ok(None)` is returned. It may run
    /// more than once when a concurrent writer wins the race.
    pub async fn update<F>(&self, id: &TaskId, mut mutator: F) -> Result<Option<Task>>
    where
        F: FnMut(&mut Task) -> bool,
    {
        for _ in 0..MAX_UPDATE_ROUNDS {
            let (mut task, version) = self
                .get_versioned(id)
                .await?
                .ok_or_else(|| QueueError::NotFound(id.clone()))?;

            if !mutator(&mut task) {
                return Ok(None);
            }
            // id is immutable whatever the mutator did
            task.id = id.clone();

            let payload = serde_json::to_string(&task)?;
            let result = sqlx::query(
                r#"
                UPDATE tasks
                SET status = ?, payload = ?, version = version + 1
                WHERE id = ? AND version = ?
                "#,
            )
            .bind(task.status.as_str())
            .bind(payload)
            .bind(id.as_str())
            .bind(version)
            .execute(&self.pool)
            .await?;

            if result.rows_affected() == 1 {
                return Ok(Some(task));
            }
            debug!("Task {} changed during update, re-reading", id);
        }

        Err(QueueError::Conflict(id.clone()))
    }

    /// Conditional update: only applies while the task is in one of `from`
    pub async fn transition<F>(
        &self,
        id: &TaskId,
        from: &[TaskStatus],
        mut mutator: F,
    ) -> Result<Option<Task>>
    where
        F: FnMut(&mut Task) -> bool,
    {
        self.update(id, |task| from.contains(&task.status) && mutator(task))
            .await
    }

    /// Query tasks, oldest insertion first unless `newest_first` is set
    pub async fn query(&self, filter: &TaskFilter) -> Result<Vec<Task>> {
        let mut builder = sqlx::QueryBuilder::<sqlx::Sqlite>::new(
            "SELECT id, status, payload, version FROM tasks",
        );
        if !filter.statuses.is_empty() {
            builder.push(" WHERE status IN (");
            let mut separated = builder.separated(", ");
            for status in &filter.statuses {
                separated.push_bind(status.as_str());
            }
            separated.push_unseparated(")");
        }
        builder.push(if filter.newest_first {
            " ORDER BY rowid DESC"
        } else {
            " ORDER BY rowid ASC"
        });

        let rows = builder.build().fetch_all(&self.pool).await?;

        let mut tasks = Vec::new();
        for row in rows {
            let task = Self::row_to_task(&row)?;
            if filter.matches(&task) {
                tasks.push(task);
                if filter.limit.is_some_and(|limit| tasks.len() >= limit) {
                    break;
                }
            }
        }

        Ok(tasks)
    }

    /// Delete a task, returning whether a row was removed
    pub async fn delete(&self, id: &TaskId) -> Result<bool> {
        let result = sqlx::query("DELETE FROM tasks WHERE id = ?")
            .bind(id.as_str())
            .execute(&self.pool)
            .await?;

        Ok(result.rows_affected() > 0)
    }

    /// Count tasks per status for monitoring
    pub async fn count_by_status(&self, status: TaskStatus) -> Result<i64> {
        let row = sqlx::query("SELECT COUNT(*) as count FROM tasks WHERE status = ?")
            .bind(status.as_str())
            .fetch_one(&self.pool)
            .await?;

        Ok(row.try_get("count")?)
    }

    fn row_to_task(row: &SqliteRow) -> Result<Task> {
        let id: String = row.try_get("id")?;
        let status: String = row.try_get("status")?;
        let payload: String = row.try_get("payload")?;

        let mut task: Task = serde_json::from_str(&payload)?;
        // The indexed columns win over whatever the payload says
        task.id = TaskId::from(id);
        task.status = TaskStatus::from_db(&status)?;
        Ok(task)
    }
}
