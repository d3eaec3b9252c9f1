//! CAS persistence for `Task` (spec.md §4.1). Mirrors
//! `DbComponentRepo<DB: Database>`'s dual-impl-per-database shape: each
//! operation is a single transaction performing the conditional `UPDATE`
//! then re-`SELECT`ing the row so the caller observes the bumped `version`.

use std::ops::Deref;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use sqlx::{Database, Pool, Row};

use crate::errors::RepoError;
use crate::model::{InvocationConfig, RetryConfig, Task, TaskStatus, TaskType};

#[derive(sqlx::FromRow, Debug, Clone)]
pub struct TaskRecord {
    pub id: i64,
    pub name: String,
    pub task_type: String,
    pub cron_expr: String,
    pub invocation: String,
    pub retry_config: String,
    pub max_execution_seconds: i64,
    pub schedule_node_id: Option<String>,
    pub schedule_params: String,
    pub next_time: i64,
    pub status: String,
    pub version: i64,
    pub ctime: i64,
    pub utime: i64,
}

impl TryFrom<TaskRecord> for Task {
    type Error = RepoError;

    fn try_from(r: TaskRecord) -> Result<Self, Self::Error> {
        let invocation: InvocationConfig = serde_json::from_str(&r.invocation)
            .map_err(|e| RepoError::Database(sqlx::Error::Decode(Box::new(e))))?;
        let retry_config: RetryConfig = serde_json::from_str(&r.retry_config)
            .map_err(|e| RepoError::Database(sqlx::Error::Decode(Box::new(e))))?;
        let schedule_params = serde_json::from_str(&r.schedule_params)
            .map_err(|e| RepoError::Database(sqlx::Error::Decode(Box::new(e))))?;
        Ok(Task {
            id: r.id,
            name: r.name,
            task_type: r
                .task_type
                .parse::<TaskType>()
                .map_err(|e| RepoError::Database(sqlx::Error::Decode(e.into())))?,
            cron_expr: r.cron_expr,
            invocation,
            retry_config,
            max_execution_seconds: r.max_execution_seconds,
            schedule_node_id: r.schedule_node_id,
            schedule_params,
            next_time: r.next_time,
            status: r
                .status
                .parse::<TaskStatus>()
                .map_err(|e| RepoError::Database(sqlx::Error::Decode(e.into())))?,
            version: r.version,
            ctime: r.ctime,
            utime: r.utime,
        })
    }
}

#[async_trait]
pub trait TaskRepo: Send + Sync {
    async fn schedulable_tasks(
        &self,
        preempted_timeout_ms: i64,
        limit: i64,
    ) -> Result<Vec<Task>, RepoError>;

    async fn acquire(&self, id: i64, version: i64, schedule_node_id: &str)
        -> Result<Task, RepoError>;

    async fn renew(&self, schedule_node_id: &str) -> Result<u64, RepoError>;

    async fn release(&self, id: i64, schedule_node_id: &str) -> Result<Task, RepoError>;

    async fn update_next_time(&self, id: i64, version: i64, next_time: i64)
        -> Result<Task, RepoError>;

    async fn update_status(&self, id: i64, status: TaskStatus) -> Result<Task, RepoError>;

    async fn get_by_id(&self, id: i64) -> Result<Option<Task>, RepoError>;
}

pub struct DbTaskRepo<DB: Database> {
    db_pool: Arc<Pool<DB>>,
}

impl<DB: Database> DbTaskRepo<DB> {
    pub fn new(db_pool: Arc<Pool<DB>>) -> Self {
        Self { db_pool }
    }
}

#[async_trait]
impl TaskRepo for DbTaskRepo<sqlx::Postgres> {
    async fn schedulable_tasks(
        &self,
        preempted_timeout_ms: i64,
        limit: i64,
    ) -> Result<Vec<Task>, RepoError> {
        let now = Utc::now().timestamp_millis();
        let stale_before = now - preempted_timeout_ms;
        let records = sqlx::query_as::<_, TaskRecord>(
            r#"
            SELECT id, name, task_type, cron_expr, invocation::text AS invocation,
                   retry_config::text AS retry_config, max_execution_seconds,
                   schedule_node_id, schedule_params::text AS schedule_params,
                   next_time, status, version, ctime, utime
            FROM tasks
            WHERE next_time <= $1
              AND (status = 'ACTIVE' OR (status = 'PREEMPTED' AND utime <= $2))
            ORDER BY next_time ASC
            LIMIT $3
            "#,
        )
        .bind(now)
        .bind(stale_before)
        .bind(limit)
        .fetch_all(self.db_pool.deref())
        .await?;

        records.into_iter().map(Task::try_from).collect()
    }

    async fn acquire(
        &self,
        id: i64,
        version: i64,
        schedule_node_id: &str,
    ) -> Result<Task, RepoError> {
        let now = Utc::now().timestamp_millis();
        let mut tx = self.db_pool.begin().await?;
        let result = sqlx::query(
            r#"
            UPDATE tasks
            SET status = 'PREEMPTED', schedule_node_id = $1, version = version + 1, utime = $2
            WHERE id = $3 AND version = $4
            "#,
        )
        .bind(schedule_node_id)
        .bind(now)
        .bind(id)
        .bind(version)
        .execute(&mut *tx)
        .await?;

        if result.rows_affected() == 0 {
            return Err(RepoError::TaskPreemptFailed);
        }

        let record = sqlx::query_as::<_, TaskRecord>(
            r#"SELECT id, name, task_type, cron_expr, invocation::text AS invocation,
                      retry_config::text AS retry_config, max_execution_seconds,
                      schedule_node_id, schedule_params::text AS schedule_params,
                      next_time, status, version, ctime, utime
               FROM tasks WHERE id = $1"#,
        )
        .bind(id)
        .fetch_one(&mut *tx)
        .await?;
        tx.commit().await?;

        record.try_into()
    }

    async fn renew(&self, schedule_node_id: &str) -> Result<u64, RepoError> {
        let now = Utc::now().timestamp_millis();
        let result = sqlx::query(
            r#"
            UPDATE tasks
            SET version = version + 1, utime = $1
            WHERE status = 'PREEMPTED' AND schedule_node_id = $2
            "#,
        )
        .bind(now)
        .bind(schedule_node_id)
        .execute(self.db_pool.deref())
        .await?;

        Ok(result.rows_affected())
    }

    async fn release(&self, id: i64, schedule_node_id: &str) -> Result<Task, RepoError> {
        let now = Utc::now().timestamp_millis();
        let mut tx = self.db_pool.begin().await?;
        let result = sqlx::query(
            r#"
            UPDATE tasks
            SET status = 'ACTIVE', schedule_node_id = NULL, version = version + 1, utime = $1
            WHERE id = $2 AND status = 'PREEMPTED' AND schedule_node_id = $3
            "#,
        )
        .bind(now)
        .bind(id)
        .bind(schedule_node_id)
        .execute(&mut *tx)
        .await?;

        if result.rows_affected() == 0 {
            return Err(RepoError::TaskReleaseFailed);
        }

        let record = sqlx::query_as::<_, TaskRecord>(
            r#"SELECT id, name, task_type, cron_expr, invocation::text AS invocation,
                      retry_config::text AS retry_config, max_execution_seconds,
                      schedule_node_id, schedule_params::text AS schedule_params,
                      next_time, status, version, ctime, utime
               FROM tasks WHERE id = $1"#,
        )
        .bind(id)
        .fetch_one(&mut *tx)
        .await?;
        tx.commit().await?;

        record.try_into()
    }

    async fn update_next_time(
        &self,
        id: i64,
        version: i64,
        next_time: i64,
    ) -> Result<Task, RepoError> {
        let now = Utc::now().timestamp_millis();
        let mut tx = self.db_pool.begin().await?;
        let result = sqlx::query(
            r#"
            UPDATE tasks
            SET next_time = $1, version = version + 1, utime = $2
            WHERE id = $3 AND version = $4
            "#,
        )
        .bind(next_time)
        .bind(now)
        .bind(id)
        .bind(version)
        .execute(&mut *tx)
        .await?;

        if result.rows_affected() == 0 {
            return Err(RepoError::TaskUpdateNextTimeFailed);
        }

        let record = sqlx::query_as::<_, TaskRecord>(
            r#"SELECT id, name, task_type, cron_expr, invocation::text AS invocation,
                      retry_config::text AS retry_config, max_execution_seconds,
                      schedule_node_id, schedule_params::text AS schedule_params,
                      next_time, status, version, ctime, utime
               FROM tasks WHERE id = $1"#,
        )
        .bind(id)
        .fetch_one(&mut *tx)
        .await?;
        tx.commit().await?;

        record.try_into()
    }

    async fn update_status(&self, id: i64, status: TaskStatus) -> Result<Task, RepoError> {
        let now = Utc::now().timestamp_millis();
        let mut tx = self.db_pool.begin().await?;
        let result = sqlx::query(
            "UPDATE tasks SET status = $1, version = version + 1, utime = $2 WHERE id = $3",
        )
        .bind(status.as_str())
        .bind(now)
        .bind(id)
        .execute(&mut *tx)
        .await?;

        if result.rows_affected() == 0 {
            return Err(RepoError::TaskUpdateStatusFailed);
        }

        let record = sqlx::query_as::<_, TaskRecord>(
            r#"SELECT id, name, task_type, cron_expr, invocation::text AS invocation,
                      retry_config::text AS retry_config, max_execution_seconds,
                      schedule_node_id, schedule_params::text AS schedule_params,
                      next_time, status, version, ctime, utime
               FROM tasks WHERE id = $1"#,
        )
        .bind(id)
        .fetch_one(&mut *tx)
        .await?;
        tx.commit().await?;

        record.try_into()
    }

    async fn get_by_id(&self, id: i64) -> Result<Option<Task>, RepoError> {
        let record = sqlx::query_as::<_, TaskRecord>(
            r#"SELECT id, name, task_type, cron_expr, invocation::text AS invocation,
                      retry_config::text AS retry_config, max_execution_seconds,
                      schedule_node_id, schedule_params::text AS schedule_params,
                      next_time, status, version, ctime, utime
               FROM tasks WHERE id = $1"#,
        )
        .bind(id)
        .fetch_optional(self.db_pool.deref())
        .await?;

        record.map(Task::try_from).transpose()
    }
}

#[async_trait]
impl TaskRepo for DbTaskRepo<sqlx::Sqlite> {
    async fn schedulable_tasks(
        &self,
        preempted_timeout_ms: i64,
        limit: i64,
    ) -> Result<Vec<Task>, RepoError> {
        let now = Utc::now().timestamp_millis();
        let stale_before = now - preempted_timeout_ms;
        let records = sqlx::query_as::<_, TaskRecord>(
            r#"
            SELECT id, name, task_type, cron_expr, invocation, retry_config,
                   max_execution_seconds, schedule_node_id, schedule_params,
                   next_time, status, version, ctime, utime
            FROM tasks
            WHERE next_time <= ?1
              AND (status = 'ACTIVE' OR (status = 'PREEMPTED' AND utime <= ?2))
            ORDER BY next_time ASC
            LIMIT ?3
            "#,
        )
        .bind(now)
        .bind(stale_before)
        .bind(limit)
        .fetch_all(self.db_pool.deref())
        .await?;

        records.into_iter().map(Task::try_from).collect()
    }

    async fn acquire(
        &self,
        id: i64,
        version: i64,
        schedule_node_id: &str,
    ) -> Result<Task, RepoError> {
        let now = Utc::now().timestamp_millis();
        let mut tx = self.db_pool.begin().await?;
        let result = sqlx::query(
            r#"
            UPDATE tasks
            SET status = 'PREEMPTED', schedule_node_id = ?1, version = version + 1, utime = ?2
            WHERE id = ?3 AND version = ?4
            "#,
        )
        .bind(schedule_node_id)
        .bind(now)
        .bind(id)
        .bind(version)
        .execute(&mut *tx)
        .await?;

        if result.rows_affected() == 0 {
            return Err(RepoError::TaskPreemptFailed);
        }

        let record = sqlx::query_as::<_, TaskRecord>(
            r#"SELECT id, name, task_type, cron_expr, invocation, retry_config,
                      max_execution_seconds, schedule_node_id, schedule_params,
                      next_time, status, version, ctime, utime
               FROM tasks WHERE id = ?1"#,
        )
        .bind(id)
        .fetch_one(&mut *tx)
        .await?;
        tx.commit().await?;

        record.try_into()
    }

    async fn renew(&self, schedule_node_id: &str) -> Result<u64, RepoError> {
        let now = Utc::now().timestamp_millis();
        let result = sqlx::query(
            r#"
            UPDATE tasks
            SET version = version + 1, utime = ?1
            WHERE status = 'PREEMPTED' AND schedule_node_id = ?2
            "#,
        )
        .bind(now)
        .bind(schedule_node_id)
        .execute(self.db_pool.deref())
        .await?;

        Ok(result.rows_affected())
    }

    async fn release(&self, id: i64, schedule_node_id: &str) -> Result<Task, RepoError> {
        let now = Utc::now().timestamp_millis();
        let mut tx = self.db_pool.begin().await?;
        let result = sqlx::query(
            r#"
            UPDATE tasks
            SET status = 'ACTIVE', schedule_node_id = NULL, version = version + 1, utime = ?1
            WHERE id = ?2 AND status = 'PREEMPTED' AND schedule_node_id = ?3
            "#,
        )
        .bind(now)
        .bind(id)
        .bind(schedule_node_id)
        .execute(&mut *tx)
        .await?;

        if result.rows_affected() == 0 {
            return Err(RepoError::TaskReleaseFailed);
        }

        let record = sqlx::query_as::<_, TaskRecord>(
            r#"SELECT id, name, task_type, cron_expr, invocation, retry_config,
                      max_execution_seconds, schedule_node_id, schedule_params,
                      next_time, status, version, ctime, utime
               FROM tasks WHERE id = ?1"#,
        )
        .bind(id)
        .fetch_one(&mut *tx)
        .await?;
        tx.commit().await?;

        record.try_into()
    }

    async fn update_next_time(
        &self,
        id: i64,
        version: i64,
        next_time: i64,
    ) -> Result<Task, RepoError> {
        let now = Utc::now().timestamp_millis();
        let mut tx = self.db_pool.begin().await?;
        let result = sqlx::query(
            r#"
            UPDATE tasks
            SET next_time = ?1, version = version + 1, utime = ?2
            WHERE id = ?3 AND version = ?4
            "#,
        )
        .bind(next_time)
        .bind(now)
        .bind(id)
        .bind(version)
        .execute(&mut *tx)
        .await?;

        if result.rows_affected() == 0 {
            return Err(RepoError::TaskUpdateNextTimeFailed);
        }

        let record = sqlx::query_as::<_, TaskRecord>(
            r#"SELECT id, name, task_type, cron_expr, invocation, retry_config,
                      max_execution_seconds, schedule_node_id, schedule_params,
                      next_time, status, version, ctime, utime
               FROM tasks WHERE id = ?1"#,
        )
        .bind(id)
        .fetch_one(&mut *tx)
        .await?;
        tx.commit().await?;

        record.try_into()
    }

    async fn update_status(&self, id: i64, status: TaskStatus) -> Result<Task, RepoError> {
        let now = Utc::now().timestamp_millis();
        let mut tx = self.db_pool.begin().await?;
        let result = sqlx::query(
            "UPDATE tasks SET status = ?1, version = version + 1, utime = ?2 WHERE id = ?3",
        )
        .bind(status.as_str())
        .bind(now)
        .bind(id)
        .execute(&mut *tx)
        .await?;

        if result.rows_affected() == 0 {
            return Err(RepoError::TaskUpdateStatusFailed);
        }

        let record = sqlx::query_as::<_, TaskRecord>(
            r#"SELECT id, name, task_type, cron_expr, invocation, retry_config,
                      max_execution_seconds, schedule_node_id, schedule_params,
                      next_time, status, version, ctime, utime
               FROM tasks WHERE id = ?1"#,
        )
        .bind(id)
        .fetch_one(&mut *tx)
        .await?;
        tx.commit().await?;

        record.try_into()
    }

    async fn get_by_id(&self, id: i64) -> Result<Option<Task>, RepoError> {
        let record = sqlx::query_as::<_, TaskRecord>(
            r#"SELECT id, name, task_type, cron_expr, invocation, retry_config,
                      max_execution_seconds, schedule_node_id, schedule_params,
                      next_time, status, version, ctime, utime
               FROM tasks WHERE id = ?1"#,
        )
        .bind(id)
        .fetch_optional(self.db_pool.deref())
        .await?;

        record.map(Task::try_from).transpose()
    }
}

/// Test-only seeding helper: inserts a fresh ACTIVE task and returns its id.
/// Task creation is out of scope per spec.md §1 (no admin CRUD surface);
/// production rows are expected to be seeded by an external control plane.
#[cfg(test)]
pub async fn seed_task(pool: &Pool<sqlx::Sqlite>, task: &Task) -> Result<i64, RepoError> {
    let invocation = serde_json::to_string(&task.invocation).unwrap();
    let retry_config = serde_json::to_string(&task.retry_config).unwrap();
    let schedule_params = serde_json::to_string(&task.schedule_params).unwrap();
    let row = sqlx::query(
        r#"
        INSERT INTO tasks
          (name, task_type, cron_expr, invocation, retry_config, max_execution_seconds,
           schedule_node_id, schedule_params, next_time, status, version, ctime, utime)
        VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)
        RETURNING id
        "#,
    )
    .bind(&task.name)
    .bind(task.task_type.as_str())
    .bind(&task.cron_expr)
    .bind(invocation)
    .bind(retry_config)
    .bind(task.max_execution_seconds)
    .bind(&task.schedule_node_id)
    .bind(schedule_params)
    .bind(task.next_time)
    .bind(task.status.as_str())
    .bind(task.version)
    .bind(task.ctime)
    .bind(task.utime)
    .fetch_one(pool)
    .await?;

    Ok(row.get::<i64, _>("id"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{GrpcConfig, InvocationConfig, RetryConfig, TaskType};
    use std::collections::HashMap;

    fn sample_task(status: TaskStatus, next_time: i64) -> Task {
        let now = Utc::now().timestamp_millis();
        Task {
            id: 0,
            name: "demo".to_string(),
            task_type: TaskType::Recurring,
            cron_expr: "* * * * * *".to_string(),
            invocation: InvocationConfig::Grpc(GrpcConfig {
                service_name: "demo".to_string(),
                params: HashMap::new(),
            }),
            retry_config: RetryConfig {
                max_retries: 3,
                initial_interval_ms: 100,
                max_interval_ms: 1000,
            },
            max_execution_seconds: 60,
            schedule_node_id: None,
            schedule_params: HashMap::new(),
            next_time,
            status,
            version: 0,
            ctime: now,
            utime: now,
        }
    }

    async fn repo() -> (Arc<Pool<sqlx::Sqlite>>, DbTaskRepo<sqlx::Sqlite>) {
        let pool = Arc::new(crate::db::create_test_sqlite_pool().await.unwrap());
        let repo = DbTaskRepo::new(pool.clone());
        (pool, repo)
    }

    #[tokio::test]
    async fn acquire_succeeds_and_bumps_version() {
        let (pool, repo) = repo().await;
        let task = sample_task(TaskStatus::Active, Utc::now().timestamp_millis());
        let id = seed_task(&pool, &task).await.unwrap();

        let acquired = repo.acquire(id, 0, "node-a").await.unwrap();
        assert_eq!(acquired.version, 1);
        assert_eq!(acquired.status, TaskStatus::Preempted);
        assert_eq!(acquired.schedule_node_id.as_deref(), Some("node-a"));
    }

    #[tokio::test]
    async fn acquire_fails_on_stale_version() {
        let (pool, repo) = repo().await;
        let task = sample_task(TaskStatus::Active, Utc::now().timestamp_millis());
        let id = seed_task(&pool, &task).await.unwrap();

        repo.acquire(id, 0, "node-a").await.unwrap();

        // A second scheduler racing against the same stale version loses.
        let result = repo.acquire(id, 0, "node-b").await;
        assert!(matches!(result, Err(RepoError::TaskPreemptFailed)));
    }

    #[tokio::test]
    async fn release_requires_the_owning_node() {
        let (pool, repo) = repo().await;
        let task = sample_task(TaskStatus::Active, Utc::now().timestamp_millis());
        let id = seed_task(&pool, &task).await.unwrap();
        repo.acquire(id, 0, "node-a").await.unwrap();

        let wrong_owner = repo.release(id, "node-b").await;
        assert!(matches!(wrong_owner, Err(RepoError::TaskReleaseFailed)));

        let released = repo.release(id, "node-a").await.unwrap();
        assert_eq!(released.status, TaskStatus::Active);
        assert_eq!(released.schedule_node_id, None);
    }

    #[tokio::test]
    async fn renew_only_touches_rows_owned_by_this_node() {
        let (pool, repo) = repo().await;
        let task_a = sample_task(TaskStatus::Active, Utc::now().timestamp_millis());
        let task_b = sample_task(TaskStatus::Active, Utc::now().timestamp_millis());
        let id_a = seed_task(&pool, &task_a).await.unwrap();
        let id_b = seed_task(&pool, &task_b).await.unwrap();

        repo.acquire(id_a, 0, "node-a").await.unwrap();
        repo.acquire(id_b, 0, "node-b").await.unwrap();

        let renewed = repo.renew("node-a").await.unwrap();
        assert_eq!(renewed, 1);

        let a = repo.get_by_id(id_a).await.unwrap().unwrap();
        let b = repo.get_by_id(id_b).await.unwrap().unwrap();
        assert_eq!(a.version, 2);
        assert_eq!(b.version, 1);
    }

    #[tokio::test]
    async fn schedulable_tasks_includes_due_active_and_stale_preempted_only() {
        let (pool, repo) = repo().await;
        let now = Utc::now().timestamp_millis();

        let due_active = sample_task(TaskStatus::Active, now - 1000);
        let not_due_active = sample_task(TaskStatus::Active, now + 60_000);
        let id_due = seed_task(&pool, &due_active).await.unwrap();
        let id_not_due = seed_task(&pool, &not_due_active).await.unwrap();

        let stale_preempted = sample_task(TaskStatus::Active, now - 1000);
        let id_stale = seed_task(&pool, &stale_preempted).await.unwrap();
        repo.acquire(id_stale, 0, "node-a").await.unwrap();
        // Back-date utime so the PREEMPTED row looks abandoned.
        sqlx::query("UPDATE tasks SET utime = ?1 WHERE id = ?2")
            .bind(now - 120_000)
            .bind(id_stale)
            .execute(pool.as_ref())
            .await
            .unwrap();

        let fresh_preempted = sample_task(TaskStatus::Active, now - 1000);
        let id_fresh = seed_task(&pool, &fresh_preempted).await.unwrap();
        repo.acquire(id_fresh, 0, "node-b").await.unwrap();

        let schedulable = repo.schedulable_tasks(60_000, 10).await.unwrap();
        let ids: Vec<i64> = schedulable.iter().map(|t| t.id).collect();

        assert!(ids.contains(&id_due));
        assert!(ids.contains(&id_stale));
        assert!(!ids.contains(&id_not_due));
        assert!(!ids.contains(&id_fresh));
    }
}
