//! Persistence for `TaskExecution` (spec.md §4.2). Same transactional
//! shape as `repo::task`; `set_running_state`'s precondition is a `WHERE
//! status IN (...)` clause, `update_progress`'s is `WHERE status =
//! 'RUNNING'`, both bare `UPDATE`s since their callers don't need the row
//! back.

use std::collections::HashMap;
use std::ops::Deref;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use sqlx::{Database, Pool};

use crate::errors::RepoError;
use crate::model::{ExecutionStatus, GrpcConfig, HttpConfig, InvocationConfig, Task, TaskExecution};

#[derive(sqlx::FromRow, Debug, Clone)]
pub struct ExecutionRecord {
    pub id: i64,
    pub task_id: i64,
    pub task_name: String,
    pub task_version: i64,
    pub task_type: String,
    pub task_cron_expr: String,
    pub task_invocation: String,
    pub task_retry_config: String,
    pub task_max_execution_seconds: i64,
    pub task_schedule_node_id: Option<String>,
    pub task_schedule_params: String,
    pub executor_node_id: Option<String>,
    pub deadline: i64,
    pub start_time: i64,
    pub end_time: i64,
    pub retry_count: i64,
    pub next_retry_time: i64,
    pub running_progress: i32,
    pub status: String,
    pub ctime: i64,
    pub utime: i64,
}

impl TryFrom<ExecutionRecord> for TaskExecution {
    type Error = RepoError;

    fn try_from(r: ExecutionRecord) -> Result<Self, Self::Error> {
        let invocation: InvocationConfig = serde_json::from_str(&r.task_invocation)
            .map_err(|e| RepoError::Database(sqlx::Error::Decode(Box::new(e))))?;
        let retry_config = serde_json::from_str(&r.task_retry_config)
            .map_err(|e| RepoError::Database(sqlx::Error::Decode(Box::new(e))))?;
        let schedule_params = serde_json::from_str(&r.task_schedule_params)
            .map_err(|e| RepoError::Database(sqlx::Error::Decode(Box::new(e))))?;

        let task = Task {
            id: r.task_id,
            name: r.task_name,
            task_type: r
                .task_type
                .parse::<crate::model::TaskType>()
                .map_err(|e| RepoError::Database(sqlx::Error::Decode(e.into())))?,
            cron_expr: r.task_cron_expr,
            invocation,
            retry_config,
            max_execution_seconds: r.task_max_execution_seconds,
            schedule_node_id: r.task_schedule_node_id,
            schedule_params,
            next_time: 0,
            status: crate::model::TaskStatus::Active,
            version: r.task_version,
            ctime: 0,
            utime: 0,
        };

        Ok(TaskExecution {
            id: r.id,
            task,
            executor_node_id: r.executor_node_id,
            deadline: r.deadline,
            start_time: r.start_time,
            end_time: r.end_time,
            retry_count: r.retry_count,
            next_retry_time: r.next_retry_time,
            running_progress: r.running_progress,
            status: r
                .status
                .parse::<ExecutionStatus>()
                .map_err(|e| RepoError::Database(sqlx::Error::Decode(e.into())))?,
            ctime: r.ctime,
            utime: r.utime,
        })
    }
}

/// Denormalized task snapshot plus the parent task's type, needed because
/// `task_executions` doesn't carry `task_type`/`status`/`ctime`/`next_time`
/// (they're irrelevant after the snapshot is taken; see spec.md §3).
pub struct NewExecution {
    pub task: Task,
}

#[async_trait]
pub trait ExecutionRepo: Send + Sync {
    async fn create(&self, new: NewExecution) -> Result<TaskExecution, RepoError>;

    async fn set_running_state(
        &self,
        id: i64,
        progress: i32,
        executor_node_id: &str,
        max_execution_seconds: i64,
    ) -> Result<(), RepoError>;

    async fn update_progress(&self, id: i64, progress: i32) -> Result<(), RepoError>;

    #[allow(clippy::too_many_arguments)]
    async fn update_schedule_result(
        &self,
        id: i64,
        status: ExecutionStatus,
        progress: i32,
        end_time: i64,
        schedule_params: Option<HashMap<String, String>>,
        executor_node_id: &str,
    ) -> Result<(), RepoError>;

    #[allow(clippy::too_many_arguments)]
    async fn update_retry_result(
        &self,
        id: i64,
        retry_count: i64,
        next_retry_time: i64,
        status: ExecutionStatus,
        progress: i32,
        end_time: i64,
        schedule_params: Option<HashMap<String, String>>,
        executor_node_id: &str,
    ) -> Result<(), RepoError>;

    async fn find_retryable_executions(&self, limit: i64) -> Result<Vec<TaskExecution>, RepoError>;

    async fn find_reschedulable_executions(
        &self,
        limit: i64,
    ) -> Result<Vec<TaskExecution>, RepoError>;

    async fn find_timeout_executions(&self, limit: i64) -> Result<Vec<TaskExecution>, RepoError>;

    async fn get_by_id(&self, id: i64) -> Result<Option<TaskExecution>, RepoError>;

    async fn find_by_task_id(&self, task_id: i64) -> Result<Vec<TaskExecution>, RepoError>;
}

pub struct DbExecutionRepo<DB: Database> {
    db_pool: Arc<Pool<DB>>,
}

impl<DB: Database> DbExecutionRepo<DB> {
    pub fn new(db_pool: Arc<Pool<DB>>) -> Self {
        Self { db_pool }
    }
}

const EXECUTION_COLUMNS: &str = r#"id, task_id, task_name, task_version, task_type, task_cron_expr,
    task_invocation, task_retry_config, task_max_execution_seconds, task_schedule_node_id,
    task_schedule_params, executor_node_id, deadline, start_time, end_time, retry_count,
    next_retry_time, running_progress, status, ctime, utime"#;

fn invocation_json(invocation: &InvocationConfig) -> String {
    serde_json::to_string(invocation).expect("InvocationConfig always serializes")
}

#[async_trait]
impl ExecutionRepo for DbExecutionRepo<sqlx::Sqlite> {
    async fn create(&self, new: NewExecution) -> Result<TaskExecution, RepoError> {
        let now = Utc::now().timestamp_millis();
        let deadline = now + new.task.max_execution_seconds * 1000;
        let invocation = invocation_json(&new.task.invocation);
        let retry_config = serde_json::to_string(&new.task.retry_config).unwrap();
        let schedule_params = serde_json::to_string(&new.task.schedule_params).unwrap();

        let query = format!(
            r#"
            INSERT INTO task_executions
              (task_id, task_name, task_version, task_type, task_cron_expr, task_invocation,
               task_retry_config, task_max_execution_seconds, task_schedule_node_id,
               task_schedule_params, deadline, start_time, status, ctime, utime)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15)
            RETURNING {EXECUTION_COLUMNS}
            "#
        );

        let record = sqlx::query_as::<_, ExecutionRecord>(&query)
            .bind(new.task.id)
            .bind(&new.task.name)
            .bind(new.task.version)
            .bind(new.task.task_type.as_str())
            .bind(&new.task.cron_expr)
            .bind(invocation)
            .bind(retry_config)
            .bind(new.task.max_execution_seconds)
            .bind(&new.task.schedule_node_id)
            .bind(schedule_params)
            .bind(deadline)
            .bind(now)
            .bind(ExecutionStatus::Prepare.as_str())
            .bind(now)
            .bind(now)
            .fetch_one(self.db_pool.deref())
            .await?;

        record.try_into()
    }

    async fn set_running_state(
        &self,
        id: i64,
        progress: i32,
        executor_node_id: &str,
        max_execution_seconds: i64,
    ) -> Result<(), RepoError> {
        let now = Utc::now().timestamp_millis();
        let deadline = now + max_execution_seconds * 1000;
        let result = sqlx::query(
            r#"
            UPDATE task_executions
            SET status = 'RUNNING', running_progress = ?1, executor_node_id = ?2,
                start_time = ?3, deadline = ?4, utime = ?5
            WHERE id = ?6 AND status IN ('PREPARE', 'FAILED_RETRYABLE', 'FAILED_RESCHEDULED')
            "#,
        )
        .bind(progress)
        .bind(executor_node_id)
        .bind(now)
        .bind(deadline)
        .bind(now)
        .bind(id)
        .execute(self.db_pool.deref())
        .await?;

        if result.rows_affected() == 0 {
            return Err(RepoError::SetRunningStateFailed(id));
        }
        Ok(())
    }

    async fn update_progress(&self, id: i64, progress: i32) -> Result<(), RepoError> {
        let now = Utc::now().timestamp_millis();
        sqlx::query(
            "UPDATE task_executions SET running_progress = ?1, utime = ?2 WHERE id = ?3 AND status = 'RUNNING'",
        )
        .bind(progress)
        .bind(now)
        .bind(id)
        .execute(self.db_pool.deref())
        .await?;
        Ok(())
    }

    async fn update_schedule_result(
        &self,
        id: i64,
        status: ExecutionStatus,
        progress: i32,
        end_time: i64,
        schedule_params: Option<HashMap<String, String>>,
        executor_node_id: &str,
    ) -> Result<(), RepoError> {
        let now = Utc::now().timestamp_millis();
        match schedule_params {
            Some(params) => {
                let params_json = serde_json::to_string(&params).unwrap();
                sqlx::query(
                    r#"
                    UPDATE task_executions
                    SET status = ?1, running_progress = ?2, end_time = ?3,
                        task_schedule_params = ?4, executor_node_id = ?5, utime = ?6
                    WHERE id = ?7
                    "#,
                )
                .bind(status.as_str())
                .bind(progress)
                .bind(end_time)
                .bind(params_json)
                .bind(executor_node_id)
                .bind(now)
                .bind(id)
                .execute(self.db_pool.deref())
                .await?;
            }
            None => {
                sqlx::query(
                    r#"
                    UPDATE task_executions
                    SET status = ?1, running_progress = ?2, end_time = ?3,
                        executor_node_id = ?4, utime = ?5
                    WHERE id = ?6
                    "#,
                )
                .bind(status.as_str())
                .bind(progress)
                .bind(end_time)
                .bind(executor_node_id)
                .bind(now)
                .bind(id)
                .execute(self.db_pool.deref())
                .await?;
            }
        }
        Ok(())
    }

    async fn update_retry_result(
        &self,
        id: i64,
        retry_count: i64,
        next_retry_time: i64,
        status: ExecutionStatus,
        progress: i32,
        end_time: i64,
        schedule_params: Option<HashMap<String, String>>,
        executor_node_id: &str,
    ) -> Result<(), RepoError> {
        let now = Utc::now().timestamp_millis();
        match schedule_params {
            Some(params) => {
                let params_json = serde_json::to_string(&params).unwrap();
                sqlx::query(
                    r#"
                    UPDATE task_executions
                    SET status = ?1, retry_count = ?2, next_retry_time = ?3,
                        running_progress = ?4, end_time = ?5, task_schedule_params = ?6,
                        executor_node_id = ?7, utime = ?8
                    WHERE id = ?9
                    "#,
                )
                .bind(status.as_str())
                .bind(retry_count)
                .bind(next_retry_time)
                .bind(progress)
                .bind(end_time)
                .bind(params_json)
                .bind(executor_node_id)
                .bind(now)
                .bind(id)
                .execute(self.db_pool.deref())
                .await?;
            }
            None => {
                sqlx::query(
                    r#"
                    UPDATE task_executions
                    SET status = ?1, retry_count = ?2, next_retry_time = ?3,
                        running_progress = ?4, end_time = ?5, executor_node_id = ?6, utime = ?7
                    WHERE id = ?8
                    "#,
                )
                .bind(status.as_str())
                .bind(retry_count)
                .bind(next_retry_time)
                .bind(progress)
                .bind(end_time)
                .bind(executor_node_id)
                .bind(now)
                .bind(id)
                .execute(self.db_pool.deref())
                .await?;
            }
        }
        Ok(())
    }

    async fn find_retryable_executions(&self, limit: i64) -> Result<Vec<TaskExecution>, RepoError> {
        let now = Utc::now().timestamp_millis();
        let query = format!(
            r#"SELECT {EXECUTION_COLUMNS} FROM task_executions
               WHERE status = 'FAILED_RETRYABLE' AND next_retry_time <= ?1
               ORDER BY next_retry_time ASC LIMIT ?2"#
        );
        let records = sqlx::query_as::<_, ExecutionRecord>(&query)
            .bind(now)
            .bind(limit)
            .fetch_all(self.db_pool.deref())
            .await?;
        records.into_iter().map(TaskExecution::try_from).collect()
    }

    async fn find_reschedulable_executions(
        &self,
        limit: i64,
    ) -> Result<Vec<TaskExecution>, RepoError> {
        let query = format!(
            r#"SELECT {EXECUTION_COLUMNS} FROM task_executions
               WHERE status = 'FAILED_RESCHEDULED'
               ORDER BY utime ASC LIMIT ?1"#
        );
        let records = sqlx::query_as::<_, ExecutionRecord>(&query)
            .bind(limit)
            .fetch_all(self.db_pool.deref())
            .await?;
        records.into_iter().map(TaskExecution::try_from).collect()
    }

    async fn find_timeout_executions(&self, limit: i64) -> Result<Vec<TaskExecution>, RepoError> {
        let now = Utc::now().timestamp_millis();
        let query = format!(
            r#"SELECT {EXECUTION_COLUMNS} FROM task_executions
               WHERE status = 'RUNNING' AND deadline <= ?1
               ORDER BY deadline ASC LIMIT ?2"#
        );
        let records = sqlx::query_as::<_, ExecutionRecord>(&query)
            .bind(now)
            .bind(limit)
            .fetch_all(self.db_pool.deref())
            .await?;
        records.into_iter().map(TaskExecution::try_from).collect()
    }

    async fn get_by_id(&self, id: i64) -> Result<Option<TaskExecution>, RepoError> {
        let query = format!("SELECT {EXECUTION_COLUMNS} FROM task_executions WHERE id = ?1");
        let record = sqlx::query_as::<_, ExecutionRecord>(&query)
            .bind(id)
            .fetch_optional(self.db_pool.deref())
            .await?;
        record.map(TaskExecution::try_from).transpose()
    }

    async fn find_by_task_id(&self, task_id: i64) -> Result<Vec<TaskExecution>, RepoError> {
        let query =
            format!("SELECT {EXECUTION_COLUMNS} FROM task_executions WHERE task_id = ?1 ORDER BY id DESC");
        let records = sqlx::query_as::<_, ExecutionRecord>(&query)
            .bind(task_id)
            .fetch_all(self.db_pool.deref())
            .await?;
        records.into_iter().map(TaskExecution::try_from).collect()
    }
}

#[async_trait]
impl ExecutionRepo for DbExecutionRepo<sqlx::Postgres> {
    async fn create(&self, new: NewExecution) -> Result<TaskExecution, RepoError> {
        let now = Utc::now().timestamp_millis();
        let deadline = now + new.task.max_execution_seconds * 1000;
        let invocation = invocation_json(&new.task.invocation);
        let retry_config = serde_json::to_string(&new.task.retry_config).unwrap();
        let schedule_params = serde_json::to_string(&new.task.schedule_params).unwrap();

        let query = format!(
            r#"
            INSERT INTO task_executions
              (task_id, task_name, task_version, task_type, task_cron_expr, task_invocation,
               task_retry_config, task_max_execution_seconds, task_schedule_node_id,
               task_schedule_params, deadline, start_time, status, ctime, utime)
            VALUES ($1, $2, $3, $4, $5, $6::jsonb, $7::jsonb, $8, $9, $10::jsonb, $11, $12, $13, $14, $15)
            RETURNING id, task_id, task_name, task_version, task_type, task_cron_expr,
                      task_invocation::text AS task_invocation,
                      task_retry_config::text AS task_retry_config,
                      task_max_execution_seconds, task_schedule_node_id,
                      task_schedule_params::text AS task_schedule_params,
                      executor_node_id, deadline, start_time, end_time, retry_count,
                      next_retry_time, running_progress, status, ctime, utime
            "#
        );

        let record = sqlx::query_as::<_, ExecutionRecord>(&query)
            .bind(new.task.id)
            .bind(&new.task.name)
            .bind(new.task.version)
            .bind(new.task.task_type.as_str())
            .bind(&new.task.cron_expr)
            .bind(invocation)
            .bind(retry_config)
            .bind(new.task.max_execution_seconds)
            .bind(&new.task.schedule_node_id)
            .bind(schedule_params)
            .bind(deadline)
            .bind(now)
            .bind(ExecutionStatus::Prepare.as_str())
            .bind(now)
            .bind(now)
            .fetch_one(self.db_pool.deref())
            .await?;

        record.try_into()
    }

    async fn set_running_state(
        &self,
        id: i64,
        progress: i32,
        executor_node_id: &str,
        max_execution_seconds: i64,
    ) -> Result<(), RepoError> {
        let now = Utc::now().timestamp_millis();
        let deadline = now + max_execution_seconds * 1000;
        let result = sqlx::query(
            r#"
            UPDATE task_executions
            SET status = 'RUNNING', running_progress = $1, executor_node_id = $2,
                start_time = $3, deadline = $4, utime = $5
            WHERE id = $6 AND status IN ('PREPARE', 'FAILED_RETRYABLE', 'FAILED_RESCHEDULED')
            "#,
        )
        .bind(progress)
        .bind(executor_node_id)
        .bind(now)
        .bind(deadline)
        .bind(now)
        .bind(id)
        .execute(self.db_pool.deref())
        .await?;

        if result.rows_affected() == 0 {
            return Err(RepoError::SetRunningStateFailed(id));
        }
        Ok(())
    }

    async fn update_progress(&self, id: i64, progress: i32) -> Result<(), RepoError> {
        let now = Utc::now().timestamp_millis();
        sqlx::query(
            "UPDATE task_executions SET running_progress = $1, utime = $2 WHERE id = $3 AND status = 'RUNNING'",
        )
        .bind(progress)
        .bind(now)
        .bind(id)
        .execute(self.db_pool.deref())
        .await?;
        Ok(())
    }

    async fn update_schedule_result(
        &self,
        id: i64,
        status: ExecutionStatus,
        progress: i32,
        end_time: i64,
        schedule_params: Option<HashMap<String, String>>,
        executor_node_id: &str,
    ) -> Result<(), RepoError> {
        let now = Utc::now().timestamp_millis();
        match schedule_params {
            Some(params) => {
                let params_json = serde_json::to_string(&params).unwrap();
                sqlx::query(
                    r#"
                    UPDATE task_executions
                    SET status = $1, running_progress = $2, end_time = $3,
                        task_schedule_params = $4::jsonb, executor_node_id = $5, utime = $6
                    WHERE id = $7
                    "#,
                )
                .bind(status.as_str())
                .bind(progress)
                .bind(end_time)
                .bind(params_json)
                .bind(executor_node_id)
                .bind(now)
                .bind(id)
                .execute(self.db_pool.deref())
                .await?;
            }
            None => {
                sqlx::query(
                    r#"
                    UPDATE task_executions
                    SET status = $1, running_progress = $2, end_time = $3,
                        executor_node_id = $4, utime = $5
                    WHERE id = $6
                    "#,
                )
                .bind(status.as_str())
                .bind(progress)
                .bind(end_time)
                .bind(executor_node_id)
                .bind(now)
                .bind(id)
                .execute(self.db_pool.deref())
                .await?;
            }
        }
        Ok(())
    }

    async fn update_retry_result(
        &self,
        id: i64,
        retry_count: i64,
        next_retry_time: i64,
        status: ExecutionStatus,
        progress: i32,
        end_time: i64,
        schedule_params: Option<HashMap<String, String>>,
        executor_node_id: &str,
    ) -> Result<(), RepoError> {
        let now = Utc::now().timestamp_millis();
        match schedule_params {
            Some(params) => {
                let params_json = serde_json::to_string(&params).unwrap();
                sqlx::query(
                    r#"
                    UPDATE task_executions
                    SET status = $1, retry_count = $2, next_retry_time = $3,
                        running_progress = $4, end_time = $5, task_schedule_params = $6::jsonb,
                        executor_node_id = $7, utime = $8
                    WHERE id = $9
                    "#,
                )
                .bind(status.as_str())
                .bind(retry_count)
                .bind(next_retry_time)
                .bind(progress)
                .bind(end_time)
                .bind(params_json)
                .bind(executor_node_id)
                .bind(now)
                .bind(id)
                .execute(self.db_pool.deref())
                .await?;
            }
            None => {
                sqlx::query(
                    r#"
                    UPDATE task_executions
                    SET status = $1, retry_count = $2, next_retry_time = $3,
                        running_progress = $4, end_time = $5, executor_node_id = $6, utime = $7
                    WHERE id = $8
                    "#,
                )
                .bind(status.as_str())
                .bind(retry_count)
                .bind(next_retry_time)
                .bind(progress)
                .bind(end_time)
                .bind(executor_node_id)
                .bind(now)
                .bind(id)
                .execute(self.db_pool.deref())
                .await?;
            }
        }
        Ok(())
    }

    async fn find_retryable_executions(&self, limit: i64) -> Result<Vec<TaskExecution>, RepoError> {
        let now = Utc::now().timestamp_millis();
        let records = sqlx::query_as::<_, ExecutionRecord>(
            r#"SELECT id, task_id, task_name, task_version, task_type, task_cron_expr,
                      task_invocation::text AS task_invocation,
                      task_retry_config::text AS task_retry_config,
                      task_max_execution_seconds, task_schedule_node_id,
                      task_schedule_params::text AS task_schedule_params,
                      executor_node_id, deadline, start_time, end_time, retry_count,
                      next_retry_time, running_progress, status, ctime, utime
               FROM task_executions
               WHERE status = 'FAILED_RETRYABLE' AND next_retry_time <= $1
               ORDER BY next_retry_time ASC LIMIT $2"#,
        )
        .bind(now)
        .bind(limit)
        .fetch_all(self.db_pool.deref())
        .await?;
        records.into_iter().map(TaskExecution::try_from).collect()
    }

    async fn find_reschedulable_executions(
        &self,
        limit: i64,
    ) -> Result<Vec<TaskExecution>, RepoError> {
        let records = sqlx::query_as::<_, ExecutionRecord>(
            r#"SELECT id, task_id, task_name, task_version, task_type, task_cron_expr,
                      task_invocation::text AS task_invocation,
                      task_retry_config::text AS task_retry_config,
                      task_max_execution_seconds, task_schedule_node_id,
                      task_schedule_params::text AS task_schedule_params,
                      executor_node_id, deadline, start_time, end_time, retry_count,
                      next_retry_time, running_progress, status, ctime, utime
               FROM task_executions
               WHERE status = 'FAILED_RESCHEDULED'
               ORDER BY utime ASC LIMIT $1"#,
        )
        .bind(limit)
        .fetch_all(self.db_pool.deref())
        .await?;
        records.into_iter().map(TaskExecution::try_from).collect()
    }

    async fn find_timeout_executions(&self, limit: i64) -> Result<Vec<TaskExecution>, RepoError> {
        let now = Utc::now().timestamp_millis();
        let records = sqlx::query_as::<_, ExecutionRecord>(
            r#"SELECT id, task_id, task_name, task_version, task_type, task_cron_expr,
                      task_invocation::text AS task_invocation,
                      task_retry_config::text AS task_retry_config,
                      task_max_execution_seconds, task_schedule_node_id,
                      task_schedule_params::text AS task_schedule_params,
                      executor_node_id, deadline, start_time, end_time, retry_count,
                      next_retry_time, running_progress, status, ctime, utime
               FROM task_executions
               WHERE status = 'RUNNING' AND deadline <= $1
               ORDER BY deadline ASC LIMIT $2"#,
        )
        .bind(now)
        .bind(limit)
        .fetch_all(self.db_pool.deref())
        .await?;
        records.into_iter().map(TaskExecution::try_from).collect()
    }

    async fn get_by_id(&self, id: i64) -> Result<Option<TaskExecution>, RepoError> {
        let record = sqlx::query_as::<_, ExecutionRecord>(
            r#"SELECT id, task_id, task_name, task_version, task_type, task_cron_expr,
                      task_invocation::text AS task_invocation,
                      task_retry_config::text AS task_retry_config,
                      task_max_execution_seconds, task_schedule_node_id,
                      task_schedule_params::text AS task_schedule_params,
                      executor_node_id, deadline, start_time, end_time, retry_count,
                      next_retry_time, running_progress, status, ctime, utime
               FROM task_executions WHERE id = $1"#,
        )
        .bind(id)
        .fetch_optional(self.db_pool.deref())
        .await?;
        record.map(TaskExecution::try_from).transpose()
    }

    async fn find_by_task_id(&self, task_id: i64) -> Result<Vec<TaskExecution>, RepoError> {
        let records = sqlx::query_as::<_, ExecutionRecord>(
            r#"SELECT id, task_id, task_name, task_version, task_type, task_cron_expr,
                      task_invocation::text AS task_invocation,
                      task_retry_config::text AS task_retry_config,
                      task_max_execution_seconds, task_schedule_node_id,
                      task_schedule_params::text AS task_schedule_params,
                      executor_node_id, deadline, start_time, end_time, retry_count,
                      next_retry_time, running_progress, status, ctime, utime
               FROM task_executions WHERE task_id = $1 ORDER BY id DESC"#,
        )
        .bind(task_id)
        .fetch_all(self.db_pool.deref())
        .await?;
        records.into_iter().map(TaskExecution::try_from).collect()
    }
}

/// Unwraps the (invocation, http config) carried on a denormalized
/// execution's task snapshot for the HTTP invoker's URL lookup.
pub fn http_config(task: &Task) -> Option<&HttpConfig> {
    match &task.invocation {
        InvocationConfig::Http(cfg) => Some(cfg),
        _ => None,
    }
}

/// Same for gRPC.
pub fn grpc_config(task: &Task) -> Option<&GrpcConfig> {
    match &task.invocation {
        InvocationConfig::Grpc(cfg) => Some(cfg),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{GrpcConfig, RetryConfig, TaskStatus, TaskType};
    use chrono::Utc;

    fn sample_task() -> Task {
        let now = Utc::now().timestamp_millis();
        Task {
            id: 7,
            name: "demo".to_string(),
            task_type: TaskType::Recurring,
            cron_expr: "* * * * * *".to_string(),
            invocation: InvocationConfig::Grpc(GrpcConfig {
                service_name: "demo".to_string(),
                params: Default::default(),
            }),
            retry_config: RetryConfig {
                max_retries: 3,
                initial_interval_ms: 100,
                max_interval_ms: 1000,
            },
            max_execution_seconds: 60,
            schedule_node_id: Some("node-a".to_string()),
            schedule_params: Default::default(),
            next_time: now,
            status: TaskStatus::Preempted,
            version: 1,
            ctime: now,
            utime: now,
        }
    }

    async fn repo() -> (Arc<Pool<sqlx::Sqlite>>, DbExecutionRepo<sqlx::Sqlite>) {
        let pool = Arc::new(crate::db::create_test_sqlite_pool().await.unwrap());
        let repo = DbExecutionRepo::new(pool.clone());
        (pool, repo)
    }

    #[tokio::test]
    async fn create_stamps_prepare_and_deadline() {
        let (_pool, repo) = repo().await;
        let execution = repo.create(NewExecution { task: sample_task() }).await.unwrap();

        assert_eq!(execution.status, ExecutionStatus::Prepare);
        assert!(execution.deadline > Utc::now().timestamp_millis());
        assert_eq!(execution.task.id, 7);
        assert_eq!(execution.task.schedule_node_id.as_deref(), Some("node-a"));
    }

    #[tokio::test]
    async fn set_running_state_rejected_when_already_terminal() {
        let (_pool, repo) = repo().await;
        let execution = repo.create(NewExecution { task: sample_task() }).await.unwrap();

        repo.update_schedule_result(execution.id, ExecutionStatus::Success, 100, 0, None, "worker-1")
            .await
            .unwrap();

        let result = repo
            .set_running_state(execution.id, 0, "worker-2", 60)
            .await;
        assert!(matches!(result, Err(RepoError::SetRunningStateFailed(_))));
    }

    #[tokio::test]
    async fn set_running_state_resets_deadline_and_records_executor() {
        let (_pool, repo) = repo().await;
        let execution = repo.create(NewExecution { task: sample_task() }).await.unwrap();
        let original_deadline = execution.deadline;

        tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        repo.set_running_state(execution.id, 0, "worker-1", 60)
            .await
            .unwrap();

        let reloaded = repo.get_by_id(execution.id).await.unwrap().unwrap();
        assert_eq!(reloaded.status, ExecutionStatus::Running);
        assert_eq!(reloaded.executor_node_id.as_deref(), Some("worker-1"));
        assert!(reloaded.deadline >= original_deadline);
    }

    #[tokio::test]
    async fn update_progress_is_a_noop_unless_running() {
        let (_pool, repo) = repo().await;
        let execution = repo.create(NewExecution { task: sample_task() }).await.unwrap();

        // Still PREPARE: the WHERE status = 'RUNNING' guard affects zero rows.
        repo.update_progress(execution.id, 42).await.unwrap();
        let reloaded = repo.get_by_id(execution.id).await.unwrap().unwrap();
        assert_eq!(reloaded.running_progress, 0);

        repo.set_running_state(execution.id, 0, "worker-1", 60)
            .await
            .unwrap();
        repo.update_progress(execution.id, 42).await.unwrap();
        let reloaded = repo.get_by_id(execution.id).await.unwrap().unwrap();
        assert_eq!(reloaded.running_progress, 42);
    }

    #[tokio::test]
    async fn update_schedule_result_merges_schedule_params_when_present() {
        let (_pool, repo) = repo().await;
        let execution = repo.create(NewExecution { task: sample_task() }).await.unwrap();

        let mut params = HashMap::new();
        params.insert("cursor".to_string(), "page-2".to_string());
        repo.update_schedule_result(
            execution.id,
            ExecutionStatus::FailedRescheduled,
            10,
            0,
            Some(params),
            "worker-1",
        )
        .await
        .unwrap();

        let reloaded = repo.get_by_id(execution.id).await.unwrap().unwrap();
        assert_eq!(reloaded.status, ExecutionStatus::FailedRescheduled);
        assert_eq!(
            reloaded.task.schedule_params.get("cursor").map(String::as_str),
            Some("page-2")
        );
    }

    #[tokio::test]
    async fn update_retry_result_bumps_retry_count_and_next_retry_time() {
        let (_pool, repo) = repo().await;
        let execution = repo.create(NewExecution { task: sample_task() }).await.unwrap();
        let next_retry_time = Utc::now().timestamp_millis() + 500;

        repo.update_retry_result(
            execution.id,
            1,
            next_retry_time,
            ExecutionStatus::FailedRetryable,
            20,
            0,
            None,
            "worker-1",
        )
        .await
        .unwrap();

        let reloaded = repo.get_by_id(execution.id).await.unwrap().unwrap();
        assert_eq!(reloaded.retry_count, 1);
        assert_eq!(reloaded.next_retry_time, next_retry_time);
        assert_eq!(reloaded.status, ExecutionStatus::FailedRetryable);
    }

    #[tokio::test]
    async fn find_queries_respect_status_and_time_filters() {
        let (_pool, repo) = repo().await;
        let due = repo.create(NewExecution { task: sample_task() }).await.unwrap();
        let not_yet_due = repo.create(NewExecution { task: sample_task() }).await.unwrap();
        let reschedulable = repo.create(NewExecution { task: sample_task() }).await.unwrap();
        let timed_out = repo.create(NewExecution { task: sample_task() }).await.unwrap();

        let now = Utc::now().timestamp_millis();
        repo.update_retry_result(
            due.id,
            1,
            now - 1000,
            ExecutionStatus::FailedRetryable,
            0,
            0,
            None,
            "",
        )
        .await
        .unwrap();
        repo.update_retry_result(
            not_yet_due.id,
            1,
            now + 60_000,
            ExecutionStatus::FailedRetryable,
            0,
            0,
            None,
            "",
        )
        .await
        .unwrap();
        repo.update_schedule_result(
            reschedulable.id,
            ExecutionStatus::FailedRescheduled,
            0,
            0,
            None,
            "",
        )
        .await
        .unwrap();
        repo.set_running_state(timed_out.id, 0, "worker-1", -10)
            .await
            .unwrap();

        let retryable = repo.find_retryable_executions(10).await.unwrap();
        assert_eq!(retryable.iter().map(|e| e.id).collect::<Vec<_>>(), vec![due.id]);

        let reschedulables = repo.find_reschedulable_executions(10).await.unwrap();
        assert_eq!(
            reschedulables.iter().map(|e| e.id).collect::<Vec<_>>(),
            vec![reschedulable.id]
        );

        let timeouts = repo.find_timeout_executions(10).await.unwrap();
        assert_eq!(timeouts.iter().map(|e| e.id).collect::<Vec<_>>(), vec![timed_out.id]);

        let by_task = repo.find_by_task_id(7).await.unwrap();
        assert_eq!(by_task.len(), 4);
    }
}
