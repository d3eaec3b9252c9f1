//! `schedulable_tasks`/`update_next_time` and the completion-consumer's
//! `next_time` recomputation (spec.md §4.11 step 3). Thin orchestration
//! above `TaskRepo`; task CRUD itself is out of scope (spec.md §1).

use std::sync::Arc;

use tracing::debug;

use crate::errors::{RepoError, SchedulerError};
use crate::model::{Task, TaskStatus};
use crate::repo::TaskRepo;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NextTimeOutcome {
    Rescheduled,
    WentInactive,
}

pub struct TaskService {
    task_repo: Arc<dyn TaskRepo>,
}

impl TaskService {
    pub fn new(task_repo: Arc<dyn TaskRepo>) -> Self {
        Self { task_repo }
    }

    pub async fn schedulable_tasks(
        &self,
        preempted_timeout_ms: i64,
        limit: i64,
    ) -> Result<Vec<Task>, RepoError> {
        self.task_repo
            .schedulable_tasks(preempted_timeout_ms, limit)
            .await
    }

    /// `ONE_TIME` tasks never re-compute their cron (spec.md §3 Kind,
    /// glossary): a one-shot task's stored `next_time` is by construction
    /// already in the past once it has run (that's why it was schedulable),
    /// so completion always retires it to `INACTIVE` rather than looping it
    /// back onto the schedulable query (spec.md §4.11 step 3). `RECURRING`
    /// tasks recompute `next_time` from cron and persist it via CAS; if the
    /// cron expression yields no further occurrence, the task also retires
    /// to `INACTIVE`. Returns whether the task went `INACTIVE`, which tells
    /// the completion consumer whether to still release the preemption
    /// (spec.md §4.11 step 4: the `ONE_TIME` → `INACTIVE` path skips
    /// release).
    pub async fn update_next_time(&self, task_id: i64) -> Result<NextTimeOutcome, SchedulerError> {
        let Some(task) = self.task_repo.get_by_id(task_id).await? else {
            debug!(task_id, "update_next_time: task no longer exists");
            return Ok(NextTimeOutcome::Rescheduled);
        };

        if task.task_type.is_one_time() {
            self.task_repo.update_status(task.id, TaskStatus::Inactive).await?;
            return Ok(NextTimeOutcome::WentInactive);
        }

        let next_time = task
            .calculate_next_time()
            .map_err(SchedulerError::InvalidCronExpr)?;

        match next_time {
            Some(next_time) => {
                self.task_repo
                    .update_next_time(task.id, task.version, next_time)
                    .await?;
                Ok(NextTimeOutcome::Rescheduled)
            }
            None => {
                self.task_repo.update_status(task.id, TaskStatus::Inactive).await?;
                Ok(NextTimeOutcome::WentInactive)
            }
        }
    }
}

fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{GrpcConfig, InvocationConfig, RetryConfig, TaskType};
    use crate::repo::task::seed_task;
    use crate::repo::DbTaskRepo;
    use std::collections::HashMap;

    fn sample_task(name: &str, task_type: TaskType, cron_expr: &str) -> Task {
        let now = now_ms();
        Task {
            id: 0,
            name: name.to_string(),
            task_type,
            cron_expr: cron_expr.to_string(),
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
            next_time: now,
            status: TaskStatus::Active,
            version: 0,
            ctime: now,
            utime: now,
        }
    }

    #[tokio::test]
    async fn recurring_task_next_time_advances() {
        let pool = Arc::new(crate::db::create_test_sqlite_pool().await.unwrap());
        let repo: Arc<dyn TaskRepo> = Arc::new(DbTaskRepo::new(pool.clone()));
        let task = sample_task("heartbeat", TaskType::Recurring, "* * * * * *");
        let id = seed_task(&pool, &task).await.unwrap();

        let service = TaskService::new(repo.clone());
        let outcome = service.update_next_time(id).await.unwrap();
        assert_eq!(outcome, NextTimeOutcome::Rescheduled);

        let reloaded = repo.get_by_id(id).await.unwrap().unwrap();
        assert!(reloaded.next_time > task.next_time);
        assert_eq!(reloaded.status, TaskStatus::Active);
    }

    #[tokio::test]
    async fn one_time_task_past_due_goes_inactive() {
        let pool = Arc::new(crate::db::create_test_sqlite_pool().await.unwrap());
        let repo: Arc<dyn TaskRepo> = Arc::new(DbTaskRepo::new(pool.clone()));
        // A one-shot cron that never fires again maps to `None`, which is
        // treated the same as an already-past computed fire time.
        let task = sample_task("onboarding-email", TaskType::OneTime, "0 0 0 29 2 ? 2000");
        let id = seed_task(&pool, &task).await.unwrap();

        let service = TaskService::new(repo.clone());
        let outcome = service.update_next_time(id).await.unwrap();
        assert_eq!(outcome, NextTimeOutcome::WentInactive);

        let reloaded = repo.get_by_id(id).await.unwrap().unwrap();
        assert_eq!(reloaded.status, TaskStatus::Inactive);
    }
}
