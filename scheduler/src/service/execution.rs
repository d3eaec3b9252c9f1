//! The execution state machine's single authority (spec.md §4.3). Every
//! transition is driven through `update_state`; the durable-queue hop for
//! terminal outcomes makes the completion consumer the single writer of
//! `SUCCESS`/`FAILED`, closing the double-write race called out in
//! spec.md §9.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::Utc;
use tracing::debug;

use crate::errors::ExecutionServiceError;
use crate::event::CompletionQueue;
use crate::metrics::Metrics;
use crate::model::{CompletionEvent, ExecutionState, ExecutionStatus, TaskExecution};
use crate::repo::ExecutionRepo;

pub struct ExecutionService {
    execution_repo: Arc<dyn ExecutionRepo>,
    completion_queue: Arc<dyn CompletionQueue>,
    metrics: Arc<Metrics>,
}

impl ExecutionService {
    pub fn new(
        execution_repo: Arc<dyn ExecutionRepo>,
        completion_queue: Arc<dyn CompletionQueue>,
        metrics: Arc<Metrics>,
    ) -> Self {
        Self {
            execution_repo,
            completion_queue,
            metrics,
        }
    }

    /// Fans a batch of reports out to `update_state` one at a time,
    /// collecting per-item errors without aborting the batch — a
    /// `BatchReport` RPC call must not let one malformed report sink the
    /// rest (SPEC_FULL.md §4.3 supplement).
    pub async fn handle_reports(&self, reports: Vec<ExecutionState>) {
        for report in reports {
            if let Err(e) = self.update_state(report.clone()).await {
                debug!(exec_id = report.id, error = %e, "report rejected");
            }
        }
    }

    pub async fn update_state(
        &self,
        reported: ExecutionState,
    ) -> Result<(), ExecutionServiceError> {
        let Some(current) = self.execution_repo.get_by_id(reported.id).await? else {
            return Err(ExecutionServiceError::Repo(crate::errors::RepoError::ExecutionNotFound(
                reported.id,
            )));
        };

        // Duplicate-report defence: a terminal row's outcome is frozen.
        if current.status.is_terminal() {
            return Err(ExecutionServiceError::InvalidTaskExecutionStatus);
        }

        if let Some(status) = reported.status {
            self.metrics
                .execution_transitions
                .with_label_values(&[status.as_str()])
                .inc();
        }

        match reported.status {
            Some(ExecutionStatus::Running) => self.handle_running(&current, &reported).await,
            Some(ExecutionStatus::FailedRetryable) => {
                match self.handle_failed_retryable(&current, &reported).await {
                    Err(ExecutionServiceError::MaxRetriesExceeded) => {
                        self.publish_completion(&current, ExecutionStatus::Failed).await;
                        Ok(())
                    }
                    other => other,
                }
            }
            Some(ExecutionStatus::FailedRescheduled) => {
                self.handle_failed_rescheduled(&current, &reported).await
            }
            Some(status @ (ExecutionStatus::Success | ExecutionStatus::Failed)) => {
                self.handle_terminal(&current, status).await
            }
            other => {
                debug!(exec_id = reported.id, ?other, "ignoring unreportable status");
                Ok(())
            }
        }
    }

    async fn handle_running(
        &self,
        current: &TaskExecution,
        reported: &ExecutionState,
    ) -> Result<(), ExecutionServiceError> {
        let progress = reported.running_progress.clamp(0, 100);
        if current.status.is_running() {
            // Progress is best-effort and monotonic only by convention; a
            // lower value is accepted as-is (spec.md §9).
            self.execution_repo.update_progress(current.id, progress).await?;
        } else {
            self.execution_repo
                .set_running_state(
                    current.id,
                    progress,
                    &reported.executor_node_id,
                    current.task.max_execution_seconds,
                )
                .await?;
        }
        Ok(())
    }

    async fn handle_failed_retryable(
        &self,
        current: &TaskExecution,
        reported: &ExecutionState,
    ) -> Result<(), ExecutionServiceError> {
        let attempt = current.retry_count + 1;
        let max_retries = current.task.retry_config.max_retries as i64;

        if attempt > max_retries {
            return Err(ExecutionServiceError::MaxRetriesExceeded);
        }

        let backoff = current.task.retry_config.backoff_for_attempt(attempt);
        let next_retry_time = Utc::now().timestamp_millis() + backoff.as_millis() as i64;
        let progress = reported.running_progress.clamp(0, 100);

        self.execution_repo
            .update_retry_result(
                current.id,
                attempt,
                next_retry_time,
                ExecutionStatus::FailedRetryable,
                progress,
                0,
                None,
                &reported.executor_node_id,
            )
            .await?;
        Ok(())
    }

    async fn handle_failed_rescheduled(
        &self,
        current: &TaskExecution,
        reported: &ExecutionState,
    ) -> Result<(), ExecutionServiceError> {
        let schedule_params = if reported.request_reschedule {
            Some(merged_schedule_params(
                &current.task.schedule_params,
                &reported.reschedule_params,
            ))
        } else {
            None
        };
        let progress = reported.running_progress.clamp(0, 100);

        self.execution_repo
            .update_schedule_result(
                current.id,
                ExecutionStatus::FailedRescheduled,
                progress,
                0,
                schedule_params,
                &reported.executor_node_id,
            )
            .await?;
        Ok(())
    }

    async fn handle_terminal(
        &self,
        current: &TaskExecution,
        status: ExecutionStatus,
    ) -> Result<(), ExecutionServiceError> {
        self.publish_completion(current, status).await;
        Ok(())
    }

    async fn publish_completion(&self, current: &TaskExecution, status: ExecutionStatus) {
        let event = CompletionEvent {
            task_id: current.task.id,
            exec_id: current.id,
            schedule_node_id: current.task.schedule_node_id.clone(),
            exec_status: status,
            name: current.task.name.clone(),
        };
        self.completion_queue.publish(event).await;
    }
}

fn merged_schedule_params(
    base: &HashMap<String, String>,
    overrides: &HashMap<String, String>,
) -> HashMap<String, String> {
    let mut merged = base.clone();
    for (k, v) in overrides {
        merged.insert(k.clone(), v.clone());
    }
    merged
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::producer::InMemoryCompletionQueue;
    use crate::model::{GrpcConfig, InvocationConfig, RetryConfig, Task, TaskStatus, TaskType};
    use crate::repo::{DbExecutionRepo, ExecutionRepo, NewExecution, TaskRepo};
    use std::sync::Arc;

    async fn seeded_execution(max_retries: i32) -> (Arc<dyn ExecutionRepo>, TaskExecution) {
        let pool = Arc::new(crate::db::create_test_sqlite_pool().await.unwrap());
        let execution_repo: Arc<dyn ExecutionRepo> = Arc::new(DbExecutionRepo::new(pool.clone()));
        let now = Utc::now().timestamp_millis();
        let task = Task {
            id: 1,
            name: "demo".to_string(),
            task_type: TaskType::Recurring,
            cron_expr: "* * * * * *".to_string(),
            invocation: InvocationConfig::Grpc(GrpcConfig {
                service_name: "demo".to_string(),
                params: Default::default(),
            }),
            retry_config: RetryConfig {
                max_retries,
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
        };
        let execution = execution_repo.create(NewExecution { task }).await.unwrap();
        (execution_repo, execution)
    }

    #[tokio::test]
    async fn duplicate_terminal_report_is_rejected() {
        let (execution_repo, execution) = seeded_execution(3).await;
        let (queue, mut receiver) = InMemoryCompletionQueue::channel();
        let service = ExecutionService::new(execution_repo.clone(), Arc::new(queue), Arc::new(crate::metrics::register_all().1));

        let report = ExecutionState {
            id: execution.id,
            task_id: execution.task.id,
            task_name: execution.task.name.clone(),
            status: Some(ExecutionStatus::Success),
            running_progress: 100,
            request_reschedule: false,
            reschedule_params: Default::default(),
            executor_node_id: "worker-1".to_string(),
        };

        service.update_state(report.clone()).await.unwrap();
        let event = receiver.recv().await.unwrap();
        assert_eq!(event.exec_status, ExecutionStatus::Success);

        // Consumer writes SUCCESS (simulated directly here).
        execution_repo
            .update_schedule_result(execution.id, ExecutionStatus::Success, 100, 0, None, "")
            .await
            .unwrap();

        let second = service.update_state(report).await;
        assert!(matches!(
            second,
            Err(ExecutionServiceError::InvalidTaskExecutionStatus)
        ));
        assert!(receiver.try_recv().is_err());
    }

    #[tokio::test]
    async fn retry_exhaustion_emits_failed_completion() {
        let (execution_repo, execution) = seeded_execution(2).await;
        let (queue, mut receiver) = InMemoryCompletionQueue::channel();
        let service = ExecutionService::new(execution_repo.clone(), Arc::new(queue), Arc::new(crate::metrics::register_all().1));

        let retryable = |progress: i32| ExecutionState {
            id: execution.id,
            task_id: execution.task.id,
            task_name: execution.task.name.clone(),
            status: Some(ExecutionStatus::FailedRetryable),
            running_progress: progress,
            request_reschedule: false,
            reschedule_params: Default::default(),
            executor_node_id: "worker-1".to_string(),
        };

        service.update_state(retryable(10)).await.unwrap();
        let after_first = execution_repo.get_by_id(execution.id).await.unwrap().unwrap();
        assert_eq!(after_first.retry_count, 1);
        assert_eq!(after_first.status, ExecutionStatus::FailedRetryable);

        service.update_state(retryable(10)).await.unwrap();
        let after_second = execution_repo.get_by_id(execution.id).await.unwrap().unwrap();
        assert_eq!(after_second.retry_count, 2);

        service.update_state(retryable(10)).await.unwrap();
        let event = receiver.recv().await.unwrap();
        assert_eq!(event.exec_status, ExecutionStatus::Failed);
        // retry_count is not bumped a third time — retry bound invariant.
        let after_third = execution_repo.get_by_id(execution.id).await.unwrap().unwrap();
        assert_eq!(after_third.retry_count, 2);
    }

    #[tokio::test]
    async fn first_running_report_transitions_from_prepare() {
        let (execution_repo, execution) = seeded_execution(3).await;
        let (queue, _receiver) = InMemoryCompletionQueue::channel();
        let service = ExecutionService::new(execution_repo.clone(), Arc::new(queue), Arc::new(crate::metrics::register_all().1));

        let report = ExecutionState {
            id: execution.id,
            task_id: execution.task.id,
            task_name: execution.task.name.clone(),
            status: Some(ExecutionStatus::Running),
            running_progress: 0,
            request_reschedule: false,
            reschedule_params: Default::default(),
            executor_node_id: "worker-1".to_string(),
        };
        service.update_state(report).await.unwrap();

        let reloaded = execution_repo.get_by_id(execution.id).await.unwrap().unwrap();
        assert_eq!(reloaded.status, ExecutionStatus::Running);
        assert_eq!(reloaded.executor_node_id.as_deref(), Some("worker-1"));
        assert!(reloaded.deadline > execution.deadline);
    }
}
