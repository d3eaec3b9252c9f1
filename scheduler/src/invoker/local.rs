//! In-process handler registry (spec.md §4.6 supplement, grounded on
//! `invoker/local.go`): lets tests and single-process deployments run task
//! handlers without a separate worker fleet, keyed by task name.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use futures::future::BoxFuture;

use crate::errors::SchedulerError;
use crate::model::{ExecutionState, TaskExecution};
use crate::picker::DispatchOptions;

pub type LocalHandler =
    Arc<dyn Fn(i64, HashMap<String, String>) -> BoxFuture<'static, ExecutionState> + Send + Sync>;

#[derive(Default)]
pub struct LocalInvoker {
    handlers: RwLock<HashMap<String, LocalHandler>>,
}

impl LocalInvoker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, task_name: impl Into<String>, handler: LocalHandler) {
        self.handlers.write().unwrap().insert(task_name.into(), handler);
    }
}

#[async_trait]
impl crate::invoker::Invoker for LocalInvoker {
    async fn execute(
        &self,
        execution: &TaskExecution,
        _options: &DispatchOptions,
    ) -> Result<ExecutionState, SchedulerError> {
        let handler = self
            .handlers
            .read()
            .unwrap()
            .get(&execution.task.name)
            .cloned()
            .ok_or_else(|| {
                SchedulerError::Invoker(format!(
                    "no local handler registered for task {}",
                    execution.task.name
                ))
            })?;
        Ok(handler(execution.id, execution.grpc_params()).await)
    }

    async fn interrupt(
        &self,
        _execution: &TaskExecution,
    ) -> Result<(bool, ExecutionState), SchedulerError> {
        Err(SchedulerError::Invoker(
            "local invoker does not support interrupt".to_string(),
        ))
    }

    async fn prepare(
        &self,
        _execution: &TaskExecution,
        _options: &DispatchOptions,
    ) -> Result<HashMap<String, String>, SchedulerError> {
        Ok(HashMap::new())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::invoker::Invoker;
    use crate::model::{ExecutionStatus, GrpcConfig, InvocationConfig, RetryConfig, Task, TaskStatus, TaskType};

    fn sample_execution() -> TaskExecution {
        let task = Task {
            id: 1,
            name: "greet".to_string(),
            task_type: TaskType::OneTime,
            cron_expr: String::new(),
            invocation: InvocationConfig::Local,
            retry_config: RetryConfig {
                max_retries: 0,
                initial_interval_ms: 0,
                max_interval_ms: 0,
            },
            max_execution_seconds: 10,
            schedule_node_id: None,
            schedule_params: HashMap::new(),
            next_time: 0,
            status: TaskStatus::Active,
            version: 0,
            ctime: 0,
            utime: 0,
        };
        TaskExecution {
            id: 42,
            task,
            executor_node_id: None,
            deadline: 0,
            start_time: 0,
            end_time: 0,
            retry_count: 0,
            next_retry_time: 0,
            running_progress: 0,
            status: ExecutionStatus::Prepare,
            ctime: 0,
            utime: 0,
        }
    }

    #[tokio::test]
    async fn registered_handler_is_invoked() {
        let invoker = LocalInvoker::new();
        invoker.register(
            "greet",
            Arc::new(|exec_id, _params| {
                Box::pin(async move {
                    ExecutionState {
                        id: exec_id,
                        task_id: 1,
                        task_name: "greet".to_string(),
                        status: Some(ExecutionStatus::Success),
                        running_progress: 100,
                        request_reschedule: false,
                        reschedule_params: HashMap::new(),
                        executor_node_id: "local".to_string(),
                    }
                })
            }),
        );

        let execution = sample_execution();
        let state = invoker
            .execute(&execution, &DispatchOptions::none())
            .await
            .unwrap();
        assert_eq!(state.status, Some(ExecutionStatus::Success));
    }

    #[tokio::test]
    async fn missing_handler_is_an_error() {
        let invoker = LocalInvoker::new();
        let execution = sample_execution();
        let result = invoker.execute(&execution, &DispatchOptions::none()).await;
        assert!(result.is_err());
    }
}
