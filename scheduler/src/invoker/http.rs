//! HTTP invoker (spec.md §4.6 "HTTP endpoint, placeholder contract"): a real
//! `reqwest`-based POST, not a stub, but intentionally shallow — the reply
//! contract is out of scope, so `execute` is fire-and-forget and reports
//! back an `UNKNOWN` state for the ReporterService path to fill in later.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;

use crate::errors::SchedulerError;
use crate::model::{ExecutionState, TaskExecution};
use crate::picker::DispatchOptions;
use crate::repo::execution::http_config;

#[derive(Serialize)]
struct ExecuteEnvelope<'a> {
    #[serde(rename = "taskId")]
    task_id: i64,
    #[serde(rename = "taskName")]
    task_name: &'a str,
    #[serde(rename = "executionId")]
    execution_id: i64,
    params: HashMap<String, String>,
}

pub struct HttpInvoker {
    client: reqwest::Client,
}

impl HttpInvoker {
    pub fn new() -> Self {
        Self {
            client: reqwest::Client::builder()
                .timeout(Duration::from_secs(5))
                .build()
                .expect("reqwest client config is static and always valid"),
        }
    }
}

impl Default for HttpInvoker {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl crate::invoker::Invoker for HttpInvoker {
    async fn execute(
        &self,
        execution: &TaskExecution,
        _options: &DispatchOptions,
    ) -> Result<ExecutionState, SchedulerError> {
        let cfg = http_config(&execution.task)
            .ok_or_else(|| SchedulerError::Invoker("execution has no HTTP invocation config".to_string()))?;

        let envelope = ExecuteEnvelope {
            task_id: execution.task.id,
            task_name: &execution.task.name,
            execution_id: execution.id,
            params: execution.grpc_params(),
        };

        self.client
            .post(&cfg.endpoint)
            .json(&envelope)
            .send()
            .await
            .map_err(|e| SchedulerError::Invoker(e.to_string()))?;

        Ok(ExecutionState {
            id: execution.id,
            task_id: execution.task.id,
            task_name: execution.task.name.clone(),
            status: None,
            running_progress: 0,
            request_reschedule: false,
            reschedule_params: HashMap::new(),
            executor_node_id: String::new(),
        })
    }

    async fn interrupt(
        &self,
        _execution: &TaskExecution,
    ) -> Result<(bool, ExecutionState), SchedulerError> {
        Err(SchedulerError::Invoker(
            "HTTP invoker does not support interrupt (placeholder contract)".to_string(),
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
