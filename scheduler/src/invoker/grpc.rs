//! Preferred invoker (spec.md §4.6). Composes effective params as task
//! params ∪ scheduleParams (latter wins) plus a synthetic
//! `max_execution_seconds` entry (`TaskExecution::grpc_params`), resolves
//! the service name through the picker, and issues `Execute`/`Interrupt`
//! with a short per-call deadline since worker-side execution is async.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use scheduler_proto::proto::scheduler::v1::executor_service_client::ExecutorServiceClient;
use scheduler_proto::proto::scheduler::v1::{ExecuteRequest, InterruptRequest, PrepareRequest};
use tokio::sync::RwLock;
use tonic::transport::{Channel, Endpoint};

use crate::errors::SchedulerError;
use crate::model::{ExecutionState, TaskExecution};
use crate::picker::{DispatchOptions, WorkerPicker};
use crate::registry::Registry;
use crate::repo::execution::grpc_config;
use crate::wire::execution_state_from_proto;

const CALL_DEADLINE: Duration = Duration::from_secs(1);

pub struct GrpcInvoker {
    picker: Arc<dyn WorkerPicker>,
    registry: Arc<dyn Registry>,
    channels: RwLock<HashMap<String, ExecutorServiceClient<Channel>>>,
}

impl GrpcInvoker {
    pub fn new(picker: Arc<dyn WorkerPicker>, registry: Arc<dyn Registry>) -> Self {
        Self {
            picker,
            registry,
            channels: RwLock::new(HashMap::new()),
        }
    }

    async fn client_for(&self, address: &str) -> Result<ExecutorServiceClient<Channel>, SchedulerError> {
        if let Some(client) = self.channels.read().await.get(address) {
            return Ok(client.clone());
        }

        let endpoint = Endpoint::from_shared(address.to_string())
            .map_err(|e| SchedulerError::Invoker(e.to_string()))?
            .timeout(CALL_DEADLINE);
        let channel = endpoint
            .connect()
            .await
            .map_err(|e| SchedulerError::Invoker(e.to_string()))?;
        let client = ExecutorServiceClient::new(channel);

        self.channels
            .write()
            .await
            .insert(address.to_string(), client.clone());
        Ok(client)
    }

    fn service_name(execution: &TaskExecution) -> Result<&str, SchedulerError> {
        grpc_config(&execution.task)
            .map(|cfg| cfg.service_name.as_str())
            .ok_or_else(|| SchedulerError::Invoker("execution has no gRPC invocation config".to_string()))
    }
}

#[async_trait]
impl crate::invoker::Invoker for GrpcInvoker {
    async fn execute(
        &self,
        execution: &TaskExecution,
        options: &DispatchOptions,
    ) -> Result<ExecutionState, SchedulerError> {
        let service_name = Self::service_name(execution)?;
        let instance = self.picker.pick(service_name, options).await?;
        let mut client = self.client_for(&instance.address).await?;

        let response = client
            .execute(ExecuteRequest {
                eid: execution.id,
                task_id: execution.task.id,
                task_name: execution.task.name.clone(),
                params: execution.grpc_params(),
            })
            .await
            .map_err(|e| SchedulerError::Invoker(e.to_string()))?;

        let state = response
            .into_inner()
            .execution_state
            .ok_or_else(|| SchedulerError::Invoker("Execute response carried no state".to_string()))?;
        Ok(execution_state_from_proto(state))
    }

    async fn interrupt(
        &self,
        execution: &TaskExecution,
    ) -> Result<(bool, ExecutionState), SchedulerError> {
        let service_name = Self::service_name(execution)?;
        let node_id = execution
            .executor_node_id
            .as_ref()
            .ok_or_else(|| SchedulerError::Invoker("execution has no executor_node_id yet".to_string()))?;

        let instances = self.registry.list_services(service_name).await?;
        let instance = instances
            .iter()
            .find(|i| &i.id == node_id)
            .ok_or_else(|| SchedulerError::Invoker(format!("worker {node_id} not found in registry")))?;

        let mut client = self.client_for(&instance.address).await?;
        let response = client
            .interrupt(InterruptRequest { eid: execution.id })
            .await
            .map_err(|e| SchedulerError::Invoker(e.to_string()))?
            .into_inner();

        let state = response
            .execution_state
            .ok_or_else(|| SchedulerError::Invoker("Interrupt response carried no state".to_string()))?;
        Ok((response.success, execution_state_from_proto(state)))
    }

    async fn prepare(
        &self,
        execution: &TaskExecution,
        options: &DispatchOptions,
    ) -> Result<HashMap<String, String>, SchedulerError> {
        let service_name = Self::service_name(execution)?;
        let instance = self.picker.pick(service_name, options).await?;
        let mut client = self.client_for(&instance.address).await?;

        let response = client
            .prepare(PrepareRequest {
                eid: execution.id,
                task_id: execution.task.id,
                task_name: execution.task.name.clone(),
                params: execution.grpc_params(),
            })
            .await
            .map_err(|e| SchedulerError::Invoker(e.to_string()))?;
        Ok(response.into_inner().params)
    }
}
