//! Picks an invoker by the execution's embedded task config and forwards
//! Execute/Prepare/Interrupt (spec.md §4.6).

use std::collections::HashMap;
use std::sync::Arc;

use crate::errors::SchedulerError;
use crate::invoker::{grpc::GrpcInvoker, http::HttpInvoker, local::LocalInvoker, Invoker};
use crate::model::{ExecutionState, InvocationConfig, TaskExecution};
use crate::picker::DispatchOptions;

pub struct Dispatcher {
    grpc: Arc<GrpcInvoker>,
    http: Arc<HttpInvoker>,
    local: Arc<LocalInvoker>,
}

impl Dispatcher {
    pub fn new(grpc: Arc<GrpcInvoker>, http: Arc<HttpInvoker>, local: Arc<LocalInvoker>) -> Self {
        Self { grpc, http, local }
    }

    fn invoker_for(&self, execution: &TaskExecution) -> Arc<dyn Invoker> {
        match execution.task.invocation {
            InvocationConfig::Grpc(_) => self.grpc.clone() as Arc<dyn Invoker>,
            InvocationConfig::Http(_) => self.http.clone() as Arc<dyn Invoker>,
            InvocationConfig::Local => self.local.clone() as Arc<dyn Invoker>,
        }
    }

    pub async fn execute(
        &self,
        execution: &TaskExecution,
        options: &DispatchOptions,
    ) -> Result<ExecutionState, SchedulerError> {
        self.invoker_for(execution).execute(execution, options).await
    }

    pub async fn interrupt(
        &self,
        execution: &TaskExecution,
    ) -> Result<(bool, ExecutionState), SchedulerError> {
        self.invoker_for(execution).interrupt(execution).await
    }

    /// Called by `Runner::dispatch` before `execute`. A no-op unless the
    /// task opts in (spec.md §9 Open Question decision) — see
    /// `InvocationConfig::wants_prepare`.
    pub async fn maybe_prepare(
        &self,
        execution: &TaskExecution,
        options: &DispatchOptions,
    ) -> Result<HashMap<String, String>, SchedulerError> {
        if !execution.task.invocation.wants_prepare() {
            return Ok(HashMap::new());
        }
        self.invoker_for(execution).prepare(execution, options).await
    }
}
