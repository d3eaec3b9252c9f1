//! Dispatcher / Invokers (spec.md §4.6): translate a `TaskExecution` into a
//! remote (or in-process) call and return the initial `ExecutionState`.

pub mod dispatcher;
pub mod grpc;
pub mod http;
pub mod local;

pub use dispatcher::Dispatcher;
pub use local::LocalInvoker;

use std::collections::HashMap;

use async_trait::async_trait;

use crate::errors::SchedulerError;
use crate::model::{ExecutionState, TaskExecution};
use crate::picker::DispatchOptions;

#[async_trait]
pub trait Invoker: Send + Sync {
    /// Non-blocking with respect to task progress: returns whatever initial
    /// state the worker reports synchronously (usually RUNNING + progress
    /// 0); all subsequent progress arrives via the ReporterServer.
    async fn execute(
        &self,
        execution: &TaskExecution,
        options: &DispatchOptions,
    ) -> Result<ExecutionState, SchedulerError>;

    /// Issued by `InterruptCompensator` directly at the worker recorded as
    /// `executor_node_id`. Returns `(success, ExecutionState)`.
    async fn interrupt(
        &self,
        execution: &TaskExecution,
    ) -> Result<(bool, ExecutionState), SchedulerError>;

    /// Optional capability for workers to augment params before execution
    /// (spec.md §6, `Prepare`). A no-op for invokers that don't support it.
    async fn prepare(
        &self,
        execution: &TaskExecution,
        options: &DispatchOptions,
    ) -> Result<HashMap<String, String>, SchedulerError>;
}
