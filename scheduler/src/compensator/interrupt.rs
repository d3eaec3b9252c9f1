use std::sync::Arc;

use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

use crate::config::CompensatorLoopConfig;
use crate::invoker::Dispatcher;
use crate::metrics::Metrics;
use crate::repo::ExecutionRepo;
use crate::service::execution::ExecutionService;

/// Scans `RUNNING` rows past `deadline` and issues `Interrupt` directly at
/// the worker recorded as `executor_node_id`. On `success = true`, applies
/// the returned state (typically `FAILED_RESCHEDULABLE`) through the
/// execution state machine; on failure, the next sweep retries.
pub struct InterruptCompensator {
    execution_repo: Arc<dyn ExecutionRepo>,
    dispatcher: Arc<Dispatcher>,
    execution_service: Arc<ExecutionService>,
    config: CompensatorLoopConfig,
    metrics: Arc<Metrics>,
}

impl InterruptCompensator {
    pub fn new(
        execution_repo: Arc<dyn ExecutionRepo>,
        dispatcher: Arc<Dispatcher>,
        execution_service: Arc<ExecutionService>,
        config: CompensatorLoopConfig,
        metrics: Arc<Metrics>,
    ) -> Self {
        Self {
            execution_repo,
            dispatcher,
            execution_service,
            config,
            metrics,
        }
    }

    pub async fn run(&self, cancel: CancellationToken) {
        loop {
            if cancel.is_cancelled() {
                return;
            }
            let round_start = Instant::now();
            self.metrics
                .compensator_sweeps
                .with_label_values(&["interrupt"])
                .inc();

            match self
                .execution_repo
                .find_timeout_executions(self.config.batch_size)
                .await
            {
                Ok(executions) => {
                    for execution in executions {
                        self.interrupt_one(execution).await;
                    }
                }
                Err(e) => error!(error = %e, "find_timeout_executions failed"),
            }

            let elapsed = round_start.elapsed();
            if elapsed < self.config.min_duration {
                tokio::select! {
                    _ = cancel.cancelled() => return,
                    _ = tokio::time::sleep(self.config.min_duration - elapsed) => {}
                }
            }
        }
    }

    async fn interrupt_one(&self, execution: crate::model::TaskExecution) {
        let exec_id = execution.id;
        match self.dispatcher.interrupt(&execution).await {
            Ok((true, mut state)) => {
                state.id = exec_id;
                if let Err(e) = self.execution_service.update_state(state).await {
                    warn!(exec_id, error = %e, "interrupt state update rejected");
                }
            }
            Ok((false, _)) => {
                debug!(exec_id, "interrupt reported failure, next sweep retries");
            }
            Err(e) => {
                warn!(exec_id, error = %e, "interrupt RPC failed, next sweep retries");
            }
        }
    }
}
