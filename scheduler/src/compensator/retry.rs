use std::sync::Arc;

use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::error;

use crate::config::CompensatorLoopConfig;
use crate::metrics::Metrics;
use crate::repo::ExecutionRepo;
use crate::runner::Runner;

/// Scans `FAILED_RETRYABLE` rows whose backoff has elapsed and re-drives
/// them through the runner, excluding the worker that just failed.
pub struct RetryCompensator {
    execution_repo: Arc<dyn ExecutionRepo>,
    runner: Arc<Runner>,
    config: CompensatorLoopConfig,
    metrics: Arc<Metrics>,
}

impl RetryCompensator {
    pub fn new(
        execution_repo: Arc<dyn ExecutionRepo>,
        runner: Arc<Runner>,
        config: CompensatorLoopConfig,
        metrics: Arc<Metrics>,
    ) -> Self {
        Self {
            execution_repo,
            runner,
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
                .with_label_values(&["retry"])
                .inc();

            match self
                .execution_repo
                .find_retryable_executions(self.config.batch_size)
                .await
            {
                Ok(executions) => {
                    for execution in executions {
                        self.runner.retry(execution).await;
                    }
                }
                Err(e) => error!(error = %e, "find_retryable_executions failed"),
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
}
