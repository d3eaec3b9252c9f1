//! Top-level schedule-loop + renew-loop (spec.md §4.8).

use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::{debug, error};

use crate::config::ScheduleLoopConfig;
use crate::metrics::Metrics;
use crate::model::{InvocationConfig, Task};
use crate::picker::{DispatchOptions, WorkerPicker};
use crate::runner::Runner;
use crate::service::acquirer::Acquirer;
use crate::service::task::TaskService;

pub struct Scheduler {
    node_id: String,
    config: ScheduleLoopConfig,
    task_service: Arc<TaskService>,
    picker: Arc<dyn WorkerPicker>,
    runner: Arc<Runner>,
    acquirer: Arc<dyn Acquirer>,
    metrics: Arc<Metrics>,
}

impl Scheduler {
    pub fn new(
        node_id: String,
        config: ScheduleLoopConfig,
        task_service: Arc<TaskService>,
        picker: Arc<dyn WorkerPicker>,
        runner: Arc<Runner>,
        acquirer: Arc<dyn Acquirer>,
        metrics: Arc<Metrics>,
    ) -> Self {
        Self {
            node_id,
            config,
            task_service,
            picker,
            runner,
            acquirer,
            metrics,
        }
    }

    pub fn node_id(&self) -> &str {
        &self.node_id
    }

    /// Bounded by `batch_timeout`; sleeps `schedule_interval` when the batch
    /// is empty, otherwise loops immediately. Exits on cancellation.
    pub async fn run_schedule_loop(&self, cancel: CancellationToken) {
        loop {
            if cancel.is_cancelled() {
                return;
            }

            let tasks = match tokio::time::timeout(
                self.config.batch_timeout,
                self.task_service.schedulable_tasks(
                    self.config.preempted_timeout.as_millis() as i64,
                    self.config.batch_size,
                ),
            )
            .await
            {
                Ok(Ok(tasks)) => tasks,
                Ok(Err(e)) => {
                    error!(error = %e, "schedulable_tasks query failed");
                    Vec::new()
                }
                Err(_) => {
                    debug!("schedulable_tasks query exceeded batch_timeout");
                    Vec::new()
                }
            };

            self.metrics
                .schedule_loop_batch_size
                .observe(tasks.len() as f64);

            if tasks.is_empty() {
                tokio::select! {
                    _ = cancel.cancelled() => return,
                    _ = tokio::time::sleep(self.config.schedule_interval) => {}
                }
                continue;
            }

            for task in tasks {
                let options = self.initial_dispatch_options(&task).await;
                self.runner.run(task, options).await;
            }
        }
    }

    /// Every `renew_interval`, bumps `version`/`utime` on every row this
    /// node currently holds PREEMPTED. `preempted_timeout > renew_interval
    /// × k` (k ≥ 3) is an operational constraint on the caller's config.
    pub async fn run_renew_loop(&self, cancel: CancellationToken) {
        loop {
            tokio::select! {
                _ = cancel.cancelled() => return,
                _ = tokio::time::sleep(self.config.renew_interval) => {
                    match self.acquirer.renew(&self.node_id).await {
                        Ok(renewed) => debug!(renewed, "renewed preempted tasks"),
                        Err(e) => error!(error = %e, "renew failed"),
                    }
                }
            }
        }
    }

    /// Picks an initial worker so the runner's dispatch commits to a
    /// specific instance at schedule time; falls back to letting the
    /// invoker pick randomly at execute time if the picker can't resolve
    /// one right now (spec.md §4.8).
    async fn initial_dispatch_options(&self, task: &Task) -> DispatchOptions {
        let InvocationConfig::Grpc(cfg) = &task.invocation else {
            return DispatchOptions::none();
        };
        match self.picker.pick(&cfg.service_name, &DispatchOptions::none()).await {
            Ok(instance) => DispatchOptions::specific(instance.id),
            Err(e) => {
                debug!(task_id = task.id, error = %e, "initial worker pick failed, deferring to execute-time random pick");
                DispatchOptions::none()
            }
        }
    }
}
