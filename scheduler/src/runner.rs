//! Per-dispatch orchestration (spec.md §4.7): preempt → create execution →
//! async fire-and-track → report result. Never blocks the Scheduler loop on
//! the invoker call.

use std::sync::Arc;

use tracing::{debug, warn};

use crate::invoker::Dispatcher;
use crate::metrics::Metrics;
use crate::model::{Task, TaskExecution};
use crate::picker::DispatchOptions;
use crate::repo::{ExecutionRepo, NewExecution};
use crate::service::acquirer::Acquirer;
use crate::service::execution::ExecutionService;

pub struct Runner {
    node_id: String,
    acquirer: Arc<dyn Acquirer>,
    execution_repo: Arc<dyn ExecutionRepo>,
    execution_service: Arc<ExecutionService>,
    dispatcher: Arc<Dispatcher>,
    metrics: Arc<Metrics>,
}

impl Runner {
    pub fn new(
        node_id: String,
        acquirer: Arc<dyn Acquirer>,
        execution_repo: Arc<dyn ExecutionRepo>,
        execution_service: Arc<ExecutionService>,
        dispatcher: Arc<Dispatcher>,
        metrics: Arc<Metrics>,
    ) -> Self {
        Self {
            node_id,
            acquirer,
            execution_repo,
            execution_service,
            dispatcher,
            metrics,
        }
    }

    /// 1. preempt via CAS, giving up silently if another scheduler won.
    /// 2. create the execution row.
    /// 3. fire the invoker in the background; never awaited here.
    pub async fn run(&self, task: Task, initial_options: DispatchOptions) {
        let acquired = match self.acquirer.acquire(&task, &self.node_id).await {
            Ok(task) => {
                self.metrics
                    .preempt_attempts
                    .with_label_values(&["preempted"])
                    .inc();
                task
            }
            Err(e) => {
                self.metrics
                    .preempt_attempts
                    .with_label_values(&["lost_race"])
                    .inc();
                debug!(task_id = task.id, error = %e, "preempt lost, another scheduler won");
                return;
            }
        };

        let execution = match self
            .execution_repo
            .create(NewExecution { task: acquired })
            .await
        {
            Ok(execution) => execution,
            Err(e) => {
                warn!(task_id = task.id, error = %e, "failed to create execution row");
                return;
            }
        };

        self.dispatch(execution, initial_options);
    }

    /// Sticky-avoid: excludes the node that just failed.
    pub async fn retry(&self, execution: TaskExecution) {
        let options = match &execution.executor_node_id {
            Some(node_id) => DispatchOptions::excluding(node_id.clone()),
            None => DispatchOptions::none(),
        };
        self.dispatch(execution, options);
    }

    /// Sticky-to: the worker that earlier asked for reschedule holds
    /// relevant local state (e.g. a pagination cursor).
    pub async fn reschedule(&self, execution: TaskExecution) {
        let options = match &execution.executor_node_id {
            Some(node_id) => DispatchOptions::specific(node_id.clone()),
            None => DispatchOptions::none(),
        };
        self.dispatch(execution, options);
    }

    fn dispatch(&self, mut execution: TaskExecution, options: DispatchOptions) {
        let dispatcher = self.dispatcher.clone();
        let execution_service = self.execution_service.clone();
        let exec_id = execution.id;

        tokio::spawn(async move {
            match dispatcher.maybe_prepare(&execution, &options).await {
                Ok(params) => execution.merge_task_schedule_params(params),
                Err(e) => {
                    warn!(exec_id, error = %e, "prepare hook failed, proceeding without augmented params")
                }
            }

            match dispatcher.execute(&execution, &options).await {
                Ok(mut initial_state) => {
                    initial_state.id = exec_id;
                    if let Err(e) = execution_service.update_state(initial_state).await {
                        warn!(exec_id, error = %e, "initial dispatch report rejected");
                    }
                }
                Err(e) => {
                    warn!(exec_id, error = %e, "dispatch failed, next compensator sweep will retry");
                }
            }
        });
    }
}
