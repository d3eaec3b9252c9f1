//! Single-writer consumer for terminal execution outcomes (spec.md §4.11).
//! Resists the double-write race where two near-simultaneous terminal
//! reports would both try to persist SUCCESS/FAILED: `ExecutionService`
//! never writes a terminal status directly, only enqueues a
//! `CompletionEvent`; this consumer is the sole writer.

use std::sync::Arc;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crate::errors::RepoError;
use crate::model::{CompletionEvent, ExecutionStatus};
use crate::repo::ExecutionRepo;
use crate::service::acquirer::Acquirer;
use crate::service::task::{NextTimeOutcome, TaskService};

pub struct CompletionConsumer {
    execution_repo: Arc<dyn ExecutionRepo>,
    task_service: Arc<TaskService>,
    acquirer: Arc<dyn Acquirer>,
}

impl CompletionConsumer {
    pub fn new(
        execution_repo: Arc<dyn ExecutionRepo>,
        task_service: Arc<TaskService>,
        acquirer: Arc<dyn Acquirer>,
    ) -> Self {
        Self {
            execution_repo,
            task_service,
            acquirer,
        }
    }

    /// Runs until `receiver` closes or `cancel` fires.
    pub async fn run(
        &self,
        mut receiver: mpsc::UnboundedReceiver<CompletionEvent>,
        cancel: CancellationToken,
    ) {
        loop {
            tokio::select! {
                _ = cancel.cancelled() => return,
                event = receiver.recv() => {
                    match event {
                        Some(event) => self.handle(event).await,
                        None => return,
                    }
                }
            }
        }
    }

    /// Idempotent: replaying the same event leaves the system in the same
    /// final state as processing it once (spec.md §8 "Idempotent
    /// completion") because `update_schedule_result` is an unconditional
    /// write and `release` is a no-op once the task is no longer PREEMPTED
    /// by `scheduleNodeId`.
    pub async fn handle(&self, event: CompletionEvent) {
        let now = chrono::Utc::now().timestamp_millis();
        let progress = match event.exec_status {
            ExecutionStatus::Success => 100,
            _ => 0,
        };

        if let Err(e) = self
            .execution_repo
            .update_schedule_result(event.exec_id, event.exec_status, progress, now, None, "")
            .await
        {
            error!(exec_id = event.exec_id, error = %e, "failed to persist terminal outcome");
            return;
        }

        let outcome = match self.task_service.update_next_time(event.task_id).await {
            Ok(outcome) => outcome,
            Err(e) => {
                error!(task_id = event.task_id, error = %e, "failed to update next_time");
                return;
            }
        };

        if outcome == NextTimeOutcome::WentInactive {
            info!(task_id = event.task_id, "one-shot task completed, skipping release");
            return;
        }

        if let Some(schedule_node_id) = &event.schedule_node_id {
            match self
                .acquirer
                .release(event.task_id, schedule_node_id)
                .await
            {
                Ok(_) => {}
                Err(RepoError::TaskReleaseFailed) => {
                    // Already released or stolen by another node — fine.
                }
                Err(e) => {
                    error!(task_id = event.task_id, error = %e, "failed to release task");
                }
            }
        }
    }
}
