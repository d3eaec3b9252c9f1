//! Conversions between the wire `ExecutionState`/`ExecutionStatus`
//! (`scheduler-proto`) and the in-process `model` types. Kept in one place
//! since both the gRPC invoker (outbound `Execute`/`Interrupt` calls) and the
//! `ReporterService` server (inbound `Report`/`BatchReport`) need them.

use scheduler_proto::proto::scheduler::v1 as pb;

use crate::model::{ExecutionState, ExecutionStatus};

pub fn status_to_proto(status: ExecutionStatus) -> pb::ExecutionStatus {
    match status {
        ExecutionStatus::Unknown | ExecutionStatus::Prepare => pb::ExecutionStatus::Unknown,
        ExecutionStatus::Running => pb::ExecutionStatus::Running,
        ExecutionStatus::Success => pb::ExecutionStatus::Success,
        ExecutionStatus::Failed => pb::ExecutionStatus::Failed,
        ExecutionStatus::FailedRetryable => pb::ExecutionStatus::FailedRetryable,
        ExecutionStatus::FailedRescheduled => pb::ExecutionStatus::FailedReschedulable,
    }
}

/// `UNKNOWN` maps to `None` — a wire status outside this set carries no
/// execution-state-machine meaning (spec.md §6).
pub fn status_from_proto(raw: i32) -> Option<ExecutionStatus> {
    match pb::ExecutionStatus::try_from(raw).unwrap_or(pb::ExecutionStatus::Unknown) {
        pb::ExecutionStatus::Unknown => None,
        pb::ExecutionStatus::Running => Some(ExecutionStatus::Running),
        pb::ExecutionStatus::Success => Some(ExecutionStatus::Success),
        pb::ExecutionStatus::Failed => Some(ExecutionStatus::Failed),
        pb::ExecutionStatus::FailedRetryable => Some(ExecutionStatus::FailedRetryable),
        pb::ExecutionStatus::FailedReschedulable => Some(ExecutionStatus::FailedRescheduled),
    }
}

pub fn execution_state_to_proto(state: &ExecutionState) -> pb::ExecutionState {
    pb::ExecutionState {
        id: state.id,
        task_id: state.task_id,
        task_name: state.task_name.clone(),
        status: state
            .status
            .map(status_to_proto)
            .unwrap_or(pb::ExecutionStatus::Unknown) as i32,
        running_progress: state.running_progress,
        request_reschedule: state.request_reschedule,
        reschedule_params: state.reschedule_params.clone(),
        executor_node_id: state.executor_node_id.clone(),
    }
}

pub fn execution_state_from_proto(state: pb::ExecutionState) -> ExecutionState {
    ExecutionState {
        id: state.id,
        task_id: state.task_id,
        task_name: state.task_name,
        status: status_from_proto(state.status),
        running_progress: state.running_progress,
        request_reschedule: state.request_reschedule,
        reschedule_params: state.reschedule_params,
        executor_node_id: state.executor_node_id,
    }
}
