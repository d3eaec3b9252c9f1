//! Error taxonomy per spec: CAS-lost, NotFound, InvalidState,
//! MaxRetriesExceeded, Transport/DB, Config. Grounded on
//! `original_source/internal/errs/error.go`'s sentinel list, pruned of the
//! plan/sharding-rule variants that belong to a different system, and on
//! the `thiserror` + `SafeDisplay` idiom in
//! `cloud-component-service/src/service/mod.rs`.

use thiserror::Error;

/// A string-safe representation suitable for returning to an external
/// caller (worker RPC, admin tooling) without leaking internal detail.
pub trait SafeDisplay {
    fn to_safe_string(&self) -> String;
}

#[derive(Debug, Error)]
pub enum RepoError {
    #[error("task preempt failed: version or row mismatch")]
    TaskPreemptFailed,
    #[error("task release failed: version or row mismatch")]
    TaskReleaseFailed,
    #[error("task update next_time failed: version or row mismatch")]
    TaskUpdateNextTimeFailed,
    #[error("task update status failed")]
    TaskUpdateStatusFailed,

    #[error("execution not found: {0}")]
    ExecutionNotFound(i64),
    #[error("set running state failed: precondition not met for execution {0}")]
    SetRunningStateFailed(i64),

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
}

impl SafeDisplay for RepoError {
    fn to_safe_string(&self) -> String {
        match self {
            RepoError::TaskPreemptFailed
            | RepoError::TaskReleaseFailed
            | RepoError::TaskUpdateNextTimeFailed
            | RepoError::SetRunningStateFailed(_) => {
                "concurrent update lost the race, will be retried".to_string()
            }
            RepoError::ExecutionNotFound(_) => "execution not found".to_string(),
            _ => "internal error".to_string(),
        }
    }
}

#[derive(Debug, Error)]
pub enum ExecutionServiceError {
    #[error(transparent)]
    Repo(#[from] RepoError),

    #[error("invalid execution status transition")]
    InvalidTaskExecutionStatus,

    /// Internal sentinel: never surfaces past `update_state`, which catches
    /// it and publishes a FAILED completion event instead.
    #[error("execution exceeded max retries")]
    MaxRetriesExceeded,
}

impl SafeDisplay for ExecutionServiceError {
    fn to_safe_string(&self) -> String {
        match self {
            ExecutionServiceError::Repo(e) => e.to_safe_string(),
            ExecutionServiceError::InvalidTaskExecutionStatus => {
                "invalid execution status transition".to_string()
            }
            ExecutionServiceError::MaxRetriesExceeded => "max retries exceeded".to_string(),
        }
    }
}

#[derive(Debug, Error)]
pub enum SchedulerError {
    #[error(transparent)]
    Execution(#[from] ExecutionServiceError),
    #[error(transparent)]
    Repo(#[from] RepoError),
    #[error("invalid cron expression: {0}")]
    InvalidCronExpr(String),
    #[error("registry error: {0}")]
    Registry(String),
    #[error("invoker error: {0}")]
    Invoker(String),
    #[error("config error: {0}")]
    Config(String),
}

impl SafeDisplay for SchedulerError {
    fn to_safe_string(&self) -> String {
        match self {
            SchedulerError::Execution(e) => e.to_safe_string(),
            SchedulerError::Repo(e) => e.to_safe_string(),
            _ => "internal error".to_string(),
        }
    }
}
