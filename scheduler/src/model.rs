use std::collections::HashMap;

use chrono::Utc;
use serde::{Deserialize, Serialize};

use crate::cron::next_fire_time;

/// `status ∈ {ACTIVE, PREEMPTED, INACTIVE}`, CAS-mutated only.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum TaskStatus {
    Active,
    Preempted,
    Inactive,
}

impl TaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Active => "ACTIVE",
            TaskStatus::Preempted => "PREEMPTED",
            TaskStatus::Inactive => "INACTIVE",
        }
    }
}

impl std::str::FromStr for TaskStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "ACTIVE" => Ok(TaskStatus::Active),
            "PREEMPTED" => Ok(TaskStatus::Preempted),
            "INACTIVE" => Ok(TaskStatus::Inactive),
            other => Err(format!("unknown task status: {other}")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum TaskType {
    Recurring,
    /// Computes its first trigger from cron, then becomes INACTIVE once run.
    OneTime,
}

impl TaskType {
    pub fn is_one_time(&self) -> bool {
        matches!(self, TaskType::OneTime)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            TaskType::Recurring => "RECURRING",
            TaskType::OneTime => "ONE_TIME",
        }
    }
}

impl std::str::FromStr for TaskType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "RECURRING" => Ok(TaskType::Recurring),
            "ONE_TIME" => Ok(TaskType::OneTime),
            other => Err(format!("unknown task type: {other}")),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryConfig {
    pub max_retries: i32,
    pub initial_interval_ms: i64,
    pub max_interval_ms: i64,
}

impl RetryConfig {
    /// `delay = min(initialInterval × 2^(attempt−1), maxInterval)`.
    pub fn backoff_for_attempt(&self, attempt: i64) -> std::time::Duration {
        let exp = attempt.saturating_sub(1).clamp(0, 62) as u32;
        let scaled = self.initial_interval_ms.saturating_mul(1i64 << exp);
        std::time::Duration::from_millis(scaled.min(self.max_interval_ms).max(0) as u64)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GrpcConfig {
    pub service_name: String,
    #[serde(default)]
    pub params: HashMap<String, String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HttpConfig {
    pub endpoint: String,
    #[serde(default)]
    pub params: HashMap<String, String>,
}

/// Reserved params key a gRPC/HTTP task sets to `"true"` to opt into the
/// pre-Execute `Prepare` hook (spec.md §9 Open Question decision).
pub const PREPARE_OPT_IN_KEY: &str = "prepare";

/// Exactly one of these identifies how a task is invoked.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum InvocationConfig {
    Grpc(GrpcConfig),
    Http(HttpConfig),
    Local,
}

impl InvocationConfig {
    /// Local handlers are always offered the hook, since there's no network
    /// round trip to weigh against it. gRPC/HTTP workers only get a Prepare
    /// call when the task's params carry the opt-in key, so workers that
    /// never implemented `Prepare` aren't called unexpectedly.
    pub fn wants_prepare(&self) -> bool {
        match self {
            InvocationConfig::Local => true,
            InvocationConfig::Grpc(cfg) => {
                cfg.params.get(PREPARE_OPT_IN_KEY).map(String::as_str) == Some("true")
            }
            InvocationConfig::Http(cfg) => {
                cfg.params.get(PREPARE_OPT_IN_KEY).map(String::as_str) == Some("true")
            }
        }
    }
}

/// The schedulable unit. See `repo::task` for the CAS persistence contract.
#[derive(Debug, Clone, PartialEq)]
pub struct Task {
    pub id: i64,
    pub name: String,
    pub task_type: TaskType,
    pub cron_expr: String,
    pub invocation: InvocationConfig,
    pub retry_config: RetryConfig,
    pub max_execution_seconds: i64,
    pub schedule_node_id: Option<String>,
    pub schedule_params: HashMap<String, String>,
    pub next_time: i64,
    pub status: TaskStatus,
    pub version: i64,
    pub ctime: i64,
    pub utime: i64,
}

impl Task {
    /// Recomputes the next cron fire time from now. Only meaningful for
    /// `RECURRING` tasks — `ONE_TIME` tasks never re-compute (spec.md §3
    /// Kind) and retire to `INACTIVE` on completion instead; see
    /// `service::task::TaskService::update_next_time`.
    pub fn calculate_next_time(&self) -> Result<Option<i64>, String> {
        if self.cron_expr.is_empty() {
            return Ok(None);
        }
        let next = next_fire_time(&self.cron_expr, Utc::now())?;
        Ok(next.map(|t| t.timestamp_millis()))
    }

    /// `None` = no-op, `Some(empty)` = reset, `Some(non-empty)` = merge
    /// (overwrite wins), lazily initializing the map.
    pub fn update_schedule_params(&mut self, params: Option<HashMap<String, String>>) {
        match params {
            None => {}
            Some(p) if p.is_empty() => self.schedule_params = HashMap::new(),
            Some(p) => {
                for (k, v) in p {
                    self.schedule_params.insert(k, v);
                }
            }
        }
    }
}

/// `PREPARE`, `RUNNING`, `FAILED_RETRYABLE`, `FAILED_RESCHEDULED` are
/// non-terminal; `SUCCESS`/`FAILED` are terminal and sticky.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ExecutionStatus {
    Unknown,
    Prepare,
    Running,
    Success,
    Failed,
    FailedRetryable,
    FailedRescheduled,
}

impl ExecutionStatus {
    pub fn is_running(&self) -> bool {
        matches!(self, ExecutionStatus::Running)
    }

    pub fn is_failed_retryable(&self) -> bool {
        matches!(self, ExecutionStatus::FailedRetryable)
    }

    pub fn is_failed_rescheduled(&self) -> bool {
        matches!(self, ExecutionStatus::FailedRescheduled)
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, ExecutionStatus::Success | ExecutionStatus::Failed)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ExecutionStatus::Unknown => "UNKNOWN",
            ExecutionStatus::Prepare => "PREPARE",
            ExecutionStatus::Running => "RUNNING",
            ExecutionStatus::Success => "SUCCESS",
            ExecutionStatus::Failed => "FAILED",
            ExecutionStatus::FailedRetryable => "FAILED_RETRYABLE",
            ExecutionStatus::FailedRescheduled => "FAILED_RESCHEDULED",
        }
    }
}

impl std::str::FromStr for ExecutionStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "PREPARE" => Ok(ExecutionStatus::Prepare),
            "RUNNING" => Ok(ExecutionStatus::Running),
            "SUCCESS" => Ok(ExecutionStatus::Success),
            "FAILED" => Ok(ExecutionStatus::Failed),
            "FAILED_RETRYABLE" => Ok(ExecutionStatus::FailedRetryable),
            "FAILED_RESCHEDULED" => Ok(ExecutionStatus::FailedRescheduled),
            other => Err(format!("unknown execution status: {other}")),
        }
    }
}

/// One attempt to run a task. Denormalizes a snapshot of `Task` at creation
/// time so later Task mutations never affect an in-flight execution.
#[derive(Debug, Clone, PartialEq)]
pub struct TaskExecution {
    pub id: i64,
    pub task: Task,
    pub executor_node_id: Option<String>,
    pub deadline: i64,
    pub start_time: i64,
    pub end_time: i64,
    pub retry_count: i64,
    pub next_retry_time: i64,
    pub running_progress: i32,
    pub status: ExecutionStatus,
    pub ctime: i64,
    pub utime: i64,
}

impl TaskExecution {
    /// Merges reschedule params into the task snapshot, overwrite wins.
    pub fn merge_task_schedule_params(&mut self, params: HashMap<String, String>) {
        if params.is_empty() {
            return;
        }
        if self.task.schedule_params.is_empty() {
            self.task.schedule_params = params;
        } else {
            for (k, v) in params {
                self.task.schedule_params.insert(k, v);
            }
        }
    }

    /// Business params ∪ schedule params (schedule wins) plus a synthetic
    /// `max_execution_seconds` entry.
    pub fn grpc_params(&self) -> HashMap<String, String> {
        let mut result = HashMap::new();
        if let InvocationConfig::Grpc(cfg) = &self.task.invocation {
            for (k, v) in &cfg.params {
                result.insert(k.clone(), v.clone());
            }
        }
        for (k, v) in &self.task.schedule_params {
            result.insert(k.clone(), v.clone());
        }
        result.insert(
            "max_execution_seconds".to_string(),
            self.task.max_execution_seconds.to_string(),
        );
        result
    }
}

/// Transient DTO carried in RPCs between workers and the scheduler.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct ExecutionState {
    pub id: i64,
    pub task_id: i64,
    pub task_name: String,
    pub status: Option<ExecutionStatus>,
    pub running_progress: i32,
    pub request_reschedule: bool,
    pub reschedule_params: HashMap<String, String>,
    pub executor_node_id: String,
}

/// Durable queue payload produced on terminal outcomes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompletionEvent {
    pub task_id: i64,
    pub exec_id: i64,
    pub schedule_node_id: Option<String>,
    pub exec_status: ExecutionStatus,
    pub name: String,
}
