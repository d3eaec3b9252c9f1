//! Thin policy wrapper over `TaskRepo::acquire/release/renew` (spec.md
//! §4.4). Kept as its own seam so a future zk/redis-backed acquirer can be
//! swapped in without touching `Runner`/`Scheduler`.

use std::sync::Arc;

use crate::errors::RepoError;
use crate::model::Task;
use crate::repo::TaskRepo;

#[async_trait::async_trait]
pub trait Acquirer: Send + Sync {
    async fn acquire(&self, task: &Task, node_id: &str) -> Result<Task, RepoError>;
    async fn release(&self, task_id: i64, node_id: &str) -> Result<Task, RepoError>;
    async fn renew(&self, node_id: &str) -> Result<u64, RepoError>;
}

pub struct TaskTableAcquirer {
    task_repo: Arc<dyn TaskRepo>,
}

impl TaskTableAcquirer {
    pub fn new(task_repo: Arc<dyn TaskRepo>) -> Self {
        Self { task_repo }
    }
}

#[async_trait::async_trait]
impl Acquirer for TaskTableAcquirer {
    async fn acquire(&self, task: &Task, node_id: &str) -> Result<Task, RepoError> {
        self.task_repo.acquire(task.id, task.version, node_id).await
    }

    async fn release(&self, task_id: i64, node_id: &str) -> Result<Task, RepoError> {
        self.task_repo.release(task_id, node_id).await
    }

    async fn renew(&self, node_id: &str) -> Result<u64, RepoError> {
        self.task_repo.renew(node_id).await
    }
}
