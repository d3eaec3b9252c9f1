//! Wires every component into a running control-plane node (spec.md §2's
//! data-flow diagram), grounded on `cloud-component-service/src/service/
//! mod.rs`'s `Services::new(config)` shape.

pub mod acquirer;
pub mod execution;
pub mod task;

use std::sync::Arc;

use tokio::sync::mpsc;
use uuid::Uuid;

use crate::compensator::{InterruptCompensator, RescheduleCompensator, RetryCompensator};
use crate::config::{DbConfig, SchedulerConfig};
use crate::db;
use crate::event::{CompletionConsumer, CompletionQueue, InMemoryCompletionQueue};
use crate::invoker::dispatcher::Dispatcher;
use crate::invoker::grpc::GrpcInvoker;
use crate::invoker::http::HttpInvoker;
use crate::invoker::local::LocalInvoker;
use crate::metrics::{self, Metrics};
use crate::model::CompletionEvent;
use crate::picker::{BasePicker, WorkerPicker};
use crate::registry::{EtcdRegistry, Registry};
use crate::repo::{DbExecutionRepo, DbTaskRepo, ExecutionRepo, TaskRepo};
use crate::runner::Runner;
use crate::scheduler::Scheduler;
use crate::service::acquirer::{Acquirer, TaskTableAcquirer};
use crate::service::execution::ExecutionService;
use crate::service::task::TaskService;

/// Everything a scheduler node needs to run its loops and serve
/// `ReporterService`. One instance per process.
pub struct Services {
    pub node_id: String,
    pub metrics_registry: prometheus::Registry,
    pub metrics: Arc<Metrics>,
    pub execution_service: Arc<ExecutionService>,
    pub task_service: Arc<TaskService>,
    pub acquirer: Arc<dyn Acquirer>,
    pub local_invoker: Arc<LocalInvoker>,
    pub scheduler: Arc<Scheduler>,
    pub retry_compensator: Arc<RetryCompensator>,
    pub reschedule_compensator: Arc<RescheduleCompensator>,
    pub interrupt_compensator: Arc<InterruptCompensator>,
    pub completion_consumer: Arc<CompletionConsumer>,
    completion_receiver: tokio::sync::Mutex<Option<mpsc::UnboundedReceiver<CompletionEvent>>>,
}

impl Services {
    pub async fn new(config: &SchedulerConfig) -> Result<Self, String> {
        let node_id = Uuid::new_v4().to_string();
        let (metrics_registry, metrics) = metrics::register_all();
        let metrics = Arc::new(metrics);

        let (task_repo, execution_repo): (Arc<dyn TaskRepo>, Arc<dyn ExecutionRepo>) =
            match config.db.clone() {
                DbConfig::Postgres(c) => {
                    db::postgres_migrate(&c, &config.environment)
                        .await
                        .map_err(|e| format!("postgres migration failed: {e}"))?;
                    let pool = Arc::new(
                        db::create_postgres_pool(&c, &config.environment)
                            .await
                            .map_err(|e| format!("postgres pool init failed: {e}"))?,
                    );
                    (
                        Arc::new(DbTaskRepo::new(pool.clone())),
                        Arc::new(DbExecutionRepo::new(pool)),
                    )
                }
                DbConfig::Sqlite(c) => {
                    db::sqlite_migrate(&c)
                        .await
                        .map_err(|e| format!("sqlite migration failed: {e}"))?;
                    let pool = Arc::new(
                        db::create_sqlite_pool(&c)
                            .await
                            .map_err(|e| format!("sqlite pool init failed: {e}"))?,
                    );
                    (
                        Arc::new(DbTaskRepo::new(pool.clone())),
                        Arc::new(DbExecutionRepo::new(pool)),
                    )
                }
            };

        let registry: Arc<dyn Registry> = Arc::new(
            EtcdRegistry::connect(
                &config.registry.endpoints,
                config.registry.key_prefix.clone(),
                config.registry.lease_ttl,
            )
            .await
            .map_err(|e| format!("registry connect failed: {e}"))?,
        );

        let picker: Arc<dyn WorkerPicker> = Arc::new(BasePicker::new(registry.clone()));
        let local_invoker = Arc::new(LocalInvoker::new());
        let dispatcher = Arc::new(Dispatcher::new(
            Arc::new(GrpcInvoker::new(picker.clone(), registry.clone())),
            Arc::new(HttpInvoker::new()),
            local_invoker.clone(),
        ));

        let acquirer: Arc<dyn Acquirer> = Arc::new(TaskTableAcquirer::new(task_repo.clone()));
        let task_service = Arc::new(TaskService::new(task_repo.clone()));

        let (completion_queue, completion_receiver) = InMemoryCompletionQueue::channel();
        let completion_queue: Arc<dyn CompletionQueue> = Arc::new(completion_queue);
        let execution_service = Arc::new(ExecutionService::new(
            execution_repo.clone(),
            completion_queue,
            metrics.clone(),
        ));

        let runner = Arc::new(Runner::new(
            node_id.clone(),
            acquirer.clone(),
            execution_repo.clone(),
            execution_service.clone(),
            dispatcher.clone(),
            metrics.clone(),
        ));

        let scheduler = Arc::new(Scheduler::new(
            node_id.clone(),
            config.schedule.clone(),
            task_service.clone(),
            picker.clone(),
            runner.clone(),
            acquirer.clone(),
            metrics.clone(),
        ));

        let retry_compensator = Arc::new(RetryCompensator::new(
            execution_repo.clone(),
            runner.clone(),
            config.compensator.retry.clone(),
            metrics.clone(),
        ));
        let reschedule_compensator = Arc::new(RescheduleCompensator::new(
            execution_repo.clone(),
            runner.clone(),
            config.compensator.reschedule.clone(),
            metrics.clone(),
        ));
        let interrupt_compensator = Arc::new(InterruptCompensator::new(
            execution_repo.clone(),
            dispatcher.clone(),
            execution_service.clone(),
            config.compensator.interrupt.clone(),
            metrics.clone(),
        ));

        let completion_consumer = Arc::new(CompletionConsumer::new(
            execution_repo.clone(),
            task_service.clone(),
            acquirer.clone(),
        ));

        Ok(Services {
            node_id,
            metrics_registry,
            metrics,
            execution_service,
            task_service,
            acquirer,
            local_invoker,
            scheduler,
            retry_compensator,
            reschedule_compensator,
            interrupt_compensator,
            completion_consumer,
            completion_receiver: tokio::sync::Mutex::new(Some(completion_receiver)),
        })
    }

    /// Takes ownership of the completion-queue receiver. Panics if called
    /// twice — there is exactly one consumer loop per process.
    pub async fn take_completion_receiver(&self) -> mpsc::UnboundedReceiver<CompletionEvent> {
        self.completion_receiver
            .lock()
            .await
            .take()
            .expect("completion receiver already taken")
    }
}
