//! `ReporterService` tonic server (spec.md §4.10): external ingress for
//! worker progress/state reports. Errors surface to the worker only for
//! transport failures; logic errors (stale terminal, unknown execution) are
//! swallowed as OK so the worker doesn't retry a report that can never
//! succeed.

use std::sync::Arc;

use scheduler_proto::proto::scheduler::v1::reporter_service_server::ReporterService as ReporterServiceTrait;
use scheduler_proto::proto::scheduler::v1::{
    BatchReportRequest, BatchReportResponse, ReportRequest, ReportResponse,
};
use tonic::{Request, Response, Status};
use tracing::debug;

use crate::service::execution::ExecutionService;
use crate::wire::execution_state_from_proto;

pub struct ReporterGrpcApi {
    execution_service: Arc<ExecutionService>,
}

impl ReporterGrpcApi {
    pub fn new(execution_service: Arc<ExecutionService>) -> Self {
        Self { execution_service }
    }
}

#[tonic::async_trait]
impl ReporterServiceTrait for ReporterGrpcApi {
    async fn report(
        &self,
        request: Request<ReportRequest>,
    ) -> Result<Response<ReportResponse>, Status> {
        let Some(state) = request.into_inner().execution_state else {
            return Ok(Response::new(ReportResponse {}));
        };
        let state = execution_state_from_proto(state);
        if let Err(e) = self.execution_service.update_state(state.clone()).await {
            debug!(exec_id = state.id, error = %e, "report rejected, reported OK to caller anyway");
        }
        Ok(Response::new(ReportResponse {}))
    }

    async fn batch_report(
        &self,
        request: Request<BatchReportRequest>,
    ) -> Result<Response<BatchReportResponse>, Status> {
        let states = request
            .into_inner()
            .execution_states
            .into_iter()
            .map(execution_state_from_proto)
            .collect();
        self.execution_service.handle_reports(states).await;
        Ok(Response::new(BatchReportResponse {}))
    }
}
