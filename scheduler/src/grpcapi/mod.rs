//! External gRPC surface (spec.md §6): `ReporterService` runs under the RPC
//! framework's own thread pool with health + reflection, grounded on
//! `cloud-component-service/src/grpcapi/mod.rs`'s server-bootstrap idiom.

mod reporter;

use std::net::SocketAddr;
use std::sync::Arc;

use scheduler_proto::proto;
use scheduler_proto::proto::scheduler::v1::reporter_service_server::ReporterServiceServer;
use tonic::codec::CompressionEncoding;
use tonic::transport::{Error, Server};

pub use reporter::ReporterGrpcApi;

use crate::service::execution::ExecutionService;

pub async fn start_grpc_server(
    addr: SocketAddr,
    execution_service: Arc<ExecutionService>,
) -> Result<(), Error> {
    let (mut health_reporter, health_service) = tonic_health::server::health_reporter();
    health_reporter
        .set_serving::<ReporterServiceServer<ReporterGrpcApi>>()
        .await;

    let reflection_service = tonic_reflection::server::Builder::configure()
        .register_encoded_file_descriptor_set(proto::FILE_DESCRIPTOR_SET)
        .build_v1()
        .unwrap();

    Server::builder()
        .add_service(reflection_service)
        .add_service(health_service)
        .add_service(
            ReporterServiceServer::new(ReporterGrpcApi::new(execution_service))
                .send_compressed(CompressionEncoding::Gzip)
                .accept_compressed(CompressionEncoding::Gzip),
        )
        .serve(addr)
        .await
}
