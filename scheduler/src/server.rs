use std::net::{Ipv4Addr, SocketAddrV4};

use poem::endpoint::PrometheusExporter;
use poem::listener::TcpListener;
use scheduler::config::{load_config, SchedulerConfig};
use scheduler::service::Services;
use scheduler::{grpcapi, tracing_init};
use tokio::select;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

fn main() -> Result<(), std::io::Error> {
    tracing_init::init();

    let config = load_config().map_err(|e| std::io::Error::other(format!("config error: {e}")))?;

    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?
        .block_on(async_main(config))
}

async fn async_main(config: SchedulerConfig) -> Result<(), std::io::Error> {
    info!(
        grpc_port = config.grpc_port,
        metrics_port = config.metrics_port,
        environment = %config.environment,
        "starting scheduler node"
    );

    let services = Services::new(&config).await.map_err(|e| {
        error!("service init failed: {}", e);
        std::io::Error::other(e)
    })?;

    let cancel = CancellationToken::new();
    let completion_receiver = services.take_completion_receiver().await;

    let schedule_loop = tokio::spawn({
        let scheduler = services.scheduler.clone();
        let cancel = cancel.clone();
        async move { scheduler.run_schedule_loop(cancel).await }
    });
    let renew_loop = tokio::spawn({
        let scheduler = services.scheduler.clone();
        let cancel = cancel.clone();
        async move { scheduler.run_renew_loop(cancel).await }
    });
    let retry_loop = tokio::spawn({
        let compensator = services.retry_compensator.clone();
        let cancel = cancel.clone();
        async move { compensator.run(cancel).await }
    });
    let reschedule_loop = tokio::spawn({
        let compensator = services.reschedule_compensator.clone();
        let cancel = cancel.clone();
        async move { compensator.run(cancel).await }
    });
    let interrupt_loop = tokio::spawn({
        let compensator = services.interrupt_compensator.clone();
        let cancel = cancel.clone();
        async move { compensator.run(cancel).await }
    });
    let completion_loop = tokio::spawn({
        let consumer = services.completion_consumer.clone();
        let cancel = cancel.clone();
        async move { consumer.run(completion_receiver, cancel).await }
    });

    let grpc_server = tokio::spawn({
        let execution_service = services.execution_service.clone();
        let addr = SocketAddrV4::new(Ipv4Addr::new(0, 0, 0, 0), config.grpc_port).into();
        async move {
            grpcapi::start_grpc_server(addr, execution_service)
                .await
                .expect("gRPC server failed");
        }
    });

    let metrics_server = tokio::spawn({
        let registry = services.metrics_registry.clone();
        let metrics_port = config.metrics_port;
        async move {
            let app = poem::Route::new().nest("/metrics", PrometheusExporter::new(registry));
            poem::Server::new(TcpListener::bind(format!("0.0.0.0:{metrics_port}")))
                .run(app)
                .await
                .expect("metrics server failed");
        }
    });

    select! {
        _ = tokio::signal::ctrl_c() => {
            info!("shutdown signal received");
            cancel.cancel();
        }
        _ = schedule_loop => {}
        _ = grpc_server => {}
        _ = metrics_server => {}
    }

    cancel.cancel();
    for handle in [renew_loop, retry_loop, reschedule_loop, interrupt_loop, completion_loop] {
        let _ = handle.await;
    }

    Ok(())
}
