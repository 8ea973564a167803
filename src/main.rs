use std::sync::Arc;

use tonic::transport::Server as TonicServer;
use tracing_subscriber::EnvFilter;

use delivery_engine::api;
use delivery_engine::api::grpc::pb::dispatch_service_server::DispatchServiceServer;
use delivery_engine::api::grpc::GrpcDispatchService;
use delivery_engine::config::Config;
use delivery_engine::error::AppError;
use delivery_engine::state::AppState;

#[tokio::main]
async fn main() -> Result<(), AppError> {
    let config = Config::from_env()?;

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::new(config.log_level.clone()))
        .with_target(false)
        .compact()
        .init();

    let grpc_port = config.grpc_port;
    let http_port = config.http_port;
    let shared_state = Arc::new(AppState::new(config));

    let app = api::rest::router(shared_state.clone());

    let grpc_addr = format!("0.0.0.0:{grpc_port}")
        .parse()
        .map_err(|err| AppError::Internal(format!("invalid grpc address: {err}")))?;
    let grpc_service = GrpcDispatchService::new(shared_state.clone());

    tokio::spawn(async move {
        tracing::info!(grpc_port = %grpc_addr, "grpc server started");
        if let Err(err) = TonicServer::builder()
            .add_service(DispatchServiceServer::new(grpc_service))
            .serve_with_shutdown(grpc_addr, shutdown_signal())
            .await
        {
            tracing::error!(error = %err, "grpc server failed");
        }
    });

    let bind_addr = format!("0.0.0.0:{http_port}");
    let listener = tokio::net::TcpListener::bind(&bind_addr)
        .await
        .map_err(|err| AppError::Internal(format!("failed to bind {bind_addr}: {err}")))?;

    tracing::info!(http_port, "http server started");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .map_err(|err| AppError::Internal(format!("server error: {err}")))?;

    Ok(())
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %err, "failed to listen for shutdown signal");
    }
}
