//! Distbuild Server

use std::net::SocketAddr;
use std::sync::Arc;

use tracing::{info, Level};
use tracing_subscriber::FmtSubscriber;

use distbuild_operator::{ClusterOperator, OperatorConfig, RestClusterFactory};
use distbuild_server::{create_router, ServerConfig, ServerState, TaskManager};

/// Default REST port.
const SERVER_PORT: u16 = 30111;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize tracing
    let subscriber = FmtSubscriber::builder()
        .with_max_level(Level::INFO)
        .with_target(true)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    let mut operator_conf = OperatorConfig::default();
    if let Ok(path) = std::env::var("DISTBUILD_OPERATOR_TEMPLATE") {
        operator_conf.template = std::fs::read_to_string(&path)?;
    }
    let operator = Arc::new(ClusterOperator::new(
        operator_conf.clone(),
        Arc::new(RestClusterFactory::new(operator_conf)),
    ));

    let tasks = TaskManager::new(ServerConfig::default(), operator);
    tasks.spawn_reaper();
    let shutdown = tasks.shutdown_token();

    let state = Arc::new(ServerState { tasks });
    let addr: SocketAddr = format!("0.0.0.0:{SERVER_PORT}").parse()?;
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!(addr = %listener.local_addr()?, "server listening");

    axum::serve(listener, create_router(state))
        .with_graceful_shutdown(async move {
            tokio::select! {
                _ = shutdown.cancelled() => info!("shutdown requested"),
                _ = tokio::signal::ctrl_c() => info!("interrupted"),
            }
        })
        .await?;

    Ok(())
}
