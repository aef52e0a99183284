//! Distbuild Controller Daemon

use std::net::SocketAddr;

use tracing::{info, Level};
use tracing_subscriber::FmtSubscriber;

use distbuild_controller::{create_router, ControllerState, CONTROLLER_PORT};
use distbuild_core::ControllerConfig;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize tracing
    let subscriber = FmtSubscriber::builder()
        .with_max_level(Level::INFO)
        .with_target(true)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    let config = ControllerConfig::default();
    let port = if config.dynamic_port {
        0
    } else {
        CONTROLLER_PORT
    };
    let addr: SocketAddr = format!("127.0.0.1:{port}").parse()?;

    let state = ControllerState::new(config);
    state.works.spawn_reaper();
    let shutdown = state.works.shutdown_token();

    let listener = tokio::net::TcpListener::bind(addr).await?;
    let local_addr = listener.local_addr()?;
    info!(
        addr = %local_addr,
        budget = ?state.pool.budget(),
        "controller listening"
    );

    let router = create_router(state);
    axum::serve(listener, router)
        .with_graceful_shutdown(async move {
            tokio::select! {
                _ = shutdown.cancelled() => info!("idle shutdown"),
                _ = tokio::signal::ctrl_c() => info!("interrupted"),
            }
        })
        .await?;

    Ok(())
}
