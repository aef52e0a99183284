//! Distbuild Booster
//!
//! Entry point invoked by the build driver. Reads the project settings
//! dropped next to the binary, resolves the action chain, registers a work
//! session with the local controller and drives the DAG to completion.

use std::net::{IpAddr, UdpSocket};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tracing::{info, warn, Level};
use tracing_subscriber::FmtSubscriber;

use distbuild_booster::chain::pick_host_ip;
use distbuild_booster::executor::{ControllerApi, ControllerClient, RemoteExecutor};
use distbuild_booster::graph::GraphOptions;
use distbuild_booster::{ActionChain, ActionGraph, BoosterError, RunOptions, Runner};
use distbuild_core::protocol::{
    RegisterWorkRequest, ReleaseWorkRequest, SetToolchainRequest, Toolchain, WorkHeartbeatRequest,
};
use distbuild_core::{exit, ApplySettings};
use tokio_util::sync::CancellationToken;

/// Settings file the build pipeline drops next to the booster binary.
const PROJECT_SETTING_FILE: &str = "bk_project_setting.json";

/// Loopback port of the controller when dynamic ports are off.
const CONTROLLER_PORT: u16 = 30117;

const HEARTBEAT_TICK: Duration = Duration::from_secs(5);

#[tokio::main]
async fn main() {
    let subscriber = FmtSubscriber::builder()
        .with_max_level(Level::INFO)
        .with_target(true)
        .finish();
    let _ = tracing::subscriber::set_global_default(subscriber);

    let code = match run().await {
        Ok(code) => code,
        Err(e) => {
            warn!(error = %e, "booster failed");
            exit::GENERIC
        }
    };
    std::process::exit(code);
}

async fn run() -> Result<i32, BoosterError> {
    let settings = load_settings()?;
    for (key, value) in &settings.env {
        std::env::set_var(key, value);
    }

    let chain_file = match std::env::var("DISTBUILD_ACTION_CHAIN") {
        Ok(path) if !path.is_empty() && path != "nothing" => path,
        _ => {
            info!("no action chain set, nothing to do");
            return Ok(exit::OK);
        }
    };

    let toolchain = load_toolchain();
    let mut chain = ActionChain::load(&chain_file)?;
    let host_ip = local_addresses().and_then(|addrs| pick_host_ip(&addrs));
    chain.prepare(toolchain.as_ref(), host_ip.as_deref());
    info!(actions = chain.actions.len(), file = %chain_file, "action chain resolved");

    let port = std::env::var("DISTBUILD_CONTROLLER_PORT")
        .ok()
        .and_then(|p| p.parse::<u16>().ok())
        .unwrap_or(CONTROLLER_PORT);
    let api: Arc<dyn ControllerApi> =
        Arc::new(ControllerClient::new(&format!("http://127.0.0.1:{port}"))?);

    let registered = api
        .register_work(&RegisterWorkRequest {
            project_id: settings.project_id.clone(),
            scene: settings.scene.clone(),
            batch_mode: settings.batch_mode,
            worker_list: settings.worker_list.clone(),
            limit_per_worker: settings.limit_per_worker,
        })
        .await?;
    info!(work_id = %registered.work_id, "work registered");

    let toolchain_req = SetToolchainRequest {
        digest: toolchain_digest(&toolchain),
        toolchain: toolchain.unwrap_or_default(),
    };
    api.set_toolchain(&registered.work_id, &toolchain_req).await?;

    let executor = Arc::new(RemoteExecutor::new(
        api.clone(),
        registered.work_id.clone(),
        toolchain_req,
    ));

    // keep the session alive while the run loop works
    let cancel = CancellationToken::new();
    let heartbeat = {
        let api = api.clone();
        let executor = executor.clone();
        let cancel = cancel.clone();
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(HEARTBEAT_TICK);
            loop {
                tokio::select! {
                    _ = tick.tick() => {
                        let work_id = executor.current_work_id().await;
                        if let Err(e) = api.heartbeat(&WorkHeartbeatRequest { work_id }).await {
                            warn!(error = %e, "heartbeat failed");
                        }
                    }
                    _ = cancel.cancelled() => return,
                }
            }
        })
    };

    let opts = GraphOptions {
        most_dependents_first: env_flag("DISTBUILD_MOST_DEPENDENTS_FIRST"),
        continue_on_error: settings.continue_on_error,
    };
    let mut graph = ActionGraph::load(chain.actions, opts)?;

    let mut run_opts = RunOptions {
        continue_on_error: settings.continue_on_error,
        ..Default::default()
    };
    if let Some(max_jobs) = std::env::var("DISTBUILD_MAX_JOBS")
        .ok()
        .and_then(|v| v.parse::<usize>().ok())
    {
        run_opts.max_jobs = max_jobs;
    }

    let runner = Runner::new(run_opts);
    let code = runner.run(&mut graph, executor.clone(), cancel.clone()).await?;

    cancel.cancel();
    let _ = heartbeat.await;

    let work_id = executor.current_work_id().await;
    if let Err(e) = api
        .release_work(&ReleaseWorkRequest {
            work_id,
            success: code == exit::OK,
        })
        .await
    {
        warn!(error = %e, "release failed");
    }

    Ok(code)
}

fn load_settings() -> Result<ApplySettings, BoosterError> {
    let path = exe_dir().join(PROJECT_SETTING_FILE);
    let data = std::fs::read_to_string(&path).map_err(|source| BoosterError::FileRead {
        path: path.display().to_string(),
        source,
    })?;
    let settings: ApplySettings = serde_json::from_str(&data)?;
    info!(project = %settings.project_id, scene = %settings.scene, "settings loaded");
    Ok(settings)
}

fn load_toolchain() -> Option<Toolchain> {
    let path = std::env::var("DISTBUILD_TOOLCHAIN").ok()?;
    let data = std::fs::read_to_string(&path)
        .map_err(|e| warn!(path = %path, error = %e, "toolchain file unreadable"))
        .ok()?;
    serde_json::from_str(&data)
        .map_err(|e| warn!(path = %path, error = %e, "toolchain file undecodable"))
        .ok()
}

fn toolchain_digest(toolchain: &Option<Toolchain>) -> String {
    toolchain
        .as_ref()
        .and_then(|t| t.toolchains.first())
        .map(|entry| entry.tool_key.clone())
        .unwrap_or_default()
}

fn exe_dir() -> PathBuf {
    std::env::current_exe()
        .ok()
        .and_then(|p| p.parent().map(|p| p.to_path_buf()))
        .unwrap_or_else(|| PathBuf::from("."))
}

/// Best-effort local address discovery: route a dummy datagram and read the
/// chosen source address.
fn local_addresses() -> Option<Vec<IpAddr>> {
    let socket = UdpSocket::bind("0.0.0.0:0").ok()?;
    socket.connect("8.8.8.8:80").ok()?;
    let addr = socket.local_addr().ok()?;
    Some(vec![addr.ip()])
}

fn env_flag(key: &str) -> bool {
    std::env::var(key).map(|v| v == "true" || v == "1").unwrap_or(false)
}
