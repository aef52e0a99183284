//! Action execution against the local controller.
//!
//! The executor turns one ready action into an [`ExecuteRequest`], sends it
//! to the controller over loopback HTTP, and self-heals when the controller
//! reports that the cached work id went away.

use crate::chain::escape_backslashes;
use crate::error::BoosterError;
use async_trait::async_trait;
use distbuild_core::policy::WORK_MISSING_REFRESH_LIMIT;
use distbuild_core::protocol::{
    code, CommandType, ExecuteRequest, ExecuteResponse, RegisterWorkRequest, RegisterWorkResponse,
    ReleaseWorkRequest, SetToolchainRequest, WorkHeartbeatRequest, WorkHeartbeatResponse,
    WorkerChanged,
};
use distbuild_core::{exit, Action, ActionResult, ErrorKind, WorkId};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

/// Payloads longer than this cannot travel on a Windows command line and go
/// through `@file` indirection instead.
pub const MAX_WINDOWS_COMMAND_LENGTH: usize = 32_768;

/// Transport attempts per action before giving up on the controller.
const EXECUTE_TRIES: u32 = 3;

/// First backoff delay; doubles per failed transport attempt (5s, 10s, 20s).
const EXECUTE_BACKOFF: Duration = Duration::from_secs(5);

/// Client view of the controller loopback surface.
#[async_trait]
pub trait ControllerApi: Send + Sync {
    async fn register_work(
        &self,
        req: &RegisterWorkRequest,
    ) -> Result<RegisterWorkResponse, BoosterError>;
    async fn set_toolchain(
        &self,
        work_id: &WorkId,
        req: &SetToolchainRequest,
    ) -> Result<(), BoosterError>;
    async fn heartbeat(
        &self,
        req: &WorkHeartbeatRequest,
    ) -> Result<WorkHeartbeatResponse, BoosterError>;
    async fn execute(&self, req: &ExecuteRequest) -> Result<ExecuteResponse, BoosterError>;
    async fn release_work(&self, req: &ReleaseWorkRequest) -> Result<(), BoosterError>;
}

/// Reqwest-backed [`ControllerApi`] implementation.
pub struct ControllerClient {
    inner: reqwest::Client,
    base_url: String,
}

impl ControllerClient {
    /// Create a client for a controller listening on the given loopback
    /// address, e.g. `http://127.0.0.1:30117`.
    pub fn new(base_url: &str) -> Result<Self, BoosterError> {
        let inner = reqwest::Client::builder()
            .timeout(Duration::from_secs(5))
            .build()?;
        Ok(Self {
            inner,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }

    async fn post_json<B: serde::Serialize, T: serde::de::DeserializeOwned>(
        &self,
        path: &str,
        body: &B,
    ) -> Result<T, BoosterError> {
        let url = format!("{}{}", self.base_url, path);
        debug!(url = %url, "POST request");
        let response = self.inner.post(&url).json(body).send().await?;
        if !response.status().is_success() {
            return Err(BoosterError::Controller(format!(
                "HTTP {}: {}",
                response.status(),
                path
            )));
        }
        Ok(response.json().await?)
    }
}

#[async_trait]
impl ControllerApi for ControllerClient {
    async fn register_work(
        &self,
        req: &RegisterWorkRequest,
    ) -> Result<RegisterWorkResponse, BoosterError> {
        self.post_json("/api/v1/work/register", req).await
    }

    async fn set_toolchain(
        &self,
        work_id: &WorkId,
        req: &SetToolchainRequest,
    ) -> Result<(), BoosterError> {
        let _: serde_json::Value = self
            .post_json(&format!("/api/v1/work/{work_id}/toolchain"), req)
            .await?;
        Ok(())
    }

    async fn heartbeat(
        &self,
        req: &WorkHeartbeatRequest,
    ) -> Result<WorkHeartbeatResponse, BoosterError> {
        self.post_json(&format!("/api/v1/work/{}/heartbeat", req.work_id), req)
            .await
    }

    async fn execute(&self, req: &ExecuteRequest) -> Result<ExecuteResponse, BoosterError> {
        self.post_json(&format!("/api/v1/work/{}/execute", req.work_id), req)
            .await
    }

    async fn release_work(&self, req: &ReleaseWorkRequest) -> Result<(), BoosterError> {
        let _: serde_json::Value = self
            .post_json(&format!("/api/v1/work/{}/release", req.work_id), req)
            .await?;
        Ok(())
    }
}

/// Something that can run one action to completion.
#[async_trait]
pub trait ActionExecutor: Send + Sync {
    async fn execute(&self, action: &Action) -> ActionResult;
}

/// The production executor: dispatches through the controller with retries
/// and work-id self-healing.
pub struct RemoteExecutor {
    api: Arc<dyn ControllerApi>,
    work_id: Mutex<WorkId>,
    toolchain: SetToolchainRequest,
}

impl RemoteExecutor {
    pub fn new(api: Arc<dyn ControllerApi>, work_id: WorkId, toolchain: SetToolchainRequest) -> Self {
        Self {
            api,
            work_id: Mutex::new(work_id),
            toolchain,
        }
    }

    /// The work id currently used for requests.
    pub async fn current_work_id(&self) -> WorkId {
        self.work_id.lock().await.clone()
    }

    /// Swap in the replacement work id from a `WorkerChanged` message tail
    /// and refresh the toolchain registration under the new id.
    async fn heal_work_id(&self, message: &str) -> bool {
        let Some(changed) = WorkerChanged::decode(message) else {
            warn!(message = %message, "work-missing reply without replacement id");
            return false;
        };

        info!(new_work_id = %changed.new_work_id, "controller reassigned work id");
        {
            let mut guard = self.work_id.lock().await;
            *guard = changed.new_work_id.clone();
        }

        if let Err(e) = self
            .api
            .set_toolchain(&changed.new_work_id, &self.toolchain)
            .await
        {
            warn!(error = %e, "toolchain refresh after work id change failed");
        }
        true
    }

    fn build_request(&self, action: &Action, work_id: WorkId) -> ExecuteRequest {
        let (command, command_type) = build_command(action);
        ExecuteRequest {
            work_id,
            action_id: action.index.clone(),
            command,
            workdir: action.workdir.clone(),
            attributes: action.attributes.clone(),
            command_type,
            class: distbuild_core::SlotClass::Exe,
            is_compile: action.is_compile,
        }
    }
}

/// Tokenize an action into argv form. A shell host keeps its argument as a
/// single string; oversized ispc payloads are marked for `@file`
/// indirection; everything else goes through shell-style splitting.
pub fn build_command(action: &Action) -> (Vec<String>, CommandType) {
    let cmd_lower = action.cmd.to_ascii_lowercase();

    if cmd_lower.ends_with("cmd.exe") {
        return (
            vec![action.cmd.clone(), action.arg.clone()],
            CommandType::Default,
        );
    }

    if cmd_lower.ends_with("ispc.exe") && action.arg.len() > MAX_WINDOWS_COMMAND_LENGTH {
        return (
            vec![action.cmd.clone(), action.arg.clone()],
            CommandType::InFile,
        );
    }

    let mut argv = vec![action.cmd.clone()];
    argv.extend(shlex::split(&escape_backslashes(&action.arg)).unwrap_or_default());
    (argv, CommandType::Default)
}

#[async_trait]
impl ActionExecutor for RemoteExecutor {
    async fn execute(&self, action: &Action) -> ActionResult {
        let mut attempts = 0u32;
        let mut transport_fails = 0u32;
        let mut refreshes = 0u32;
        let mut backoff = EXECUTE_BACKOFF;

        loop {
            attempts += 1;
            let req = self.build_request(action, self.current_work_id().await);

            match self.api.execute(&req).await {
                Ok(resp) if resp.code == code::OK => {
                    return ActionResult {
                        index: action.index.clone(),
                        exit_code: resp.exit_code,
                        error: resp.error,
                        stdout: resp.stdout,
                        stderr: resp.stderr,
                        attempts,
                    };
                }
                Ok(resp) if resp.code == code::WORK_NOT_FOUND => {
                    warn!(
                        action = %action.index,
                        attempt = attempts,
                        "controller lost our work id"
                    );
                    if refreshes >= WORK_MISSING_REFRESH_LIMIT
                        || !self.heal_work_id(&resp.message).await
                    {
                        return ActionResult {
                            index: action.index.clone(),
                            exit_code: exit::GENERIC,
                            error: ErrorKind::WorkMissing,
                            stdout: String::new(),
                            stderr: resp.message,
                            attempts,
                        };
                    }
                    refreshes += 1;
                }
                Ok(resp) => {
                    // logical failure; the controller already ran its own
                    // retry/degrade policy, nothing left to do here
                    return ActionResult {
                        index: action.index.clone(),
                        exit_code: resp.exit_code,
                        error: resp.error,
                        stdout: resp.stdout,
                        stderr: resp.stderr,
                        attempts,
                    };
                }
                Err(e) => {
                    transport_fails += 1;
                    warn!(
                        action = %action.index,
                        attempt = attempts,
                        error = %e,
                        "controller request failed"
                    );
                    if transport_fails >= EXECUTE_TRIES {
                        return ActionResult {
                            index: action.index.clone(),
                            exit_code: exit::GENERIC,
                            error: ErrorKind::RemoteExec,
                            stdout: String::new(),
                            stderr: e.to_string(),
                            attempts,
                        };
                    }
                    tokio::time::sleep(backoff).await;
                    backoff *= 2;
                }
            }
        }
    }
}
