//! Wire DTOs shared by booster, controller and server.
//!
//! The booster talks to its local controller over loopback JSON; the
//! controller and booster talk to the central server over its REST surface.
//! Everything on those wires lives here so both sides agree on one shape.

use crate::budget::SlotClass;
use crate::error::ErrorKind;
use crate::ids::{ActionId, TaskId, WorkId};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Stable result codes carried in response envelopes.
pub mod code {
    pub const OK: i32 = 0;
    pub const INVALID_PARAM: i32 = 1;
    pub const WORK_NOT_FOUND: i32 = 2;
    pub const EXECUTE_FAILED: i32 = 3;
    pub const APPLY_FAILED: i32 = 4;
    pub const TASK_INFO_FAILED: i32 = 5;
    pub const HEARTBEAT_FAILED: i32 = 6;
    pub const RELEASE_FAILED: i32 = 7;
}

// ---------------------------------------------------------------------------
// controller loopback surface
// ---------------------------------------------------------------------------

/// How the dispatcher should deliver the command line.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CommandType {
    /// Plain argv.
    #[default]
    Default,
    /// The argument string is written to a temp file and passed as `@file`,
    /// for payloads beyond the platform command-line limit.
    InFile,
}

/// Register one booster session with the controller.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegisterWorkRequest {
    pub project_id: String,
    pub scene: String,
    pub batch_mode: bool,
    /// Remote worker endpoints in `host:port` form.
    pub worker_list: Vec<String>,
    pub limit_per_worker: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegisterWorkResponse {
    pub work_id: WorkId,
}

/// Toolchain description file fed to the controller after registration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Toolchain {
    #[serde(rename = "Toolchains", default)]
    pub toolchains: Vec<ToolchainEntry>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolchainEntry {
    #[serde(rename = "ToolKey")]
    pub tool_key: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SetToolchainRequest {
    /// Digest of the toolchain content, used to detect stale registration.
    pub digest: String,
    pub toolchain: Toolchain,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkHeartbeatRequest {
    pub work_id: WorkId,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkHeartbeatResponse {
    pub work_id: WorkId,
    pub alive: bool,
}

/// Ask the controller to run one admitted action.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecuteRequest {
    pub work_id: WorkId,
    pub action_id: ActionId,
    /// Full argv including the executable.
    pub command: Vec<String>,
    pub workdir: String,
    #[serde(default)]
    pub attributes: HashMap<String, String>,
    #[serde(default)]
    pub command_type: CommandType,
    #[serde(default = "default_class")]
    pub class: SlotClass,
    /// The action was recognized as a compile; gates remote eligibility.
    #[serde(default)]
    pub is_compile: bool,
}

fn default_class() -> SlotClass {
    SlotClass::Exe
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecuteResponse {
    /// Result code from [`code`]; non-zero means the request itself failed.
    pub code: i32,
    pub exit_code: i32,
    pub error: ErrorKind,
    pub stdout: String,
    pub stderr: String,
    /// Failure detail; for `WORK_NOT_FOUND` carries the replacement work id
    /// in the `msg|{json}` tail format.
    pub message: String,
}

/// Observable state of a work handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkState {
    Registered,
    Active,
    Released,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkStatusResponse {
    pub work_id: WorkId,
    pub state: WorkState,
    pub registered_workers: usize,
    pub alive_workers: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReleaseWorkRequest {
    pub work_id: WorkId,
    pub success: bool,
}

/// Sent to an executor that referenced an obsolete work id; carries the
/// replacement so the executor can self-heal without restarting.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkerChanged {
    pub new_work_id: WorkId,
}

impl WorkerChanged {
    /// Render the `msg|{json}` message tail the executor decodes.
    pub fn encode(&self, msg: &str) -> String {
        let json = serde_json::to_string(self).unwrap_or_default();
        format!("{msg}|{json}")
    }

    /// Decode from a `msg|{json}` message tail, if present.
    pub fn decode(retmsg: &str) -> Option<Self> {
        let (_, tail) = retmsg.split_once('|')?;
        serde_json::from_str(tail).ok()
    }
}

// ---------------------------------------------------------------------------
// server REST surface
// ---------------------------------------------------------------------------

/// Response envelope used by every server endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RestResponse<T> {
    pub code: i32,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<T>,
}

impl<T> RestResponse<T> {
    pub fn ok(data: T) -> Self {
        Self {
            code: code::OK,
            message: String::new(),
            data: Some(data),
        }
    }

    pub fn ok_empty() -> Self {
        Self {
            code: code::OK,
            message: String::new(),
            data: None,
        }
    }

    pub fn error(code: i32, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            data: None,
        }
    }
}

/// Status of a server-side apply task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Staging,
    Running,
    Finished,
    Failed,
}

impl TaskStatus {
    /// True once the task can never serve workers again.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Finished | Self::Failed)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApplyRequest {
    #[serde(rename = "ProjectID")]
    pub project_id: String,
    #[serde(rename = "Scene", default)]
    pub scene: String,
    #[serde(rename = "BuildID", default)]
    pub build_id: String,
    #[serde(rename = "ClientVersion", default)]
    pub client_version: String,
    #[serde(rename = "ClientCPU", default)]
    pub client_cpu: u32,
    #[serde(rename = "Message", default)]
    pub message: String,
    #[serde(rename = "Extra", default)]
    pub extra: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskInfoResponse {
    #[serde(rename = "TaskID")]
    pub task_id: TaskId,
    #[serde(rename = "Status")]
    pub status: TaskStatus,
    #[serde(rename = "HostList")]
    pub host_list: Vec<String>,
    #[serde(rename = "HostNameMap")]
    pub host_name_map: HashMap<String, String>,
    #[serde(rename = "QueueNumber")]
    pub queue_number: usize,
    #[serde(rename = "Message")]
    pub message: String,
    #[serde(rename = "Extra")]
    pub extra: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReleaseTaskRequest {
    #[serde(rename = "TaskID")]
    pub task_id: TaskId,
    #[serde(rename = "Success")]
    pub success: bool,
    #[serde(rename = "Message", default)]
    pub message: String,
    #[serde(rename = "Extra", default)]
    pub extra: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskHeartbeatRequest {
    #[serde(rename = "TaskID")]
    pub task_id: TaskId,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskHeartbeatResponse {
    #[serde(rename = "TaskID")]
    pub task_id: TaskId,
    #[serde(rename = "Type")]
    pub kind: String,
    #[serde(rename = "Status")]
    pub status: TaskStatus,
}

impl TaskHeartbeatResponse {
    /// The pong reply for one heartbeat.
    pub fn pong(task_id: TaskId, status: TaskStatus) -> Self {
        Self {
            task_id,
            kind: "pong".to_string(),
            status,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_worker_changed_round_trip() {
        let changed = WorkerChanged {
            new_work_id: WorkId::new("w-2"),
        };
        let msg = changed.encode("work not found");
        assert!(msg.starts_with("work not found|"));
        let decoded = WorkerChanged::decode(&msg).unwrap();
        assert_eq!(decoded, changed);
    }

    #[test]
    fn test_worker_changed_decode_rejects_plain_message() {
        assert!(WorkerChanged::decode("no tail here").is_none());
        assert!(WorkerChanged::decode("bad|not json").is_none());
    }

    #[test]
    fn test_apply_request_field_names() {
        let json = r#"{"ProjectID": "p1", "Scene": "ue", "BuildID": "b1"}"#;
        let req: ApplyRequest = serde_json::from_str(json).unwrap();
        assert_eq!(req.project_id, "p1");
        assert_eq!(req.scene, "ue");
    }

    #[test]
    fn test_heartbeat_pong() {
        let pong = TaskHeartbeatResponse::pong(TaskId::new("t1"), TaskStatus::Running);
        assert_eq!(pong.kind, "pong");
        let json = serde_json::to_string(&pong).unwrap();
        assert!(json.contains(r#""Type":"pong""#));
    }
}
