//! Server REST surface.
//!
//! Provides endpoints for:
//! - Apply (`/v2/build/apply`)
//! - Task query (`/v2/build/task?task_id=`)
//! - Heartbeat (`/v2/build/heartbeat`)
//! - Release (`/v2/build/release`)
//! - Health check (`/v2/health`)
//!
//! Every reply rides the `{code, message, data}` envelope.

use std::collections::HashMap;
use std::sync::Arc;

use axum::{
    extract::{Query, State},
    routing::{get, post},
    Json, Router,
};
use tracing::{info, warn};

use distbuild_core::protocol::{
    code, ApplyRequest, ReleaseTaskRequest, RestResponse, TaskHeartbeatRequest,
    TaskHeartbeatResponse, TaskInfoResponse, TaskStatus,
};
use distbuild_core::TaskId;

use crate::tasks::{Task, TaskManager};

/// Shared state behind the server handlers.
pub struct ServerState {
    pub tasks: Arc<TaskManager>,
}

/// Create the HTTP router.
pub fn create_router(state: Arc<ServerState>) -> Router {
    Router::new()
        .route("/v2/build/apply", post(apply_resource))
        .route("/v2/build/task", get(query_task_info))
        .route("/v2/build/heartbeat", post(update_heartbeat))
        .route("/v2/build/release", post(release_resource))
        .route("/v2/health", get(health_check))
        .with_state(state)
}

async fn health_check() -> Json<RestResponse<()>> {
    Json(RestResponse::ok_empty())
}

async fn task_info(state: &ServerState, id: &TaskId) -> Result<TaskInfoResponse, String> {
    let task = state.tasks.get_task(id).await.map_err(|e| e.to_string())?;
    let queue_number = if task.status == TaskStatus::Staging {
        state.tasks.task_rank(id).await
    } else {
        0
    };
    Ok(build_task_info(&task, queue_number))
}

fn build_task_info(task: &Task, queue_number: usize) -> TaskInfoResponse {
    TaskInfoResponse {
        task_id: task.id.clone(),
        status: task.status,
        host_list: task.host_list.clone(),
        host_name_map: task.host_name_map.clone(),
        queue_number,
        message: task.message.clone(),
        extra: String::new(),
    }
}

async fn apply_resource(
    State(state): State<Arc<ServerState>>,
    Json(param): Json<ApplyRequest>,
) -> Json<RestResponse<TaskInfoResponse>> {
    let task = match state.tasks.create_task(&param).await {
        Ok(task) => task,
        Err(e) => {
            warn!(project = %param.project_id, error = %e, "apply failed");
            return Json(RestResponse::error(code::APPLY_FAILED, e.to_string()));
        }
    };

    match task_info(&state, &task.id).await {
        Ok(info) => {
            info!(task_id = %task.id, project = %task.project_id, "apply accepted");
            Json(RestResponse::ok(info))
        }
        Err(message) => Json(RestResponse::error(code::TASK_INFO_FAILED, message)),
    }
}

async fn query_task_info(
    State(state): State<Arc<ServerState>>,
    Query(params): Query<HashMap<String, String>>,
) -> Json<RestResponse<TaskInfoResponse>> {
    let Some(task_id) = params.get("task_id").filter(|v| !v.is_empty()) else {
        return Json(RestResponse::error(
            code::INVALID_PARAM,
            "task_id no specific",
        ));
    };

    match task_info(&state, &TaskId::new(task_id.clone())).await {
        Ok(info) => Json(RestResponse::ok(info)),
        Err(message) => Json(RestResponse::error(code::TASK_INFO_FAILED, message)),
    }
}

async fn update_heartbeat(
    State(state): State<Arc<ServerState>>,
    Json(param): Json<TaskHeartbeatRequest>,
) -> Json<RestResponse<TaskHeartbeatResponse>> {
    match state.tasks.update_heartbeat(&param.task_id).await {
        Ok(status) => Json(RestResponse::ok(TaskHeartbeatResponse::pong(
            param.task_id,
            status,
        ))),
        Err(e) => {
            warn!(task_id = %param.task_id, error = %e, "heartbeat failed");
            Json(RestResponse::error(code::HEARTBEAT_FAILED, e.to_string()))
        }
    }
}

async fn release_resource(
    State(state): State<Arc<ServerState>>,
    Json(param): Json<ReleaseTaskRequest>,
) -> Json<RestResponse<()>> {
    match state.tasks.release_task(&param.task_id, param.success).await {
        Ok(()) => {
            info!(task_id = %param.task_id, "released");
            Json(RestResponse::ok_empty())
        }
        // repeat or unknown release: report the message, keep the code ok
        Err(e) if e.is_benign_release() => Json(RestResponse {
            code: code::OK,
            message: e.to_string(),
            data: None,
        }),
        Err(e) => {
            warn!(task_id = %param.task_id, error = %e, "release failed");
            Json(RestResponse::error(code::RELEASE_FAILED, e.to_string()))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tasks::ServerConfig;
    use async_trait::async_trait;
    use distbuild_operator::{
        LaunchParam, NodeInfo, Operator, OperatorError, ServiceInfo, ServiceStatus,
    };

    struct StubOperator;

    #[async_trait]
    impl Operator for StubOperator {
        async fn get_resource(&self, _cluster_id: &str) -> Result<Vec<NodeInfo>, OperatorError> {
            Ok(Vec::new())
        }

        async fn launch_server(
            &self,
            _cluster_id: &str,
            _param: LaunchParam,
        ) -> Result<(), OperatorError> {
            Ok(())
        }

        async fn get_server_status(
            &self,
            _cluster_id: &str,
            _namespace: &str,
            _name: &str,
        ) -> Result<ServiceInfo, OperatorError> {
            Ok(ServiceInfo {
                status: ServiceStatus::Staging,
                request_instances: 1,
                current_instances: 0,
                available_endpoints: Vec::new(),
            })
        }

        async fn release_server(
            &self,
            _cluster_id: &str,
            _namespace: &str,
            _name: &str,
        ) -> Result<(), OperatorError> {
            Ok(())
        }
    }

    fn state() -> Arc<ServerState> {
        Arc::new(ServerState {
            tasks: TaskManager::new(ServerConfig::default(), Arc::new(StubOperator)),
        })
    }

    fn apply() -> ApplyRequest {
        ApplyRequest {
            project_id: "p1".to_string(),
            scene: "ue".to_string(),
            build_id: "b1".to_string(),
            client_version: "1".to_string(),
            client_cpu: 8,
            message: String::new(),
            extra: String::new(),
        }
    }

    #[tokio::test]
    async fn test_apply_returns_staging_task_with_rank() {
        let state = state();
        let resp = apply_resource(State(state.clone()), Json(apply())).await;
        assert_eq!(resp.0.code, code::OK);
        let info = resp.0.data.unwrap();
        assert_eq!(info.status, TaskStatus::Staging);
        assert_eq!(info.queue_number, 1);
    }

    #[tokio::test]
    async fn test_heartbeat_pong() {
        let state = state();
        let info = apply_resource(State(state.clone()), Json(apply()))
            .await
            .0
            .data
            .unwrap();

        let resp = update_heartbeat(
            State(state.clone()),
            Json(TaskHeartbeatRequest {
                task_id: info.task_id.clone(),
            }),
        )
        .await;
        assert_eq!(resp.0.code, code::OK);
        let pong = resp.0.data.unwrap();
        assert_eq!(pong.kind, "pong");
        assert_eq!(pong.task_id, info.task_id);
    }

    #[tokio::test]
    async fn test_release_twice_both_succeed() {
        let state = state();
        let info = apply_resource(State(state.clone()), Json(apply()))
            .await
            .0
            .data
            .unwrap();

        let release = ReleaseTaskRequest {
            task_id: info.task_id.clone(),
            success: true,
            message: String::new(),
            extra: String::new(),
        };
        let first = release_resource(State(state.clone()), Json(release.clone())).await;
        assert_eq!(first.0.code, code::OK);

        let second = release_resource(State(state.clone()), Json(release)).await;
        assert_eq!(second.0.code, code::OK);
        assert_eq!(second.0.message, "task is already terminated");
    }

    #[tokio::test]
    async fn test_query_requires_task_id() {
        let state = state();
        let resp = query_task_info(State(state), Query(HashMap::new())).await;
        assert_eq!(resp.0.code, code::INVALID_PARAM);
    }
}
