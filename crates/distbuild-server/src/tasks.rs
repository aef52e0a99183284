//! Task management.
//!
//! One apply request becomes one task backed by one worker service. Task
//! status is recomputed from the operator on every query; heartbeats keep
//! the task alive and a reaper releases tasks whose booster disappeared.

use crate::error::ServerError;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use distbuild_core::protocol::{ApplyRequest, TaskStatus};
use distbuild_core::TaskId;
use distbuild_operator::{
    LaunchParam, Operator, ServiceStatus, ATTRIBUTE_KEY_CITY, ATTRIBUTE_KEY_PLATFORM,
};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// A task missing heartbeats for this long gets released.
pub const TASK_HEARTBEAT_TIMEOUT_SECS: i64 = 30;

/// Reaper scan period.
pub const REAP_INTERVAL_SECS: u64 = 5;

/// Logical port the worker serves compile traffic on.
pub const SERVICE_PORT_NAME: &str = "SERVICE_PORT";
/// Logical port for worker stats.
pub const STATS_PORT_NAME: &str = "STATS_PORT";

/// Static server-side scheduling config.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Cluster every task's service lands on.
    pub cluster_id: String,
    /// Namespace for worker services.
    pub namespace: String,
    /// Worker container image.
    pub image: String,
    /// City selector required by the operator.
    pub city: String,
    /// Platform selector for the workers.
    pub platform: String,
    /// CPU one worker instance covers; sizes the instance count.
    pub cpu_per_instance: f64,
    /// Ceiling on instances per task.
    pub max_instance: usize,
    /// Bound on one cluster apply call.
    pub resource_timeout_secs: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            cluster_id: "default".to_string(),
            namespace: "distbuild".to_string(),
            image: "distbuild/worker:latest".to_string(),
            city: "default".to_string(),
            platform: "linux".to_string(),
            cpu_per_instance: 8.0,
            max_instance: 16,
            resource_timeout_secs: 60,
        }
    }
}

/// One accepted apply request.
#[derive(Debug, Clone)]
pub struct Task {
    pub id: TaskId,
    /// Composite `project?scene` identity.
    pub project_id: String,
    pub build_id: String,
    pub client_version: String,
    pub client_cpu: u32,
    pub status: TaskStatus,
    pub message: String,
    /// Name of the worker service backing this task.
    pub service_name: String,
    pub requested_instances: usize,
    pub host_list: Vec<String>,
    pub host_name_map: HashMap<String, String>,
    pub created_at: DateTime<Utc>,
    pub heartbeat_deadline: DateTime<Utc>,
}

impl Task {
    fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }
}

/// Resolve the composite project identity for a scene.
pub fn project_id_with_scene(project_id: &str, scene: &str) -> String {
    if scene.is_empty() {
        project_id.to_string()
    } else {
        format!("{project_id}?{scene}")
    }
}

/// Owner of all live and terminal tasks.
pub struct TaskManager {
    conf: ServerConfig,
    operator: Arc<dyn Operator>,
    tasks: RwLock<HashMap<TaskId, Task>>,
    /// Apply order, for queue ranks while staging.
    queue: RwLock<Vec<TaskId>>,
    shutdown: CancellationToken,
}

impl TaskManager {
    pub fn new(conf: ServerConfig, operator: Arc<dyn Operator>) -> Arc<Self> {
        Arc::new(Self {
            conf,
            operator,
            tasks: RwLock::new(HashMap::new()),
            queue: RwLock::new(Vec::new()),
            shutdown: CancellationToken::new(),
        })
    }

    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Accept one apply request: launch the backing service and record the
    /// task as staging.
    pub async fn create_task(&self, param: &ApplyRequest) -> Result<Task, ServerError> {
        if param.project_id.is_empty() {
            return Err(ServerError::InvalidParam("empty project id".to_string()));
        }

        let id = TaskId::generate();
        let service_name = format!("distbuild-{}", &id.as_str()[..8]);
        let instance = instance_count(
            param.client_cpu,
            self.conf.cpu_per_instance,
            self.conf.max_instance,
        );

        let mut launch = LaunchParam {
            name: service_name.clone(),
            namespace: self.conf.namespace.clone(),
            image: self.conf.image.clone(),
            instance,
            ..Default::default()
        };
        launch
            .ports
            .insert(SERVICE_PORT_NAME.to_string(), "tcp".to_string());
        launch
            .ports
            .insert(STATS_PORT_NAME.to_string(), "tcp".to_string());
        launch
            .attribute_condition
            .insert(ATTRIBUTE_KEY_CITY.to_string(), self.conf.city.clone());
        launch.attribute_condition.insert(
            ATTRIBUTE_KEY_PLATFORM.to_string(),
            self.conf.platform.clone(),
        );

        tokio::time::timeout(
            Duration::from_secs(self.conf.resource_timeout_secs),
            self.operator.launch_server(&self.conf.cluster_id, launch),
        )
        .await
        .map_err(|_| ServerError::ResourceTimeout(self.conf.resource_timeout_secs))??;

        let task = Task {
            id: id.clone(),
            project_id: project_id_with_scene(&param.project_id, &param.scene),
            build_id: param.build_id.clone(),
            client_version: param.client_version.clone(),
            client_cpu: param.client_cpu,
            status: TaskStatus::Staging,
            message: String::new(),
            service_name,
            requested_instances: instance,
            host_list: Vec::new(),
            host_name_map: HashMap::new(),
            created_at: Utc::now(),
            heartbeat_deadline: Utc::now()
                + ChronoDuration::seconds(TASK_HEARTBEAT_TIMEOUT_SECS),
        };

        info!(
            task_id = %task.id,
            project = %task.project_id,
            instances = instance,
            "task created"
        );
        self.tasks.write().await.insert(id.clone(), task.clone());
        self.queue.write().await.push(id);
        Ok(task)
    }

    /// Fetch a task, refreshing a staging task from the operator's observed
    /// service state.
    pub async fn get_task(&self, id: &TaskId) -> Result<Task, ServerError> {
        let task = {
            let tasks = self.tasks.read().await;
            tasks
                .get(id)
                .cloned()
                .ok_or_else(|| ServerError::TaskNotFound(id.to_string()))?
        };
        if task.is_terminal() {
            return Ok(task);
        }

        let info = self
            .operator
            .get_server_status(&self.conf.cluster_id, &self.conf.namespace, &task.service_name)
            .await?;

        let mut tasks = self.tasks.write().await;
        let task = tasks
            .get_mut(id)
            .ok_or_else(|| ServerError::TaskNotFound(id.to_string()))?;
        match info.status {
            ServiceStatus::Running => {
                task.status = TaskStatus::Running;
                task.host_list = info
                    .available_endpoints
                    .iter()
                    .filter_map(|e| {
                        e.ports
                            .get(SERVICE_PORT_NAME)
                            .map(|port| format!("{}:{port}", e.ip))
                    })
                    .collect();
                task.host_name_map = info
                    .available_endpoints
                    .iter()
                    .map(|e| (e.ip.clone(), e.name.clone()))
                    .collect();
            }
            ServiceStatus::Staging => task.status = TaskStatus::Staging,
        }
        Ok(task.clone())
    }

    /// Rank of a staging task among all staging tasks, 1-based. Zero for
    /// anything already running.
    pub async fn task_rank(&self, id: &TaskId) -> usize {
        let tasks = self.tasks.read().await;
        let queue = self.queue.read().await;
        let mut rank = 0;
        for queued in queue.iter() {
            let Some(task) = tasks.get(queued) else {
                continue;
            };
            if task.status != TaskStatus::Staging {
                continue;
            }
            rank += 1;
            if queued == id {
                return rank;
            }
        }
        0
    }

    /// Refresh the heartbeat deadline and report the current status.
    pub async fn update_heartbeat(&self, id: &TaskId) -> Result<TaskStatus, ServerError> {
        let mut tasks = self.tasks.write().await;
        let task = tasks
            .get_mut(id)
            .ok_or_else(|| ServerError::TaskNotFound(id.to_string()))?;
        task.heartbeat_deadline =
            Utc::now() + ChronoDuration::seconds(TASK_HEARTBEAT_TIMEOUT_SECS);
        Ok(task.status)
    }

    /// Release a task: tear down its service and mark it terminal. Both
    /// repeat-release and releasing an unknown id are benign.
    pub async fn release_task(&self, id: &TaskId, success: bool) -> Result<(), ServerError> {
        let service_name = {
            let tasks = self.tasks.read().await;
            match tasks.get(id) {
                None => return Err(ServerError::UnterminatedTaskNotFound),
                Some(task) if task.is_terminal() => {
                    return Err(ServerError::TaskAlreadyTerminated)
                }
                Some(task) => task.service_name.clone(),
            }
        };

        self.operator
            .release_server(&self.conf.cluster_id, &self.conf.namespace, &service_name)
            .await?;

        let mut tasks = self.tasks.write().await;
        if let Some(task) = tasks.get_mut(id) {
            task.status = if success {
                TaskStatus::Finished
            } else {
                TaskStatus::Failed
            };
        }
        self.queue.write().await.retain(|queued| queued != id);
        info!(task_id = %id, success, "task released");
        Ok(())
    }

    /// Release tasks whose heartbeat deadline passed. Returns released ids.
    pub async fn reap_expired(&self, now: DateTime<Utc>) -> Vec<TaskId> {
        let expired: Vec<TaskId> = {
            let tasks = self.tasks.read().await;
            tasks
                .values()
                .filter(|t| !t.is_terminal() && t.heartbeat_deadline < now)
                .map(|t| t.id.clone())
                .collect()
        };

        let mut reaped = Vec::new();
        for id in expired {
            warn!(task_id = %id, "task missed heartbeats, releasing");
            match self.release_task(&id, false).await {
                Ok(()) => reaped.push(id),
                Err(e) if e.is_benign_release() => reaped.push(id),
                Err(e) => warn!(task_id = %id, error = %e, "failed to reap task"),
            }
        }
        reaped
    }

    /// Periodic reaper; runs until shutdown.
    pub fn spawn_reaper(self: &Arc<Self>) {
        let manager = self.clone();
        let shutdown = self.shutdown.clone();
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(Duration::from_secs(REAP_INTERVAL_SECS));
            loop {
                tokio::select! {
                    _ = tick.tick() => {
                        manager.reap_expired(Utc::now()).await;
                    }
                    _ = shutdown.cancelled() => return,
                }
            }
        });
    }
}

/// How many instances one task gets for its client CPU count.
fn instance_count(client_cpu: u32, cpu_per_instance: f64, max_instance: usize) -> usize {
    if cpu_per_instance <= 0.0 {
        return 1;
    }
    let wanted = (client_cpu as f64 / cpu_per_instance).ceil() as usize;
    wanted.clamp(1, max_instance.max(1))
}
