//! Work-handle management.
//!
//! Every booster session gets a work handle at registration. Heartbeats
//! push its deadline forward; a reaper cancels and removes handles whose
//! booster went away. Once the last handle is released the controller
//! lingers `remain_time_secs` and then shuts itself down.

use crate::error::ControllerError;
use crate::workers::WorkerRegistry;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use distbuild_core::protocol::{RegisterWorkRequest, WorkState, WorkStatusResponse};
use distbuild_core::{ControllerConfig, WorkId};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// A booster missing heartbeats for this long is considered gone.
pub const WORK_HEARTBEAT_TIMEOUT_SECS: i64 = 60;

/// Reaper scan period.
pub const REAP_INTERVAL_SECS: u64 = 5;

/// One registered booster session.
pub struct WorkEntry {
    pub id: WorkId,
    pub project_id: String,
    pub scene: String,
    pub state: WorkState,
    pub toolchain_digest: Option<String>,
    pub heartbeat_deadline: DateTime<Utc>,
    pub cancel: CancellationToken,
    pub registry: Arc<WorkerRegistry>,
}

/// Owner of all work handles in this controller.
pub struct WorkManager {
    cfg: ControllerConfig,
    works: RwLock<HashMap<WorkId, WorkEntry>>,
    /// The most recently registered work, offered as the replacement id to
    /// executors that reference a reaped session.
    current: RwLock<Option<WorkId>>,
    idle_epoch: AtomicU64,
    shutdown: CancellationToken,
}

impl WorkManager {
    pub fn new(cfg: ControllerConfig) -> Arc<Self> {
        Arc::new(Self {
            cfg,
            works: RwLock::new(HashMap::new()),
            current: RwLock::new(None),
            idle_epoch: AtomicU64::new(0),
            shutdown: CancellationToken::new(),
        })
    }

    /// Token cancelled when the controller should exit.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Register a new booster session and hand back its work id.
    pub async fn register(self: &Arc<Self>, req: &RegisterWorkRequest) -> WorkId {
        let work_id = WorkId::generate();
        let registry = Arc::new(WorkerRegistry::from_list(
            &req.worker_list,
            self.cfg.net_error_limit,
            req.limit_per_worker,
        ));

        let entry = WorkEntry {
            id: work_id.clone(),
            project_id: req.project_id.clone(),
            scene: req.scene.clone(),
            state: WorkState::Registered,
            toolchain_digest: None,
            heartbeat_deadline: Utc::now() + ChronoDuration::seconds(WORK_HEARTBEAT_TIMEOUT_SECS),
            cancel: CancellationToken::new(),
            registry,
        };

        self.idle_epoch.fetch_add(1, Ordering::SeqCst);
        self.works.write().await.insert(work_id.clone(), entry);
        *self.current.write().await = Some(work_id.clone());

        info!(
            work_id = %work_id,
            project = %req.project_id,
            workers = req.worker_list.len(),
            "registered work"
        );
        work_id
    }

    /// Record the toolchain registration for a session.
    pub async fn set_toolchain(&self, id: &WorkId, digest: String) -> Result<(), ControllerError> {
        let mut works = self.works.write().await;
        let entry = works
            .get_mut(id)
            .ok_or_else(|| ControllerError::WorkNotFound(id.clone()))?;
        entry.toolchain_digest = Some(digest);
        Ok(())
    }

    /// Push the heartbeat deadline forward.
    pub async fn heartbeat(&self, id: &WorkId) -> Result<(), ControllerError> {
        let mut works = self.works.write().await;
        let entry = works
            .get_mut(id)
            .ok_or_else(|| ControllerError::WorkNotFound(id.clone()))?;
        entry.heartbeat_deadline = Utc::now() + ChronoDuration::seconds(WORK_HEARTBEAT_TIMEOUT_SECS);
        Ok(())
    }

    /// Resolve a session for dispatch, flipping it to Active. Returns the
    /// pieces the dispatcher needs without holding the map lock.
    pub async fn resolve(
        &self,
        id: &WorkId,
    ) -> Result<(Arc<WorkerRegistry>, CancellationToken), ControllerError> {
        let mut works = self.works.write().await;
        let entry = works
            .get_mut(id)
            .ok_or_else(|| ControllerError::WorkNotFound(id.clone()))?;
        entry.state = WorkState::Active;
        Ok((entry.registry.clone(), entry.cancel.clone()))
    }

    /// Status snapshot for one session.
    pub async fn status(&self, id: &WorkId) -> Result<WorkStatusResponse, ControllerError> {
        let works = self.works.read().await;
        let entry = works
            .get(id)
            .ok_or_else(|| ControllerError::WorkNotFound(id.clone()))?;
        Ok(WorkStatusResponse {
            work_id: entry.id.clone(),
            state: entry.state,
            registered_workers: entry.registry.total_count(),
            alive_workers: entry.registry.live_count(),
        })
    }

    /// Release a session. Unknown ids are fine; release is idempotent.
    pub async fn release(self: &Arc<Self>, id: &WorkId, success: bool) {
        let removed = {
            let mut works = self.works.write().await;
            works.remove(id)
        };
        match removed {
            Some(entry) => {
                entry.cancel.cancel();
                info!(work_id = %id, success, "released work");
            }
            None => {
                info!(work_id = %id, "release for unknown work, nothing to do");
            }
        }

        let empty = self.works.read().await.is_empty();
        {
            let mut current = self.current.write().await;
            if current.as_ref() == Some(id) && empty {
                *current = None;
            }
        }

        self.maybe_start_idle_timer().await;
    }

    /// The replacement work id handed to executors holding a stale one.
    pub async fn current_work_id(&self) -> Option<WorkId> {
        self.current.read().await.clone()
    }

    /// Cancel and remove sessions whose heartbeat deadline passed. Returns
    /// the reaped ids.
    pub async fn reap_expired(self: &Arc<Self>, now: DateTime<Utc>) -> Vec<WorkId> {
        let mut reaped = Vec::new();
        {
            let mut works = self.works.write().await;
            let expired: Vec<WorkId> = works
                .iter()
                .filter(|(_, e)| e.heartbeat_deadline < now)
                .map(|(id, _)| id.clone())
                .collect();
            for id in expired {
                if let Some(entry) = works.remove(&id) {
                    entry.cancel.cancel();
                    warn!(work_id = %id, "reaped work after missed heartbeats");
                    reaped.push(id);
                }
            }
        }
        if !reaped.is_empty() {
            self.maybe_start_idle_timer().await;
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

    /// When no work remains, arm the remain-time timer (or exit straight
    /// away under `no_wait`). A new registration invalidates the timer.
    async fn maybe_start_idle_timer(self: &Arc<Self>) {
        if !self.works.read().await.is_empty() {
            return;
        }
        if self.cfg.no_wait {
            info!("no work left and no_wait set, shutting down");
            self.shutdown.cancel();
            return;
        }

        let epoch = self.idle_epoch.load(Ordering::SeqCst);
        let manager = self.clone();
        let remain = Duration::from_secs(self.cfg.remain_time_secs);
        tokio::spawn(async move {
            tokio::time::sleep(remain).await;
            if manager.idle_epoch.load(Ordering::SeqCst) == epoch
                && manager.works.read().await.is_empty()
            {
                info!(
                    remain_secs = remain.as_secs(),
                    "idle past remain time, shutting down"
                );
                manager.shutdown.cancel();
            }
        });
    }
}
