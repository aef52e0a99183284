//! Apply settings and controller configuration.

use crate::budget::SlotBudget;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// The per-project apply settings file (`bk_project_setting.json`) dropped
/// next to the booster binary by the build pipeline.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ApplySettings {
    #[serde(rename = "ServerHost")]
    pub server_host: String,

    #[serde(rename = "ProjectID")]
    pub project_id: String,

    #[serde(rename = "BuildID")]
    pub build_id: String,

    #[serde(rename = "Scene")]
    pub scene: String,

    #[serde(rename = "BatchMode")]
    pub batch_mode: bool,

    #[serde(rename = "WorkerList")]
    pub worker_list: Vec<String>,

    #[serde(rename = "LimitPerWorker")]
    pub limit_per_worker: u32,

    #[serde(rename = "MaxLocalTotalJobs")]
    pub max_local_total_jobs: usize,

    #[serde(rename = "MaxLocalPreJobs")]
    pub max_local_pre_jobs: usize,

    #[serde(rename = "MaxLocalExeJobs")]
    pub max_local_exe_jobs: usize,

    #[serde(rename = "MaxLocalPostJobs")]
    pub max_local_post_jobs: usize,

    #[serde(rename = "ResultCacheList")]
    pub result_cache_list: Vec<String>,

    #[serde(rename = "ContinueOnError")]
    pub continue_on_error: bool,

    #[serde(rename = "ControllerIdleRunSeconds")]
    pub controller_idle_run_seconds: Option<u64>,

    #[serde(rename = "ControllerNoBatchWait")]
    pub controller_no_batch_wait: bool,

    #[serde(rename = "ControllerSendCork")]
    pub controller_send_cork: bool,

    #[serde(rename = "ControllerSendFileMemoryLimit")]
    pub controller_send_file_memory_limit: Option<i64>,

    #[serde(rename = "ControllerNetErrorLimit")]
    pub controller_net_error_limit: Option<u32>,

    #[serde(rename = "ControllerRemoteRetryTimes")]
    pub controller_remote_retry_times: Option<u32>,

    #[serde(rename = "ControllerEnableLink")]
    pub controller_enable_link: bool,

    #[serde(rename = "ControllerEnableLib")]
    pub controller_enable_lib: bool,

    #[serde(rename = "ControllerLongTCP")]
    pub controller_long_tcp: bool,

    #[serde(rename = "ControllerDynamicPort")]
    pub controller_dynamic_port: bool,

    #[serde(rename = "ControllerPreferLocal")]
    pub controller_prefer_local: bool,

    #[serde(rename = "Env")]
    pub env: HashMap<String, String>,
}

/// Controller daemon knobs. Field defaults follow the shipped controller:
/// slots derive from the CPU count, an idle controller lingers two minutes
/// before exiting, a worker is dropped after three straight net errors.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ControllerConfig {
    /// Max slots the controller takes from this host; 0 means `ncpu - 2`.
    pub local_slots: usize,
    /// Per-class caps; 0 or anything above `local_slots` means the total.
    pub local_pre_slots: usize,
    pub local_exe_slots: usize,
    pub local_post_slots: usize,

    /// Seconds of idleness after the last work release before self-exit.
    pub remain_time_secs: u64,
    /// Quit immediately once no work is running.
    pub no_wait: bool,

    /// Net errors tolerated before an endpoint is disabled for good.
    pub net_error_limit: u32,
    /// Remote retries allowed before degrading to local.
    pub remote_retry_times: u32,
    /// Local degrade is forbidden; remote exhaustion is a hard failure.
    pub no_local: bool,

    /// Allow link.exe on remote workers.
    pub enable_link: bool,
    /// Allow lib.exe on remote workers.
    pub enable_lib: bool,

    /// Keep long-lived TCP connections to workers.
    pub long_tcp: bool,
    /// Listen on a dynamic loopback port instead of the fixed one.
    pub dynamic_port: bool,
    /// Try the local slots before remote workers.
    pub prefer_local: bool,
    /// Pick the first live worker when no explicit selection is given.
    pub use_default_worker: bool,

    /// Batch small file sends.
    pub send_cork: bool,
    /// Memory budget for corked sends, bytes. 0 means unlimited.
    pub send_file_memory_limit: i64,

    /// Hard bound on one subprocess execution, seconds.
    pub io_timeout_secs: u64,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            local_slots: 0,
            local_pre_slots: 0,
            local_exe_slots: 0,
            local_post_slots: 0,
            remain_time_secs: 120,
            no_wait: false,
            net_error_limit: 3,
            remote_retry_times: 1,
            no_local: false,
            enable_link: false,
            enable_lib: false,
            long_tcp: false,
            dynamic_port: false,
            prefer_local: false,
            use_default_worker: true,
            send_cork: false,
            send_file_memory_limit: 0,
            io_timeout_secs: 300,
        }
    }
}

impl ControllerConfig {
    /// Merge the controller-relevant knobs of an apply settings file over
    /// the defaults, the way the booster hands them to a freshly launched
    /// controller.
    pub fn from_apply(settings: &ApplySettings) -> Self {
        let mut cfg = Self::default();
        cfg.local_slots = settings.max_local_total_jobs;
        cfg.local_pre_slots = settings.max_local_pre_jobs;
        cfg.local_exe_slots = settings.max_local_exe_jobs;
        cfg.local_post_slots = settings.max_local_post_jobs;
        if let Some(secs) = settings.controller_idle_run_seconds {
            cfg.remain_time_secs = secs;
        }
        cfg.no_wait = settings.controller_no_batch_wait;
        if let Some(limit) = settings.controller_net_error_limit {
            cfg.net_error_limit = limit;
        }
        if let Some(times) = settings.controller_remote_retry_times {
            cfg.remote_retry_times = times;
        }
        cfg.enable_link = settings.controller_enable_link;
        cfg.enable_lib = settings.controller_enable_lib;
        cfg.long_tcp = settings.controller_long_tcp;
        cfg.dynamic_port = settings.controller_dynamic_port;
        cfg.prefer_local = settings.controller_prefer_local;
        cfg.send_cork = settings.controller_send_cork;
        if let Some(limit) = settings.controller_send_file_memory_limit {
            cfg.send_file_memory_limit = limit;
        }
        cfg
    }

    /// Resolve the slot budget for this host.
    pub fn slot_budget(&self, ncpu: usize) -> SlotBudget {
        SlotBudget::derive(
            self.local_slots,
            self.local_pre_slots,
            self.local_exe_slots,
            self.local_post_slots,
            ncpu,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let cfg = ControllerConfig::default();
        assert_eq!(cfg.remain_time_secs, 120);
        assert_eq!(cfg.net_error_limit, 3);
        assert_eq!(cfg.remote_retry_times, 1);
        assert!(cfg.use_default_worker);
    }

    #[test]
    fn test_apply_settings_round_trip() {
        let json = r#"{
            "ServerHost": "http://sched.example:30111",
            "ProjectID": "game-x",
            "BuildID": "b-17",
            "Scene": "ue",
            "WorkerList": ["10.0.0.3:31000"],
            "MaxLocalTotalJobs": 8,
            "ControllerRemoteRetryTimes": 2,
            "ControllerPreferLocal": true,
            "Env": {"BK_DIST_LOG_LEVEL": "debug"}
        }"#;
        let settings: ApplySettings = serde_json::from_str(json).unwrap();
        assert_eq!(settings.project_id, "game-x");
        assert_eq!(settings.worker_list.len(), 1);

        let cfg = ControllerConfig::from_apply(&settings);
        assert_eq!(cfg.local_slots, 8);
        assert_eq!(cfg.remote_retry_times, 2);
        assert!(cfg.prefer_local);
        // untouched knobs keep their defaults
        assert_eq!(cfg.net_error_limit, 3);
        assert_eq!(cfg.remain_time_secs, 120);
    }

    #[test]
    fn test_slot_budget_resolution() {
        let mut cfg = ControllerConfig::default();
        cfg.local_slots = 4;
        cfg.local_pre_slots = 2;
        let b = cfg.slot_budget(64);
        assert_eq!(b.total, 4);
        assert_eq!(b.pre, 2);
        assert_eq!(b.exe, 4);
    }
}
