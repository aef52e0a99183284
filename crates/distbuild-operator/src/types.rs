//! Operator-side domain types.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Per-node (or per-selector, in federation mode) capacity report.
/// CPU is in cores, memory in MB, disk in bytes.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NodeInfo {
    pub ip: String,
    pub hostname: String,
    pub cpu_total: f64,
    pub cpu_used: f64,
    pub mem_total: f64,
    pub mem_used: f64,
    pub disk_total: f64,
    pub disk_used: f64,
    /// Instances still placeable, reported directly by federation.
    pub instances_left: f64,
    pub attributes: HashMap<String, String>,
    pub disabled: bool,
}

impl NodeInfo {
    /// How many instances of the given size fit into the free capacity.
    pub fn available_instances(&self, cpu_per_instance: f64, mem_per_instance: f64) -> usize {
        if cpu_per_instance <= 0.0 || mem_per_instance <= 0.0 {
            return 0;
        }
        let by_cpu = ((self.cpu_total - self.cpu_used) / cpu_per_instance).floor();
        let by_mem = ((self.mem_total - self.mem_used) / mem_per_instance).floor();
        by_cpu.min(by_mem).max(0.0) as usize
    }
}

/// Observed lifecycle state of a launched service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ServiceStatus {
    /// Some replica is still coming up.
    Staging,
    /// Every requested replica is running.
    Running,
}

/// Status report for one launched service.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceInfo {
    pub status: ServiceStatus,
    pub request_instances: usize,
    pub current_instances: usize,
    pub available_endpoints: Vec<Endpoint>,
}

/// One reachable worker instance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Endpoint {
    /// Host IP of the node the instance landed on.
    pub ip: String,
    /// Instance name, unique within the service.
    pub name: String,
    /// Logical port name to host port.
    pub ports: HashMap<String, u16>,
}

/// A host directory mounted into the worker container.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Volume {
    pub container_dir: String,
    pub host_dir: String,
}

/// Everything needed to launch one worker service.
#[derive(Debug, Clone, Default)]
pub struct LaunchParam {
    pub name: String,
    pub namespace: String,
    pub image: String,
    pub instance: usize,
    /// Logical port name to protocol.
    pub ports: HashMap<String, String>,
    pub env: HashMap<String, String>,
    pub volumes: HashMap<String, Volume>,
    /// Node attribute requirements; `city` is mandatory, `platform`
    /// selects windows handling.
    pub attribute_condition: HashMap<String, String>,
}

impl LaunchParam {
    /// True when an instance type matches this launch's selectors.
    pub fn matches_instance_type(&self, ist: &InstanceType) -> bool {
        self.attribute_condition
            .get(crate::ATTRIBUTE_KEY_PLATFORM)
            .map(|p| p.eq_ignore_ascii_case(&ist.platform))
            .unwrap_or(false)
            && self
                .attribute_condition
                .get(crate::ATTRIBUTE_KEY_CITY)
                .map(|c| c == &ist.group)
                .unwrap_or(false)
    }
}

/// Per-queue instance sizing. The `…_offset` fields shrink the size used
/// when computing availability, while the manifest still requests the
/// unshrunk amount; limits default to the request.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct InstanceType {
    pub platform: String,
    /// City this sizing applies to.
    pub group: String,
    pub cpu_per_instance: f64,
    pub mem_per_instance: f64,
    #[serde(default)]
    pub cpu_per_instance_offset: f64,
    #[serde(default)]
    pub mem_per_instance_offset: f64,
    #[serde(default)]
    pub cpu_limit_per_instance: f64,
    #[serde(default)]
    pub mem_limit_per_instance: f64,
}

impl InstanceType {
    /// The planning size: request minus offset, when the offset is sane.
    pub fn planning_cpu_mem(&self) -> (f64, f64) {
        let mut cpu = self.cpu_per_instance;
        let mut mem = self.mem_per_instance;
        if self.cpu_per_instance_offset > 0.0 && self.cpu_per_instance_offset < cpu {
            cpu -= self.cpu_per_instance_offset;
        }
        if self.mem_per_instance_offset > 0.0 && self.mem_per_instance_offset < mem {
            mem -= self.mem_per_instance_offset;
        }
        (cpu, mem)
    }
}

/// How clients reach the cluster API.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ClusterKind {
    /// One plain cluster.
    #[default]
    Normal,
    /// A federation meta-cluster answering per-selector capacity.
    Federation,
}

/// Static operator configuration.
#[derive(Debug, Clone, Default)]
pub struct OperatorConfig {
    /// The deployment manifest template with `__crm_*__` placeholders.
    pub template: String,
    /// Namespace the worker services live in.
    pub namespace: String,
    /// Cluster API host, e.g. `https://bcs-api.example.com`.
    pub api_host: String,
    /// Bearer token for the gateway.
    pub api_token: String,
    /// Use the gateway URI layout instead of the tunnel one.
    pub enable_gateway: bool,
    /// Path to a kubeconfig for native clusters; overrides the gateway.
    pub kubeconfig_path: Option<String>,
    pub cluster_kind: ClusterKind,

    pub cpu_per_instance: f64,
    pub mem_per_instance: f64,
    pub cpu_per_instance_offset: f64,
    pub mem_per_instance_offset: f64,
    pub cpu_limit_per_instance: f64,
    pub mem_limit_per_instance: f64,
    pub storage_per_instance: f64,
    pub storage_limit_per_instance: f64,

    pub instance_types: Vec<InstanceType>,

    /// Node label key carrying the city; defaults to the attribute key.
    pub city_label_key: Option<String>,
    /// Node label key carrying the platform; defaults to the OS label.
    pub platform_label_key: Option<String>,
    /// Never use host networking for windows services.
    pub disable_win_host_network: bool,
}

impl OperatorConfig {
    pub fn city_label_key(&self) -> &str {
        self.city_label_key
            .as_deref()
            .unwrap_or(crate::ATTRIBUTE_KEY_CITY)
    }

    pub fn platform_label_key(&self) -> &str {
        self.platform_label_key.as_deref().unwrap_or("kubernetes.io/os")
    }

    /// Default instance sizing, used when no instance type matches.
    pub fn default_instance_type(&self) -> InstanceType {
        InstanceType {
            platform: String::new(),
            group: String::new(),
            cpu_per_instance: self.cpu_per_instance,
            mem_per_instance: self.mem_per_instance,
            cpu_per_instance_offset: self.cpu_per_instance_offset,
            mem_per_instance_offset: self.mem_per_instance_offset,
            cpu_limit_per_instance: self.cpu_limit_per_instance,
            mem_limit_per_instance: self.mem_limit_per_instance,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_available_instances() {
        let node = NodeInfo {
            cpu_total: 16.0,
            cpu_used: 4.0,
            mem_total: 32_000.0,
            mem_used: 8_000.0,
            ..Default::default()
        };
        // cpu allows 3, memory allows 6
        assert_eq!(node.available_instances(4.0, 4_000.0), 3);
        assert_eq!(node.available_instances(0.0, 4_000.0), 0);
    }

    #[test]
    fn test_planning_size_shrinks_by_offset() {
        let ist = InstanceType {
            cpu_per_instance: 4.0,
            mem_per_instance: 8_192.0,
            cpu_per_instance_offset: 1.0,
            mem_per_instance_offset: 9_999.0, // larger than the size, ignored
            ..Default::default()
        };
        let (cpu, mem) = ist.planning_cpu_mem();
        assert_eq!(cpu, 3.0);
        assert_eq!(mem, 8_192.0);
    }

    #[test]
    fn test_matches_instance_type() {
        let mut param = LaunchParam::default();
        param
            .attribute_condition
            .insert(crate::ATTRIBUTE_KEY_PLATFORM.to_string(), "linux".to_string());
        param
            .attribute_condition
            .insert(crate::ATTRIBUTE_KEY_CITY.to_string(), "sh".to_string());
        let ist = InstanceType {
            platform: "linux".to_string(),
            group: "sh".to_string(),
            ..Default::default()
        };
        assert!(param.matches_instance_type(&ist));
        let other = InstanceType {
            platform: "windows".to_string(),
            group: "sh".to_string(),
            ..Default::default()
        };
        assert!(!param.matches_instance_type(&other));
    }
}
