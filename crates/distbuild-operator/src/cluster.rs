//! Cluster REST client.
//!
//! The operator reads and writes a small slice of the cluster API: nodes,
//! pods, deployments, and the federation capacity endpoint. Only the fields
//! the control loop consumes are modeled. Everything goes through the
//! [`ClusterApi`] trait so the operator logic stays testable without a
//! cluster.

use crate::error::OperatorError;
use crate::types::OperatorConfig;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Request timeout for cluster calls.
pub const REQ_TIMEOUT_SECS: u64 = 10;
/// Requests slower than this get a warning line.
pub const REQ_SLOW_WARN_SECS: u64 = 3;

const TUNNEL_BASE_URI: &str = "{host}/tunnels/clusters/{cluster}";
const GATEWAY_BASE_URI: &str = "{host}/clusters/{cluster}";

// ---------------------------------------------------------------------------
// resource models (only what the operator reads)
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Metadata {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub labels: HashMap<String, String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NodeAddress {
    #[serde(rename = "type", default)]
    pub kind: String,
    #[serde(default)]
    pub address: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NodeStatus {
    #[serde(default)]
    pub addresses: Vec<NodeAddress>,
    /// Quantity strings, e.g. `"16"`, `"32Gi"`.
    #[serde(default)]
    pub capacity: HashMap<String, String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Node {
    #[serde(default)]
    pub metadata: Metadata,
    #[serde(default)]
    pub status: NodeStatus,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NodeList {
    #[serde(default)]
    pub items: Vec<Node>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ContainerPort {
    #[serde(default)]
    pub name: String,
    #[serde(rename = "containerPort", default)]
    pub container_port: u16,
    #[serde(rename = "hostPort", default)]
    pub host_port: u16,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ResourceRequirements {
    #[serde(default)]
    pub requests: HashMap<String, String>,
    #[serde(default)]
    pub limits: HashMap<String, String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Container {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub ports: Vec<ContainerPort>,
    #[serde(default)]
    pub resources: ResourceRequirements,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PodSpec {
    #[serde(rename = "nodeName", default)]
    pub node_name: String,
    #[serde(rename = "nodeSelector", default)]
    pub node_selector: HashMap<String, String>,
    #[serde(default)]
    pub containers: Vec<Container>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PodStatus {
    #[serde(default)]
    pub phase: String,
    #[serde(rename = "hostIP", default)]
    pub host_ip: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Pod {
    #[serde(default)]
    pub metadata: Metadata,
    #[serde(default)]
    pub spec: PodSpec,
    #[serde(default)]
    pub status: PodStatus,
}

impl Pod {
    /// Succeeded and Failed pods hold no capacity.
    pub fn is_terminal(&self) -> bool {
        self.status.phase == "Succeeded" || self.status.phase == "Failed"
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PodList {
    #[serde(default)]
    pub items: Vec<Pod>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DeploymentStatus {
    #[serde(default)]
    pub replicas: usize,
    #[serde(rename = "unavailableReplicas", default)]
    pub unavailable_replicas: usize,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Deployment {
    #[serde(default)]
    pub metadata: Metadata,
    #[serde(default)]
    pub status: DeploymentStatus,
}

// ---------------------------------------------------------------------------
// federation capacity query
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResourceRequest {
    pub cpu: String,
    pub memory: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResourceRequests {
    pub requests: ResourceRequest,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AvailableResourceParam {
    pub resources: ResourceRequests,
    #[serde(rename = "nodeSelector")]
    pub node_selector: HashMap<String, String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AvailableResourceData {
    #[serde(default)]
    pub total: i64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AvailableResourceResult {
    #[serde(default)]
    pub code: i32,
    #[serde(default)]
    pub msg: String,
    #[serde(default)]
    pub data: AvailableResourceData,
}

// ---------------------------------------------------------------------------
// quantities
// ---------------------------------------------------------------------------

/// Parse a CPU quantity into cores (`"4"` -> 4.0, `"500m"` -> 0.5).
pub fn parse_cpu(q: &str) -> f64 {
    if let Some(milli) = q.strip_suffix('m') {
        return milli.parse::<f64>().unwrap_or(0.0) / 1000.0;
    }
    q.parse::<f64>().unwrap_or(0.0)
}

/// Parse a memory/storage quantity into MB.
pub fn parse_mem_mb(q: &str) -> f64 {
    let suffixes: [(&str, f64); 6] = [
        ("Ki", 1.0 / 1024.0),
        ("Mi", 1.0),
        ("Gi", 1024.0),
        ("Ti", 1024.0 * 1024.0),
        ("M", 1.0),
        ("G", 1000.0),
    ];
    for (suffix, factor) in suffixes {
        if let Some(num) = q.strip_suffix(suffix) {
            return num.parse::<f64>().unwrap_or(0.0) * factor;
        }
    }
    // plain bytes
    q.parse::<f64>().unwrap_or(0.0) / 1024.0 / 1024.0
}

/// Render a `key=value` label selector.
pub fn manifest_selector(key: &str, value: &str) -> String {
    format!("{key}={value}")
}

// ---------------------------------------------------------------------------
// the client
// ---------------------------------------------------------------------------

/// The slice of the cluster API the operator consumes.
#[async_trait]
pub trait ClusterApi: Send + Sync {
    async fn list_nodes(&self) -> Result<NodeList, OperatorError>;
    /// `label_selector`/`field_selector` use the cluster's selector syntax.
    async fn list_pods(
        &self,
        namespace: &str,
        label_selector: Option<&str>,
        field_selector: Option<&str>,
    ) -> Result<PodList, OperatorError>;
    async fn get_deployment(&self, namespace: &str, name: &str)
        -> Result<Deployment, OperatorError>;
    /// Create from a rendered manifest; a name conflict is an error.
    async fn create_deployment(
        &self,
        namespace: &str,
        manifest_yaml: &str,
    ) -> Result<(), OperatorError>;
    /// Background propagation, zero grace. Not-found maps to
    /// [`OperatorError::NotFound`].
    async fn delete_deployment(&self, namespace: &str, name: &str) -> Result<(), OperatorError>;
    /// Federation capacity for one selector.
    async fn available_resource(
        &self,
        namespace: &str,
        param: &AvailableResourceParam,
    ) -> Result<AvailableResourceResult, OperatorError>;
}

/// Builds [`ClusterApi`] clients per cluster id; the operator caches them.
#[async_trait]
pub trait ClientFactory: Send + Sync {
    async fn build(&self, cluster_id: &str) -> Result<Arc<dyn ClusterApi>, OperatorError>;
}

/// REST implementation over the gateway (bearer token, TLS skip-verify the
/// way the gateway terminates it) or a native API host from kubeconfig.
pub struct RestClusterClient {
    client: reqwest::Client,
    base_url: String,
    token: String,
}

impl RestClusterClient {
    /// Gateway or tunnel client for one cluster.
    pub fn new(conf: &OperatorConfig, cluster_id: &str) -> Result<Self, OperatorError> {
        let pattern = if conf.enable_gateway {
            GATEWAY_BASE_URI
        } else {
            TUNNEL_BASE_URI
        };
        let base_url = pattern
            .replace("{host}", conf.api_host.trim_end_matches('/'))
            .replace("{cluster}", cluster_id);

        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(REQ_TIMEOUT_SECS))
            .danger_accept_invalid_certs(true)
            .build()?;

        info!(cluster = %cluster_id, base = %base_url, "new cluster client");
        Ok(Self {
            client,
            base_url,
            token: conf.api_token.clone(),
        })
    }

    /// Native client for a kubeconfig-described cluster: the host and token
    /// are lifted from the kubeconfig file.
    pub fn from_kubeconfig(path: &str, cluster_id: &str) -> Result<Self, OperatorError> {
        let data = std::fs::read_to_string(path)
            .map_err(|e| OperatorError::Config(format!("read kubeconfig {path}: {e}")))?;
        let kubeconfig: Kubeconfig = serde_yaml::from_str(&data)?;
        let host = kubeconfig
            .clusters
            .first()
            .map(|c| c.cluster.server.clone())
            .ok_or_else(|| OperatorError::Config("kubeconfig has no clusters".to_string()))?;
        let token = kubeconfig
            .users
            .first()
            .and_then(|u| u.user.token.clone())
            .unwrap_or_default();

        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(REQ_TIMEOUT_SECS))
            .danger_accept_invalid_certs(true)
            .build()?;

        info!(cluster = %cluster_id, host = %host, "new native cluster client");
        Ok(Self {
            client,
            base_url: host.trim_end_matches('/').to_string(),
            token,
        })
    }

    async fn request<T: serde::de::DeserializeOwned>(
        &self,
        method: reqwest::Method,
        path: &str,
        body: Option<serde_json::Value>,
    ) -> Result<T, OperatorError> {
        let url = format!("{}{}", self.base_url, path);
        debug!(method = %method, url = %url, "cluster request");
        let before = Instant::now();

        let mut builder = self
            .client
            .request(method.clone(), &url)
            .bearer_auth(&self.token);
        if let Some(body) = body {
            builder = builder.json(&body);
        }
        let response = builder.send().await?;

        if before.elapsed() > Duration::from_secs(REQ_SLOW_WARN_SECS) {
            warn!(
                method = %method,
                url = %url,
                elapsed = ?before.elapsed(),
                "cluster request took too long"
            );
        }

        let status = response.status();
        if status == reqwest::StatusCode::NOT_FOUND {
            return Err(OperatorError::NotFound(path.to_string()));
        }
        if !status.is_success() {
            return Err(OperatorError::Cluster(format!("http({status}): {url}")));
        }
        response
            .json()
            .await
            .map_err(|e| OperatorError::Decode(e.to_string()))
    }
}

#[async_trait]
impl ClusterApi for RestClusterClient {
    async fn list_nodes(&self) -> Result<NodeList, OperatorError> {
        self.request(reqwest::Method::GET, "/api/v1/nodes", None)
            .await
    }

    async fn list_pods(
        &self,
        namespace: &str,
        label_selector: Option<&str>,
        field_selector: Option<&str>,
    ) -> Result<PodList, OperatorError> {
        let mut path = if namespace.is_empty() {
            "/api/v1/pods".to_string()
        } else {
            format!("/api/v1/namespaces/{namespace}/pods")
        };
        let mut query = Vec::new();
        if let Some(selector) = label_selector {
            query.push(format!("labelSelector={selector}"));
        }
        if let Some(selector) = field_selector {
            query.push(format!("fieldSelector={selector}"));
        }
        if !query.is_empty() {
            path = format!("{path}?{}", query.join("&"));
        }
        self.request(reqwest::Method::GET, &path, None).await
    }

    async fn get_deployment(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Deployment, OperatorError> {
        self.request(
            reqwest::Method::GET,
            &format!("/apis/apps/v1/namespaces/{namespace}/deployments/{name}"),
            None,
        )
        .await
    }

    async fn create_deployment(
        &self,
        namespace: &str,
        manifest_yaml: &str,
    ) -> Result<(), OperatorError> {
        // the manifest is rendered as YAML; the API wants JSON
        let manifest: serde_json::Value = serde_yaml::from_str(manifest_yaml)?;
        let _: serde_json::Value = self
            .request(
                reqwest::Method::POST,
                &format!("/apis/apps/v1/namespaces/{namespace}/deployments"),
                Some(manifest),
            )
            .await?;
        Ok(())
    }

    async fn delete_deployment(&self, namespace: &str, name: &str) -> Result<(), OperatorError> {
        let options = serde_json::json!({
            "gracePeriodSeconds": 0,
            "propagationPolicy": "Background",
        });
        let _: serde_json::Value = self
            .request(
                reqwest::Method::DELETE,
                &format!("/apis/apps/v1/namespaces/{namespace}/deployments/{name}"),
                Some(options),
            )
            .await?;
        Ok(())
    }

    async fn available_resource(
        &self,
        namespace: &str,
        param: &AvailableResourceParam,
    ) -> Result<AvailableResourceResult, OperatorError> {
        self.request(
            reqwest::Method::POST,
            &format!("/apis/federated/v1/namespaces/{namespace}/availableresource"),
            Some(serde_json::to_value(param)?),
        )
        .await
    }
}

/// Default factory: kubeconfig when configured, gateway otherwise.
pub struct RestClusterFactory {
    conf: OperatorConfig,
}

impl RestClusterFactory {
    pub fn new(conf: OperatorConfig) -> Self {
        Self { conf }
    }
}

#[async_trait]
impl ClientFactory for RestClusterFactory {
    async fn build(&self, cluster_id: &str) -> Result<Arc<dyn ClusterApi>, OperatorError> {
        let client = match &self.conf.kubeconfig_path {
            Some(path) => RestClusterClient::from_kubeconfig(path, cluster_id)?,
            None => RestClusterClient::new(&self.conf, cluster_id)?,
        };
        Ok(Arc::new(client))
    }
}

// minimal kubeconfig model for the native path
#[derive(Debug, Default, Deserialize)]
struct Kubeconfig {
    #[serde(default)]
    clusters: Vec<KubeconfigCluster>,
    #[serde(default)]
    users: Vec<KubeconfigUser>,
}

#[derive(Debug, Default, Deserialize)]
struct KubeconfigCluster {
    #[serde(default)]
    cluster: KubeconfigClusterData,
}

#[derive(Debug, Default, Deserialize)]
struct KubeconfigClusterData {
    #[serde(default)]
    server: String,
}

#[derive(Debug, Default, Deserialize)]
struct KubeconfigUser {
    #[serde(default)]
    user: KubeconfigUserData,
}

#[derive(Debug, Default, Deserialize)]
struct KubeconfigUserData {
    #[serde(default)]
    token: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_cpu() {
        assert_eq!(parse_cpu("4"), 4.0);
        assert_eq!(parse_cpu("500m"), 0.5);
        assert_eq!(parse_cpu("junk"), 0.0);
    }

    #[test]
    fn test_parse_mem_mb() {
        assert_eq!(parse_mem_mb("8Gi"), 8192.0);
        assert_eq!(parse_mem_mb("512Mi"), 512.0);
        assert_eq!(parse_mem_mb("1024Ki"), 1.0);
        assert_eq!(parse_mem_mb("100M"), 100.0);
        assert_eq!(parse_mem_mb(&(64 * 1024 * 1024).to_string()), 64.0);
    }

    #[test]
    fn test_pod_terminal_phases() {
        let mut pod = Pod::default();
        pod.status.phase = "Running".to_string();
        assert!(!pod.is_terminal());
        pod.status.phase = "Succeeded".to_string();
        assert!(pod.is_terminal());
    }

    #[test]
    fn test_pod_list_decoding() {
        let json = r#"{
            "items": [{
                "metadata": {"name": "w-0", "labels": {"distbuild/name": "svc"}},
                "spec": {
                    "nodeName": "node-a",
                    "containers": [{
                        "name": "worker",
                        "ports": [{"name": "service-port", "containerPort": 31000, "hostPort": 31000}],
                        "resources": {"requests": {"cpu": "4", "memory": "8Gi"}}
                    }]
                },
                "status": {"phase": "Running", "hostIP": "10.1.2.3"}
            }]
        }"#;
        let pods: PodList = serde_json::from_str(json).unwrap();
        assert_eq!(pods.items.len(), 1);
        let pod = &pods.items[0];
        assert_eq!(pod.status.host_ip, "10.1.2.3");
        assert_eq!(pod.spec.containers[0].ports[0].host_port, 31000);
        assert_eq!(parse_cpu(&pod.spec.containers[0].resources.requests["cpu"]), 4.0);
    }

    #[test]
    fn test_gateway_and_tunnel_base_uris() {
        let mut conf = OperatorConfig {
            api_host: "https://api.example.com/".to_string(),
            api_token: "t".to_string(),
            ..Default::default()
        };
        let tunnel = RestClusterClient::new(&conf, "c-1").unwrap();
        assert_eq!(
            tunnel.base_url,
            "https://api.example.com/tunnels/clusters/c-1"
        );

        conf.enable_gateway = true;
        let gateway = RestClusterClient::new(&conf, "c-1").unwrap();
        assert_eq!(gateway.base_url, "https://api.example.com/clusters/c-1");
    }
}
