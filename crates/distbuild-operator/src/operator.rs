//! The cluster operator.
//!
//! Idempotent control-loop primitives over one or more clusters, with a
//! per-cluster client cache. Launch is the one non-idempotent operation:
//! repeating it surfaces the cluster's conflict error, so callers check
//! status first.

use crate::cluster::{
    manifest_selector, parse_cpu, parse_mem_mb, AvailableResourceParam, ClientFactory, ClusterApi,
    Pod, ResourceRequest, ResourceRequests,
};
use crate::error::OperatorError;
use crate::template::{self, manifest_to_logical_port};
use crate::types::{
    ClusterKind, Endpoint, InstanceType, LaunchParam, NodeInfo, OperatorConfig, ServiceInfo,
    ServiceStatus,
};
use crate::{APP_LABEL, ATTRIBUTE_KEY_CITY, ATTRIBUTE_KEY_PLATFORM, DISABLE_LABEL};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;
use tokio::sync::{Mutex, RwLock};
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Cached cluster clients go stale after this long.
pub const CLIENT_CACHE_TTL: Duration = Duration::from_secs(60);

/// Control-loop surface over the worker fleet.
#[async_trait]
pub trait Operator: Send + Sync {
    /// Per-node (or per-selector) capacity for one cluster.
    async fn get_resource(&self, cluster_id: &str) -> Result<Vec<NodeInfo>, OperatorError>;
    /// Create the worker service. Not idempotent.
    async fn launch_server(
        &self,
        cluster_id: &str,
        param: LaunchParam,
    ) -> Result<(), OperatorError>;
    /// Recompute the observed service state.
    async fn get_server_status(
        &self,
        cluster_id: &str,
        namespace: &str,
        name: &str,
    ) -> Result<ServiceInfo, OperatorError>;
    /// Delete the worker service; missing services count as released.
    async fn release_server(
        &self,
        cluster_id: &str,
        namespace: &str,
        name: &str,
    ) -> Result<(), OperatorError>;
}

struct CachedClient {
    api: Arc<dyn ClusterApi>,
    expires: Instant,
}

/// Production [`Operator`] over REST cluster clients.
pub struct ClusterOperator {
    conf: OperatorConfig,
    factory: Arc<dyn ClientFactory>,
    cache: RwLock<HashMap<String, CachedClient>>,
    /// Per-cluster construction locks so one slow rebuild never stampedes.
    build_locks: StdMutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl ClusterOperator {
    pub fn new(conf: OperatorConfig, factory: Arc<dyn ClientFactory>) -> Self {
        Self {
            conf,
            factory,
            cache: RwLock::new(HashMap::new()),
            build_locks: StdMutex::new(HashMap::new()),
        }
    }

    async fn cached_client(&self, cluster_id: &str) -> Option<Arc<dyn ClusterApi>> {
        let cache = self.cache.read().await;
        let entry = cache.get(cluster_id)?;
        if entry.expires <= Instant::now() {
            debug!(cluster = %cluster_id, "cached client is out of date");
            return None;
        }
        Some(entry.api.clone())
    }

    /// Two-level lookup: shared read on the map, then a per-cluster mutex
    /// around construction so concurrent callers wait for one build.
    async fn client(&self, cluster_id: &str) -> Result<Arc<dyn ClusterApi>, OperatorError> {
        if let Some(api) = self.cached_client(cluster_id).await {
            return Ok(api);
        }

        let build_lock = {
            let mut locks = self.build_locks.lock().expect("build locks poisoned");
            locks
                .entry(cluster_id.to_string())
                .or_insert_with(|| Arc::new(Mutex::new(())))
                .clone()
        };
        let _guard = build_lock.lock().await;

        if let Some(api) = self.cached_client(cluster_id).await {
            return Ok(api);
        }

        let api = self.factory.build(cluster_id).await?;
        self.cache.write().await.insert(
            cluster_id.to_string(),
            CachedClient {
                api: api.clone(),
                expires: Instant::now() + CLIENT_CACHE_TTL,
            },
        );
        Ok(api)
    }

    async fn plain_resource(&self, cluster_id: &str) -> Result<Vec<NodeInfo>, OperatorError> {
        let client = self.client(cluster_id).await?;
        let nodes = client.list_nodes().await?;
        let pods = client
            .list_pods(
                "",
                None,
                Some("status.phase!=Succeeded,status.phase!=Failed"),
            )
            .await?;

        let city_key = self.conf.city_label_key();
        let platform_key = self.conf.platform_label_key();

        let mut out = Vec::with_capacity(nodes.items.len());
        for node in nodes.items {
            let Some(ip) = node
                .status
                .addresses
                .iter()
                .find(|a| a.kind == "InternalIP")
                .map(|a| a.address.clone())
            else {
                warn!(node = %node.metadata.name, "node without internal ip, skipped");
                continue;
            };

            let (cpu_used, mem_used, disk_used) =
                pods_requests_on_node(&pods.items, &node.metadata.name);

            let mut cpu_total = node
                .status
                .capacity
                .get("cpu")
                .map(|q| parse_cpu(q))
                .unwrap_or(0.0);
            let mut mem_total = node
                .status
                .capacity
                .get("memory")
                .map(|q| parse_mem_mb(q))
                .unwrap_or(0.0);
            let disk_total = node
                .status
                .capacity
                .get("ephemeral-storage")
                .map(|q| parse_mem_mb(q))
                .unwrap_or(0.0);

            let disabled = node.metadata.labels.get(DISABLE_LABEL).map(String::as_str)
                == Some("true");

            // offset sizing corrects the totals to what the planner may
            // actually place
            if let Some(ist) = self.conf.instance_types.iter().find(|ist| {
                node.metadata.labels.get(city_key) == Some(&ist.group)
                    && node.metadata.labels.get(platform_key) == Some(&ist.platform)
            }) {
                if ist.cpu_per_instance_offset > 0.0 || ist.mem_per_instance_offset > 0.0 {
                    let probe = NodeInfo {
                        cpu_total,
                        cpu_used,
                        mem_total,
                        mem_used,
                        ..Default::default()
                    };
                    let (plan_cpu, plan_mem) = ist.planning_cpu_mem();
                    let available = probe.available_instances(plan_cpu, plan_mem) as f64;
                    cpu_total = cpu_used + available * ist.cpu_per_instance;
                    mem_total = mem_used + available * ist.mem_per_instance;
                }
            }

            let mut attributes = node.metadata.labels.clone();
            if let Some(city) = node.metadata.labels.get(city_key) {
                attributes.insert(ATTRIBUTE_KEY_CITY.to_string(), city.clone());
            }
            if let Some(platform) = node.metadata.labels.get(platform_key) {
                attributes.insert(ATTRIBUTE_KEY_PLATFORM.to_string(), platform.clone());
            }

            out.push(NodeInfo {
                ip,
                hostname: node.metadata.name.clone(),
                cpu_total,
                cpu_used,
                mem_total,
                mem_used,
                disk_total,
                disk_used,
                instances_left: 0.0,
                attributes,
                disabled,
            });
        }
        Ok(out)
    }

    async fn federation_resource(&self, cluster_id: &str) -> Result<Vec<NodeInfo>, OperatorError> {
        if self.conf.namespace.is_empty() {
            return Err(OperatorError::Config(
                "federation capacity needs a namespace".to_string(),
            ));
        }
        let client = self.client(cluster_id).await?;
        let pods = client.list_pods(&self.conf.namespace, None, None).await?;

        let city_key = self.conf.city_label_key();
        let platform_key = self.conf.platform_label_key();

        let mut out = Vec::with_capacity(self.conf.instance_types.len());
        for ist in &self.conf.instance_types {
            let (plan_cpu, plan_mem) = ist.planning_cpu_mem();
            let param = AvailableResourceParam {
                resources: ResourceRequests {
                    requests: ResourceRequest {
                        cpu: format!("{plan_cpu}"),
                        memory: format!("{plan_mem}M"),
                    },
                },
                node_selector: HashMap::from([
                    (platform_key.to_string(), ist.platform.clone()),
                    (city_key.to_string(), ist.group.clone()),
                ]),
            };

            let result = client
                .available_resource(&self.conf.namespace, &param)
                .await?;
            if result.code != 0 {
                return Err(OperatorError::Capacity {
                    code: result.code,
                    message: result.msg,
                });
            }
            let total = result.data.total as f64;

            let (cpu_used, mem_used, disk_used) =
                pods_limits_for_selector(&pods.items, platform_key, city_key, ist);

            out.push(NodeInfo {
                ip: selector_host(cluster_id, &self.conf.namespace, ist),
                hostname: selector_host(cluster_id, &self.conf.namespace, ist),
                cpu_total: cpu_used + total * ist.cpu_per_instance,
                cpu_used,
                mem_total: mem_used + total * ist.mem_per_instance,
                mem_used,
                disk_total: 0.0,
                disk_used,
                instances_left: total,
                attributes: HashMap::from([
                    (ATTRIBUTE_KEY_PLATFORM.to_string(), ist.platform.clone()),
                    (ATTRIBUTE_KEY_CITY.to_string(), ist.group.clone()),
                ]),
                disabled: false,
            });
        }

        debug!(cluster = %cluster_id, selectors = out.len(), "federation capacity collected");
        Ok(out)
    }
}

fn selector_host(cluster_id: &str, namespace: &str, ist: &InstanceType) -> String {
    format!("{cluster_id}-{namespace}-{}-{}", ist.platform, ist.group)
}

/// Sum the resource requests of every pod scheduled on `node`.
fn pods_requests_on_node(pods: &[Pod], node: &str) -> (f64, f64, f64) {
    let mut cpu = 0.0;
    let mut mem = 0.0;
    let mut disk = 0.0;
    for pod in pods {
        if pod.spec.node_name != node {
            continue;
        }
        for container in &pod.spec.containers {
            let requests = &container.resources.requests;
            cpu += requests.get("cpu").map(|q| parse_cpu(q)).unwrap_or(0.0);
            mem += requests.get("memory").map(|q| parse_mem_mb(q)).unwrap_or(0.0);
            disk += requests
                .get("ephemeral-storage")
                .map(|q| parse_mem_mb(q))
                .unwrap_or(0.0);
        }
    }
    (cpu, mem, disk)
}

/// Sum the resource limits of non-terminal pods pinned to one selector.
fn pods_limits_for_selector(
    pods: &[Pod],
    platform_key: &str,
    city_key: &str,
    ist: &InstanceType,
) -> (f64, f64, f64) {
    let mut cpu = 0.0;
    let mut mem = 0.0;
    let mut disk = 0.0;
    for pod in pods {
        if pod.is_terminal() {
            continue;
        }
        if !pod.spec.node_selector.is_empty()
            && (pod.spec.node_selector.get(platform_key) != Some(&ist.platform)
                || pod.spec.node_selector.get(city_key) != Some(&ist.group))
        {
            continue;
        }
        for container in &pod.spec.containers {
            let limits = &container.resources.limits;
            cpu += limits.get("cpu").map(|q| parse_cpu(q)).unwrap_or(0.0);
            mem += limits.get("memory").map(|q| parse_mem_mb(q)).unwrap_or(0.0);
            disk += limits
                .get("ephemeral-storage")
                .map(|q| parse_mem_mb(q))
                .unwrap_or(0.0);
        }
    }
    (cpu, mem, disk)
}

#[async_trait]
impl Operator for ClusterOperator {
    async fn get_resource(&self, cluster_id: &str) -> Result<Vec<NodeInfo>, OperatorError> {
        match self.conf.cluster_kind {
            ClusterKind::Federation => self.federation_resource(cluster_id).await,
            ClusterKind::Normal => self.plain_resource(cluster_id).await,
        }
    }

    async fn launch_server(
        &self,
        cluster_id: &str,
        mut param: LaunchParam,
    ) -> Result<(), OperatorError> {
        let manifest = template::render(&self.conf, &mut param)?;
        debug!(
            cluster = %cluster_id,
            namespace = %param.namespace,
            name = %param.name,
            "launching service:\n{manifest}"
        );

        let client = self.client(cluster_id).await?;
        client
            .create_deployment(&param.namespace, &manifest)
            .await?;
        info!(
            cluster = %cluster_id,
            namespace = %param.namespace,
            name = %param.name,
            instances = param.instance,
            "service created"
        );
        Ok(())
    }

    async fn get_server_status(
        &self,
        cluster_id: &str,
        namespace: &str,
        name: &str,
    ) -> Result<ServiceInfo, OperatorError> {
        let client = self.client(cluster_id).await?;

        let deployment = client.get_deployment(namespace, name).await?;
        let mut status = ServiceStatus::Running;
        let request_instances = deployment.status.replicas;
        if deployment.status.unavailable_replicas > 0 || deployment.status.replicas == 0 {
            status = ServiceStatus::Staging;
        }

        let pods = client
            .list_pods(namespace, Some(&manifest_selector(APP_LABEL, name)), None)
            .await?;

        let mut endpoints = Vec::with_capacity(pods.items.len());
        for pod in &pods.items {
            if pod.status.phase != "Running" {
                if pod.status.phase == "Pending" && status != ServiceStatus::Staging {
                    warn!(
                        pod = %pod.metadata.name,
                        service = %name,
                        "pending pod forces the service back to staging"
                    );
                    status = ServiceStatus::Staging;
                }
                continue;
            }
            let Some(container) = pod.spec.containers.first() else {
                warn!(pod = %pod.metadata.name, service = %name, "pod without containers");
                continue;
            };

            let mut ports = HashMap::new();
            for port in &container.ports {
                ports.insert(manifest_to_logical_port(&port.name), port.host_port);
            }
            endpoints.push(Endpoint {
                ip: pod.status.host_ip.clone(),
                name: pod.metadata.name.clone(),
                ports,
            });
        }

        // replicas the cluster has not materialized yet also mean staging
        if request_instances > pods.items.len() && status != ServiceStatus::Staging {
            warn!(
                service = %name,
                requested = request_instances,
                observed = pods.items.len(),
                "requested instances exceed observed pods"
            );
            status = ServiceStatus::Staging;
        }

        Ok(ServiceInfo {
            status,
            request_instances,
            current_instances: endpoints.len(),
            available_endpoints: endpoints,
        })
    }

    async fn release_server(
        &self,
        cluster_id: &str,
        namespace: &str,
        name: &str,
    ) -> Result<(), OperatorError> {
        let client = self.client(cluster_id).await?;
        match client.delete_deployment(namespace, name).await {
            Ok(()) => {
                info!(cluster = %cluster_id, namespace = %namespace, name = %name, "service released");
                Ok(())
            }
            Err(OperatorError::NotFound(_)) => {
                warn!(
                    cluster = %cluster_id,
                    namespace = %namespace,
                    name = %name,
                    "service already gone, regarded as released"
                );
                Ok(())
            }
            Err(e) => Err(e),
        }
    }
}
