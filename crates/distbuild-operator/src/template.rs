//! Manifest templating.
//!
//! The deployment manifest is a YAML template with `__crm_*__` placeholders
//! filled by plain string substitution, the same way operators hand-edit
//! these files. Host ports are handed out deterministically from a fixed
//! base; that keeps the manifest reproducible but means two instances of
//! one service cannot share a node.

use crate::error::OperatorError;
use crate::types::{LaunchParam, OperatorConfig, Volume};
use crate::{ATTRIBUTE_KEY_CITY, ATTRIBUTE_KEY_PLATFORM};
use std::collections::HashMap;

/// First host port handed to a service; one port per logical name.
pub const SPECIFIC_PORT: u16 = 31000;

/// Env prefix carrying the assigned host port.
pub const ENV_KEY_HOST_PORT: &str = "HOST_PORT_";
/// Env prefix mirroring the host port for tools that expect a random one.
pub const ENV_KEY_RAND_PORT: &str = "RAND_PORT_";

/// Fixed auxiliary port granted to windows services.
pub const AUX_PORT_NAME: &str = "aux-port";
pub const AUX_PORT_NUMBER: u16 = 1345;

const VAR_IMAGE: &str = "__crm_image__";
const VAR_NAME: &str = "__crm_name__";
const VAR_NAMESPACE: &str = "__crm_namespace__";
const VAR_INSTANCE: &str = "__crm_instance__";
const VAR_CPU: &str = "__crm_cpu__";
const VAR_MEM: &str = "__crm_mem__";
const VAR_STORAGE: &str = "__crm_storage__";
const VAR_LIMIT_CPU: &str = "__crm_limit_cpu__";
const VAR_LIMIT_MEM: &str = "__crm_limit_mem__";
const VAR_LIMIT_STORAGE: &str = "__crm_limit_storage__";
const VAR_ENV: &str = "__crm_env__";
const VAR_ENV_KEY: &str = "__crm_env_key__";
const VAR_ENV_VALUE: &str = "__crm_env_value__";
const VAR_PORTS: &str = "__crm_ports__";
const VAR_PORTS_NAME: &str = "__crm_ports_name__";
const VAR_PORTS_CONTAINER: &str = "__crm_ports_container__";
const VAR_PORTS_HOST: &str = "__crm_ports_host__";
const VAR_PLATFORM: &str = "__crm_platform__";
const VAR_PLATFORM_KEY: &str = "__crm_platform_key__";
const VAR_CITY: &str = "__crm_city__";
const VAR_CITY_KEY: &str = "__crm_city_key__";
const VAR_VOLUME_MOUNTS: &str = "__crm_volume_mounts__";
const VAR_VOLUMES: &str = "__crm_volumes__";
const VAR_VOLUME_MOUNTS_NAME: &str = "__crm_volume_mounts_name__";
const VAR_VOLUME_MOUNTS_PATH: &str = "__crm_volume_mounts_path__";
const VAR_VOLUME_HOST_PATH: &str = "__crm_volume_host_path__";
const VAR_RAND_PORT_NAMES: &str = "__crm_rand_port_names__";
const VAR_HOST_NETWORK: &str = "__crm_host_network__";

const CONTENT_ENV: &str = "        - name: __crm_env_key__\n          value: __crm_env_value__";

const CONTENT_PORTS: &str = "        - name: __crm_ports_name__\n          containerPort: __crm_ports_container__\n          hostPort: __crm_ports_host__";

const CONTENT_VOLUME_MOUNTS: &str =
    "        - mountPath: __crm_volume_mounts_path__\n          name: __crm_volume_mounts_name__";

const CONTENT_VOLUMES: &str = "      - name: __crm_volume_mounts_name__\n        hostPath:\n          path: __crm_volume_host_path__\n          type: DirectoryOrCreate";

/// Logical port names are SCREAMING_SNAKE; the manifest wants dns-ish.
pub fn logical_to_manifest_port(name: &str) -> String {
    name.to_ascii_lowercase().replace('_', "-")
}

/// Inverse of [`logical_to_manifest_port`], used when reading pods back.
pub fn manifest_to_logical_port(name: &str) -> String {
    name.to_ascii_uppercase().replace('-', "_")
}

/// Render the deployment manifest for one launch. Mutates the param's env
/// with the assigned `HOST_PORT_*`/`RAND_PORT_*` variables as a side
/// effect, since the workers read their ports from the environment.
pub fn render(
    conf: &OperatorConfig,
    param: &mut LaunchParam,
) -> Result<String, OperatorError> {
    let city = param
        .attribute_condition
        .get(ATTRIBUTE_KEY_CITY)
        .cloned()
        .ok_or_else(|| OperatorError::MissingAttribute(ATTRIBUTE_KEY_CITY.to_string()))?;

    let platform = match param
        .attribute_condition
        .get(ATTRIBUTE_KEY_PLATFORM)
        .map(String::as_str)
    {
        Some("windows") | Some("WINDOWS") | Some("win") | Some("WIN") => "windows",
        _ => "linux",
    };
    let host_network = if platform == "windows" && !conf.disable_win_host_network {
        "hostNetwork: true"
    } else {
        ""
    };

    // deterministic port assignment: sorted logical names, base + index
    let mut port_names: Vec<String> = param.ports.keys().cloned().collect();
    port_names.sort();
    let mut ports: Vec<(String, u16)> = Vec::new();
    let mut rand_port_names: Vec<String> = Vec::new();
    for (index, name) in port_names.iter().enumerate() {
        let port = SPECIFIC_PORT + index as u16;
        param
            .env
            .insert(format!("{ENV_KEY_HOST_PORT}{name}"), port.to_string());
        param
            .env
            .insert(format!("{ENV_KEY_RAND_PORT}{name}"), port.to_string());
        ports.push((logical_to_manifest_port(name), port));
        rand_port_names.push(logical_to_manifest_port(name));
    }

    if platform == "windows" {
        ports.push((AUX_PORT_NAME.to_string(), AUX_PORT_NUMBER));
        rand_port_names.push(AUX_PORT_NAME.to_string());
    }

    let (cpu, mem, limit_cpu, limit_mem) = instance_size(conf, param);

    let mut storage = String::new();
    let mut storage_limit = String::new();
    if conf.storage_per_instance > 0.0 {
        storage = format!("ephemeral-storage: {:.2}Gi", conf.storage_per_instance);
        storage_limit = storage.clone();
    }
    if conf.storage_limit_per_instance > 0.0 {
        storage_limit = format!("ephemeral-storage: {:.2}Gi", conf.storage_limit_per_instance);
    }

    let mut data = conf.template.clone();
    data = data.replace(VAR_IMAGE, &param.image);
    data = data.replace(VAR_NAME, &param.name);
    data = data.replace(VAR_NAMESPACE, &param.namespace);
    data = data.replace(VAR_INSTANCE, &param.instance.to_string());
    data = data.replace(VAR_RAND_PORT_NAMES, &rand_port_names.join(","));
    data = insert_ports(data, &ports);
    data = insert_env(data, &param.env);
    data = insert_volumes(data, &param.volumes);
    data = data.replace(VAR_HOST_NETWORK, host_network);
    data = data.replace(VAR_PLATFORM, platform);
    data = data.replace(VAR_PLATFORM_KEY, conf.platform_label_key());
    data = data.replace(VAR_CITY, &city);
    data = data.replace(VAR_CITY_KEY, conf.city_label_key());
    // cpu goes in as millicores
    data = data.replace(VAR_CPU, &format!("{:.2}", cpu * 1000.0));
    data = data.replace(VAR_MEM, &format!("{mem:.2}"));
    data = data.replace(VAR_STORAGE, &storage);
    data = data.replace(VAR_LIMIT_CPU, &format!("{:.2}", limit_cpu * 1000.0));
    data = data.replace(VAR_LIMIT_MEM, &format!("{limit_mem:.2}"));
    data = data.replace(VAR_LIMIT_STORAGE, &storage_limit);

    Ok(data)
}

/// Resolve the requested and limit sizing for a launch: queue-matched
/// instance types override the defaults, limits fall back to the request.
fn instance_size(conf: &OperatorConfig, param: &LaunchParam) -> (f64, f64, f64, f64) {
    let default_ist = conf.default_instance_type();
    let (mut cpu, mut mem) = (default_ist.cpu_per_instance, default_ist.mem_per_instance);
    let mut limit_cpu = if conf.cpu_limit_per_instance > 0.0 {
        conf.cpu_limit_per_instance
    } else {
        cpu
    };
    let mut limit_mem = if conf.mem_limit_per_instance > 0.0 {
        conf.mem_limit_per_instance
    } else {
        mem
    };

    for ist in &conf.instance_types {
        if !param.matches_instance_type(ist) {
            continue;
        }
        if ist.cpu_per_instance > 0.0 {
            cpu = ist.cpu_per_instance;
            limit_cpu = ist.cpu_per_instance;
        }
        if ist.mem_per_instance > 0.0 {
            mem = ist.mem_per_instance;
            limit_mem = ist.mem_per_instance;
        }
        if ist.cpu_limit_per_instance > 0.0 {
            limit_cpu = ist.cpu_limit_per_instance;
        }
        if ist.mem_limit_per_instance > 0.0 {
            limit_mem = ist.mem_limit_per_instance;
        }
        break;
    }

    (cpu, mem, limit_cpu, limit_mem)
}

fn insert_ports(data: String, ports: &[(String, u16)]) -> String {
    let mut rendered = String::new();
    for (name, port) in ports {
        let mut content = CONTENT_PORTS.to_string();
        content = content.replace(VAR_PORTS_NAME, name);
        content = content.replace(VAR_PORTS_CONTAINER, &port.to_string());
        content = content.replace(VAR_PORTS_HOST, &port.to_string());
        rendered.push('\n');
        rendered.push_str(&content);
    }
    data.replace(VAR_PORTS, &rendered)
}

fn insert_env(data: String, env: &HashMap<String, String>) -> String {
    let mut keys: Vec<&String> = env.keys().collect();
    keys.sort();
    let mut rendered = String::new();
    for key in keys {
        let mut content = CONTENT_ENV.to_string();
        content = content.replace(VAR_ENV_KEY, key);
        content = content.replace(VAR_ENV_VALUE, &env[key]);
        rendered.push('\n');
        rendered.push_str(&content);
    }
    data.replace(VAR_ENV, &rendered)
}

fn insert_volumes(data: String, volumes: &HashMap<String, Volume>) -> String {
    let mut keys: Vec<&String> = volumes.keys().collect();
    keys.sort();

    let mut mounts = String::new();
    let mut defs = String::new();
    for key in &keys {
        let volume = &volumes[*key];
        let mut content = CONTENT_VOLUME_MOUNTS.to_string();
        content = content.replace(VAR_VOLUME_MOUNTS_PATH, &volume.container_dir);
        content = content.replace(VAR_VOLUME_MOUNTS_NAME, key);
        mounts.push('\n');
        mounts.push_str(&content);

        let mut content = CONTENT_VOLUMES.to_string();
        content = content.replace(VAR_VOLUME_MOUNTS_NAME, key);
        content = content.replace(VAR_VOLUME_HOST_PATH, &volume.host_dir);
        defs.push('\n');
        defs.push_str(&content);
    }

    data.replace(VAR_VOLUME_MOUNTS, &mounts)
        .replace(VAR_VOLUMES, &defs)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::InstanceType;

    const TEMPLATE: &str = r#"apiVersion: apps/v1
kind: Deployment
metadata:
  name: __crm_name__
  namespace: __crm_namespace__
spec:
  replicas: __crm_instance__
  template:
    metadata:
      labels:
        distbuild/name: __crm_name__
    spec:
      __crm_host_network__
      nodeSelector:
        __crm_platform_key__: __crm_platform__
        __crm_city_key__: __crm_city__
      containers:
      - name: worker
        image: __crm_image__
        resources:
          requests:
            cpu: __crm_cpu__m
            memory: __crm_mem__Mi
            __crm_storage__
          limits:
            cpu: __crm_limit_cpu__m
            memory: __crm_limit_mem__Mi
            __crm_limit_storage__
        env:__crm_env__
        ports:__crm_ports__
        volumeMounts:__crm_volume_mounts__
      volumes:__crm_volumes__
"#;

    fn conf() -> OperatorConfig {
        OperatorConfig {
            template: TEMPLATE.to_string(),
            namespace: "workers".to_string(),
            cpu_per_instance: 8.0,
            mem_per_instance: 16_384.0,
            ..Default::default()
        }
    }

    fn param() -> LaunchParam {
        let mut p = LaunchParam {
            name: "svc-1".to_string(),
            namespace: "workers".to_string(),
            image: "registry/worker:1".to_string(),
            instance: 4,
            ..Default::default()
        };
        p.ports.insert("SERVICE_PORT".to_string(), "tcp".to_string());
        p.ports.insert("STATS_PORT".to_string(), "tcp".to_string());
        p.attribute_condition
            .insert(ATTRIBUTE_KEY_CITY.to_string(), "sh".to_string());
        p.attribute_condition
            .insert(ATTRIBUTE_KEY_PLATFORM.to_string(), "linux".to_string());
        p
    }

    #[test]
    fn test_render_requires_city() {
        let conf = conf();
        let mut p = param();
        p.attribute_condition.remove(ATTRIBUTE_KEY_CITY);
        let err = render(&conf, &mut p).unwrap_err();
        assert!(matches!(err, OperatorError::MissingAttribute(_)));
    }

    #[test]
    fn test_render_ports_and_env() {
        let conf = conf();
        let mut p = param();
        let yaml = render(&conf, &mut p).unwrap();

        // one containerPort/hostPort pair per logical port, base + index
        // over the sorted names
        assert_eq!(yaml.matches("containerPort: 31000").count(), 1);
        assert_eq!(yaml.matches("containerPort: 31001").count(), 1);
        assert_eq!(yaml.matches("hostPort: 31000").count(), 1);
        assert!(yaml.contains("name: service-port"));
        assert!(yaml.contains("name: stats-port"));

        // the env block advertises both variables per port
        assert_eq!(p.env["HOST_PORT_SERVICE_PORT"], "31000");
        assert_eq!(p.env["RAND_PORT_SERVICE_PORT"], "31000");
        assert_eq!(p.env["HOST_PORT_STATS_PORT"], "31001");
        assert!(yaml.contains("name: HOST_PORT_SERVICE_PORT"));
        assert!(yaml.contains("value: 31000"));

        // no placeholder left behind
        assert!(!yaml.contains("__crm_"));
        // linux never gets host networking
        assert!(!yaml.contains("hostNetwork: true"));
    }

    #[test]
    fn test_render_windows_aux_port_and_host_network() {
        let conf = conf();
        let mut p = param();
        p.attribute_condition
            .insert(ATTRIBUTE_KEY_PLATFORM.to_string(), "windows".to_string());
        let yaml = render(&conf, &mut p).unwrap();
        assert!(yaml.contains("hostNetwork: true"));
        assert!(yaml.contains(&format!("name: {AUX_PORT_NAME}")));
        assert!(yaml.contains(&format!("containerPort: {AUX_PORT_NUMBER}")));
    }

    #[test]
    fn test_render_windows_host_network_can_be_disabled() {
        let mut conf = conf();
        conf.disable_win_host_network = true;
        let mut p = param();
        p.attribute_condition
            .insert(ATTRIBUTE_KEY_PLATFORM.to_string(), "windows".to_string());
        let yaml = render(&conf, &mut p).unwrap();
        assert!(!yaml.contains("hostNetwork: true"));
    }

    #[test]
    fn test_instance_type_overrides_and_millicores() {
        let mut conf = conf();
        conf.instance_types.push(InstanceType {
            platform: "linux".to_string(),
            group: "sh".to_string(),
            cpu_per_instance: 4.0,
            mem_per_instance: 8_192.0,
            cpu_per_instance_offset: 1.0,
            ..Default::default()
        });
        let mut p = param();
        let yaml = render(&conf, &mut p).unwrap();
        // request renders the unshrunk size, in millicores
        assert!(yaml.contains("cpu: 4000.00m"));
        assert!(yaml.contains("memory: 8192.00Mi"));
        // limit defaults to the request
        assert!(yaml.contains("cpu: 4000.00m\n            memory: 8192.00Mi"));
    }

    #[test]
    fn test_port_name_mapping_round_trip() {
        assert_eq!(logical_to_manifest_port("SERVICE_PORT"), "service-port");
        assert_eq!(manifest_to_logical_port("service-port"), "SERVICE_PORT");
    }
}
