//! Distbuild Resource Operator
//!
//! The control loop primitives for the worker fleet: launch a batch of
//! container workers as one service, watch it go Staging -> Running,
//! collect its endpoints, and release it again. Capacity queries cover
//! both plain clusters and the federated variant that answers per
//! (platform, city) selector.

pub mod cluster;
pub mod error;
pub mod operator;
pub mod template;
pub mod types;

pub use cluster::{ClientFactory, ClusterApi, RestClusterClient, RestClusterFactory};
pub use error::OperatorError;
pub use operator::{ClusterOperator, Operator, CLIENT_CACHE_TTL};
pub use types::{
    Endpoint, InstanceType, LaunchParam, NodeInfo, OperatorConfig, ServiceInfo, ServiceStatus,
    Volume,
};

/// Node label marking a worker host as unschedulable for us.
pub const DISABLE_LABEL: &str = "distbuild/disabled";

/// Label tying pods to the service that launched them.
pub const APP_LABEL: &str = "distbuild/name";

/// Attribute key for the city selector.
pub const ATTRIBUTE_KEY_CITY: &str = "city";

/// Attribute key for the platform selector.
pub const ATTRIBUTE_KEY_PLATFORM: &str = "platform";
