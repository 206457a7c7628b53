use core::error::Error;

use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::core::v1::ConfigMap;
use k8s_openapi::api::core::v1::Service;
use k8s_openapi::api::core::v1::ServiceAccount;
use k8s_openapi::api::rbac::v1::Role;
use k8s_openapi::api::rbac::v1::RoleBinding;
use k8s_openapi::api::storage::v1::StorageClass;

/// Label marking objects owned by chasi-bod.
pub const MANAGED_BY_LABEL: &str = "app.kubernetes.io/managed-by";
pub const MANAGED_BY_VALUE: &str = "chasi-bod";

/// Errors that can occur during Kubernetes operations.
#[derive(Debug, derive_more::Display)]
pub enum KubernetesError {
    #[display("Failed to connect to Kubernetes API: {message}")]
    ConnectionFailed { message: String },
    #[display("{kind} not found: {name}")]
    NotFound { kind: String, name: String },
    #[display("{kind} already exists: {name}")]
    AlreadyExists { kind: String, name: String },
    #[display("Eviction of pod {name} blocked by a disruption budget")]
    EvictionBlocked { name: String },
    #[display("Kubernetes request failed: {message}")]
    RequestFailed { message: String },
}

impl Error for KubernetesError {}

impl KubernetesError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, KubernetesError::NotFound { .. })
    }

    pub fn is_already_exists(&self) -> bool {
        matches!(self, KubernetesError::AlreadyExists { .. })
    }

    pub fn is_eviction_blocked(&self) -> bool {
        matches!(self, KubernetesError::EvictionBlocked { .. })
    }

    /// The API server could not be reached at all.
    pub fn is_connection_failed(&self) -> bool {
        matches!(self, KubernetesError::ConnectionFailed { .. })
    }
}

/// Readiness counters of a Deployment.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DeploymentStatus {
    pub replicas: i32,
    pub ready_replicas: i32,
}

impl DeploymentStatus {
    pub fn is_ready(&self) -> bool {
        self.ready_replicas > 0 && self.ready_replicas >= self.replicas
    }
}

/// The parts of a Node the orchestration cares about.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NodeSummary {
    pub name: String,
    pub ready: bool,
    pub unschedulable: bool,
    pub control_plane: bool,
    /// InternalIP, ExternalIP and Hostname addresses
    pub addresses: Vec<String>,
}

impl NodeSummary {
    /// Whether this Kubernetes node is the machine reachable at `address`.
    pub fn matches(&self, address: &str) -> bool {
        self.name == address || self.addresses.iter().any(|a| a == address)
    }
}

/// A pod scheduled on a node.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PodSummary {
    pub namespace: String,
    pub name: String,
    pub daemonset_owned: bool,
    pub mirror: bool,
}

impl PodSummary {
    /// Pods a drain must evict; DaemonSet and static pods stay.
    pub fn is_evictable(&self) -> bool {
        !self.daemonset_owned && !self.mirror
    }
}

/// Typed objects that can be server-side applied.
#[derive(Debug, Clone)]
pub enum KubeObject {
    ServiceAccount(ServiceAccount),
    Role(Role),
    RoleBinding(RoleBinding),
    Service(Service),
    Deployment(Deployment),
    ConfigMap(ConfigMap),
    StorageClass(StorageClass),
}

impl KubeObject {
    pub fn kind(&self) -> &'static str {
        match self {
            KubeObject::ServiceAccount(_) => "ServiceAccount",
            KubeObject::Role(_) => "Role",
            KubeObject::RoleBinding(_) => "RoleBinding",
            KubeObject::Service(_) => "Service",
            KubeObject::Deployment(_) => "Deployment",
            KubeObject::ConfigMap(_) => "ConfigMap",
            KubeObject::StorageClass(_) => "StorageClass",
        }
    }

    pub fn name(&self) -> String {
        let meta = match self {
            KubeObject::ServiceAccount(o) => &o.metadata,
            KubeObject::Role(o) => &o.metadata,
            KubeObject::RoleBinding(o) => &o.metadata,
            KubeObject::Service(o) => &o.metadata,
            KubeObject::Deployment(o) => &o.metadata,
            KubeObject::ConfigMap(o) => &o.metadata,
            KubeObject::StorageClass(o) => &o.metadata,
        };
        meta.name.clone().unwrap_or_default()
    }
}
