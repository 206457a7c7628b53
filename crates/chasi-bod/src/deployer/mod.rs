//! Node convergence: the ordered deployment phases and the orchestrator
//! that sequences them.

pub mod drain;
mod kubeadm;
mod orchestrator;
pub mod phases;
mod tenants;

use core::error::Error;
use std::time::Duration;

use async_trait::async_trait;
use error_stack::Report;

pub use kubeadm::JoinCommand;
pub use kubeadm::kubeadm_version;
pub use kubeadm::wait_nodes_ready;
pub use kubeadm::KubeadmInstaller;
pub use kubeadm::READY_POLL;
pub use orchestrator::Orchestrator;
pub use orchestrator::PhaseTimeouts;
pub use tenants::VClusterDeployPhase;

use crate::platform::ClusterConfig;
use crate::platform::NodeConfig;
use crate::platform::VClusterConfig;
use crate::state::NodeLifecycleState;

/// The seven deployment phases, in execution order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, derive_more::Display)]
pub enum PhaseKind {
    Init,
    #[display("OSConfig")]
    OsConfig,
    RuntimeConfig,
    NetworkConfig,
    StorageConfig,
    K8sInstall,
    VClusterDeploy,
}

impl PhaseKind {
    /// Node state recorded once this phase completes on a node.
    pub fn reached(self) -> Option<NodeLifecycleState> {
        match self {
            PhaseKind::Init => Some(NodeLifecycleState::Initializing),
            PhaseKind::OsConfig => Some(NodeLifecycleState::OsConfigured),
            PhaseKind::RuntimeConfig => Some(NodeLifecycleState::RuntimeReady),
            PhaseKind::NetworkConfig => Some(NodeLifecycleState::NetworkReady),
            PhaseKind::StorageConfig => Some(NodeLifecycleState::StorageReady),
            PhaseKind::K8sInstall => Some(NodeLifecycleState::K8sJoined),
            PhaseKind::VClusterDeploy => None,
        }
    }
}

/// Errors raised while converging nodes.
#[derive(Debug, derive_more::Display)]
pub enum DeployError {
    #[display("Phase {phase} failed on node {node}")]
    PhaseFailed { phase: PhaseKind, node: String },
    #[display("Phase {phase} timed out after {timeout:?} on node {node}")]
    PhaseTimeout {
        phase: PhaseKind,
        node: String,
        timeout: Duration,
    },
    #[display("Phase {phase} failed")]
    ClusterPhaseFailed { phase: PhaseKind },
    #[display("Phase {phase} timed out after {timeout:?}")]
    ClusterPhaseTimeout { phase: PhaseKind, timeout: Duration },
    #[display("Step '{step}' failed on node {node}")]
    Step { node: String, step: String },
    #[display("Node {node} does not meet requirement: {message}")]
    Precondition { node: String, message: String },
    #[display("Unsupported {what}: {value}")]
    Unsupported { what: String, value: String },
    #[display("Cannot parse join command: {message}")]
    InvalidJoinCommand { message: String },
    #[display("Host cluster API is unavailable")]
    HostApi,
    #[display("Nodes did not become Ready: {nodes}")]
    NotReady { nodes: String },
    #[display("Failed to drain node {node}")]
    DrainFailed { node: String },
    #[display("Failed to deploy vcluster '{name}'")]
    TenantFailed { name: String },
    #[display("Failed to add node {node}")]
    AddNodeFailed { node: String },
    #[display("Adding node {node} timed out after {timeout:?}")]
    AddNodeTimeout { node: String, timeout: Duration },
    #[display("Failed to remove node {node}")]
    RemoveNodeFailed { node: String },
    #[display("Removing node {node} timed out after {timeout:?}")]
    RemoveNodeTimeout { node: String, timeout: Duration },
    #[display("Cluster has no master node")]
    NoMaster,
}

impl Error for DeployError {}

impl DeployError {
    pub fn step(node: &NodeConfig, step: impl Into<String>) -> Self {
        DeployError::Step {
            node: node.address.clone(),
            step: step.into(),
        }
    }
}

/// One per-node phase (Init through StorageConfig).
#[async_trait]
pub trait NodePhase: Send + Sync {
    fn kind(&self) -> PhaseKind;

    async fn run(&self, node: &NodeConfig, cluster: &ClusterConfig)
        -> Result<(), Report<DeployError>>;
}

/// The K8sInstall phase: bootstraps the control plane and joins nodes.
#[async_trait]
pub trait ClusterInstaller: Send + Sync {
    /// Installs Kubernetes across every node of `cluster` and waits until
    /// all of them are Ready.
    async fn install(&self, cluster: &ClusterConfig) -> Result<(), Report<DeployError>>;

    /// Joins one additional node to the running cluster and waits until it
    /// is Ready.
    async fn join(&self, node: &NodeConfig, cluster: &ClusterConfig)
        -> Result<(), Report<DeployError>>;
}

/// The VClusterDeploy phase.
#[async_trait]
pub trait TenantInstaller: Send + Sync {
    async fn deploy(
        &self,
        vclusters: &[&VClusterConfig],
        cluster: &ClusterConfig,
    ) -> Result<(), Report<DeployError>>;
}

/// Incremental topology changes, as used by the lifecycle operations.
#[async_trait]
pub trait NodeProvisioner: Send + Sync {
    async fn add_node(
        &self,
        node: &NodeConfig,
        cluster: &ClusterConfig,
    ) -> Result<(), Report<DeployError>>;

    async fn remove_node(
        &self,
        node: &NodeConfig,
        cluster: &ClusterConfig,
        reset_os: bool,
    ) -> Result<(), Report<DeployError>>;
}
