use std::collections::BTreeMap;

use async_trait::async_trait;
use error_stack::Report;

use super::DeploymentStatus;
use super::KubeObject;
use super::KubernetesError;
use super::NodeSummary;
use super::PodSummary;

/// Operations chasi-bod performs against a Kubernetes API server.
///
/// Implementations report missing objects as [`KubernetesError::NotFound`]
/// and create conflicts as [`KubernetesError::AlreadyExists`] so callers can
/// decide what is idempotent.
#[async_trait]
pub trait ClusterApi: Send + Sync {
    /// Cheap round trip proving the API server answers
    async fn ping(&self) -> Result<(), Report<KubernetesError>>;

    async fn create_namespace(
        &self,
        name: &str,
        labels: BTreeMap<String, String>,
    ) -> Result<(), Report<KubernetesError>>;

    async fn namespace_exists(&self, name: &str) -> Result<bool, Report<KubernetesError>>;

    async fn delete_namespace(&self, name: &str) -> Result<(), Report<KubernetesError>>;

    /// Namespace names, optionally filtered by a label selector
    async fn list_namespaces(
        &self,
        label_selector: Option<&str>,
    ) -> Result<Vec<String>, Report<KubernetesError>>;

    /// Server-side applies `object` into `namespace` (ignored for
    /// cluster-scoped kinds)
    async fn apply(
        &self,
        namespace: &str,
        object: &KubeObject,
    ) -> Result<(), Report<KubernetesError>>;

    async fn deployment_status(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<DeploymentStatus, Report<KubernetesError>>;

    async fn list_deployments(
        &self,
        namespace: &str,
    ) -> Result<Vec<(String, DeploymentStatus)>, Report<KubernetesError>>;

    /// Decoded data of a secret
    async fn secret_data(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<BTreeMap<String, Vec<u8>>, Report<KubernetesError>>;

    async fn list_nodes(&self) -> Result<Vec<NodeSummary>, Report<KubernetesError>>;

    async fn set_unschedulable(
        &self,
        node: &str,
        unschedulable: bool,
    ) -> Result<(), Report<KubernetesError>>;

    async fn list_pods_on_node(&self, node: &str)
        -> Result<Vec<PodSummary>, Report<KubernetesError>>;

    async fn evict_pod(&self, namespace: &str, name: &str) -> Result<(), Report<KubernetesError>>;

    async fn delete_node(&self, name: &str) -> Result<(), Report<KubernetesError>>;
}
