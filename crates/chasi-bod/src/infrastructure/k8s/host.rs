use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use error_stack::Report;
use error_stack::ResultExt;
use tracing::info;

use super::client_from_kubeconfig_yaml;
use super::init_kube_client;
use super::ClusterApi;
use super::KubeClusterApi;
use super::KubernetesError;
use crate::infrastructure::remote::NodeConnector;
use crate::infrastructure::remote::NodeShell;
use crate::platform::ClusterConfig;

/// Admin kubeconfig written by `kubeadm init` on control-plane nodes.
pub const ADMIN_KUBECONFIG_PATH: &str = "/etc/kubernetes/admin.conf";

/// Produces a client for the Host cluster once its control plane exists.
#[async_trait]
pub trait HostAccess: Send + Sync {
    async fn host_api(
        &self,
        cluster: &ClusterConfig,
    ) -> Result<Arc<dyn ClusterApi>, Report<KubernetesError>>;
}

/// Uses a local kubeconfig file, or the default client configuration.
pub struct KubeconfigFileAccess {
    path: Option<PathBuf>,
}

impl KubeconfigFileAccess {
    pub fn new(path: Option<PathBuf>) -> Self {
        Self { path }
    }
}

#[async_trait]
impl HostAccess for KubeconfigFileAccess {
    async fn host_api(
        &self,
        _cluster: &ClusterConfig,
    ) -> Result<Arc<dyn ClusterApi>, Report<KubernetesError>> {
        let client = init_kube_client(self.path.clone()).await?;
        Ok(Arc::new(KubeClusterApi::new(client)))
    }
}

/// Reads the admin kubeconfig off the first master node.
pub struct AdminKubeconfigAccess {
    connector: Arc<dyn NodeConnector>,
}

impl AdminKubeconfigAccess {
    pub fn new(connector: Arc<dyn NodeConnector>) -> Self {
        Self { connector }
    }
}

#[async_trait]
impl HostAccess for AdminKubeconfigAccess {
    async fn host_api(
        &self,
        cluster: &ClusterConfig,
    ) -> Result<Arc<dyn ClusterApi>, Report<KubernetesError>> {
        let master = cluster
            .first_master()
            .ok_or_else(|| {
                Report::new(KubernetesError::ConnectionFailed {
                    message: "cluster has no master node".to_string(),
                })
            })?;
        let connection_failed = || KubernetesError::ConnectionFailed {
            message: format!("cannot read {ADMIN_KUBECONFIG_PATH} from {}", master.address),
        };

        let shell = NodeShell::open(self.connector.as_ref(), master)
            .await
            .change_context_lazy(connection_failed)?;
        let kubeconfig = shell
            .run(&format!("cat {ADMIN_KUBECONFIG_PATH}"))
            .await
            .change_context_lazy(connection_failed)?;

        let client = client_from_kubeconfig_yaml(&kubeconfig).await?;
        info!(master = %master.address, "Connected to Host cluster API");
        Ok(Arc::new(KubeClusterApi::new(client)))
    }
}
