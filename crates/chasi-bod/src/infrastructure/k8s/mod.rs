//! Kubernetes API access for the Host cluster and vclusters.

mod api;
mod client;
mod host;
mod kube_api;
#[cfg(test)]
pub(crate) mod mock;
mod types;

pub use api::ClusterApi;
pub use client::client_from_kubeconfig_yaml;
pub use client::init_kube_client;
pub use host::AdminKubeconfigAccess;
pub use host::HostAccess;
pub use host::KubeconfigFileAccess;
pub use host::ADMIN_KUBECONFIG_PATH;
pub use kube_api::KubeClusterApi;
pub use types::*;
