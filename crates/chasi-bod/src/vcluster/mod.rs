//! Tenant virtual clusters on the Host cluster.

mod manager;
pub mod manifests;
mod resolver;

use core::error::Error;

pub use manager::VClusterManager;
pub use resolver::tenant_endpoint;
pub use resolver::SecretClientResolver;
pub use resolver::TenantClientResolver;
pub use resolver::TenantEndpoint;
#[cfg(test)]
pub(crate) use resolver::mock;

/// Errors raised while managing a vcluster.
#[derive(Debug, derive_more::Display)]
pub enum VClusterError {
    #[display("Failed to ensure namespace {namespace} for vcluster '{name}'")]
    NamespaceFailed { name: String, namespace: String },
    #[display("Failed to apply control plane of vcluster '{name}'")]
    ApplyFailed { name: String },
    #[display("Timed out waiting for vcluster '{name}' in namespace {namespace} to become ready")]
    ReadyTimeout { name: String, namespace: String },
    #[display("Failed while waiting for vcluster '{name}' to become ready")]
    WaitFailed { name: String },
    #[display("Failed to delete namespace {namespace} of vcluster '{name}'")]
    DeleteFailed { name: String, namespace: String },
    #[display("Timed out waiting for namespace {namespace} of vcluster '{name}' to be removed")]
    DeleteTimeout { name: String, namespace: String },
    #[display("Timed out waiting for the API of vcluster '{name}' to answer")]
    ApiTimeout { name: String },
    #[display("Secret {secret} of vcluster '{name}' not found in namespace {namespace}")]
    SecretMissing {
        name: String,
        namespace: String,
        secret: String,
    },
    #[display("Secret {secret} of vcluster '{name}' has no usable '{key}' entry")]
    CredentialMissing {
        name: String,
        secret: String,
        key: String,
    },
    #[display("Failed to build an API client for vcluster '{name}'")]
    ClientFailed { name: String },
    #[display("Failed to list vclusters")]
    ListFailed,
}

impl Error for VClusterError {}
