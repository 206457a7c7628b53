//! Business applications deployed into tenant vclusters with Helm,
//! Kustomize or raw manifests.

mod commands;
mod deployer;

use core::error::Error;

pub use deployer::injected_config_name;
pub use deployer::ApplicationDeployer;

#[derive(Debug, derive_more::Display)]
pub enum ApplicationError {
    #[display("Application '{name}' is not defined in the platform document")]
    Unknown { name: String },
    #[display("Application '{name}': {reason}")]
    InvalidSource { name: String, reason: String },
    #[display("vcluster '{vcluster}' is unavailable")]
    TenantUnavailable { vcluster: String },
    #[display("Cannot prepare working files for application '{name}'")]
    Workspace { name: String },
    #[display("Failed to ensure namespace {namespace} in vcluster '{vcluster}'")]
    Namespace { vcluster: String, namespace: String },
    #[display("{backend} failed to {action} application '{name}'")]
    Backend {
        name: String,
        backend: &'static str,
        action: &'static str,
    },
    #[display("Failed to inject configuration for application '{name}'")]
    ConfigInjection { name: String },
}

impl Error for ApplicationError {}
