//! Platform health: a registry of named checkers folded into one status,
//! the deeper cluster checks, and an optional `/healthz` endpoint.

mod checks;
mod registry;
mod server;

use core::error::Error;

pub use checks::run_cluster_checks;
pub use checks::HostApiChecker;
pub use checks::NodeReadinessChecker;
pub use checks::VClusterApiChecker;
pub use registry::aggregate;
pub use registry::HealthChecker;
pub use registry::HealthRegistry;
pub use registry::CHECK_TIMEOUT;
pub use server::HealthServer;

#[derive(Debug, derive_more::Display)]
pub enum HealthError {
    #[display("Host cluster API is unavailable")]
    HostApi,
    #[display("Node {node} is not Ready")]
    NodeNotReady { node: String },
    #[display("Deployment {namespace}/{name} has {ready}/{replicas} ready replicas")]
    DeploymentUnhealthy {
        namespace: String,
        name: String,
        ready: i32,
        replicas: i32,
    },
    #[display("API of vcluster '{name}' is unreachable")]
    TenantUnreachable { name: String },
    #[display("{failed} cluster checks failed")]
    ChecksFailed { failed: usize },
    #[display("Health server failed: {message}")]
    Server { message: String },
}

impl Error for HealthError {}
