//! Per-node phases, Init through StorageConfig.

mod init;
mod network;
mod os;
mod runtime;
mod storage;

use std::sync::Arc;

use error_stack::Report;
use error_stack::ResultExt;

pub use init::InitPhase;
pub use network::NetworkConfigPhase;
pub use os::OsConfigPhase;
pub use runtime::ContainerRuntime;
pub use runtime::RuntimeConfigPhase;
pub use storage::StorageConfigPhase;

use super::DeployError;
use super::NodePhase;
use crate::infrastructure::remote::quote;
use crate::infrastructure::remote::NodeConnector;
use crate::infrastructure::remote::NodeShell;
use crate::platform::DiskConfig;
use crate::platform::NodeConfig;

/// Phases 1-5 in execution order.
pub fn node_phases(connector: Arc<dyn NodeConnector>) -> Vec<Arc<dyn NodePhase>> {
    vec![
        Arc::new(InitPhase::new(connector.clone())),
        Arc::new(OsConfigPhase::new(connector.clone())),
        Arc::new(RuntimeConfigPhase::new(connector.clone())),
        Arc::new(NetworkConfigPhase::new(connector.clone())),
        Arc::new(StorageConfigPhase::new(connector)),
    ]
}

pub(crate) async fn open_shell(
    connector: &dyn NodeConnector,
    node: &NodeConfig,
) -> Result<NodeShell, Report<DeployError>> {
    NodeShell::open(connector, node)
        .await
        .change_context_lazy(|| DeployError::step(node, "connect"))
}

/// Runs `command`, attributing a failure to `step`.
pub(crate) async fn run_step(
    shell: &NodeShell,
    node: &NodeConfig,
    step: &str,
    command: &str,
) -> Result<String, Report<DeployError>> {
    shell
        .run(command)
        .await
        .change_context_lazy(|| DeployError::step(node, step))
}

pub(crate) fn quoted(node: &NodeConfig, word: &str) -> Result<String, Report<DeployError>> {
    quote(word).change_context_lazy(|| DeployError::step(node, "quote argument"))
}

/// Mounts `disk` at its mount point unless something is mounted there.
pub(crate) fn mount_command(node: &NodeConfig, disk: &DiskConfig) -> Result<String, Report<DeployError>> {
    let device = quoted(node, &disk.device)?;
    let mount_point = quoted(node, &disk.mount_point)?;
    Ok(format!(
        "mkdir -p {mount_point} && (mountpoint -q {mount_point} || mount {device} {mount_point})"
    ))
}
