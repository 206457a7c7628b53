use std::sync::Arc;

use async_trait::async_trait;
use error_stack::Report;
use tracing::info;
use tracing::instrument;

use super::open_shell;
use super::run_step;
use crate::deployer::DeployError;
use crate::deployer::NodePhase;
use crate::deployer::PhaseKind;
use crate::infrastructure::remote::NodeConnector;
use crate::platform::ClusterConfig;
use crate::platform::NodeConfig;

const MIN_KERNEL: (u32, u32) = (4, 19);
const MIN_FREE_KIB: u64 = 10 * 1024 * 1024;
const REQUIRED_BINARIES: [&str; 3] = ["kubeadm", "kubelet", "kubectl"];
const WRITABLE_DIRS: [&str; 4] = [
    "/etc/kubernetes",
    "/var/lib/kubelet",
    "/etc/cni/net.d",
    "/opt/cni/bin",
];

/// Verifies reachability and the baseline OS requirements of a node.
pub struct InitPhase {
    connector: Arc<dyn NodeConnector>,
}

impl InitPhase {
    pub fn new(connector: Arc<dyn NodeConnector>) -> Self {
        Self { connector }
    }
}

/// Extracts `(major, minor)` from a `uname -r` string such as
/// `5.15.0-91-generic`.
pub(crate) fn parse_kernel_version(release: &str) -> Option<(u32, u32)> {
    let mut parts = release.trim().split(|c: char| !c.is_ascii_digit());
    let major = parts.next()?.parse().ok()?;
    let minor = parts.next()?.parse().ok()?;
    Some((major, minor))
}

fn precondition(node: &NodeConfig, message: String) -> Report<DeployError> {
    Report::new(DeployError::Precondition {
        node: node.address.clone(),
        message,
    })
}

#[async_trait]
impl NodePhase for InitPhase {
    fn kind(&self) -> PhaseKind {
        PhaseKind::Init
    }

    #[instrument(skip_all, fields(node = %node.address))]
    async fn run(
        &self,
        node: &NodeConfig,
        _cluster: &ClusterConfig,
    ) -> Result<(), Report<DeployError>> {
        let shell = open_shell(self.connector.as_ref(), node).await?;

        let release = run_step(&shell, node, "read kernel version", "uname -r").await?;
        match parse_kernel_version(&release) {
            Some(version) if version >= MIN_KERNEL => {}
            _ => {
                return Err(precondition(
                    node,
                    format!(
                        "kernel {} is older than {}.{}",
                        release.trim(),
                        MIN_KERNEL.0,
                        MIN_KERNEL.1
                    ),
                ))
            }
        }

        let free = run_step(
            &shell,
            node,
            "read free disk space",
            "df -Pk /var/lib | awk 'NR==2 {print $4}'",
        )
        .await?;
        let free_kib: u64 = free.trim().parse().map_err(|_| {
            precondition(node, format!("cannot read free space under /var/lib: '{}'", free.trim()))
        })?;
        if free_kib < MIN_FREE_KIB {
            return Err(precondition(
                node,
                format!(
                    "only {} MiB free under /var/lib, at least {} MiB required",
                    free_kib / 1024,
                    MIN_FREE_KIB / 1024
                ),
            ));
        }

        for dir in WRITABLE_DIRS {
            let writable = shell
                .probe(&format!("mkdir -p {dir} && test -w {dir}"))
                .await
                .map_err(|e| e.change_context(DeployError::step(node, "check directories")))?;
            if !writable {
                return Err(precondition(node, format!("{dir} is not writable")));
            }
        }

        for binary in REQUIRED_BINARIES {
            let present = shell
                .probe(&format!("command -v {binary}"))
                .await
                .map_err(|e| e.change_context(DeployError::step(node, "check binaries")))?;
            if !present {
                return Err(precondition(node, format!("{binary} is not installed")));
            }
        }

        info!("Node meets baseline requirements");
        Ok(())
    }
}
