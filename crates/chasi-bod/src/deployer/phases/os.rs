use std::sync::Arc;

use async_trait::async_trait;
use error_stack::Report;
use error_stack::ResultExt;
use tracing::debug;
use tracing::info;
use tracing::instrument;
use tracing::warn;

use super::mount_command;
use super::open_shell;
use super::quoted;
use super::run_step;
use crate::deployer::DeployError;
use crate::deployer::NodePhase;
use crate::deployer::PhaseKind;
use crate::infrastructure::remote::NodeConnector;
use crate::infrastructure::remote::NodeShell;
use crate::platform::ClusterConfig;
use crate::platform::DiskConfig;
use crate::platform::NodeConfig;

pub const SYSCTL_FILE: &str = "/etc/sysctl.d/99-chasi-bod.conf";

/// Applies node sysctl values, prepares disks and fixes base-OS file modes.
pub struct OsConfigPhase {
    connector: Arc<dyn NodeConnector>,
}

impl OsConfigPhase {
    pub fn new(connector: Arc<dyn NodeConnector>) -> Self {
        Self { connector }
    }
}

pub(crate) fn sysctl_file_content(node: &NodeConfig) -> String {
    node.sysctl
        .iter()
        .map(|(key, value)| format!("{key} = {value}\n"))
        .collect()
}

fn mkfs_command(node: &NodeConfig, disk: &DiskConfig) -> Result<String, Report<DeployError>> {
    let force = match disk.filesystem.as_str() {
        "xfs" | "btrfs" => "-f",
        _ => "-F",
    };
    Ok(format!(
        "mkfs -t {} {force} {}",
        quoted(node, &disk.filesystem)?,
        quoted(node, &disk.device)?
    ))
}

fn fstab_command(node: &NodeConfig, disk: &DiskConfig) -> Result<String, Report<DeployError>> {
    let filesystem = if disk.filesystem.is_empty() {
        "auto"
    } else {
        disk.filesystem.as_str()
    };
    let entry = format!("{} {} {filesystem} defaults 0 2", disk.device, disk.mount_point);
    let prefix = format!("^{} {} ", disk.device, disk.mount_point);
    Ok(format!(
        "grep -qs {} /etc/fstab || echo {} >> /etc/fstab",
        quoted(node, &prefix)?,
        quoted(node, &entry)?
    ))
}

async fn prepare_disk(
    shell: &NodeShell,
    node: &NodeConfig,
    disk: &DiskConfig,
) -> Result<(), Report<DeployError>> {
    let step = format!("prepare disk {}", disk.device);

    if disk.format && !disk.filesystem.is_empty() {
        let current = run_step(
            shell,
            node,
            &step,
            &format!(
                "blkid -s TYPE -o value {} || true",
                quoted(node, &disk.device)?
            ),
        )
        .await?;
        if current.trim() == disk.filesystem {
            debug!(device = %disk.device, "Disk already carries {}", disk.filesystem);
        } else {
            info!(device = %disk.device, filesystem = %disk.filesystem, "Formatting disk");
            run_step(shell, node, &step, &mkfs_command(node, disk)?).await?;
        }
    }

    if !disk.mount_point.is_empty() {
        run_step(shell, node, &step, &mount_command(node, disk)?).await?;
        run_step(shell, node, &step, &fstab_command(node, disk)?).await?;
    }
    Ok(())
}

#[async_trait]
impl NodePhase for OsConfigPhase {
    fn kind(&self) -> PhaseKind {
        PhaseKind::OsConfig
    }

    #[instrument(skip_all, fields(node = %node.address))]
    async fn run(
        &self,
        node: &NodeConfig,
        cluster: &ClusterConfig,
    ) -> Result<(), Report<DeployError>> {
        let shell = open_shell(self.connector.as_ref(), node).await?;

        if !node.sysctl.is_empty() {
            shell
                .write_file(SYSCTL_FILE, &sysctl_file_content(node), "0644")
                .await
                .change_context_lazy(|| DeployError::step(node, "write sysctl"))?;
            run_step(&shell, node, "apply sysctl", "sysctl --system").await?;
        }

        for disk in &node.disk_configs {
            prepare_disk(&shell, node, disk).await?;
        }

        for file in &cluster.base_os.files {
            if file.mode.is_empty() {
                continue;
            }
            let dest = quoted(node, &file.dest)?;
            let present = shell
                .probe(&format!("test -e {dest}"))
                .await
                .change_context_lazy(|| DeployError::step(node, "check base-OS file"))?;
            if !present {
                warn!(dest = %file.dest, "Base-OS file not present on node, skipping permissions");
                continue;
            }
            run_step(
                &shell,
                node,
                "fix base-OS file permissions",
                &format!("chown root:root {dest} && chmod {} {dest}", quoted(node, &file.mode)?),
            )
            .await?;
        }

        info!("OS configured");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use similar_asserts::assert_eq;
    use test_log::test;

    use super::*;
    use crate::infrastructure::remote::mock::MockConnector;
    use crate::platform::model::fixtures;
    use crate::platform::FileConfig;
    use crate::platform::NodeRole;

    #[test]
    fn sysctl_file_lists_sorted_keys() {
        let mut node = fixtures::node("10.0.0.1", &[NodeRole::Worker]);
        node.sysctl.insert("vm.swappiness".to_string(), "0".to_string());
        node.sysctl
            .insert("net.ipv4.ip_forward".to_string(), "1".to_string());

        assert_eq!(
            sysctl_file_content(&node),
            "net.ipv4.ip_forward = 1\nvm.swappiness = 0\n"
        );
    }

    #[test(tokio::test)]
    async fn unformatted_disk_is_formatted_and_mounted() {
        let connector = MockConnector::new();
        let mut node = fixtures::node("10.0.0.1", &[NodeRole::Worker]);
        node.disk_configs.push(DiskConfig {
            device: "/dev/sdb".to_string(),
            filesystem: "ext4".to_string(),
            mount_point: "/data".to_string(),
            format: true,
        });
        let cluster = fixtures::cluster(vec![node.clone()]);

        OsConfigPhase::new(Arc::new(connector.clone()))
            .run(&node, &cluster)
            .await
            .expect("should configure");

        assert!(connector.ran_on("10.0.0.1", "mkfs -t ext4 -F /dev/sdb"));
        assert!(connector.ran_on("10.0.0.1", "mount /dev/sdb /data"));
        assert!(connector.ran_on("10.0.0.1", "/etc/fstab"));
    }

    #[test(tokio::test)]
    async fn disk_with_matching_filesystem_is_not_reformatted() {
        let connector = MockConnector::new();
        connector.respond("blkid", 0, "xfs\n", "");
        let mut node = fixtures::node("10.0.0.1", &[NodeRole::Worker]);
        node.disk_configs.push(DiskConfig {
            device: "/dev/sdb".to_string(),
            filesystem: "xfs".to_string(),
            mount_point: "/data".to_string(),
            format: true,
        });
        let cluster = fixtures::cluster(vec![node.clone()]);

        OsConfigPhase::new(Arc::new(connector.clone()))
            .run(&node, &cluster)
            .await
            .expect("should configure");

        assert!(!connector.ran_on("10.0.0.1", "mkfs"));
    }

    #[test(tokio::test)]
    async fn base_os_file_modes_are_fixed() {
        let connector = MockConnector::new();
        let node = fixtures::node("10.0.0.1", &[NodeRole::Master]);
        let mut cluster = fixtures::cluster(vec![node.clone()]);
        cluster.base_os.files.push(FileConfig {
            source: "files/motd".to_string(),
            dest: "/etc/motd".to_string(),
            mode: "0644".to_string(),
        });

        OsConfigPhase::new(Arc::new(connector.clone()))
            .run(&node, &cluster)
            .await
            .expect("should configure");

        assert!(connector.ran_on("10.0.0.1", "chmod 0644 /etc/motd"));
    }
}
