use std::collections::BTreeSet;
use std::sync::Arc;

use async_trait::async_trait;
use error_stack::Report;
use tracing::info;
use tracing::instrument;

use super::mount_command;
use super::open_shell;
use super::quoted;
use super::run_step;
use crate::deployer::DeployError;
use crate::deployer::NodePhase;
use crate::deployer::PhaseKind;
use crate::infrastructure::remote::NodeConnector;
use crate::platform::ClusterConfig;
use crate::platform::NodeConfig;
use crate::platform::StorageConfig;

/// OS-level dependency of a CSI driver.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum StorageDependency {
    NfsClient,
    IscsiInitiator,
}

impl StorageDependency {
    fn apt_package(self) -> &'static str {
        match self {
            StorageDependency::NfsClient => "nfs-common",
            StorageDependency::IscsiInitiator => "open-iscsi",
        }
    }

    fn rpm_package(self) -> &'static str {
        match self {
            StorageDependency::NfsClient => "nfs-utils",
            StorageDependency::IscsiInitiator => "iscsi-initiator-utils",
        }
    }
}

/// Packages implied by the provisioners of the configured StorageClasses.
pub(crate) fn dependencies(storage: &StorageConfig) -> BTreeSet<StorageDependency> {
    let mut deps = BTreeSet::new();
    for class in &storage.storage_classes {
        let provisioner = class.provisioner.to_ascii_lowercase();
        if provisioner.contains("nfs") {
            deps.insert(StorageDependency::NfsClient);
        }
        if ["iscsi", "longhorn", "openebs"]
            .iter()
            .any(|p| provisioner.contains(p))
        {
            deps.insert(StorageDependency::IscsiInitiator);
        }
    }
    deps
}

/// Host directories a driver or a hostPath PV expects to exist.
pub(crate) fn host_directories(storage: &StorageConfig) -> BTreeSet<String> {
    let mut dirs = BTreeSet::new();
    for class in &storage.storage_classes {
        if class.provisioner.contains("longhorn") {
            dirs.insert("/var/lib/longhorn".to_string());
        }
        if class.provisioner.contains("local-path") {
            dirs.insert("/opt/local-path-provisioner".to_string());
        }
    }
    for pv in &storage.pv_configs {
        if let Some(host_path) = &pv.persistent_volume_source.host_path {
            if matches!(host_path.kind.as_str(), "" | "Directory" | "DirectoryOrCreate") {
                dirs.insert(host_path.path.clone());
            }
        }
    }
    dirs
}

/// Installs CSI dependencies, creates host directories and re-affirms the
/// disk mounts made by OSConfig.
pub struct StorageConfigPhase {
    connector: Arc<dyn NodeConnector>,
}

impl StorageConfigPhase {
    pub fn new(connector: Arc<dyn NodeConnector>) -> Self {
        Self { connector }
    }
}

#[async_trait]
impl NodePhase for StorageConfigPhase {
    fn kind(&self) -> PhaseKind {
        PhaseKind::StorageConfig
    }

    #[instrument(skip_all, fields(node = %node.address))]
    async fn run(
        &self,
        node: &NodeConfig,
        cluster: &ClusterConfig,
    ) -> Result<(), Report<DeployError>> {
        let shell = open_shell(self.connector.as_ref(), node).await?;

        let deps = dependencies(&cluster.storage);
        if !deps.is_empty() {
            let apt: Vec<&str> = deps.iter().map(|d| d.apt_package()).collect();
            let rpm: Vec<&str> = deps.iter().map(|d| d.rpm_package()).collect();
            run_step(
                &shell,
                node,
                "install storage dependencies",
                &format!(
                    "if command -v apt-get >/dev/null; then DEBIAN_FRONTEND=noninteractive apt-get install -y {}; \
                     elif command -v dnf >/dev/null; then dnf install -y {}; \
                     else yum install -y {}; fi",
                    apt.join(" "),
                    rpm.join(" "),
                    rpm.join(" ")
                ),
            )
            .await?;
        }

        for dir in host_directories(&cluster.storage) {
            run_step(
                &shell,
                node,
                "create storage directories",
                &format!("mkdir -p {}", quoted(node, &dir)?),
            )
            .await?;
        }

        for disk in node.disk_configs.iter().filter(|d| !d.mount_point.is_empty()) {
            run_step(&shell, node, "verify disk mounts", &mount_command(node, disk)?).await?;
        }

        info!("Storage configured");
        Ok(())
    }
}
