use std::sync::Arc;

use error_stack::Report;
use error_stack::ResultExt;
use tracing::info;
use tracing::instrument;
use tracing::warn;

use super::ImageBuilder;
use super::LifecycleError;
use crate::deployer::drain;
use crate::deployer::kubeadm_version;
use crate::deployer::wait_nodes_ready;
use crate::deployer::NodeProvisioner;
use crate::deployer::Orchestrator;
use crate::deployer::READY_POLL;
use crate::infrastructure::k8s::ClusterApi;
use crate::infrastructure::remote::NodeShell;
use crate::platform::topology::check_master_removal;
use crate::platform::topology::cluster_settings_changed;
use crate::platform::topology::NodeDiff;
use crate::platform::topology::QuorumViolation;
use crate::platform::validator::parse_kubernetes_version;
use crate::platform::ClusterConfig;
use crate::platform::NodeConfig;
use crate::platform::PlatformConfig;
use crate::state::NodeLifecycleState;
use crate::util::poll::PollSettings;

/// Composes the orchestrator into upgrade, scale, backup and restore.
pub struct LifecycleManager {
    pub(super) orchestrator: Arc<Orchestrator>,
    pub(super) provisioner: Arc<dyn NodeProvisioner>,
    pub(super) images: Arc<dyn ImageBuilder>,
    pub(super) ready_poll: PollSettings,
}

impl From<QuorumViolation> for LifecycleError {
    fn from(v: QuorumViolation) -> Self {
        LifecycleError::Quorum {
            live: v.live_masters,
            remaining: v.remaining_masters,
            required: v.required,
        }
    }
}

impl LifecycleManager {
    pub fn new(orchestrator: Arc<Orchestrator>, images: Arc<dyn ImageBuilder>) -> Self {
        Self {
            provisioner: orchestrator.clone(),
            orchestrator,
            images,
            ready_poll: READY_POLL,
        }
    }

    /// Replaces the node add/remove implementation.
    pub fn with_provisioner(mut self, provisioner: Arc<dyn NodeProvisioner>) -> Self {
        self.provisioner = provisioner;
        self
    }

    async fn host_api(
        &self,
        cluster: &ClusterConfig,
    ) -> Result<Arc<dyn ClusterApi>, Report<LifecycleError>> {
        self.orchestrator
            .host()
            .host_api(cluster)
            .await
            .change_context(LifecycleError::HostApi)
    }

    /// Rolls the platform from `current` to `new`, one node at a time.
    ///
    /// Nodes only in `new` are added first. Nodes whose configuration
    /// changed (every shared node when a cluster-wide setting changed) are
    /// drained, reconfigured and rejoined, workers before masters. Nodes
    /// only in `current` are removed last.
    ///
    /// # Errors
    ///
    /// - [`LifecycleError::Downgrade`] if `new` has an older Kubernetes
    ///   version; nothing is touched
    /// - [`LifecycleError::Quorum`] if the removals would break quorum;
    ///   nothing is touched
    /// - [`LifecycleError::ImageBuild`] if the image cannot be built
    /// - [`LifecycleError::MastersNotReady`] before touching a master while
    ///   another master is not Ready
    /// - [`LifecycleError::UpgradeNode`], [`LifecycleError::AddNode`],
    ///   [`LifecycleError::RemoveNode`] naming the first node that failed
    #[instrument(skip_all, fields(from = %current.cluster.kubernetes_version, to = %new.cluster.kubernetes_version))]
    pub async fn upgrade(
        &self,
        current: &PlatformConfig,
        new: &PlatformConfig,
    ) -> Result<(), Report<LifecycleError>> {
        let version = |v: &str| {
            parse_kubernetes_version(v).ok_or_else(|| {
                Report::new(LifecycleError::InvalidVersion {
                    version: v.to_string(),
                })
            })
        };
        let from = version(&current.cluster.kubernetes_version)?;
        let to = version(&new.cluster.kubernetes_version)?;
        if to < from {
            return Err(Report::new(LifecycleError::Downgrade {
                current: from.to_string(),
                new: to.to_string(),
            }));
        }

        let diff = NodeDiff::between(&current.cluster, &new.cluster);
        let live_masters: Vec<&NodeConfig> = current.cluster.masters().collect();
        check_master_removal(&live_masters, &diff.removed).map_err(LifecycleError::from)?;

        let image = self
            .images
            .build(new)
            .await
            .change_context(LifecycleError::ImageBuild)?;
        info!(image = %image.display(), "New platform image ready");

        let cluster = &new.cluster;
        for node in &diff.added {
            self.provisioner
                .add_node(node, cluster)
                .await
                .change_context_lazy(|| LifecycleError::AddNode {
                    node: node.address.clone(),
                })?;
        }

        let mut reconfigure: Vec<&NodeConfig> = if cluster_settings_changed(&current.cluster, cluster) {
            cluster
                .nodes
                .iter()
                .filter(|n| current.cluster.node(&n.address).is_some())
                .collect()
        } else {
            diff.changed.clone()
        };
        // workers first; the sort is stable so declaration order holds
        reconfigure.sort_by_key(|n| n.is_master());

        let version_changed = from != to;
        let mut control_plane_upgraded = false;
        for node in reconfigure {
            if node.is_master() {
                self.ensure_other_masters_ready(node, cluster).await?;
            }
            let apply = version_changed && node.is_master() && !control_plane_upgraded;
            self.upgrade_node(node, cluster, apply).await?;
            control_plane_upgraded |= apply;
        }

        for node in &diff.removed {
            self.provisioner
                .remove_node(node, &current.cluster, true)
                .await
                .change_context_lazy(|| LifecycleError::RemoveNode {
                    node: node.address.clone(),
                })?;
        }

        info!(
            added = diff.added.len(),
            removed = diff.removed.len(),
            "Platform upgrade completed"
        );
        Ok(())
    }

    async fn ensure_other_masters_ready(
        &self,
        master: &NodeConfig,
        cluster: &ClusterConfig,
    ) -> Result<(), Report<LifecycleError>> {
        let others: Vec<&NodeConfig> = cluster
            .masters()
            .filter(|m| m.address != master.address)
            .collect();
        if others.is_empty() {
            warn!(
                node = %master.address,
                "Upgrading the only master, the API server will be unavailable meanwhile"
            );
            return Ok(());
        }

        let api = self.host_api(cluster).await?;
        let nodes = api
            .list_nodes()
            .await
            .change_context(LifecycleError::HostApi)?;
        let pending: Vec<&str> = others
            .iter()
            .filter(|m| !nodes.iter().any(|n| n.matches(&m.address) && n.ready))
            .map(|m| m.address.as_str())
            .collect();
        if !pending.is_empty() {
            return Err(Report::new(LifecycleError::MastersNotReady {
                node: master.address.clone(),
                pending: pending.join(","),
            }));
        }
        Ok(())
    }

    /// Drain, reconfigure, rejoin and uncordon one node.
    #[instrument(skip_all, fields(node = %node.address, apply = apply))]
    async fn upgrade_node(
        &self,
        node: &NodeConfig,
        cluster: &ClusterConfig,
        apply: bool,
    ) -> Result<(), Report<LifecycleError>> {
        let failed = || LifecycleError::UpgradeNode {
            node: node.address.clone(),
        };
        let api = self.host_api(cluster).await?;
        let name = drain::drain(api.as_ref(), &node.address, drain::DRAIN_POLL)
            .await
            .change_context_lazy(failed)?;

        self.orchestrator
            .converge_node(node, cluster)
            .await
            .change_context_lazy(failed)?;

        let shell = NodeShell::open(self.orchestrator.connector().as_ref(), node)
            .await
            .change_context_lazy(failed)?;
        let upgrade = if apply {
            format!(
                "kubeadm upgrade apply {} -y",
                kubeadm_version(&cluster.kubernetes_version)
            )
        } else {
            "kubeadm upgrade node".to_string()
        };
        info!(command = %upgrade, "Rejoining node");
        shell.run(&upgrade).await.change_context_lazy(failed)?;
        shell
            .run("systemctl daemon-reload && systemctl restart kubelet")
            .await
            .change_context_lazy(failed)?;

        wait_nodes_ready(api.as_ref(), &[node.address.as_str()], self.ready_poll)
            .await
            .change_context_lazy(failed)?;
        if let Some(name) = name {
            drain::uncordon(api.as_ref(), &name)
                .await
                .change_context_lazy(failed)?;
        }

        let state = self.orchestrator.state();
        state.advance_node(&node.address, NodeLifecycleState::K8sJoined);
        state.advance_node(&node.address, NodeLifecycleState::Ready);
        info!("Node upgraded");
        Ok(())
    }

    /// Adds then removes Host nodes.
    ///
    /// The quorum rule is checked before anything changes. Adds stop at the
    /// first failure; removals run only when every add succeeded.
    ///
    /// # Errors
    ///
    /// - [`LifecycleError::Quorum`] if `remove` would break the master quorum
    /// - [`LifecycleError::AddNode`] / [`LifecycleError::RemoveNode`] for
    ///   the first node that failed
    #[instrument(skip_all, fields(add = add.len(), remove = remove.len()))]
    pub async fn scale(
        &self,
        config: &PlatformConfig,
        add: &[&NodeConfig],
        remove: &[&NodeConfig],
        reset_os: bool,
    ) -> Result<(), Report<LifecycleError>> {
        let live_masters: Vec<&NodeConfig> = config.cluster.masters().collect();
        check_master_removal(&live_masters, remove).map_err(LifecycleError::from)?;

        for node in add {
            self.provisioner
                .add_node(node, &config.cluster)
                .await
                .change_context_lazy(|| LifecycleError::AddNode {
                    node: node.address.clone(),
                })?;
        }
        for node in remove {
            self.provisioner
                .remove_node(node, &config.cluster, reset_os)
                .await
                .change_context_lazy(|| LifecycleError::RemoveNode {
                    node: node.address.clone(),
                })?;
        }
        info!("Host cluster scaled");
        Ok(())
    }
}
