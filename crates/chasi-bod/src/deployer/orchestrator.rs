use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use error_stack::Report;
use error_stack::ResultExt;
use tracing::info;
use tracing::instrument;
use tracing::warn;

use super::drain;
use super::phases;
use super::ClusterInstaller;
use super::DeployError;
use super::KubeadmInstaller;
use super::NodePhase;
use super::NodeProvisioner;
use super::PhaseKind;
use super::TenantInstaller;
use super::VClusterDeployPhase;
use crate::infrastructure::k8s::HostAccess;
use crate::infrastructure::remote::NodeConnector;
use crate::infrastructure::remote::NodeShell;
use crate::platform::ClusterConfig;
use crate::platform::NodeConfig;
use crate::platform::PlatformConfig;
use crate::platform::VClusterConfig;
use crate::state::NodeLifecycleState;
use crate::state::StateStore;

const MINUTE: Duration = Duration::from_secs(60);

/// Deadlines of each phase and of the incremental operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PhaseTimeouts {
    pub init: Duration,
    pub os_config: Duration,
    pub runtime_config: Duration,
    pub network_config: Duration,
    pub storage_config: Duration,
    pub k8s_install: Duration,
    pub vcluster_deploy: Duration,
    pub add_node: Duration,
    pub remove_node: Duration,
}

impl Default for PhaseTimeouts {
    fn default() -> Self {
        Self {
            init: 5 * MINUTE,
            os_config: 10 * MINUTE,
            runtime_config: 5 * MINUTE,
            network_config: 5 * MINUTE,
            storage_config: 5 * MINUTE,
            k8s_install: 30 * MINUTE,
            vcluster_deploy: 15 * MINUTE,
            add_node: 20 * MINUTE,
            remove_node: 10 * MINUTE,
        }
    }
}

impl PhaseTimeouts {
    pub fn for_phase(&self, phase: PhaseKind) -> Duration {
        match phase {
            PhaseKind::Init => self.init,
            PhaseKind::OsConfig => self.os_config,
            PhaseKind::RuntimeConfig => self.runtime_config,
            PhaseKind::NetworkConfig => self.network_config,
            PhaseKind::StorageConfig => self.storage_config,
            PhaseKind::K8sInstall => self.k8s_install,
            PhaseKind::VClusterDeploy => self.vcluster_deploy,
        }
    }
}

/// Sequences the deployment phases over the node set.
pub struct Orchestrator {
    connector: Arc<dyn NodeConnector>,
    host: Arc<dyn HostAccess>,
    state: Arc<StateStore>,
    node_phases: Vec<Arc<dyn NodePhase>>,
    installer: Arc<dyn ClusterInstaller>,
    tenants: Arc<dyn TenantInstaller>,
    timeouts: PhaseTimeouts,
}

impl Orchestrator {
    /// Orchestrator with the SSH/kubeadm phase implementations.
    pub fn new(
        connector: Arc<dyn NodeConnector>,
        host: Arc<dyn HostAccess>,
        state: Arc<StateStore>,
    ) -> Self {
        Self {
            node_phases: phases::node_phases(connector.clone()),
            installer: Arc::new(KubeadmInstaller::new(connector.clone(), host.clone())),
            tenants: Arc::new(VClusterDeployPhase::new(host.clone(), state.clone())),
            connector,
            host,
            state,
            timeouts: PhaseTimeouts::default(),
        }
    }

    /// Replaces the phase implementations.
    pub fn with_phases(
        mut self,
        node_phases: Vec<Arc<dyn NodePhase>>,
        installer: Arc<dyn ClusterInstaller>,
        tenants: Arc<dyn TenantInstaller>,
    ) -> Self {
        self.node_phases = node_phases;
        self.installer = installer;
        self.tenants = tenants;
        self
    }

    pub fn with_timeouts(mut self, timeouts: PhaseTimeouts) -> Self {
        self.timeouts = timeouts;
        self
    }

    pub fn host(&self) -> &Arc<dyn HostAccess> {
        &self.host
    }

    pub fn connector(&self) -> &Arc<dyn NodeConnector> {
        &self.connector
    }

    pub fn state(&self) -> &Arc<StateStore> {
        &self.state
    }

    async fn run_node_phase(
        &self,
        phase: &dyn NodePhase,
        node: &NodeConfig,
        cluster: &ClusterConfig,
    ) -> Result<(), Report<DeployError>> {
        let kind = phase.kind();
        let timeout = self.timeouts.for_phase(kind);
        info!(phase = %kind, node = %node.address, "Running phase");
        match tokio::time::timeout(timeout, phase.run(node, cluster)).await {
            Ok(Ok(())) => {}
            Ok(Err(report)) => {
                return Err(report.change_context(DeployError::PhaseFailed {
                    phase: kind,
                    node: node.address.clone(),
                }))
            }
            Err(_) => {
                return Err(Report::new(DeployError::PhaseTimeout {
                    phase: kind,
                    node: node.address.clone(),
                    timeout,
                }))
            }
        }
        if let Some(reached) = kind.reached() {
            self.state.advance_node(&node.address, reached);
        }
        Ok(())
    }

    /// Runs phases 1-5 on one node, in order.
    ///
    /// # Errors
    ///
    /// The first phase failure or timeout.
    pub async fn converge_node(
        &self,
        node: &NodeConfig,
        cluster: &ClusterConfig,
    ) -> Result<(), Report<DeployError>> {
        self.state.reset_node(&node.address);
        for phase in &self.node_phases {
            self.run_node_phase(phase.as_ref(), node, cluster).await?;
        }
        Ok(())
    }

    /// Full deployment: phases 1-5 across every node, then K8sInstall, then
    /// VClusterDeploy. Stops at the first failure without rolling back.
    ///
    /// # Errors
    ///
    /// - [`DeployError::PhaseFailed`] / [`DeployError::PhaseTimeout`] for a
    ///   per-node phase
    /// - [`DeployError::ClusterPhaseFailed`] /
    ///   [`DeployError::ClusterPhaseTimeout`] for K8sInstall or
    ///   VClusterDeploy
    #[instrument(skip_all, fields(platform = %platform.metadata.name, nodes = platform.cluster.nodes.len()))]
    pub async fn deploy(&self, platform: &PlatformConfig) -> Result<(), Report<DeployError>> {
        let cluster = &platform.cluster;
        info!(
            masters = cluster.masters().count(),
            workers = cluster.workers().count(),
            "Starting platform deployment"
        );

        for node in &cluster.nodes {
            self.state.reset_node(&node.address);
        }
        for phase in &self.node_phases {
            for node in &cluster.nodes {
                self.run_node_phase(phase.as_ref(), node, cluster).await?;
            }
        }

        self.run_cluster_phase(PhaseKind::K8sInstall, self.installer.install(cluster))
            .await?;
        for node in &cluster.nodes {
            self.state
                .advance_node(&node.address, NodeLifecycleState::K8sJoined);
            self.state.advance_node(&node.address, NodeLifecycleState::Ready);
        }

        let vclusters: Vec<&VClusterConfig> = platform.vclusters.values().collect();
        if vclusters.is_empty() {
            info!("No vclusters configured, skipping VClusterDeploy");
        } else {
            self.run_cluster_phase(
                PhaseKind::VClusterDeploy,
                self.tenants.deploy(&vclusters, cluster),
            )
            .await?;
        }

        info!("Platform deployment completed");
        Ok(())
    }

    async fn run_cluster_phase<F>(&self, kind: PhaseKind, phase: F) -> Result<(), Report<DeployError>>
    where
        F: std::future::Future<Output = Result<(), Report<DeployError>>>,
    {
        let timeout = self.timeouts.for_phase(kind);
        info!(phase = %kind, "Running phase");
        match tokio::time::timeout(timeout, phase).await {
            Ok(result) => result.change_context(DeployError::ClusterPhaseFailed { phase: kind }),
            Err(_) => Err(Report::new(DeployError::ClusterPhaseTimeout {
                phase: kind,
                timeout,
            })),
        }
    }

    async fn add_node_inner(
        &self,
        node: &NodeConfig,
        cluster: &ClusterConfig,
    ) -> Result<(), Report<DeployError>> {
        self.converge_node(node, cluster).await?;
        self.installer.join(node, cluster).await?;
        self.state
            .advance_node(&node.address, NodeLifecycleState::K8sJoined);
        self.state.advance_node(&node.address, NodeLifecycleState::Ready);
        Ok(())
    }

    async fn remove_node_inner(
        &self,
        node: &NodeConfig,
        cluster: &ClusterConfig,
        reset_os: bool,
    ) -> Result<(), Report<DeployError>> {
        let api = self
            .host
            .host_api(cluster)
            .await
            .change_context(DeployError::HostApi)?;
        if let Some(name) = drain::drain(api.as_ref(), &node.address, drain::DRAIN_POLL).await? {
            drain::delete_node(api.as_ref(), &name).await?;
        }

        if reset_os {
            match NodeShell::open(self.connector.as_ref(), node).await {
                Ok(shell) => {
                    if let Err(report) = shell.run("kubeadm reset --force").await {
                        warn!(node = %node.address, "OS reset failed: {report:?}");
                    }
                }
                Err(report) => warn!(node = %node.address, "OS reset skipped: {report:?}"),
            }
        }

        self.state.forget_node(&node.address);
        Ok(())
    }
}

#[async_trait]
impl NodeProvisioner for Orchestrator {
    /// Converges one new node and joins it to the running cluster.
    #[instrument(skip_all, fields(node = %node.address))]
    async fn add_node(
        &self,
        node: &NodeConfig,
        cluster: &ClusterConfig,
    ) -> Result<(), Report<DeployError>> {
        let timeout = self.timeouts.add_node;
        match tokio::time::timeout(timeout, self.add_node_inner(node, cluster)).await {
            Ok(result) => result.change_context_lazy(|| DeployError::AddNodeFailed {
                node: node.address.clone(),
            })?,
            Err(_) => {
                return Err(Report::new(DeployError::AddNodeTimeout {
                    node: node.address.clone(),
                    timeout,
                }))
            }
        }
        info!("Node added");
        Ok(())
    }

    /// Drains and deletes a node, optionally resetting its OS.
    #[instrument(skip_all, fields(node = %node.address, reset_os = reset_os))]
    async fn remove_node(
        &self,
        node: &NodeConfig,
        cluster: &ClusterConfig,
        reset_os: bool,
    ) -> Result<(), Report<DeployError>> {
        let timeout = self.timeouts.remove_node;
        match tokio::time::timeout(timeout, self.remove_node_inner(node, cluster, reset_os)).await
        {
            Ok(result) => result.change_context_lazy(|| DeployError::RemoveNodeFailed {
                node: node.address.clone(),
            })?,
            Err(_) => {
                return Err(Report::new(DeployError::RemoveNodeTimeout {
                    node: node.address.clone(),
                    timeout,
                }))
            }
        }
        info!("Node removed");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use similar_asserts::assert_eq;
    use test_log::test;

    use super::*;
    use crate::deployer::mock::CallLog;
    use crate::deployer::mock::RecordingInstaller;
    use crate::deployer::mock::RecordingPhase;
    use crate::deployer::mock::RecordingTenants;
    use crate::infrastructure::k8s::mock::MockClusterApi;
    use crate::infrastructure::k8s::mock::MockHostAccess;
    use crate::infrastructure::k8s::NodeSummary;
    use crate::infrastructure::k8s::PodSummary;
    use crate::infrastructure::remote::mock::MockConnector;
    use crate::platform::model::fixtures;
    use crate::platform::NodeRole;

    const NODE_PHASES: [PhaseKind; 5] = [
        PhaseKind::Init,
        PhaseKind::OsConfig,
        PhaseKind::RuntimeConfig,
        PhaseKind::NetworkConfig,
        PhaseKind::StorageConfig,
    ];

    struct Harness {
        log: CallLog,
        connector: MockConnector,
        api: MockClusterApi,
        state: Arc<StateStore>,
        orchestrator: Orchestrator,
    }

    fn harness(fail_on: Option<(PhaseKind, &str)>) -> Harness {
        let log = CallLog::default();
        let connector = MockConnector::new();
        let api = MockClusterApi::new();
        let state = Arc::new(StateStore::in_memory());
        let node_phases: Vec<Arc<dyn NodePhase>> = NODE_PHASES
            .iter()
            .map(|kind| {
                Arc::new(RecordingPhase {
                    kind: *kind,
                    log: log.clone(),
                    fail_on: fail_on
                        .filter(|(k, _)| k == kind)
                        .map(|(_, address)| address.to_string()),
                }) as Arc<dyn NodePhase>
            })
            .collect();
        let orchestrator = Orchestrator::new(
            Arc::new(connector.clone()),
            Arc::new(MockHostAccess::new(api.clone())),
            state.clone(),
        )
        .with_phases(
            node_phases,
            Arc::new(RecordingInstaller { log: log.clone() }),
            Arc::new(RecordingTenants { log: log.clone() }),
        );
        Harness {
            log,
            connector,
            api,
            state,
            orchestrator,
        }
    }

    #[test(tokio::test)]
    async fn phases_run_phase_major_in_strict_order() {
        let h = harness(None);
        let mut platform = fixtures::platform(vec![
            fixtures::node("10.0.0.1", &[NodeRole::Master]),
            fixtures::node("10.0.0.2", &[NodeRole::Worker]),
        ]);
        platform.vclusters.insert(
            "biz-a".to_string(),
            fixtures::vcluster("biz-a", "10.10.0.0/16", "10.11.0.0/16"),
        );

        h.orchestrator
            .deploy(&platform)
            .await
            .expect("should deploy");

        let mut expected = Vec::new();
        for kind in NODE_PHASES {
            expected.push(format!("{kind} 10.0.0.1"));
            expected.push(format!("{kind} 10.0.0.2"));
        }
        expected.push("K8sInstall host".to_string());
        expected.push("VClusterDeploy biz-a".to_string());
        assert_eq!(h.log.entries(), expected);
        assert_eq!(h.state.node_state("10.0.0.2"), NodeLifecycleState::Ready);
    }

    #[test(tokio::test)]
    async fn failing_phase_stops_the_run() {
        let h = harness(Some((PhaseKind::RuntimeConfig, "10.0.0.1")));
        let mut platform =
            fixtures::platform(vec![fixtures::node("10.0.0.1", &[NodeRole::Master])]);
        platform.vclusters.insert(
            "biz-a".to_string(),
            fixtures::vcluster("biz-a", "10.10.0.0/16", "10.11.0.0/16"),
        );

        let err = h
            .orchestrator
            .deploy(&platform)
            .await
            .expect_err("should fail");

        assert!(matches!(
            err.current_context(),
            DeployError::PhaseFailed { phase: PhaseKind::RuntimeConfig, node } if node == "10.0.0.1"
        ));
        assert_eq!(
            h.log.entries(),
            vec![
                "Init 10.0.0.1".to_string(),
                "OSConfig 10.0.0.1".to_string(),
                "RuntimeConfig 10.0.0.1".to_string(),
            ]
        );
        assert_eq!(
            h.state.node_state("10.0.0.1"),
            NodeLifecycleState::OsConfigured
        );
    }

    #[test(tokio::test)]
    async fn zero_vclusters_skips_tenant_phase() {
        let h = harness(None);
        let platform = fixtures::platform(vec![fixtures::node("10.0.0.1", &[NodeRole::Master])]);

        h.orchestrator
            .deploy(&platform)
            .await
            .expect("should deploy");

        let entries = h.log.entries();
        assert_eq!(entries.last().map(String::as_str), Some("K8sInstall host"));
        assert!(!entries.iter().any(|e| e.starts_with("VClusterDeploy")));
    }

    struct StuckPhase;

    #[async_trait]
    impl NodePhase for StuckPhase {
        fn kind(&self) -> PhaseKind {
            PhaseKind::Init
        }

        async fn run(
            &self,
            _node: &NodeConfig,
            _cluster: &ClusterConfig,
        ) -> Result<(), Report<DeployError>> {
            std::future::pending().await
        }
    }

    #[test(tokio::test(start_paused = true))]
    async fn stuck_phase_times_out() {
        let h = harness(None);
        let orchestrator = h.orchestrator.with_phases(
            vec![Arc::new(StuckPhase)],
            Arc::new(RecordingInstaller { log: h.log.clone() }),
            Arc::new(RecordingTenants { log: h.log.clone() }),
        );
        let platform = fixtures::platform(vec![fixtures::node("10.0.0.1", &[NodeRole::Master])]);

        let err = orchestrator
            .deploy(&platform)
            .await
            .expect_err("should time out");

        assert!(matches!(
            err.current_context(),
            DeployError::PhaseTimeout { phase: PhaseKind::Init, timeout, .. }
                if *timeout == Duration::from_secs(300)
        ));
        assert!(h.log.entries().is_empty());
    }

    #[test(tokio::test)]
    async fn add_node_converges_then_joins() {
        let h = harness(None);
        let master = fixtures::node("10.0.0.1", &[NodeRole::Master]);
        let new_worker = fixtures::node("10.0.0.3", &[NodeRole::Worker]);
        let cluster = fixtures::cluster(vec![master, new_worker.clone()]);

        h.orchestrator
            .add_node(&new_worker, &cluster)
            .await
            .expect("should add");

        let entries = h.log.entries();
        assert_eq!(entries.len(), 6);
        assert_eq!(entries[0], "Init 10.0.0.3");
        assert_eq!(entries[5], "join 10.0.0.3");
        assert_eq!(h.state.node_state("10.0.0.3"), NodeLifecycleState::Ready);
    }

    #[test(tokio::test(start_paused = true))]
    async fn remove_node_drains_deletes_and_resets() {
        let h = harness(None);
        h.api.add_node(NodeSummary {
            name: "worker-2".to_string(),
            ready: true,
            addresses: vec!["10.0.0.2".to_string()],
            ..Default::default()
        });
        h.api.add_pod(
            "worker-2",
            PodSummary {
                namespace: "default".to_string(),
                name: "web-0".to_string(),
                ..Default::default()
            },
        );
        h.connector.respond("kubeadm reset", 1, "", "reset failed");
        let worker = fixtures::node("10.0.0.2", &[NodeRole::Worker]);
        let cluster = fixtures::cluster(vec![
            fixtures::node("10.0.0.1", &[NodeRole::Master]),
            worker.clone(),
        ]);
        h.state
            .advance_node("10.0.0.2", NodeLifecycleState::Ready);

        h.orchestrator
            .remove_node(&worker, &cluster, true)
            .await
            .expect("reset failure should only warn");

        assert!(h.api.nodes().is_empty());
        assert!(h.connector.ran_on("10.0.0.2", "kubeadm reset --force"));
        assert!(!h.state.snapshot().nodes.contains_key("10.0.0.2"));
    }
}
