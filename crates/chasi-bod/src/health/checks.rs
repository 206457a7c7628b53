use std::sync::Arc;

use api_types::HealthCheckResult;
use api_types::HealthStatus;
use async_trait::async_trait;
use error_stack::Report;
use error_stack::ResultExt;
use tracing::info;
use tracing::instrument;
use tracing::warn;

use super::HealthChecker;
use super::HealthError;
use crate::infrastructure::k8s::ClusterApi;
use crate::platform::PlatformConfig;
use crate::vcluster::TenantClientResolver;

const KUBE_SYSTEM: &str = "kube-system";

/// Host API server round trip.
pub struct HostApiChecker {
    api: Arc<dyn ClusterApi>,
}

impl HostApiChecker {
    pub fn new(api: Arc<dyn ClusterApi>) -> Self {
        Self { api }
    }
}

#[async_trait]
impl HealthChecker for HostApiChecker {
    fn name(&self) -> &str {
        "host-api"
    }

    async fn check(&self) -> HealthCheckResult {
        match self.api.ping().await {
            Ok(()) => HealthCheckResult::healthy(self.name(), "Host API server is reachable"),
            Err(report) => HealthCheckResult::with_error(
                self.name(),
                HealthStatus::Unhealthy,
                "Host API server is unreachable",
                format!("{report}"),
            ),
        }
    }
}

/// Readiness of the Host cluster nodes: all Ready is healthy, some Ready is
/// degraded, none is unhealthy.
pub struct NodeReadinessChecker {
    api: Arc<dyn ClusterApi>,
}

impl NodeReadinessChecker {
    pub fn new(api: Arc<dyn ClusterApi>) -> Self {
        Self { api }
    }
}

#[async_trait]
impl HealthChecker for NodeReadinessChecker {
    fn name(&self) -> &str {
        "host-nodes"
    }

    async fn check(&self) -> HealthCheckResult {
        let nodes = match self.api.list_nodes().await {
            Ok(nodes) => nodes,
            Err(report) => {
                return HealthCheckResult::with_error(
                    self.name(),
                    HealthStatus::Unhealthy,
                    "Cannot list Host nodes",
                    format!("{report}"),
                )
            }
        };
        let ready = nodes.iter().filter(|n| n.ready).count();
        let message = format!("{ready}/{} nodes Ready", nodes.len());
        if !nodes.is_empty() && ready == nodes.len() {
            return HealthCheckResult::healthy(self.name(), message);
        }
        let pending = nodes
            .iter()
            .filter(|n| !n.ready)
            .map(|n| n.name.as_str())
            .collect::<Vec<_>>()
            .join(", ");
        let status = if ready == 0 {
            HealthStatus::Unhealthy
        } else {
            HealthStatus::Degraded
        };
        HealthCheckResult::with_error(self.name(), status, message, format!("not Ready: {pending}"))
    }
}

/// API reachability of one tenant, through the client resolver.
pub struct VClusterApiChecker {
    name: String,
    tenant: String,
    resolver: Arc<dyn TenantClientResolver>,
}

impl VClusterApiChecker {
    pub fn new(tenant: &str, resolver: Arc<dyn TenantClientResolver>) -> Self {
        Self {
            name: format!("vcluster-{tenant}"),
            tenant: tenant.to_string(),
            resolver,
        }
    }
}

#[async_trait]
impl HealthChecker for VClusterApiChecker {
    fn name(&self) -> &str {
        &self.name
    }

    async fn check(&self) -> HealthCheckResult {
        let api = match self.resolver.resolve(&self.tenant).await {
            Ok(api) => api,
            Err(report) => {
                return HealthCheckResult::with_error(
                    self.name(),
                    HealthStatus::Unhealthy,
                    "Cannot build vcluster client",
                    format!("{report}"),
                )
            }
        };
        match api.list_namespaces(None).await {
            Ok(_) => HealthCheckResult::healthy(self.name(), "vcluster API is reachable"),
            Err(report) => HealthCheckResult::with_error(
                self.name(),
                HealthStatus::Unhealthy,
                "vcluster API is unreachable",
                format!("{report}"),
            ),
        }
    }
}

async fn check_nodes(
    api: &dyn ClusterApi,
    config: &PlatformConfig,
    failures: &mut Vec<Report<HealthError>>,
) {
    let nodes = match api.list_nodes().await {
        Ok(nodes) => nodes,
        Err(report) => {
            failures.push(report.change_context(HealthError::HostApi));
            return;
        }
    };
    for node in &config.cluster.nodes {
        let ready = nodes.iter().any(|n| n.matches(&node.address) && n.ready);
        if !ready {
            warn!(node = %node.address, "Node is not Ready");
            failures.push(Report::new(HealthError::NodeNotReady {
                node: node.address.clone(),
            }));
        }
    }
}

async fn check_system_deployments(api: &dyn ClusterApi, failures: &mut Vec<Report<HealthError>>) {
    let deployments = match api.list_deployments(KUBE_SYSTEM).await {
        Ok(deployments) => deployments,
        Err(report) => {
            failures.push(
                report
                    .change_context(HealthError::HostApi)
                    .attach_printable(format!("listing deployments in {KUBE_SYSTEM}")),
            );
            return;
        }
    };
    for (name, status) in deployments.into_iter().filter(|(_, s)| !s.is_ready()) {
        warn!(
            deployment = %name,
            ready = status.ready_replicas,
            replicas = status.replicas,
            "System deployment is not ready"
        );
        failures.push(Report::new(HealthError::DeploymentUnhealthy {
            namespace: KUBE_SYSTEM.to_string(),
            name,
            ready: status.ready_replicas,
            replicas: status.replicas,
        }));
    }
}

async fn check_tenant(
    resolver: &dyn TenantClientResolver,
    name: &str,
) -> Result<(), Report<HealthError>> {
    let unreachable = || HealthError::TenantUnreachable {
        name: name.to_string(),
    };
    let api = resolver.resolve(name).await.change_context_lazy(unreachable)?;
    api.list_namespaces(None)
        .await
        .change_context_lazy(unreachable)?;
    Ok(())
}

/// Inspects Host node readiness, kube-system deployments and the API of
/// every configured vcluster.
///
/// # Errors
///
/// - [`HealthError::ChecksFailed`] carrying every individual failure
#[instrument(skip_all, fields(platform = %config.metadata.name))]
pub async fn run_cluster_checks(
    api: &dyn ClusterApi,
    resolver: &dyn TenantClientResolver,
    config: &PlatformConfig,
) -> Result<(), Report<HealthError>> {
    let mut failures = Vec::new();
    check_nodes(api, config, &mut failures).await;
    check_system_deployments(api, &mut failures).await;
    for name in config.vclusters.keys() {
        if let Err(report) = check_tenant(resolver, name).await {
            warn!(vcluster = %name, "vcluster API check failed");
            failures.push(report);
        }
    }

    let failed = failures.len();
    let combined = failures.into_iter().reduce(|mut acc, report| {
        acc.extend_one(report);
        acc
    });
    match combined {
        None => {
            info!("Cluster checks passed");
            Ok(())
        }
        Some(report) => Err(report.change_context(HealthError::ChecksFailed { failed })),
    }
}

#[cfg(test)]
mod tests {
    use similar_asserts::assert_eq;
    use test_log::test;

    use super::*;
    use crate::infrastructure::k8s::mock::MockClusterApi;
    use crate::infrastructure::k8s::DeploymentStatus;
    use crate::infrastructure::k8s::NodeSummary;
    use crate::platform::model::fixtures;
    use crate::platform::NodeRole;
    use crate::vcluster::mock::MockResolver;

    fn node(name: &str, ready: bool) -> NodeSummary {
        NodeSummary {
            name: name.to_string(),
            ready,
            addresses: vec![name.to_string()],
            ..Default::default()
        }
    }

    fn healthy_host() -> MockClusterApi {
        let api = MockClusterApi::new();
        api.add_node(node("10.0.0.1", true));
        api.set_deployment(
            KUBE_SYSTEM,
            "coredns",
            DeploymentStatus {
                replicas: 2,
                ready_replicas: 2,
            },
        );
        api
    }

    fn config_with_tenant() -> PlatformConfig {
        let mut config = fixtures::platform(vec![fixtures::node("10.0.0.1", &[NodeRole::Master])]);
        config.vclusters.insert(
            "biz-a".to_string(),
            fixtures::vcluster("biz-a", "10.100.0.0/16", "10.101.0.0/16"),
        );
        config
    }

    #[test(tokio::test)]
    async fn node_readiness_grades_partial_readiness() {
        let api = MockClusterApi::new();
        let checker = NodeReadinessChecker::new(Arc::new(api.clone()));

        assert_eq!(checker.check().await.status, HealthStatus::Unhealthy);

        api.add_node(node("m1", true));
        api.add_node(node("w1", false));
        let result = checker.check().await;
        assert_eq!(result.status, HealthStatus::Degraded);
        assert_eq!(result.message, "1/2 nodes Ready");
        assert_eq!(result.error.as_deref(), Some("not Ready: w1"));

        let all_ready = MockClusterApi::new();
        all_ready.add_node(node("m1", true));
        let checker = NodeReadinessChecker::new(Arc::new(all_ready));
        assert_eq!(checker.check().await.status, HealthStatus::Healthy);
    }

    #[test(tokio::test)]
    async fn host_api_checker_reports_unreachable_api() {
        let api = MockClusterApi::new();
        api.set_unreachable(true);

        let result = HostApiChecker::new(Arc::new(api)).check().await;

        assert_eq!(result.name, "host-api");
        assert_eq!(result.status, HealthStatus::Unhealthy);
        assert!(result.error.is_some());
    }

    #[test(tokio::test)]
    async fn vcluster_checker_uses_resolved_client() {
        let resolver = MockResolver::new();
        resolver.register("biz-a", MockClusterApi::new());
        let resolver: Arc<dyn TenantClientResolver> = Arc::new(resolver);

        let reachable = VClusterApiChecker::new("biz-a", resolver.clone()).check().await;
        let missing = VClusterApiChecker::new("biz-b", resolver).check().await;

        assert_eq!(reachable.name, "vcluster-biz-a");
        assert_eq!(reachable.status, HealthStatus::Healthy);
        assert_eq!(missing.status, HealthStatus::Unhealthy);
    }

    #[test(tokio::test)]
    async fn cluster_checks_pass_on_healthy_platform() {
        let resolver = MockResolver::new();
        resolver.register("biz-a", MockClusterApi::new());

        run_cluster_checks(&healthy_host(), &resolver, &config_with_tenant())
            .await
            .expect("should pass");
    }

    #[test(tokio::test)]
    async fn cluster_checks_aggregate_every_failure() {
        let host = healthy_host();
        host.set_deployment(
            KUBE_SYSTEM,
            "metrics-server",
            DeploymentStatus {
                replicas: 1,
                ready_replicas: 0,
            },
        );
        let mut config = config_with_tenant();
        config
            .cluster
            .nodes
            .push(fixtures::node("10.0.0.2", &[NodeRole::Worker]));
        let unreachable = MockClusterApi::new();
        unreachable.set_unreachable(true);
        let resolver = MockResolver::new();
        resolver.register("biz-a", unreachable);

        let err = run_cluster_checks(&host, &resolver, &config)
            .await
            .expect_err("should fail");

        assert!(matches!(
            err.current_context(),
            HealthError::ChecksFailed { failed: 3 }
        ));
        let rendered = format!("{err:?}");
        assert!(rendered.contains("Node 10.0.0.2 is not Ready"));
        assert!(rendered.contains("kube-system/metrics-server"));
        assert!(rendered.contains("vcluster 'biz-a'"));
    }
}
