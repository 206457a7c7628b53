use std::sync::Arc;

use async_trait::async_trait;
use error_stack::Report;
use error_stack::ResultExt;
use tracing::info;
use tracing::instrument;

use super::DeployError;
use super::TenantInstaller;
use crate::infrastructure::k8s::HostAccess;
use crate::platform::ClusterConfig;
use crate::platform::VClusterConfig;
use crate::state::StateStore;
use crate::vcluster::SecretClientResolver;
use crate::vcluster::VClusterManager;

/// VClusterDeploy: creates every tenant and waits for its API.
pub struct VClusterDeployPhase {
    host: Arc<dyn HostAccess>,
    state: Arc<StateStore>,
}

impl VClusterDeployPhase {
    pub fn new(host: Arc<dyn HostAccess>, state: Arc<StateStore>) -> Self {
        Self { host, state }
    }
}

#[async_trait]
impl TenantInstaller for VClusterDeployPhase {
    #[instrument(skip_all, fields(tenants = vclusters.len()))]
    async fn deploy(
        &self,
        vclusters: &[&VClusterConfig],
        cluster: &ClusterConfig,
    ) -> Result<(), Report<DeployError>> {
        let api = self
            .host
            .host_api(cluster)
            .await
            .change_context(DeployError::HostApi)?;
        let resolver = Arc::new(SecretClientResolver::new(api.clone()));
        let manager = VClusterManager::new(api, resolver).with_state(self.state.clone());

        for vcluster in vclusters {
            let failed = || DeployError::TenantFailed {
                name: vcluster.name.clone(),
            };
            manager.create(vcluster).await.change_context_lazy(failed)?;
            manager
                .wait_for_ready(&vcluster.name)
                .await
                .change_context_lazy(failed)?;
            info!(vcluster = %vcluster.name, "VCluster deployed");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use similar_asserts::assert_eq;
    use test_log::test;

    use super::*;
    use crate::infrastructure::k8s::mock::MockClusterApi;
    use crate::infrastructure::k8s::mock::MockHostAccess;
    use crate::platform::model::fixtures;
    use crate::platform::NodeRole;
    use crate::state::VClusterLifecycleState;

    #[test(tokio::test(start_paused = true))]
    async fn first_failing_tenant_aborts_the_run() {
        let api = MockClusterApi::new();
        api.set_ready_on_apply(true);
        let state = Arc::new(StateStore::in_memory());
        let phase = VClusterDeployPhase::new(Arc::new(MockHostAccess::new(api.clone())), state.clone());
        let cluster = fixtures::cluster(vec![fixtures::node("10.0.0.1", &[NodeRole::Master])]);
        let biz_a = fixtures::vcluster("biz-a", "10.10.0.0/16", "10.11.0.0/16");
        let biz_b = fixtures::vcluster("biz-b", "10.12.0.0/16", "10.13.0.0/16");

        // no credential secrets exist, so the tenant API never resolves
        let err = phase
            .deploy(&[&biz_a, &biz_b], &cluster)
            .await
            .expect_err("should fail on biz-a");

        assert!(matches!(
            err.current_context(),
            DeployError::TenantFailed { name } if name == "biz-a"
        ));
        assert!(!api.has_namespace("vcluster-biz-b"));
        assert_eq!(state.tenant_state("biz-a"), VClusterLifecycleState::Ready);
    }
}
