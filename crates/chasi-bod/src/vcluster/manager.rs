use std::collections::BTreeMap;
use std::sync::Arc;

use error_stack::Report;
use error_stack::ResultExt;
use tracing::debug;
use tracing::info;
use tracing::instrument;

use super::manifests;
use super::TenantClientResolver;
use super::VClusterError;
use crate::infrastructure::k8s::ClusterApi;
use crate::infrastructure::k8s::MANAGED_BY_LABEL;
use crate::infrastructure::k8s::MANAGED_BY_VALUE;
use crate::platform::vcluster_namespace;
use crate::platform::VClusterConfig;
use crate::platform::VCLUSTER_NAMESPACE_PREFIX;
use crate::state::StateStore;
use crate::state::VClusterLifecycleState;
use crate::util::poll::poll_until;
use crate::util::poll::Attempt;
use crate::util::poll::PollError;
use crate::util::poll::PollSettings;

/// Creates, deletes and inspects tenant vclusters on the Host cluster.
pub struct VClusterManager {
    host: Arc<dyn ClusterApi>,
    resolver: Arc<dyn TenantClientResolver>,
    poll: PollSettings,
    state: Option<Arc<StateStore>>,
}

impl VClusterManager {
    pub fn new(host: Arc<dyn ClusterApi>, resolver: Arc<dyn TenantClientResolver>) -> Self {
        Self {
            host,
            resolver,
            poll: PollSettings::default(),
            state: None,
        }
    }

    pub fn with_poll(mut self, poll: PollSettings) -> Self {
        self.poll = poll;
        self
    }

    /// Records tenant transitions in `state`.
    pub fn with_state(mut self, state: Arc<StateStore>) -> Self {
        self.state = Some(state);
        self
    }

    fn record(&self, name: &str, tenant: VClusterLifecycleState) {
        if let Some(state) = &self.state {
            state.set_tenant(name, tenant);
        }
    }

    /// Ensures the tenant namespace, applies the control plane and waits for
    /// its Deployment to report ready replicas.
    ///
    /// # Errors
    ///
    /// - [`VClusterError::NamespaceFailed`] if the namespace cannot be created
    /// - [`VClusterError::ApplyFailed`] if a control-plane object is rejected
    /// - [`VClusterError::ReadyTimeout`] if the Deployment is not ready in time
    #[instrument(skip(self, config), fields(vcluster = %config.name, namespace = %config.namespace))]
    pub async fn create(&self, config: &VClusterConfig) -> Result<(), Report<VClusterError>> {
        let name = config.name.as_str();
        let namespace = config.namespace.as_str();

        let labels = BTreeMap::from([
            (MANAGED_BY_LABEL.to_string(), MANAGED_BY_VALUE.to_string()),
            ("vcluster.chasi-bod.io/name".to_string(), name.to_string()),
        ]);
        match self.host.create_namespace(namespace, labels).await {
            Ok(()) => info!("Created namespace"),
            Err(report) if report.current_context().is_already_exists() => {
                debug!("Namespace already exists");
            }
            Err(report) => {
                return Err(report.change_context(VClusterError::NamespaceFailed {
                    name: name.to_string(),
                    namespace: namespace.to_string(),
                }));
            }
        }
        self.record(name, VClusterLifecycleState::NamespaceEnsured);

        for object in manifests::control_plane(config) {
            self.host
                .apply(namespace, &object)
                .await
                .change_context_lazy(|| VClusterError::ApplyFailed {
                    name: name.to_string(),
                })
                .attach_printable_lazy(|| format!("{} {}", object.kind(), object.name()))?;
        }
        self.record(name, VClusterLifecycleState::ManifestsApplied);
        self.record(name, VClusterLifecycleState::AwaitingReady);

        poll_until(self.poll, || async {
            match self.host.deployment_status(namespace, name).await {
                Ok(status) if status.is_ready() => Ok(Attempt::Ready(())),
                Ok(status) => Ok(Attempt::Pending(format!(
                    "{}/{} replicas ready",
                    status.ready_replicas, status.replicas
                ))),
                Err(report) if report.current_context().is_not_found() => {
                    Ok(Attempt::Pending("deployment not found".to_string()))
                }
                Err(report) => Err(report),
            }
        })
        .await
        .map_err(|report| {
            let context = match report.current_context() {
                PollError::TimedOut { .. } => VClusterError::ReadyTimeout {
                    name: name.to_string(),
                    namespace: namespace.to_string(),
                },
                PollError::Aborted => VClusterError::WaitFailed {
                    name: name.to_string(),
                },
            };
            report.change_context(context)
        })?;

        self.record(name, VClusterLifecycleState::Ready);
        info!("VCluster control plane is ready");
        Ok(())
    }

    /// Deletes the tenant namespace and waits until it is gone. Deleting a
    /// tenant that does not exist succeeds.
    ///
    /// # Errors
    ///
    /// - [`VClusterError::DeleteFailed`] if the delete request fails
    /// - [`VClusterError::DeleteTimeout`] if the namespace lingers
    #[instrument(skip(self))]
    pub async fn delete(&self, name: &str) -> Result<(), Report<VClusterError>> {
        let namespace = vcluster_namespace(name);
        let failed = || VClusterError::DeleteFailed {
            name: name.to_string(),
            namespace: namespace.clone(),
        };

        self.record(name, VClusterLifecycleState::Deleting);
        match self.host.delete_namespace(&namespace).await {
            Ok(()) => info!(%namespace, "Deleting namespace"),
            Err(report) if report.current_context().is_not_found() => {
                debug!(%namespace, "Namespace already absent");
            }
            Err(report) => return Err(report.change_context(failed())),
        }

        poll_until(self.poll, || async {
            match self.host.namespace_exists(&namespace).await {
                Ok(true) => Ok(Attempt::Pending("namespace terminating".to_string())),
                Ok(false) => Ok(Attempt::Ready(())),
                Err(report) => Err(report),
            }
        })
        .await
        .map_err(|report| {
            let context = match report.current_context() {
                PollError::TimedOut { .. } => VClusterError::DeleteTimeout {
                    name: name.to_string(),
                    namespace: namespace.clone(),
                },
                PollError::Aborted => failed(),
            };
            report.change_context(context)
        })?;

        self.record(name, VClusterLifecycleState::Absent);
        info!("VCluster deleted");
        Ok(())
    }

    /// Waits until the tenant API answers through a resolved client.
    /// Resolution and request failures are retried until the deadline.
    ///
    /// # Errors
    ///
    /// - [`VClusterError::ApiTimeout`] if the API never answers in time
    #[instrument(skip(self))]
    pub async fn wait_for_ready(&self, name: &str) -> Result<(), Report<VClusterError>> {
        poll_until(self.poll, || async {
            let attempt = match self.resolver.resolve(name).await {
                Ok(api) => match api.list_namespaces(None).await {
                    Ok(_) => Attempt::Ready(()),
                    Err(report) => Attempt::Pending(report.to_string()),
                },
                Err(report) => Attempt::Pending(report.to_string()),
            };
            Ok::<_, Report<VClusterError>>(attempt)
        })
        .await
        .change_context_lazy(|| VClusterError::ApiTimeout {
            name: name.to_string(),
        })?;
        info!("VCluster API is reachable");
        Ok(())
    }

    /// API client for the tenant `name`.
    ///
    /// # Errors
    ///
    /// Any resolution failure of the underlying resolver.
    pub async fn client(&self, name: &str) -> Result<Arc<dyn ClusterApi>, Report<VClusterError>> {
        self.resolver.resolve(name).await
    }

    /// Kubeconfig for connecting external tools to the tenant `name`.
    ///
    /// # Errors
    ///
    /// Any credential lookup failure of the underlying resolver.
    pub async fn kubeconfig(&self, name: &str) -> Result<String, Report<VClusterError>> {
        self.resolver.kubeconfig(name).await
    }

    /// Names of the tenants present on the Host cluster.
    ///
    /// # Errors
    ///
    /// - [`VClusterError::ListFailed`] if namespaces cannot be listed
    pub async fn list(&self) -> Result<Vec<String>, Report<VClusterError>> {
        let selector = format!("{MANAGED_BY_LABEL}={MANAGED_BY_VALUE}");
        let namespaces = self
            .host
            .list_namespaces(Some(&selector))
            .await
            .change_context(VClusterError::ListFailed)?;
        Ok(namespaces
            .iter()
            .filter_map(|ns| ns.strip_prefix(VCLUSTER_NAMESPACE_PREFIX))
            .filter(|name| !name.is_empty())
            .map(str::to_string)
            .collect())
    }
}
