//! Evacuating workloads from a node.

use std::time::Duration;

use error_stack::Report;
use error_stack::ResultExt;
use tracing::debug;
use tracing::info;
use tracing::warn;

use super::DeployError;
use crate::infrastructure::k8s::ClusterApi;
use crate::util::poll::poll_until;
use crate::util::poll::Attempt;
use crate::util::poll::PollSettings;

/// Interval and deadline of the eviction loop.
pub const DRAIN_POLL: PollSettings =
    PollSettings::new(Duration::from_secs(5), Duration::from_secs(5 * 60));

/// Kubernetes node name of the machine at `address`, if it is registered.
///
/// # Errors
///
/// - [`DeployError::HostApi`] if nodes cannot be listed
pub async fn node_name(
    api: &dyn ClusterApi,
    address: &str,
) -> Result<Option<String>, Report<DeployError>> {
    let nodes = api
        .list_nodes()
        .await
        .change_context(DeployError::HostApi)?;
    Ok(nodes
        .into_iter()
        .find(|n| n.matches(address))
        .map(|n| n.name))
}

/// Cordons the node at `address` and evicts every pod not owned by a
/// DaemonSet and not mirrored from a static manifest, until none remain.
/// Returns the node name, or `None` when the address is not registered.
///
/// # Errors
///
/// - [`DeployError::DrainFailed`] if cordoning fails or pods remain at the
///   deadline
pub async fn drain(
    api: &dyn ClusterApi,
    address: &str,
    poll: PollSettings,
) -> Result<Option<String>, Report<DeployError>> {
    let failed = || DeployError::DrainFailed {
        node: address.to_string(),
    };
    let Some(name) = node_name(api, address).await? else {
        info!(node = address, "Node is not registered, nothing to drain");
        return Ok(None);
    };

    api.set_unschedulable(&name, true)
        .await
        .change_context_lazy(failed)?;
    info!(node = address, %name, "Node cordoned");

    poll_until(poll, || async {
        let pods = match api.list_pods_on_node(&name).await {
            Ok(pods) => pods,
            Err(report) => return Err(report),
        };
        let remaining: Vec<_> = pods.into_iter().filter(|p| p.is_evictable()).collect();
        if remaining.is_empty() {
            return Ok(Attempt::Ready(()));
        }
        for pod in &remaining {
            match api.evict_pod(&pod.namespace, &pod.name).await {
                Ok(()) => debug!(pod = %pod.name, namespace = %pod.namespace, "Evicted"),
                Err(report)
                    if report.current_context().is_not_found()
                        || report.current_context().is_eviction_blocked() =>
                {
                    debug!(pod = %pod.name, "Eviction deferred: {report}");
                }
                Err(report) => return Err(report),
            }
        }
        Ok(Attempt::Pending(format!("{} pods remaining", remaining.len())))
    })
    .await
    .change_context_lazy(failed)?;

    info!(node = address, %name, "Node drained");
    Ok(Some(name))
}

/// Makes a drained node schedulable again.
///
/// # Errors
///
/// - [`DeployError::HostApi`] if the node cannot be patched
pub async fn uncordon(api: &dyn ClusterApi, name: &str) -> Result<(), Report<DeployError>> {
    api.set_unschedulable(name, false)
        .await
        .change_context(DeployError::HostApi)?;
    info!(%name, "Node uncordoned");
    Ok(())
}

/// Deletes the Kubernetes node object, tolerating its absence.
///
/// # Errors
///
/// - [`DeployError::HostApi`] if the delete request fails
pub async fn delete_node(api: &dyn ClusterApi, name: &str) -> Result<(), Report<DeployError>> {
    match api.delete_node(name).await {
        Ok(()) => {
            info!(%name, "Node deleted from cluster");
            Ok(())
        }
        Err(report) if report.current_context().is_not_found() => {
            warn!(%name, "Node already gone from cluster");
            Ok(())
        }
        Err(report) => Err(report.change_context(DeployError::HostApi)),
    }
}
