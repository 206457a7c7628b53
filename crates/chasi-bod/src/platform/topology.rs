//! Node set arithmetic shared by scale and upgrade.

use std::collections::BTreeSet;

use super::ClusterConfig;
use super::NodeConfig;

/// Masters that must remain after a removal: `ceil(masters / 2) + 1`.
pub fn quorum_size(masters: usize) -> usize {
    masters.div_ceil(2) + 1
}

/// A removal that would break the master quorum.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QuorumViolation {
    pub live_masters: usize,
    pub remaining_masters: usize,
    pub required: usize,
}

/// Checks that removing `removals` from a cluster with `live_masters`
/// masters keeps at least one master and a quorum of them.
pub fn check_master_removal(
    live_masters: &[&NodeConfig],
    removals: &[&NodeConfig],
) -> Result<(), QuorumViolation> {
    let removed: BTreeSet<&str> = removals
        .iter()
        .filter(|n| n.is_master())
        .map(|n| n.address.as_str())
        .collect();
    let remaining = live_masters
        .iter()
        .filter(|n| !removed.contains(n.address.as_str()))
        .count();
    let required = quorum_size(live_masters.len());

    if removed.is_empty() {
        return Ok(());
    }
    if remaining == 0 || remaining < required {
        return Err(QuorumViolation {
            live_masters: live_masters.len(),
            remaining_masters: remaining,
            required,
        });
    }
    Ok(())
}

/// Node-level difference between two cluster documents, keyed by address.
#[derive(Debug, Default)]
pub struct NodeDiff<'a> {
    /// Present only in the new document
    pub added: Vec<&'a NodeConfig>,
    /// Present only in the current document
    pub removed: Vec<&'a NodeConfig>,
    /// Present in both with a different configuration; holds the new one
    pub changed: Vec<&'a NodeConfig>,
}

impl<'a> NodeDiff<'a> {
    pub fn between(current: &'a ClusterConfig, new: &'a ClusterConfig) -> Self {
        let mut diff = NodeDiff::default();
        for node in &new.nodes {
            match current.node(&node.address) {
                None => diff.added.push(node),
                Some(old) if old != node => diff.changed.push(node),
                Some(_) => {}
            }
        }
        diff.removed = current
            .nodes
            .iter()
            .filter(|n| new.node(&n.address).is_none())
            .collect();
        diff
    }

    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.removed.is_empty() && self.changed.is_empty()
    }
}

/// Cluster-wide settings whose change forces every node to be reconfigured.
pub fn cluster_settings_changed(current: &ClusterConfig, new: &ClusterConfig) -> bool {
    current.kubernetes_version != new.kubernetes_version
        || current.container_runtime != new.container_runtime
        || current.network != new.network
        || current.storage != new.storage
        || current.base_os != new.base_os
}
