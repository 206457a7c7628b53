//! Deployment state record: last lifecycle state reached per node and
//! per tenant, kept as YAML next to the platform document.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Mutex;

use chrono::DateTime;
use chrono::Utc;
use serde::Deserialize;
use serde::Serialize;
use tracing::warn;

/// Convergence state of a Host node. Ordered by phase progression.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize,
    derive_more::Display,
)]
pub enum NodeLifecycleState {
    #[default]
    Unknown,
    Initializing,
    #[display("OSConfigured")]
    OsConfigured,
    RuntimeReady,
    NetworkReady,
    StorageReady,
    K8sJoined,
    Ready,
}

/// Lifecycle state of a tenant vcluster.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, derive_more::Display)]
pub enum VClusterLifecycleState {
    Absent,
    NamespaceEnsured,
    ManifestsApplied,
    AwaitingReady,
    Ready,
    Deleting,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeploymentState {
    #[serde(default)]
    pub nodes: BTreeMap<String, NodeLifecycleState>,
    #[serde(default)]
    pub tenants: BTreeMap<String, VClusterLifecycleState>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<DateTime<Utc>>,
}

/// Thread-safe holder of a [`DeploymentState`], optionally persisted.
///
/// Persistence failures are logged and never fail the caller.
#[derive(Debug, Default)]
pub struct StateStore {
    path: Option<PathBuf>,
    state: Mutex<DeploymentState>,
}

impl StateStore {
    pub fn in_memory() -> Self {
        Self::default()
    }

    /// Opens the record at `path`, starting empty when it is missing or
    /// unreadable.
    pub fn open(path: PathBuf) -> Self {
        let state = match std::fs::read_to_string(&path) {
            Ok(content) => serde_yaml::from_str(&content).unwrap_or_else(|e| {
                warn!(path = %path.display(), "Ignoring unreadable deployment state: {e}");
                DeploymentState::default()
            }),
            Err(_) => DeploymentState::default(),
        };
        Self {
            path: Some(path),
            state: Mutex::new(state),
        }
    }

    pub fn snapshot(&self) -> DeploymentState {
        self.lock().clone()
    }

    pub fn node_state(&self, address: &str) -> NodeLifecycleState {
        self.lock().nodes.get(address).copied().unwrap_or_default()
    }

    /// Moves a node forward to `reached`. Backward moves are ignored and
    /// reported as `false`.
    pub fn advance_node(&self, address: &str, reached: NodeLifecycleState) -> bool {
        let mut state = self.lock();
        let current = state.nodes.get(address).copied().unwrap_or_default();
        if reached <= current {
            return false;
        }
        state.nodes.insert(address.to_string(), reached);
        self.persist(&mut state);
        true
    }

    /// Restarts a node's progression at the start of a convergence run.
    pub fn reset_node(&self, address: &str) {
        let mut state = self.lock();
        state
            .nodes
            .insert(address.to_string(), NodeLifecycleState::Unknown);
        self.persist(&mut state);
    }

    pub fn forget_node(&self, address: &str) {
        let mut state = self.lock();
        if state.nodes.remove(address).is_some() {
            self.persist(&mut state);
        }
    }

    pub fn tenant_state(&self, name: &str) -> VClusterLifecycleState {
        self.lock()
            .tenants
            .get(name)
            .copied()
            .unwrap_or(VClusterLifecycleState::Absent)
    }

    pub fn set_tenant(&self, name: &str, tenant: VClusterLifecycleState) {
        let mut state = self.lock();
        if tenant == VClusterLifecycleState::Absent {
            state.tenants.remove(name);
        } else {
            state.tenants.insert(name.to_string(), tenant);
        }
        self.persist(&mut state);
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, DeploymentState> {
        self.state
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    fn persist(&self, state: &mut DeploymentState) {
        state.updated_at = Some(Utc::now());
        let Some(path) = &self.path else {
            return;
        };
        let result = serde_yaml::to_string(&*state)
            .map_err(|e| e.to_string())
            .and_then(|content| std::fs::write(path, content).map_err(|e| e.to_string()));
        if let Err(e) = result {
            warn!(path = %path.display(), "Failed to persist deployment state: {e}");
        }
    }
}

#[cfg(test)]
mod tests {
    use similar_asserts::assert_eq;

    use super::*;

    #[test]
    fn node_state_only_moves_forward() {
        let store = StateStore::in_memory();

        assert!(store.advance_node("10.0.0.1", NodeLifecycleState::Initializing));
        assert!(store.advance_node("10.0.0.1", NodeLifecycleState::RuntimeReady));
        assert!(!store.advance_node("10.0.0.1", NodeLifecycleState::OsConfigured));

        assert_eq!(
            store.node_state("10.0.0.1"),
            NodeLifecycleState::RuntimeReady
        );
    }

    #[test]
    fn reset_allows_progress_from_scratch() {
        let store = StateStore::in_memory();
        store.advance_node("10.0.0.1", NodeLifecycleState::Ready);

        store.reset_node("10.0.0.1");

        assert!(store.advance_node("10.0.0.1", NodeLifecycleState::Initializing));
    }

    #[test]
    fn absent_tenant_is_dropped_from_record() {
        let store = StateStore::in_memory();
        store.set_tenant("biz-a", VClusterLifecycleState::Ready);
        store.set_tenant("biz-a", VClusterLifecycleState::Absent);

        assert!(store.snapshot().tenants.is_empty());
        assert_eq!(store.tenant_state("biz-a"), VClusterLifecycleState::Absent);
    }

    #[test]
    fn persisted_state_survives_reopen() {
        let dir = tempfile::tempdir().expect("should create temp dir");
        let path = dir.path().join("config.state.yaml");

        let store = StateStore::open(path.clone());
        store.advance_node("10.0.0.1", NodeLifecycleState::K8sJoined);
        store.set_tenant("biz-a", VClusterLifecycleState::AwaitingReady);
        drop(store);

        let reopened = StateStore::open(path);
        assert_eq!(
            reopened.node_state("10.0.0.1"),
            NodeLifecycleState::K8sJoined
        );
        assert_eq!(
            reopened.tenant_state("biz-a"),
            VClusterLifecycleState::AwaitingReady
        );
    }
}
