//! Test adapters for the cluster API.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::Mutex;

use async_trait::async_trait;
use error_stack::Report;

use super::ClusterApi;
use super::DeploymentStatus;
use super::HostAccess;
use super::KubeObject;
use super::KubernetesError;
use super::NodeSummary;
use super::PodSummary;
use crate::platform::ClusterConfig;

#[derive(Default)]
struct State {
    calls: Vec<String>,
    namespaces: BTreeMap<String, BTreeMap<String, String>>,
    /// Namespaces being deleted and how many more lookups still see them
    terminating: BTreeMap<String, u32>,
    deployments: BTreeMap<(String, String), DeploymentStatus>,
    secrets: BTreeMap<(String, String), BTreeMap<String, Vec<u8>>>,
    nodes: Vec<NodeSummary>,
    pods: Vec<(String, PodSummary)>,
    applied: Vec<(String, String, String)>,
    ready_on_apply: bool,
    unreachable: bool,
    forbidden: bool,
    namespace_linger: u32,
}

/// In-memory cluster with call recording.
#[derive(Clone, Default)]
pub struct MockClusterApi {
    state: Arc<Mutex<State>>,
}

fn not_found(kind: &str, name: &str) -> Report<KubernetesError> {
    Report::new(KubernetesError::NotFound {
        kind: kind.to_string(),
        name: name.to_string(),
    })
}

impl MockClusterApi {
    pub fn new() -> Self {
        Self::default()
    }

    fn record(&self, call: String) -> std::sync::MutexGuard<'_, State> {
        let mut state = self.state.lock().unwrap();
        state.calls.push(call);
        state
    }

    fn check_reachable(&self) -> Result<(), Report<KubernetesError>> {
        let state = self.state.lock().unwrap();
        if state.unreachable {
            return Err(Report::new(KubernetesError::ConnectionFailed {
                message: "mock API unreachable".to_string(),
            }));
        }
        if state.forbidden {
            return Err(Report::new(KubernetesError::RequestFailed {
                message: "forbidden: credentials rejected".to_string(),
            }));
        }
        Ok(())
    }

    pub fn calls(&self) -> Vec<String> {
        self.state.lock().unwrap().calls.clone()
    }

    pub fn set_unreachable(&self, unreachable: bool) {
        self.state.lock().unwrap().unreachable = unreachable;
    }

    /// Every call answers like a 403.
    pub fn set_forbidden(&self, forbidden: bool) {
        self.state.lock().unwrap().forbidden = forbidden;
    }

    /// Deployments applied through [`ClusterApi::apply`] report 1/1 ready.
    pub fn set_ready_on_apply(&self, ready: bool) {
        self.state.lock().unwrap().ready_on_apply = ready;
    }

    /// Number of existence checks that still see a deleted namespace.
    pub fn set_namespace_linger(&self, lookups: u32) {
        self.state.lock().unwrap().namespace_linger = lookups;
    }

    pub fn add_namespace(&self, name: &str) {
        self.state
            .lock()
            .unwrap()
            .namespaces
            .insert(name.to_string(), BTreeMap::new());
    }

    pub fn has_namespace(&self, name: &str) -> bool {
        self.state.lock().unwrap().namespaces.contains_key(name)
    }

    pub fn set_deployment(&self, namespace: &str, name: &str, status: DeploymentStatus) {
        self.state
            .lock()
            .unwrap()
            .deployments
            .insert((namespace.to_string(), name.to_string()), status);
    }

    pub fn set_secret(&self, namespace: &str, name: &str, data: &[(&str, &[u8])]) {
        self.state.lock().unwrap().secrets.insert(
            (namespace.to_string(), name.to_string()),
            data.iter()
                .map(|(k, v)| (k.to_string(), v.to_vec()))
                .collect(),
        );
    }

    pub fn add_node(&self, node: NodeSummary) {
        self.state.lock().unwrap().nodes.push(node);
    }

    pub fn nodes(&self) -> Vec<NodeSummary> {
        self.state.lock().unwrap().nodes.clone()
    }

    pub fn add_pod(&self, node: &str, pod: PodSummary) {
        self.state
            .lock()
            .unwrap()
            .pods
            .push((node.to_string(), pod));
    }

    /// (namespace, kind, name) of every applied object, in order
    pub fn applied(&self) -> Vec<(String, String, String)> {
        self.state.lock().unwrap().applied.clone()
    }
}

#[async_trait]
impl ClusterApi for MockClusterApi {
    async fn ping(&self) -> Result<(), Report<KubernetesError>> {
        self.check_reachable()?;
        self.record("ping".to_string());
        Ok(())
    }

    async fn create_namespace(
        &self,
        name: &str,
        labels: BTreeMap<String, String>,
    ) -> Result<(), Report<KubernetesError>> {
        self.check_reachable()?;
        let mut state = self.record(format!("create_namespace {name}"));
        if state.namespaces.contains_key(name) {
            return Err(Report::new(KubernetesError::AlreadyExists {
                kind: "Namespace".to_string(),
                name: name.to_string(),
            }));
        }
        state.namespaces.insert(name.to_string(), labels);
        Ok(())
    }

    async fn namespace_exists(&self, name: &str) -> Result<bool, Report<KubernetesError>> {
        self.check_reachable()?;
        let mut state = self.record(format!("namespace_exists {name}"));
        if let Some(remaining) = state.terminating.get_mut(name) {
            if *remaining > 0 {
                *remaining -= 1;
                return Ok(true);
            }
            state.terminating.remove(name);
            state.namespaces.remove(name);
        }
        Ok(state.namespaces.contains_key(name))
    }

    async fn delete_namespace(&self, name: &str) -> Result<(), Report<KubernetesError>> {
        self.check_reachable()?;
        let mut state = self.record(format!("delete_namespace {name}"));
        if !state.namespaces.contains_key(name) {
            return Err(not_found("Namespace", name));
        }
        let linger = state.namespace_linger;
        if linger == 0 {
            state.namespaces.remove(name);
        } else {
            state.terminating.insert(name.to_string(), linger);
        }
        state.deployments.retain(|(ns, _), _| ns != name);
        Ok(())
    }

    async fn list_namespaces(
        &self,
        label_selector: Option<&str>,
    ) -> Result<Vec<String>, Report<KubernetesError>> {
        self.check_reachable()?;
        let state = self.record("list_namespaces".to_string());
        let wanted = label_selector.and_then(|s| s.split_once('='));
        Ok(state
            .namespaces
            .iter()
            .filter(|(_, labels)| match wanted {
                Some((k, v)) => labels.get(k).is_some_and(|value| value == v),
                None => true,
            })
            .map(|(name, _)| name.clone())
            .collect())
    }

    async fn apply(
        &self,
        namespace: &str,
        object: &KubeObject,
    ) -> Result<(), Report<KubernetesError>> {
        self.check_reachable()?;
        let mut state = self.record(format!("apply {} {}", object.kind(), object.name()));
        state.applied.push((
            namespace.to_string(),
            object.kind().to_string(),
            object.name(),
        ));
        if matches!(object, KubeObject::Deployment(_)) {
            let status = if state.ready_on_apply {
                DeploymentStatus {
                    replicas: 1,
                    ready_replicas: 1,
                }
            } else {
                DeploymentStatus {
                    replicas: 1,
                    ready_replicas: 0,
                }
            };
            state
                .deployments
                .insert((namespace.to_string(), object.name()), status);
        }
        Ok(())
    }

    async fn deployment_status(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<DeploymentStatus, Report<KubernetesError>> {
        self.check_reachable()?;
        let state = self.record(format!("deployment_status {namespace}/{name}"));
        state
            .deployments
            .get(&(namespace.to_string(), name.to_string()))
            .copied()
            .ok_or_else(|| not_found("Deployment", name))
    }

    async fn list_deployments(
        &self,
        namespace: &str,
    ) -> Result<Vec<(String, DeploymentStatus)>, Report<KubernetesError>> {
        self.check_reachable()?;
        let state = self.record(format!("list_deployments {namespace}"));
        Ok(state
            .deployments
            .iter()
            .filter(|((ns, _), _)| ns == namespace)
            .map(|((_, name), status)| (name.clone(), *status))
            .collect())
    }

    async fn secret_data(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<BTreeMap<String, Vec<u8>>, Report<KubernetesError>> {
        self.check_reachable()?;
        let state = self.record(format!("secret_data {namespace}/{name}"));
        state
            .secrets
            .get(&(namespace.to_string(), name.to_string()))
            .cloned()
            .ok_or_else(|| not_found("Secret", name))
    }

    async fn list_nodes(&self) -> Result<Vec<NodeSummary>, Report<KubernetesError>> {
        self.check_reachable()?;
        let state = self.record("list_nodes".to_string());
        Ok(state.nodes.clone())
    }

    async fn set_unschedulable(
        &self,
        node: &str,
        unschedulable: bool,
    ) -> Result<(), Report<KubernetesError>> {
        self.check_reachable()?;
        let mut state = self.record(format!("set_unschedulable {node} {unschedulable}"));
        let entry = state
            .nodes
            .iter_mut()
            .find(|n| n.name == node)
            .ok_or_else(|| not_found("Node", node))?;
        entry.unschedulable = unschedulable;
        Ok(())
    }

    async fn list_pods_on_node(
        &self,
        node: &str,
    ) -> Result<Vec<PodSummary>, Report<KubernetesError>> {
        self.check_reachable()?;
        let state = self.record(format!("list_pods_on_node {node}"));
        Ok(state
            .pods
            .iter()
            .filter(|(n, _)| n == node)
            .map(|(_, pod)| pod.clone())
            .collect())
    }

    async fn evict_pod(&self, namespace: &str, name: &str) -> Result<(), Report<KubernetesError>> {
        self.check_reachable()?;
        let mut state = self.record(format!("evict_pod {namespace}/{name}"));
        let before = state.pods.len();
        state
            .pods
            .retain(|(_, pod)| !(pod.namespace == namespace && pod.name == name));
        if state.pods.len() == before {
            return Err(not_found("Pod", name));
        }
        Ok(())
    }

    async fn delete_node(&self, name: &str) -> Result<(), Report<KubernetesError>> {
        self.check_reachable()?;
        let mut state = self.record(format!("delete_node {name}"));
        let before = state.nodes.len();
        state.nodes.retain(|n| n.name != name);
        if state.nodes.len() == before {
            return Err(not_found("Node", name));
        }
        Ok(())
    }
}

/// Hands out the same mock cluster for any Host configuration.
#[derive(Clone, Default)]
pub struct MockHostAccess {
    pub api: MockClusterApi,
}

impl MockHostAccess {
    pub fn new(api: MockClusterApi) -> Self {
        Self { api }
    }
}

#[async_trait]
impl HostAccess for MockHostAccess {
    async fn host_api(
        &self,
        _cluster: &ClusterConfig,
    ) -> Result<Arc<dyn ClusterApi>, Report<KubernetesError>> {
        Ok(Arc::new(self.api.clone()))
    }
}
