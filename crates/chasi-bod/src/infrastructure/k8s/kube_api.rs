use std::collections::BTreeMap;
use std::fmt::Debug;

use async_trait::async_trait;
use error_stack::Report;
use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::core::v1::Namespace;
use k8s_openapi::api::core::v1::Node;
use k8s_openapi::api::core::v1::Pod;
use k8s_openapi::api::core::v1::Secret;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use k8s_openapi::NamespaceResourceScope;
use kube::api::DeleteParams;
use kube::api::EvictParams;
use kube::api::ListParams;
use kube::api::Patch;
use kube::api::PatchParams;
use kube::api::PostParams;
use kube::Api;
use kube::Client;
use kube::Resource;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::json;
use tracing::debug;

use super::ClusterApi;
use super::DeploymentStatus;
use super::KubeObject;
use super::KubernetesError;
use super::NodeSummary;
use super::PodSummary;

const FIELD_MANAGER: &str = "chasi-bod";
const MIRROR_POD_ANNOTATION: &str = "kubernetes.io/config.mirror";
const CONTROL_PLANE_LABEL: &str = "node-role.kubernetes.io/control-plane";

/// [`ClusterApi`] backed by a `kube` client.
#[derive(Clone)]
pub struct KubeClusterApi {
    client: Client,
}

impl KubeClusterApi {
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    async fn apply_namespaced<K>(&self, namespace: &str, object: &K) -> Result<(), Report<KubernetesError>>
    where
        K: Resource<Scope = NamespaceResourceScope, DynamicType = ()>
            + Clone
            + Debug
            + DeserializeOwned
            + Serialize,
    {
        let name = object.meta().name.clone().unwrap_or_default();
        let api: Api<K> = Api::namespaced(self.client.clone(), namespace);
        api.patch(
            &name,
            &PatchParams::apply(FIELD_MANAGER).force(),
            &Patch::Apply(object),
        )
        .await
        .map_err(|e| map_error(e, &K::kind(&()), &name))?;
        Ok(())
    }

    async fn apply_cluster<K>(&self, object: &K) -> Result<(), Report<KubernetesError>>
    where
        K: Resource<DynamicType = ()> + Clone + Debug + DeserializeOwned + Serialize,
    {
        let name = object.meta().name.clone().unwrap_or_default();
        let api: Api<K> = Api::all(self.client.clone());
        api.patch(
            &name,
            &PatchParams::apply(FIELD_MANAGER).force(),
            &Patch::Apply(object),
        )
        .await
        .map_err(|e| map_error(e, &K::kind(&()), &name))?;
        Ok(())
    }
}

/// Maps API status codes onto the error variants callers branch on.
fn map_error(err: kube::Error, kind: &str, name: &str) -> Report<KubernetesError> {
    let context = match &err {
        kube::Error::Api(response) => match response.code {
            404 => KubernetesError::NotFound {
                kind: kind.to_string(),
                name: name.to_string(),
            },
            409 => KubernetesError::AlreadyExists {
                kind: kind.to_string(),
                name: name.to_string(),
            },
            429 => KubernetesError::EvictionBlocked {
                name: name.to_string(),
            },
            _ => KubernetesError::RequestFailed {
                message: format!("{kind} {name}: {}", response.message),
            },
        },
        other => KubernetesError::ConnectionFailed {
            message: format!("{kind} {name}: {other}"),
        },
    };
    Report::new(err).change_context(context)
}

fn deployment_status(deployment: &Deployment) -> DeploymentStatus {
    let status = deployment.status.as_ref();
    DeploymentStatus {
        replicas: status.and_then(|s| s.replicas).unwrap_or(0),
        ready_replicas: status.and_then(|s| s.ready_replicas).unwrap_or(0),
    }
}

fn node_summary(node: Node) -> NodeSummary {
    let status = node.status.unwrap_or_default();
    let ready = status
        .conditions
        .unwrap_or_default()
        .iter()
        .any(|c| c.type_ == "Ready" && c.status == "True");
    NodeSummary {
        control_plane: node
            .metadata
            .labels
            .as_ref()
            .is_some_and(|labels| labels.contains_key(CONTROL_PLANE_LABEL)),
        name: node.metadata.name.unwrap_or_default(),
        ready,
        unschedulable: node.spec.and_then(|s| s.unschedulable).unwrap_or(false),
        addresses: status
            .addresses
            .unwrap_or_default()
            .into_iter()
            .map(|a| a.address)
            .collect(),
    }
}

fn pod_summary(pod: Pod) -> PodSummary {
    let meta = pod.metadata;
    PodSummary {
        daemonset_owned: meta
            .owner_references
            .as_ref()
            .is_some_and(|refs| refs.iter().any(|r| r.kind == "DaemonSet")),
        mirror: meta
            .annotations
            .as_ref()
            .is_some_and(|a| a.contains_key(MIRROR_POD_ANNOTATION)),
        namespace: meta.namespace.unwrap_or_default(),
        name: meta.name.unwrap_or_default(),
    }
}

#[async_trait]
impl ClusterApi for KubeClusterApi {
    async fn ping(&self) -> Result<(), Report<KubernetesError>> {
        let api: Api<Namespace> = Api::all(self.client.clone());
        api.list(&ListParams::default().limit(1))
            .await
            .map_err(|e| map_error(e, "Namespace", "*"))?;
        Ok(())
    }

    async fn create_namespace(
        &self,
        name: &str,
        labels: BTreeMap<String, String>,
    ) -> Result<(), Report<KubernetesError>> {
        let api: Api<Namespace> = Api::all(self.client.clone());
        let namespace = Namespace {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                labels: Some(labels),
                ..Default::default()
            },
            ..Default::default()
        };
        api.create(&PostParams::default(), &namespace)
            .await
            .map_err(|e| map_error(e, "Namespace", name))?;
        debug!(namespace = name, "Created namespace");
        Ok(())
    }

    async fn namespace_exists(&self, name: &str) -> Result<bool, Report<KubernetesError>> {
        let api: Api<Namespace> = Api::all(self.client.clone());
        let namespace = api
            .get_opt(name)
            .await
            .map_err(|e| map_error(e, "Namespace", name))?;
        Ok(namespace.is_some())
    }

    async fn delete_namespace(&self, name: &str) -> Result<(), Report<KubernetesError>> {
        let api: Api<Namespace> = Api::all(self.client.clone());
        api.delete(name, &DeleteParams::foreground())
            .await
            .map_err(|e| map_error(e, "Namespace", name))?;
        Ok(())
    }

    async fn list_namespaces(
        &self,
        label_selector: Option<&str>,
    ) -> Result<Vec<String>, Report<KubernetesError>> {
        let api: Api<Namespace> = Api::all(self.client.clone());
        let mut params = ListParams::default();
        if let Some(selector) = label_selector {
            params = params.labels(selector);
        }
        let list = api
            .list(&params)
            .await
            .map_err(|e| map_error(e, "Namespace", "*"))?;
        Ok(list
            .items
            .into_iter()
            .filter_map(|ns| ns.metadata.name)
            .collect())
    }

    async fn apply(
        &self,
        namespace: &str,
        object: &KubeObject,
    ) -> Result<(), Report<KubernetesError>> {
        match object {
            KubeObject::ServiceAccount(o) => self.apply_namespaced(namespace, o).await,
            KubeObject::Role(o) => self.apply_namespaced(namespace, o).await,
            KubeObject::RoleBinding(o) => self.apply_namespaced(namespace, o).await,
            KubeObject::Service(o) => self.apply_namespaced(namespace, o).await,
            KubeObject::Deployment(o) => self.apply_namespaced(namespace, o).await,
            KubeObject::ConfigMap(o) => self.apply_namespaced(namespace, o).await,
            KubeObject::StorageClass(o) => self.apply_cluster(o).await,
        }
    }

    async fn deployment_status(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<DeploymentStatus, Report<KubernetesError>> {
        let api: Api<Deployment> = Api::namespaced(self.client.clone(), namespace);
        let deployment = api
            .get(name)
            .await
            .map_err(|e| map_error(e, "Deployment", name))?;
        Ok(deployment_status(&deployment))
    }

    async fn list_deployments(
        &self,
        namespace: &str,
    ) -> Result<Vec<(String, DeploymentStatus)>, Report<KubernetesError>> {
        let api: Api<Deployment> = Api::namespaced(self.client.clone(), namespace);
        let list = api
            .list(&ListParams::default())
            .await
            .map_err(|e| map_error(e, "Deployment", "*"))?;
        Ok(list
            .items
            .iter()
            .map(|d| (d.metadata.name.clone().unwrap_or_default(), deployment_status(d)))
            .collect())
    }

    async fn secret_data(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<BTreeMap<String, Vec<u8>>, Report<KubernetesError>> {
        let api: Api<Secret> = Api::namespaced(self.client.clone(), namespace);
        let secret = api
            .get(name)
            .await
            .map_err(|e| map_error(e, "Secret", name))?;
        Ok(secret
            .data
            .unwrap_or_default()
            .into_iter()
            .map(|(k, v)| (k, v.0))
            .collect())
    }

    async fn list_nodes(&self) -> Result<Vec<NodeSummary>, Report<KubernetesError>> {
        let api: Api<Node> = Api::all(self.client.clone());
        let list = api
            .list(&ListParams::default())
            .await
            .map_err(|e| map_error(e, "Node", "*"))?;
        Ok(list.items.into_iter().map(node_summary).collect())
    }

    async fn set_unschedulable(
        &self,
        node: &str,
        unschedulable: bool,
    ) -> Result<(), Report<KubernetesError>> {
        let api: Api<Node> = Api::all(self.client.clone());
        let patch = json!({ "spec": { "unschedulable": unschedulable } });
        api.patch(node, &PatchParams::default(), &Patch::Merge(&patch))
            .await
            .map_err(|e| map_error(e, "Node", node))?;
        Ok(())
    }

    async fn list_pods_on_node(
        &self,
        node: &str,
    ) -> Result<Vec<PodSummary>, Report<KubernetesError>> {
        let api: Api<Pod> = Api::all(self.client.clone());
        let params = ListParams::default().fields(&format!("spec.nodeName={node}"));
        let list = api
            .list(&params)
            .await
            .map_err(|e| map_error(e, "Pod", "*"))?;
        Ok(list.items.into_iter().map(pod_summary).collect())
    }

    async fn evict_pod(&self, namespace: &str, name: &str) -> Result<(), Report<KubernetesError>> {
        let api: Api<Pod> = Api::namespaced(self.client.clone(), namespace);
        api.evict(name, &EvictParams::default())
            .await
            .map_err(|e| map_error(e, "Pod", name))?;
        Ok(())
    }

    async fn delete_node(&self, name: &str) -> Result<(), Report<KubernetesError>> {
        let api: Api<Node> = Api::all(self.client.clone());
        api.delete(name, &DeleteParams::default())
            .await
            .map_err(|e| map_error(e, "Node", name))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use k8s_openapi::api::core::v1::NodeAddress;
    use k8s_openapi::api::core::v1::NodeCondition;
    use k8s_openapi::api::core::v1::NodeStatus;
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference;
    use kube::error::ErrorResponse;
    use similar_asserts::assert_eq;

    use super::*;

    fn api_error(code: u16) -> kube::Error {
        kube::Error::Api(ErrorResponse {
            status: "Failure".to_string(),
            message: "boom".to_string(),
            reason: "Test".to_string(),
            code,
        })
    }

    #[test]
    fn status_codes_map_to_error_variants() {
        assert!(map_error(api_error(404), "Namespace", "x")
            .current_context()
            .is_not_found());
        assert!(map_error(api_error(409), "Namespace", "x")
            .current_context()
            .is_already_exists());
        assert!(matches!(
            map_error(api_error(429), "Pod", "web-0").current_context(),
            KubernetesError::EvictionBlocked { .. }
        ));
        assert!(matches!(
            map_error(api_error(500), "Pod", "web-0").current_context(),
            KubernetesError::RequestFailed { .. }
        ));
    }

    #[test]
    fn node_summary_reads_ready_condition_and_addresses() {
        let node = Node {
            metadata: ObjectMeta {
                name: Some("master-1".to_string()),
                labels: Some(BTreeMap::from([(
                    CONTROL_PLANE_LABEL.to_string(),
                    String::new(),
                )])),
                ..Default::default()
            },
            status: Some(NodeStatus {
                conditions: Some(vec![NodeCondition {
                    type_: "Ready".to_string(),
                    status: "True".to_string(),
                    ..Default::default()
                }]),
                addresses: Some(vec![NodeAddress {
                    type_: "InternalIP".to_string(),
                    address: "10.0.0.1".to_string(),
                }]),
                ..Default::default()
            }),
            ..Default::default()
        };

        let summary = node_summary(node);

        assert_eq!(
            summary,
            NodeSummary {
                name: "master-1".to_string(),
                ready: true,
                unschedulable: false,
                control_plane: true,
                addresses: vec!["10.0.0.1".to_string()],
            }
        );
    }

    #[test]
    fn daemonset_pods_are_not_evictable() {
        let pod = Pod {
            metadata: ObjectMeta {
                name: Some("kube-proxy-abc".to_string()),
                namespace: Some("kube-system".to_string()),
                owner_references: Some(vec![OwnerReference {
                    kind: "DaemonSet".to_string(),
                    name: "kube-proxy".to_string(),
                    ..Default::default()
                }]),
                ..Default::default()
            },
            ..Default::default()
        };

        assert!(!pod_summary(pod).is_evictable());
    }
}
