//! Control-plane objects of a vcluster, rendered from its configuration.

use std::collections::BTreeMap;

use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::apps::v1::DeploymentSpec;
use k8s_openapi::api::core::v1::Container;
use k8s_openapi::api::core::v1::ContainerPort;
use k8s_openapi::api::core::v1::EnvVar;
use k8s_openapi::api::core::v1::PodSpec;
use k8s_openapi::api::core::v1::PodTemplateSpec;
use k8s_openapi::api::core::v1::ResourceRequirements;
use k8s_openapi::api::core::v1::Service;
use k8s_openapi::api::core::v1::ServiceAccount;
use k8s_openapi::api::core::v1::ServicePort;
use k8s_openapi::api::core::v1::ServiceSpec;
use k8s_openapi::api::rbac::v1::PolicyRule;
use k8s_openapi::api::rbac::v1::Role;
use k8s_openapi::api::rbac::v1::RoleBinding;
use k8s_openapi::api::rbac::v1::RoleRef;
use k8s_openapi::api::rbac::v1::Subject;
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::LabelSelector;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;

use crate::infrastructure::k8s::KubeObject;
use crate::infrastructure::k8s::MANAGED_BY_LABEL;
use crate::infrastructure::k8s::MANAGED_BY_VALUE;
use crate::platform::VClusterConfig;

/// Control-plane image used when the vcluster names no template.
pub const DEFAULT_CONTROL_PLANE_IMAGE: &str = "ghcr.io/loft-sh/vcluster:0.19.5";
/// Port the control plane listens on inside its pod.
pub const CONTROL_PLANE_PORT: i32 = 8443;
/// Port the tenant API is exposed on through its Service.
pub const SERVICE_PORT: i32 = 443;

/// Labels identifying every object of the vcluster `name`.
pub fn labels(name: &str) -> BTreeMap<String, String> {
    BTreeMap::from([
        ("app".to_string(), "vcluster".to_string()),
        ("release".to_string(), name.to_string()),
        (MANAGED_BY_LABEL.to_string(), MANAGED_BY_VALUE.to_string()),
    ])
}

fn selector(name: &str) -> BTreeMap<String, String> {
    BTreeMap::from([
        ("app".to_string(), "vcluster".to_string()),
        ("release".to_string(), name.to_string()),
    ])
}

fn meta(name: &str, namespace: &str, owner: &str) -> ObjectMeta {
    ObjectMeta {
        name: Some(name.to_string()),
        namespace: Some(namespace.to_string()),
        labels: Some(labels(owner)),
        ..Default::default()
    }
}

fn quantities(values: &BTreeMap<String, String>) -> Option<BTreeMap<String, Quantity>> {
    (!values.is_empty()).then(|| {
        values
            .iter()
            .map(|(k, v)| (k.clone(), Quantity(v.clone())))
            .collect()
    })
}

fn syncer_args(config: &VClusterConfig) -> Vec<String> {
    let mut args = vec![
        format!("--name={}", config.name),
        format!("--service-name={}", config.name),
        format!("--target-namespace={}", config.namespace),
    ];
    if !config.service_cidr.is_empty() {
        args.push(format!("--service-cidr={}", config.service_cidr));
    }
    if !config.pod_cidr.is_empty() {
        args.push(format!("--pod-cidr={}", config.pod_cidr));
    }
    let mut synced = config.sync.enabled_resources.clone();
    if config.sync.persistent_volume_claim_sync.enabled {
        synced.push("persistentvolumeclaims".to_string());
    }
    if !synced.is_empty() {
        args.push(format!("--sync={}", synced.join(",")));
    }
    args
}

/// Renders the ServiceAccount, Role, RoleBinding, Service and Deployment
/// that make up the tenant control plane, in apply order.
pub fn control_plane(config: &VClusterConfig) -> Vec<KubeObject> {
    let name = config.name.as_str();
    let namespace = config.namespace.as_str();
    let account = format!("vc-{name}");

    let service_account = ServiceAccount {
        metadata: meta(&account, namespace, name),
        ..Default::default()
    };

    let role = Role {
        metadata: meta(&account, namespace, name),
        rules: Some(vec![
            PolicyRule {
                api_groups: Some(vec![String::new()]),
                resources: Some(
                    [
                        "configmaps",
                        "secrets",
                        "services",
                        "pods",
                        "pods/attach",
                        "pods/portforward",
                        "pods/exec",
                        "pods/log",
                        "endpoints",
                        "persistentvolumeclaims",
                        "events",
                    ]
                    .map(str::to_string)
                    .to_vec(),
                ),
                verbs: ["create", "delete", "patch", "update", "get", "list", "watch"]
                    .map(str::to_string)
                    .to_vec(),
                ..Default::default()
            },
            PolicyRule {
                api_groups: Some(vec!["apps".to_string()]),
                resources: Some(vec!["statefulsets".to_string(), "deployments".to_string()]),
                verbs: ["get", "list", "watch"].map(str::to_string).to_vec(),
                ..Default::default()
            },
        ]),
    };

    let role_binding = RoleBinding {
        metadata: meta(&account, namespace, name),
        role_ref: RoleRef {
            api_group: "rbac.authorization.k8s.io".to_string(),
            kind: "Role".to_string(),
            name: account.clone(),
        },
        subjects: Some(vec![Subject {
            kind: "ServiceAccount".to_string(),
            name: account.clone(),
            namespace: Some(namespace.to_string()),
            ..Default::default()
        }]),
    };

    let service = Service {
        metadata: meta(name, namespace, name),
        spec: Some(ServiceSpec {
            selector: Some(selector(name)),
            ports: Some(vec![ServicePort {
                name: Some("https".to_string()),
                port: SERVICE_PORT,
                target_port: Some(IntOrString::Int(CONTROL_PLANE_PORT)),
                protocol: Some("TCP".to_string()),
                ..Default::default()
            }]),
            type_: Some("ClusterIP".to_string()),
            ..Default::default()
        }),
        ..Default::default()
    };

    let image = if config.template.is_empty() {
        DEFAULT_CONTROL_PLANE_IMAGE.to_string()
    } else {
        config.template.clone()
    };
    let deployment = Deployment {
        metadata: meta(name, namespace, name),
        spec: Some(DeploymentSpec {
            replicas: Some(1),
            selector: LabelSelector {
                match_labels: Some(selector(name)),
                ..Default::default()
            },
            template: PodTemplateSpec {
                metadata: Some(ObjectMeta {
                    labels: Some(labels(name)),
                    ..Default::default()
                }),
                spec: Some(PodSpec {
                    service_account_name: Some(account),
                    containers: vec![Container {
                        name: "syncer".to_string(),
                        image: Some(image),
                        args: Some(syncer_args(config)),
                        env: Some(vec![EnvVar {
                            name: "KUBERNETES_VERSION".to_string(),
                            value: Some(config.kubernetes_version.clone()),
                            ..Default::default()
                        }]),
                        ports: Some(vec![ContainerPort {
                            name: Some("https".to_string()),
                            container_port: CONTROL_PLANE_PORT,
                            ..Default::default()
                        }]),
                        resources: Some(ResourceRequirements {
                            requests: quantities(&config.resource_requests),
                            limits: quantities(&config.resource_limits),
                            ..Default::default()
                        }),
                        ..Default::default()
                    }],
                    ..Default::default()
                }),
            },
            ..Default::default()
        }),
        ..Default::default()
    };

    vec![
        KubeObject::ServiceAccount(service_account),
        KubeObject::Role(role),
        KubeObject::RoleBinding(role_binding),
        KubeObject::Service(service),
        KubeObject::Deployment(deployment),
    ]
}
