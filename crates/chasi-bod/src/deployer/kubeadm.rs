//! K8sInstall: control-plane bootstrap and node joins with kubeadm.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use error_stack::Report;
use error_stack::ResultExt;
use k8s_openapi::api::storage::v1::StorageClass;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use tracing::info;
use tracing::instrument;

use super::phases::open_shell;
use super::phases::quoted;
use super::phases::run_step;
use super::ClusterInstaller;
use super::DeployError;
use crate::deployer::phases::ContainerRuntime;
use crate::infrastructure::k8s::ClusterApi;
use crate::infrastructure::k8s::HostAccess;
use crate::infrastructure::k8s::KubeObject;
use crate::infrastructure::k8s::ADMIN_KUBECONFIG_PATH;
use crate::infrastructure::k8s::MANAGED_BY_LABEL;
use crate::infrastructure::k8s::MANAGED_BY_VALUE;
use crate::infrastructure::remote::NodeConnector;
use crate::infrastructure::remote::NodeShell;
use crate::platform::ClusterConfig;
use crate::platform::NodeConfig;
use crate::platform::StorageConfig;
use crate::platform::KUBE_API_SERVER_PORT;
use crate::util::poll::poll_until;
use crate::util::poll::Attempt;
use crate::util::poll::PollError;
use crate::util::poll::PollSettings;

const KUBELET_DEFAULTS_PATH: &str = "/etc/default/kubelet";
const KUBELET_KUBECONFIG_PATH: &str = "/etc/kubernetes/kubelet.conf";
const DEFAULT_CLASS_ANNOTATION: &str = "storageclass.kubernetes.io/is-default-class";

/// Parts of a `kubeadm join` invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JoinCommand {
    pub endpoint: String,
    pub token: String,
    pub ca_cert_hash: String,
    pub certificate_key: Option<String>,
}

impl JoinCommand {
    /// Extracts the join parameters from `kubeadm init` or
    /// `kubeadm token create --print-join-command` output.
    ///
    /// # Errors
    ///
    /// - [`DeployError::InvalidJoinCommand`] if the endpoint, token or CA
    ///   hash is missing
    pub fn parse(output: &str) -> Result<Self, Report<DeployError>> {
        let invalid = |message: &str| {
            Report::new(DeployError::InvalidJoinCommand {
                message: message.to_string(),
            })
        };
        let start = output
            .find("kubeadm join")
            .ok_or_else(|| invalid("no 'kubeadm join' line"))?;
        let words: Vec<&str> = output[start + "kubeadm join".len()..]
            .split_whitespace()
            .filter(|w| *w != "\\")
            .collect();

        let endpoint = words
            .first()
            .filter(|w| !w.starts_with("--"))
            .ok_or_else(|| invalid("no API server endpoint"))?;
        let flag = |name: &str| {
            words
                .windows(2)
                .find(|pair| pair[0] == name)
                .map(|pair| pair[1].to_string())
        };

        Ok(Self {
            endpoint: endpoint.to_string(),
            token: flag("--token").ok_or_else(|| invalid("no --token"))?,
            ca_cert_hash: flag("--discovery-token-ca-cert-hash")
                .ok_or_else(|| invalid("no --discovery-token-ca-cert-hash"))?,
            certificate_key: flag("--certificate-key"),
        })
    }

    /// Command line joining a worker, or a control-plane node when
    /// `control_plane` is set.
    ///
    /// # Errors
    ///
    /// - [`DeployError::InvalidJoinCommand`] if a control-plane join has no
    ///   certificate key
    pub fn command(&self, control_plane: bool) -> Result<String, Report<DeployError>> {
        let mut command = format!(
            "kubeadm join {} --token {} --discovery-token-ca-cert-hash {}",
            self.endpoint, self.token, self.ca_cert_hash
        );
        if control_plane {
            let key = self.certificate_key.as_deref().ok_or_else(|| {
                Report::new(DeployError::InvalidJoinCommand {
                    message: "control-plane join needs a certificate key".to_string(),
                })
            })?;
            command.push_str(&format!(" --control-plane --certificate-key {key}"));
        }
        Ok(command)
    }
}

/// `KUBELET_EXTRA_ARGS` line carrying the node labels and taints.
pub(crate) fn kubelet_extra_args(node: &NodeConfig) -> String {
    let mut args = Vec::new();
    if !node.labels.is_empty() {
        let labels: Vec<String> = node.labels.iter().map(|(k, v)| format!("{k}={v}")).collect();
        args.push(format!("--node-labels={}", labels.join(",")));
    }
    if !node.taints.is_empty() {
        args.push(format!("--register-with-taints={}", node.taints.join(",")));
    }
    format!("KUBELET_EXTRA_ARGS=\"{}\"\n", args.join(" "))
}

/// Manifest URL of a CNI plugin name, or the plugin itself when it is a URL.
pub(crate) fn cni_manifest(plugin: &str) -> Option<String> {
    match plugin {
        "calico" => Some(
            "https://raw.githubusercontent.com/projectcalico/calico/v3.26.4/manifests/calico.yaml"
                .to_string(),
        ),
        "flannel" => Some(
            "https://github.com/flannel-io/flannel/releases/download/v0.24.2/kube-flannel.yml"
                .to_string(),
        ),
        url if url.starts_with("https://") || url.starts_with("http://") => Some(url.to_string()),
        _ => None,
    }
}

/// Kubernetes version in the `v1.28.4` form kubeadm expects.
pub fn kubeadm_version(version: &str) -> String {
    format!("v{}", version.trim_start_matches('v'))
}

pub(crate) fn storage_classes(storage: &StorageConfig) -> Vec<KubeObject> {
    storage
        .storage_classes
        .iter()
        .map(|class| {
            let mut annotations = BTreeMap::new();
            if class.name == storage.default_storage_class {
                annotations.insert(DEFAULT_CLASS_ANNOTATION.to_string(), "true".to_string());
            }
            KubeObject::StorageClass(StorageClass {
                metadata: ObjectMeta {
                    name: Some(class.name.clone()),
                    labels: Some(BTreeMap::from([(
                        MANAGED_BY_LABEL.to_string(),
                        MANAGED_BY_VALUE.to_string(),
                    )])),
                    annotations: Some(annotations),
                    ..Default::default()
                },
                provisioner: class.provisioner.clone(),
                parameters: (!class.parameters.is_empty()).then(|| class.parameters.clone()),
                ..Default::default()
            })
        })
        .collect()
}

/// Installs Kubernetes with kubeadm over SSH.
pub struct KubeadmInstaller {
    connector: Arc<dyn NodeConnector>,
    host: Arc<dyn HostAccess>,
}

impl KubeadmInstaller {
    pub fn new(connector: Arc<dyn NodeConnector>, host: Arc<dyn HostAccess>) -> Self {
        Self {
            connector,
            host,
        }
    }

    async fn write_kubelet_args(&self, node: &NodeConfig) -> Result<(), Report<DeployError>> {
        let shell = open_shell(self.connector.as_ref(), node).await?;
        shell
            .write_file(KUBELET_DEFAULTS_PATH, &kubelet_extra_args(node), "0644")
            .await
            .change_context_lazy(|| DeployError::step(node, "write kubelet args"))
    }

    /// Runs `kubeadm init` on `master`, or fetches fresh join parameters
    /// when its control plane already exists.
    async fn bootstrap(
        &self,
        master: &NodeConfig,
        cluster: &ClusterConfig,
    ) -> Result<JoinCommand, Report<DeployError>> {
        let shell = open_shell(self.connector.as_ref(), master).await?;
        let initialized = shell
            .probe(&format!("test -f {ADMIN_KUBECONFIG_PATH}"))
            .await
            .change_context_lazy(|| DeployError::step(master, "inspect control plane"))?;
        let ha = cluster.masters().count() > 1;
        if initialized {
            info!(master = %master.address, "Control plane already initialized");
            return fresh_join(&shell, master, ha).await;
        }

        let runtime = ContainerRuntime::parse(&cluster.container_runtime).map(ContainerRuntime::socket);
        let mut command = format!(
            "kubeadm init --kubernetes-version {} --pod-network-cidr {} --service-cidr {} \
             --control-plane-endpoint {}:{KUBE_API_SERVER_PORT} --upload-certs",
            quoted(master, &kubeadm_version(&cluster.kubernetes_version))?,
            quoted(master, &cluster.network.pod_cidr)?,
            quoted(master, &cluster.network.service_cidr)?,
            quoted(master, &master.address)?,
        );
        if let Some(socket) = runtime {
            command.push_str(&format!(" --cri-socket {socket}"));
        }
        info!(master = %master.address, "Bootstrapping control plane");
        let output = run_step(&shell, master, "kubeadm init", &command).await?;
        JoinCommand::parse(&output)
    }

    async fn join_node(
        &self,
        node: &NodeConfig,
        join: &JoinCommand,
    ) -> Result<(), Report<DeployError>> {
        let shell = open_shell(self.connector.as_ref(), node).await?;
        let joined = shell
            .probe(&format!("test -f {KUBELET_KUBECONFIG_PATH}"))
            .await
            .change_context_lazy(|| DeployError::step(node, "inspect kubelet"))?;
        if joined {
            info!(node = %node.address, "Node already joined");
            return Ok(());
        }
        let command = join.command(node.is_master())?;
        run_step(&shell, node, "kubeadm join", &command).await?;
        info!(node = %node.address, control_plane = node.is_master(), "Node joined");
        Ok(())
    }

    async fn deploy_cni(
        &self,
        master: &NodeConfig,
        cluster: &ClusterConfig,
    ) -> Result<(), Report<DeployError>> {
        let manifest = cni_manifest(&cluster.network.plugin).ok_or_else(|| {
            Report::new(DeployError::Unsupported {
                what: "CNI plugin".to_string(),
                value: cluster.network.plugin.clone(),
            })
        })?;
        let shell = open_shell(self.connector.as_ref(), master).await?;
        run_step(
            &shell,
            master,
            "deploy CNI",
            &format!(
                "kubectl --kubeconfig {ADMIN_KUBECONFIG_PATH} apply -f {}",
                quoted(master, &manifest)?
            ),
        )
        .await?;
        info!(plugin = %cluster.network.plugin, "CNI deployed");
        Ok(())
    }
}

/// Interval and deadline of the node readiness wait.
pub const READY_POLL: PollSettings =
    PollSettings::new(Duration::from_secs(5), Duration::from_secs(10 * 60));

/// Waits until every node at `addresses` reports Ready.
///
/// # Errors
///
/// - [`DeployError::NotReady`] if a node is still not Ready at the deadline
/// - [`DeployError::HostApi`] if the API rejects the node listing; only an
///   unreachable API server is retried
pub async fn wait_nodes_ready(
    api: &dyn ClusterApi,
    addresses: &[&str],
    poll: PollSettings,
) -> Result<(), Report<DeployError>> {
    poll_until(poll, || async {
        let nodes = match api.list_nodes().await {
            Ok(nodes) => nodes,
            Err(report) if report.current_context().is_connection_failed() => {
                return Ok(Attempt::Pending(report.to_string()));
            }
            Err(report) => return Err(report),
        };
        let pending: Vec<&str> = addresses
            .iter()
            .copied()
            .filter(|address| !nodes.iter().any(|n| n.matches(address) && n.ready))
            .collect();
        Ok(if pending.is_empty() {
            Attempt::Ready(())
        } else {
            Attempt::Pending(pending.join(","))
        })
    })
    .await
    .map_err(|report| {
        let context = match report.current_context() {
            PollError::TimedOut { .. } => DeployError::NotReady {
                nodes: addresses.join(","),
            },
            PollError::Aborted => DeployError::HostApi,
        };
        report.change_context(context)
    })
}

/// Join parameters minted on an existing master.
async fn fresh_join(
    shell: &NodeShell,
    master: &NodeConfig,
    control_plane: bool,
) -> Result<JoinCommand, Report<DeployError>> {
    let output = run_step(
        shell,
        master,
        "create join token",
        "kubeadm token create --print-join-command",
    )
    .await?;
    let mut join = JoinCommand::parse(&output)?;
    if control_plane {
        let output = run_step(
            shell,
            master,
            "upload certificates",
            "kubeadm init phase upload-certs --upload-certs",
        )
        .await?;
        let key = output
            .lines()
            .map(str::trim)
            .filter(|l| !l.is_empty())
            .last()
            .ok_or_else(|| {
                Report::new(DeployError::InvalidJoinCommand {
                    message: "upload-certs printed no certificate key".to_string(),
                })
            })?;
        join.certificate_key = Some(key.to_string());
    }
    Ok(join)
}

#[async_trait]
impl ClusterInstaller for KubeadmInstaller {
    #[instrument(skip_all, fields(cluster = %cluster.name))]
    async fn install(&self, cluster: &ClusterConfig) -> Result<(), Report<DeployError>> {
        let first = cluster
            .first_master()
            .ok_or_else(|| Report::new(DeployError::NoMaster))?;

        for node in &cluster.nodes {
            self.write_kubelet_args(node).await?;
        }

        let join = self.bootstrap(first, cluster).await?;
        for master in cluster.masters().skip(1) {
            self.join_node(master, &join).await?;
        }
        for worker in cluster.workers() {
            self.join_node(worker, &join).await?;
        }

        let api = self
            .host
            .host_api(cluster)
            .await
            .change_context(DeployError::HostApi)?;

        self.deploy_cni(first, cluster).await?;
        if cluster.has_storage_classes() {
            for object in storage_classes(&cluster.storage) {
                api.apply("", &object)
                    .await
                    .change_context(DeployError::HostApi)
                    .attach_printable_lazy(|| format!("StorageClass {}", object.name()))?;
            }
        }

        let addresses: Vec<&str> = cluster.nodes.iter().map(|n| n.address.as_str()).collect();
        wait_nodes_ready(api.as_ref(), &addresses, READY_POLL).await?;
        info!(nodes = addresses.len(), "Host cluster is Ready");
        Ok(())
    }

    #[instrument(skip_all, fields(node = %node.address))]
    async fn join(
        &self,
        node: &NodeConfig,
        cluster: &ClusterConfig,
    ) -> Result<(), Report<DeployError>> {
        let seed = cluster
            .masters()
            .find(|m| m.address != node.address)
            .ok_or_else(|| Report::new(DeployError::NoMaster))?;

        self.write_kubelet_args(node).await?;
        let seed_shell = open_shell(self.connector.as_ref(), seed).await?;
        let join = fresh_join(&seed_shell, seed, node.is_master()).await?;
        drop(seed_shell);
        self.join_node(node, &join).await?;

        let api = self
            .host
            .host_api(cluster)
            .await
            .change_context(DeployError::HostApi)?;
        wait_nodes_ready(api.as_ref(), &[node.address.as_str()], READY_POLL).await
    }
}
