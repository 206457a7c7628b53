//! Desired-state document of a chasi-bod platform.
//!
//! The document is YAML with camelCase keys. Everything here is plain data;
//! invariants are enforced by [`super::validator`].

use std::collections::BTreeMap;
use std::path::PathBuf;

use serde::Deserialize;
use serde::Serialize;

/// SSH port used when a node does not set one.
pub const DEFAULT_SSH_PORT: u16 = 22;
/// Port of the Kubernetes API server on master nodes.
pub const KUBE_API_SERVER_PORT: u16 = 6443;
/// Namespace prefix every vcluster lives under on the Host cluster.
pub const VCLUSTER_NAMESPACE_PREFIX: &str = "vcluster-";
/// Namespace applications land in when none is configured.
pub const DEFAULT_APPLICATION_NAMESPACE: &str = "default";

/// Host namespace that owns the vcluster named `name`.
pub fn vcluster_namespace(name: &str) -> String {
    format!("{VCLUSTER_NAMESPACE_PREFIX}{name}")
}

/// Root desired state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlatformConfig {
    #[serde(default)]
    pub api_version: String,
    #[serde(default)]
    pub kind: String,
    pub metadata: Metadata,
    pub cluster: ClusterConfig,
    #[serde(default)]
    pub vclusters: BTreeMap<String, VClusterConfig>,
    #[serde(default)]
    pub applications: BTreeMap<String, ApplicationConfig>,
    /// Global sysctl values baked into the platform image
    #[serde(default)]
    pub sysctl: BTreeMap<String, String>,
    pub output: OutputConfig,
    #[serde(default)]
    pub dfx: DfxConfig,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Metadata {
    pub name: String,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub labels: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub annotations: BTreeMap<String, String>,
}

/// Image format produced by the image builder.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, derive_more::Display)]
#[serde(rename_all = "lowercase")]
pub enum OutputFormat {
    #[display("iso")]
    Iso,
    #[display("qcow2")]
    Qcow2,
    #[display("ova")]
    Ova,
    #[display("vma")]
    Vma,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OutputConfig {
    pub format: OutputFormat,
    pub output_dir: PathBuf,
    pub image_name: String,
}

impl OutputConfig {
    /// Path of the image produced for this output configuration.
    pub fn image_path(&self) -> PathBuf {
        self.output_dir
            .join(format!("{}.{}", self.image_name, self.format))
    }
}

/// Host cluster desired state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClusterConfig {
    pub name: String,
    pub kubernetes_version: String,
    #[serde(default = "default_container_runtime")]
    pub container_runtime: String,
    pub network: NetworkConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    pub nodes: Vec<NodeConfig>,
    #[serde(rename = "baseOS")]
    pub base_os: BaseOsConfig,
}

fn default_container_runtime() -> String {
    "containerd".to_string()
}

impl ClusterConfig {
    /// Nodes carrying the master role, in declaration order.
    pub fn masters(&self) -> impl Iterator<Item = &NodeConfig> {
        self.nodes.iter().filter(|n| n.is_master())
    }

    /// Nodes without the master role, in declaration order.
    pub fn workers(&self) -> impl Iterator<Item = &NodeConfig> {
        self.nodes.iter().filter(|n| !n.is_master())
    }

    pub fn first_master(&self) -> Option<&NodeConfig> {
        self.masters().next()
    }

    pub fn node(&self, address: &str) -> Option<&NodeConfig> {
        self.nodes.iter().find(|n| n.address == address)
    }

    pub fn has_storage_classes(&self) -> bool {
        !self.storage.default_storage_class.is_empty() || !self.storage.storage_classes.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NetworkConfig {
    /// CNI plugin name (calico, flannel, cilium) or a manifest URL
    pub plugin: String,
    #[serde(rename = "podCIDR")]
    pub pod_cidr: String,
    #[serde(rename = "serviceCIDR")]
    pub service_cidr: String,
    #[serde(default, rename = "dnsServiceIP", skip_serializing_if = "String::is_empty")]
    pub dns_service_ip: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub interfaces: Vec<InterfaceConfig>,
    /// Ping every peer node before the network phase completes
    #[serde(default = "default_verify_reachability")]
    pub verify_reachability: bool,
}

fn default_verify_reachability() -> bool {
    true
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            plugin: String::new(),
            pod_cidr: String::new(),
            service_cidr: String::new(),
            dns_service_ip: String::new(),
            interfaces: Vec::new(),
            verify_reachability: default_verify_reachability(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InterfaceConfig {
    pub name: String,
    /// Addresses in CIDR notation
    #[serde(default)]
    pub ip_addrs: Vec<String>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub gateway: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StorageConfig {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub default_storage_class: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub storage_classes: Vec<StorageClassConfig>,
    #[serde(default, rename = "pvConfigs", skip_serializing_if = "Vec::is_empty")]
    pub pv_configs: Vec<PvConfig>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StorageClassConfig {
    pub name: String,
    pub provisioner: String,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub parameters: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PvConfig {
    pub name: String,
    pub capacity: String,
    #[serde(default)]
    pub access_modes: Vec<String>,
    #[serde(default)]
    pub persistent_volume_source: PvSource,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PvSource {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub host_path: Option<HostPathSource>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HostPathSource {
    pub path: String,
    #[serde(default, rename = "type", skip_serializing_if = "String::is_empty")]
    pub kind: String,
}

/// Role a node plays in the Host cluster.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize, derive_more::Display,
)]
#[serde(rename_all = "lowercase")]
pub enum NodeRole {
    #[display("master")]
    Master,
    #[display("worker")]
    Worker,
    #[display("edge")]
    Edge,
}

/// One target machine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeConfig {
    pub address: String,
    pub user: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub private_key: Option<PathBuf>,
    #[serde(default = "default_ssh_port")]
    pub port: u16,
    pub roles: Vec<NodeRole>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub labels: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub annotations: BTreeMap<String, String>,
    /// Taints in `key=value:Effect` form
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub taints: Vec<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub sysctl: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub disk_configs: Vec<DiskConfig>,
}

fn default_ssh_port() -> u16 {
    DEFAULT_SSH_PORT
}

impl NodeConfig {
    pub fn is_master(&self) -> bool {
        self.roles.contains(&NodeRole::Master)
    }

    /// Credentials to open a session with. `None` when the document sets
    /// neither or both, which validation rejects.
    pub fn credentials(&self) -> Option<NodeCredentials<'_>> {
        match (&self.password, &self.private_key) {
            (Some(password), None) => Some(NodeCredentials::Password(password)),
            (None, Some(key)) => Some(NodeCredentials::PrivateKey(key)),
            _ => None,
        }
    }
}

/// Authentication material for a node session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeCredentials<'a> {
    Password(&'a str),
    PrivateKey(&'a std::path::Path),
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DiskConfig {
    pub device: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub filesystem: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub mount_point: String,
    #[serde(default)]
    pub format: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BaseOsConfig {
    pub image: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub packages: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub kernel_args: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub files: Vec<FileConfig>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub commands: Vec<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub sysctl: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub ssh_authorized_keys: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub users: Vec<UserConfig>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileConfig {
    pub source: String,
    pub dest: String,
    /// Octal permission string such as `0644`
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub mode: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserConfig {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub uid: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gid: Option<u32>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub groups: Vec<String>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub shell: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub home_dir: String,
    #[serde(default)]
    pub sudo: bool,
}

/// One tenant virtual cluster.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VClusterConfig {
    pub name: String,
    pub namespace: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub template: String,
    pub kubernetes_version: String,
    #[serde(default, rename = "serviceCIDR", skip_serializing_if = "String::is_empty")]
    pub service_cidr: String,
    #[serde(default, rename = "podCIDR", skip_serializing_if = "String::is_empty")]
    pub pod_cidr: String,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub resource_requests: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub resource_limits: BTreeMap<String, String>,
    #[serde(default)]
    pub sync: SyncConfig,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub network: Option<NetworkConfig>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub storage: Option<StorageConfig>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncConfig {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub enabled_resources: Vec<String>,
    #[serde(default)]
    pub persistent_volume_claim_sync: PvcSyncConfig,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PvcSyncConfig {
    #[serde(default)]
    pub enabled: bool,
}

/// Workload profile of an application.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, derive_more::Display)]
#[serde(rename_all = "kebab-case")]
pub enum ApplicationType {
    #[display("compute-bound")]
    ComputeBound,
    #[display("io-bound")]
    IoBound,
    #[display("memory-bound")]
    MemoryBound,
    #[display("network-bound")]
    NetworkBound,
    #[default]
    #[display("general")]
    General,
}

/// Application as written in the document. Use
/// [`ApplicationConfig::manifest_source`] to get the single deploy source.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApplicationConfig {
    pub name: String,
    pub vcluster_name: String,
    #[serde(default = "default_application_namespace")]
    pub namespace: String,
    #[serde(default, rename = "type")]
    pub app_type: ApplicationType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub helm_chart: Option<HelmChartConfig>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kustomize: Option<KustomizeConfig>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub manifests: Vec<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub config_injection: BTreeMap<String, String>,
}

fn default_application_namespace() -> String {
    DEFAULT_APPLICATION_NAMESPACE.to_string()
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HelmChartConfig {
    pub chart: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub repo: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub version: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub values: Option<serde_yaml::Value>,
    pub release_name: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct KustomizeConfig {
    pub path: String,
}

/// The one source an application is deployed from.
#[derive(Debug, Clone, PartialEq)]
pub enum ManifestSource<'a> {
    Helm(&'a HelmChartConfig),
    Kustomize(&'a KustomizeConfig),
    Raw(&'a [String]),
}

/// Why an application does not resolve to a single manifest source.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ManifestSourceError {
    Missing,
    Ambiguous,
}

impl std::fmt::Display for ManifestSourceError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ManifestSourceError::Missing => {
                f.write_str("one of helmChart, kustomize, or manifests must be specified")
            }
            ManifestSourceError::Ambiguous => {
                f.write_str("only one of helmChart, kustomize, or manifests can be specified")
            }
        }
    }
}

impl ApplicationConfig {
    /// Resolves the document's optional source fields into one variant.
    pub fn manifest_source(&self) -> Result<ManifestSource<'_>, ManifestSourceError> {
        let mut sources = Vec::with_capacity(1);
        if let Some(helm) = &self.helm_chart {
            sources.push(ManifestSource::Helm(helm));
        }
        if let Some(kustomize) = &self.kustomize {
            sources.push(ManifestSource::Kustomize(kustomize));
        }
        if !self.manifests.is_empty() {
            sources.push(ManifestSource::Raw(&self.manifests));
        }

        match sources.len() {
            0 => Err(ManifestSourceError::Missing),
            1 => Ok(sources.remove(0)),
            _ => Err(ManifestSourceError::Ambiguous),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DfxConfig {
    #[serde(default)]
    pub logging: AgentConfig,
    #[serde(default)]
    pub metrics: MetricsConfig,
    #[serde(default)]
    pub tracing: TracingConfig,
    #[serde(default)]
    pub healthz: HealthzConfig,
    #[serde(default)]
    pub reliability: ReliabilityConfig,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub agent: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<AgentOutput>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentOutput {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub endpoint: String,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub options: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MetricsConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub agent: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub scrape_configs: Vec<serde_yaml::Value>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TracingConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub agent: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub endpoint: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthzConfig {
    #[serde(default)]
    pub enabled: bool,
    /// Duration such as `30s`
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub interval: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub timeout: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReliabilityConfig {
    #[serde(default)]
    pub config_backup: BackupTarget,
    #[serde(default)]
    pub etcd_backup: BackupTarget,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BackupTarget {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub schedule: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub location: String,
}


#[cfg(test)]
mod tests {
    use similar_asserts::assert_eq;

    use super::*;

    const DOCUMENT: &str = r#"
apiVersion: chasi-bod.io/v1
kind: Platform
metadata:
  name: demo
cluster:
  name: host
  kubernetesVersion: v1.28.4
  network:
    plugin: calico
    podCIDR: 10.244.0.0/16
    serviceCIDR: 10.96.0.0/12
  nodes:
    - address: 192.168.1.10
      user: root
      privateKey: /root/.ssh/id_rsa
      roles: [master]
      diskConfigs:
        - device: /dev/sdb
          filesystem: ext4
          mountPoint: /data
          format: true
  baseOS:
    image: ubuntu-22.04
vclusters:
  biz-a:
    name: biz-a
    namespace: vcluster-biz-a
    kubernetesVersion: v1.28.4
applications:
  web:
    name: web
    vclusterName: biz-a
    type: io-bound
    helmChart:
      chart: nginx
      repo: https://charts.bitnami.com/bitnami
      releaseName: web
output:
  format: qcow2
  outputDir: /tmp/out
  imageName: demo
"#;

    #[test]
    fn document_parses_with_defaults() {
        let config: PlatformConfig = serde_yaml::from_str(DOCUMENT).expect("should parse");

        let node = &config.cluster.nodes[0];
        assert_eq!(node.port, DEFAULT_SSH_PORT);
        assert_eq!(node.roles, vec![NodeRole::Master]);
        assert!(node.disk_configs[0].format);
        assert_eq!(config.cluster.container_runtime, "containerd");
        assert!(config.cluster.network.verify_reachability);

        let app = &config.applications["web"];
        assert_eq!(app.namespace, DEFAULT_APPLICATION_NAMESPACE);
        assert_eq!(app.app_type, ApplicationType::IoBound);
        assert!(matches!(app.manifest_source(), Ok(ManifestSource::Helm(_))));
        assert_eq!(
            config.output.image_path(),
            PathBuf::from("/tmp/out/demo.qcow2")
        );
    }

    #[test]
    fn manifest_source_rejects_two_sources() {
        let app = ApplicationConfig {
            helm_chart: Some(HelmChartConfig::default()),
            manifests: vec!["deploy.yaml".to_string()],
            ..Default::default()
        };

        assert_eq!(app.manifest_source(), Err(ManifestSourceError::Ambiguous));
    }

    #[test]
    fn manifest_source_requires_one_source() {
        let app = ApplicationConfig::default();

        assert_eq!(app.manifest_source(), Err(ManifestSourceError::Missing));
    }

    #[test]
    fn credentials_require_exactly_one_secret() {
        let mut node = fixtures::node("10.0.0.1", &[NodeRole::Worker]);
        assert!(matches!(
            node.credentials(),
            Some(NodeCredentials::PrivateKey(_))
        ));

        node.password = Some("secret".to_string());
        assert_eq!(node.credentials(), None);

        node.private_key = None;
        assert_eq!(node.credentials(), Some(NodeCredentials::Password("secret")));
    }
}
