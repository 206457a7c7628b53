use std::path::Path;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context as _;
use anyhow::Result;
use tracing::info;

use super::IntoAnyhow;
use crate::config::GlobalArgs;
use crate::deployer::Orchestrator;
use crate::infrastructure::k8s::AdminKubeconfigAccess;
use crate::infrastructure::k8s::ClusterApi;
use crate::infrastructure::k8s::HostAccess;
use crate::infrastructure::k8s::KubeconfigFileAccess;
use crate::infrastructure::process::LocalRunner;
use crate::infrastructure::remote::NodeConnector;
use crate::infrastructure::remote::SshConnector;
use crate::lifecycle::LifecycleManager;
use crate::lifecycle::PackerImageBuilder;
use crate::platform::current_config_path;
use crate::platform::load_config;
use crate::platform::save_config;
use crate::platform::state_path;
use crate::platform::validate_config;
use crate::platform::PlatformConfig;
use crate::state::StateStore;
use crate::vcluster::SecretClientResolver;
use crate::vcluster::VClusterManager;

/// Wires the production adapters from the global flags.
pub struct CommandContext {
    global: GlobalArgs,
    connector: Arc<dyn NodeConnector>,
    state: Arc<StateStore>,
}

impl CommandContext {
    pub fn new(global: GlobalArgs) -> Self {
        let state = Arc::new(StateStore::open(state_path(&global.config)));
        Self {
            global,
            connector: Arc::new(SshConnector::default()),
            state,
        }
    }

    pub fn config_path(&self) -> &Path {
        &self.global.config
    }

    /// Loads and validates the platform document.
    pub fn load(&self) -> Result<PlatformConfig> {
        load_validated(&self.global.config)
    }

    /// Loads the document describing the running platform, by default the
    /// last applied one.
    pub fn load_current(&self, path: Option<&Path>) -> Result<PlatformConfig> {
        let path = path
            .map(Path::to_path_buf)
            .unwrap_or_else(|| current_config_path(&self.global.config));
        load_config(&path)
            .into_anyhow()
            .with_context(|| format!("cannot load running platform from {}", path.display()))
    }

    /// Records `config` as the last applied document.
    pub fn save_current(&self, config: &PlatformConfig) -> Result<PathBuf> {
        let path = current_config_path(&self.global.config);
        save_config(config, &path).into_anyhow()?;
        info!(path = %path.display(), "Saved applied configuration");
        Ok(path)
    }

    pub fn host_access(&self) -> Arc<dyn HostAccess> {
        match &self.global.kubeconfig {
            Some(path) => Arc::new(KubeconfigFileAccess::new(Some(path.clone()))),
            None => Arc::new(AdminKubeconfigAccess::new(self.connector.clone())),
        }
    }

    pub async fn host_api(&self, config: &PlatformConfig) -> Result<Arc<dyn ClusterApi>> {
        self.host_access()
            .host_api(&config.cluster)
            .await
            .into_anyhow()
            .context("cannot connect to the Host cluster")
    }

    pub fn orchestrator(&self) -> Orchestrator {
        Orchestrator::new(
            self.connector.clone(),
            self.host_access(),
            self.state.clone(),
        )
    }

    pub fn lifecycle(&self, template: &Path) -> LifecycleManager {
        let images = PackerImageBuilder::new(Arc::new(LocalRunner), template);
        LifecycleManager::new(Arc::new(self.orchestrator()), Arc::new(images))
    }

    pub async fn vclusters(&self, config: &PlatformConfig) -> Result<VClusterManager> {
        let host = self.host_api(config).await?;
        let resolver = Arc::new(SecretClientResolver::new(host.clone()));
        Ok(VClusterManager::new(host, resolver).with_state(self.state.clone()))
    }
}

fn load_validated(path: &Path) -> Result<PlatformConfig> {
    let config = load_config(path).into_anyhow()?;
    validate_config(&config).into_anyhow()?;
    Ok(config)
}
