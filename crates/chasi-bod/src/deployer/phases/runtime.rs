use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use error_stack::Report;
use error_stack::ResultExt;
use tracing::debug;
use tracing::info;
use tracing::instrument;

use super::open_shell;
use super::run_step;
use crate::deployer::DeployError;
use crate::deployer::NodePhase;
use crate::deployer::PhaseKind;
use crate::infrastructure::remote::NodeConnector;
use crate::infrastructure::remote::NodeShell;
use crate::platform::ClusterConfig;
use crate::platform::NodeConfig;

const HEALTH_ATTEMPTS: u32 = 12;
const HEALTH_INTERVAL: Duration = Duration::from_secs(5);

const CRIO_CGROUP_DROP_IN: &str = "[crio.runtime]\ncgroup_manager = \"systemd\"\n";

/// Container runtimes the runtime phase knows how to configure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContainerRuntime {
    Containerd,
    CriO,
}

impl ContainerRuntime {
    pub fn parse(name: &str) -> Option<Self> {
        match name {
            "containerd" => Some(ContainerRuntime::Containerd),
            "cri-o" | "crio" => Some(ContainerRuntime::CriO),
            _ => None,
        }
    }

    pub fn service(self) -> &'static str {
        match self {
            ContainerRuntime::Containerd => "containerd",
            ContainerRuntime::CriO => "crio",
        }
    }

    pub fn socket(self) -> &'static str {
        match self {
            ContainerRuntime::Containerd => "unix:///run/containerd/containerd.sock",
            ContainerRuntime::CriO => "unix:///var/run/crio/crio.sock",
        }
    }

    fn health_command(self) -> String {
        format!("crictl --runtime-endpoint {} info", self.socket())
    }
}

/// Writes the runtime configuration, starts the runtime service and waits
/// until it answers.
pub struct RuntimeConfigPhase {
    connector: Arc<dyn NodeConnector>,
    attempts: u32,
    interval: Duration,
}

impl RuntimeConfigPhase {
    pub fn new(connector: Arc<dyn NodeConnector>) -> Self {
        Self {
            connector,
            attempts: HEALTH_ATTEMPTS,
            interval: HEALTH_INTERVAL,
        }
    }

    async fn configure(
        &self,
        shell: &NodeShell,
        node: &NodeConfig,
        runtime: ContainerRuntime,
    ) -> Result<(), Report<DeployError>> {
        match runtime {
            ContainerRuntime::Containerd => {
                run_step(
                    shell,
                    node,
                    "write containerd config",
                    "mkdir -p /etc/containerd && \
                     (test -s /etc/containerd/config.toml || containerd config default > /etc/containerd/config.toml) && \
                     sed -i 's/SystemdCgroup = false/SystemdCgroup = true/' /etc/containerd/config.toml",
                )
                .await?;
            }
            ContainerRuntime::CriO => {
                shell
                    .write_file(
                        "/etc/crio/crio.conf.d/02-cgroup-manager.conf",
                        CRIO_CGROUP_DROP_IN,
                        "0644",
                    )
                    .await
                    .change_context_lazy(|| DeployError::step(node, "write cri-o config"))?;
            }
        }
        Ok(())
    }

    async fn wait_healthy(
        &self,
        shell: &NodeShell,
        node: &NodeConfig,
        runtime: ContainerRuntime,
    ) -> Result<(), Report<DeployError>> {
        let command = runtime.health_command();
        for attempt in 1..=self.attempts {
            let healthy = shell
                .probe(&command)
                .await
                .change_context_lazy(|| DeployError::step(node, "probe runtime"))?;
            if healthy {
                return Ok(());
            }
            debug!(attempt, "Container runtime not healthy yet");
            if attempt < self.attempts {
                tokio::time::sleep(self.interval).await;
            }
        }
        Err(Report::new(DeployError::Precondition {
            node: node.address.clone(),
            message: format!(
                "{} not healthy after {} attempts",
                runtime.service(),
                self.attempts
            ),
        }))
    }
}

#[async_trait]
impl NodePhase for RuntimeConfigPhase {
    fn kind(&self) -> PhaseKind {
        PhaseKind::RuntimeConfig
    }

    #[instrument(skip_all, fields(node = %node.address, runtime = %cluster.container_runtime))]
    async fn run(
        &self,
        node: &NodeConfig,
        cluster: &ClusterConfig,
    ) -> Result<(), Report<DeployError>> {
        let runtime = ContainerRuntime::parse(&cluster.container_runtime).ok_or_else(|| {
            Report::new(DeployError::Unsupported {
                what: "container runtime".to_string(),
                value: cluster.container_runtime.clone(),
            })
        })?;
        let shell = open_shell(self.connector.as_ref(), node).await?;

        self.configure(&shell, node, runtime).await?;
        run_step(&shell, node, "reload systemd", "systemctl daemon-reload").await?;
        run_step(
            &shell,
            node,
            "start runtime",
            &format!("systemctl enable --now {}", runtime.service()),
        )
        .await?;
        self.wait_healthy(&shell, node, runtime).await?;

        info!("Container runtime ready");
        Ok(())
    }
}
