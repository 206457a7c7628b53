use std::net::IpAddr;
use std::sync::Arc;

use async_trait::async_trait;
use error_stack::Report;
use error_stack::ResultExt;
use ipnetwork::IpNetwork;
use tracing::debug;
use tracing::info;
use tracing::instrument;
use tracing::warn;

use super::open_shell;
use super::quoted;
use super::run_step;
use crate::deployer::DeployError;
use crate::deployer::NodePhase;
use crate::deployer::PhaseKind;
use crate::infrastructure::remote::NodeConnector;
use crate::infrastructure::remote::NodeShell;
use crate::platform::ClusterConfig;
use crate::platform::InterfaceConfig;
use crate::platform::NodeConfig;

const CONTROL_PLANE_PORTS: [&str; 5] = ["6443", "2379-2380", "10250", "10257", "10259"];
const NODE_PORTS: [&str; 2] = ["10250", "30000-32767"];

/// Configures interfaces, opens firewall ports and checks name resolution
/// and peer reachability.
pub struct NetworkConfigPhase {
    connector: Arc<dyn NodeConnector>,
}

impl NetworkConfigPhase {
    pub fn new(connector: Arc<dyn NodeConnector>) -> Self {
        Self { connector }
    }
}

/// Ports a node must accept, as `port` or `first-last` ranges.
pub(crate) fn required_ports(node: &NodeConfig) -> Vec<String> {
    let mut ports = vec![node.port.to_string()];
    if node.is_master() {
        ports.extend(CONTROL_PLANE_PORTS.iter().map(|p| p.to_string()));
    }
    for port in NODE_PORTS {
        if !ports.iter().any(|p| p == port) {
            ports.push(port.to_string());
        }
    }
    ports
}

/// Addresses of `interface` that belong to `node`: the entries whose host
/// part is the node address.
pub(crate) fn node_addresses<'a>(interface: &'a InterfaceConfig, node: &NodeConfig) -> Vec<&'a str> {
    let Ok(address) = node.address.parse::<IpAddr>() else {
        return Vec::new();
    };
    interface
        .ip_addrs
        .iter()
        .filter(|cidr| {
            cidr.parse::<IpNetwork>()
                .is_ok_and(|network| network.ip() == address)
        })
        .map(String::as_str)
        .collect()
}

async fn configure_interface(
    shell: &NodeShell,
    node: &NodeConfig,
    interface: &InterfaceConfig,
) -> Result<(), Report<DeployError>> {
    let name = quoted(node, &interface.name)?;
    let exists = shell
        .probe(&format!("ip link show {name}"))
        .await
        .change_context_lazy(|| DeployError::step(node, "inspect interfaces"))?;
    if !exists {
        debug!(interface = %interface.name, "Interface not present on node");
        return Ok(());
    }

    let step = format!("configure interface {}", interface.name);
    for cidr in node_addresses(interface, node) {
        run_step(
            shell,
            node,
            &step,
            &format!("ip addr replace {} dev {name}", quoted(node, cidr)?),
        )
        .await?;
    }
    run_step(shell, node, &step, &format!("ip link set dev {name} up")).await?;
    if !interface.gateway.is_empty() {
        run_step(
            shell,
            node,
            &step,
            &format!(
                "ip route replace default via {} dev {name}",
                quoted(node, &interface.gateway)?
            ),
        )
        .await?;
    }
    Ok(())
}

async fn open_ports(shell: &NodeShell, node: &NodeConfig) -> Result<(), Report<DeployError>> {
    let ports = required_ports(node);
    let firewalld = shell
        .probe("command -v firewall-cmd && firewall-cmd --state")
        .await
        .change_context_lazy(|| DeployError::step(node, "detect firewall"))?;
    if firewalld {
        for port in &ports {
            run_step(
                shell,
                node,
                "open firewall ports",
                &format!("firewall-cmd --permanent --add-port={port}/tcp"),
            )
            .await?;
        }
        run_step(shell, node, "open firewall ports", "firewall-cmd --reload").await?;
        return Ok(());
    }

    let ufw = shell
        .probe("command -v ufw && ufw status | grep -q 'Status: active'")
        .await
        .change_context_lazy(|| DeployError::step(node, "detect firewall"))?;
    if ufw {
        for port in &ports {
            let port = port.replace('-', ":");
            run_step(
                shell,
                node,
                "open firewall ports",
                &format!("ufw allow {port}/tcp"),
            )
            .await?;
        }
        return Ok(());
    }

    warn!("No active firewall found, leaving ports as they are");
    Ok(())
}

#[async_trait]
impl NodePhase for NetworkConfigPhase {
    fn kind(&self) -> PhaseKind {
        PhaseKind::NetworkConfig
    }

    #[instrument(skip_all, fields(node = %node.address))]
    async fn run(
        &self,
        node: &NodeConfig,
        cluster: &ClusterConfig,
    ) -> Result<(), Report<DeployError>> {
        let shell = open_shell(self.connector.as_ref(), node).await?;

        for interface in &cluster.network.interfaces {
            configure_interface(&shell, node, interface).await?;
        }
        open_ports(&shell, node).await?;

        run_step(
            &shell,
            node,
            "verify DNS resolution",
            "test -s /etc/resolv.conf && getent hosts \"$(hostname)\"",
        )
        .await?;

        if cluster.network.verify_reachability {
            for peer in cluster.nodes.iter().filter(|n| n.address != node.address) {
                run_step(
                    &shell,
                    node,
                    &format!("reach peer {}", peer.address),
                    &format!("ping -c 1 -W 2 {}", quoted(node, &peer.address)?),
                )
                .await?;
            }
        } else {
            debug!("Peer reachability check disabled");
        }

        info!("Network configured");
        Ok(())
    }
}
