//! Structural and cross-reference validation of a platform document.
//!
//! Validation stops at the first problem and runs before any side effect.

use std::collections::BTreeSet;
use std::net::IpAddr;
use std::str::FromStr;

use error_stack::Report;
use ipnetwork::IpNetwork;

use super::model::*;
use super::ConfigError;

/// Container runtimes the runtime phase knows how to configure.
pub const SUPPORTED_RUNTIMES: &[&str] = &["containerd", "cri-o", "crio"];

const MAX_HOSTNAME_LEN: usize = 253;

fn invalid(message: impl Into<String>) -> Report<ConfigError> {
    Report::new(ConfigError::Validation {
        message: message.into(),
    })
}

/// Validates a whole platform document. Every section is checked and all
/// violations are reported together.
///
/// # Errors
///
/// - [`ConfigError::Validation`] for the first violated rule, with the
///   remaining violations attached as sibling reports
pub fn validate_config(config: &PlatformConfig) -> Result<(), Report<ConfigError>> {
    let mut results = Vec::new();
    if config.metadata.name.is_empty() {
        results.push(Err(invalid("metadata.name is required")));
    }
    results.push(validate_output(&config.output));
    results.push(validate_cluster(&config.cluster));

    for (key, vcluster) in &config.vclusters {
        results.push(
            validate_vcluster(key, vcluster)
                .map_err(|e| e.attach_printable(format!("vcluster '{key}'"))),
        );
    }
    for (key, app) in &config.applications {
        results.push(
            validate_application(key, app, config)
                .map_err(|e| e.attach_printable(format!("application '{key}'"))),
        );
    }
    for (key, value) in &config.sysctl {
        if key.is_empty() {
            results.push(Err(invalid(format!("sysctl key is empty (value '{value}')"))));
        }
    }

    results.push(validate_cidr_overlaps(config));
    results.push(validate_dfx(&config.dfx));

    let combined = results
        .into_iter()
        .filter_map(Result::err)
        .reduce(|mut acc, report| {
            acc.extend_one(report);
            acc
        });
    match combined {
        None => Ok(()),
        Some(report) => Err(report),
    }
}

fn validate_output(output: &OutputConfig) -> Result<(), Report<ConfigError>> {
    if output.output_dir.as_os_str().is_empty() {
        return Err(invalid("output.outputDir is required"));
    }
    if output.image_name.is_empty() {
        return Err(invalid("output.imageName is required"));
    }
    Ok(())
}

/// Parses `1.28.4` or `v1.28.4`.
pub fn parse_kubernetes_version(version: &str) -> Option<semver::Version> {
    semver::Version::parse(version.trim().trim_start_matches('v')).ok()
}

fn parse_cidr(field: &str, value: &str) -> Result<IpNetwork, Report<ConfigError>> {
    if !value.contains('/') {
        return Err(invalid(format!("{field} '{value}' is not in CIDR notation")));
    }
    IpNetwork::from_str(value)
        .map_err(|e| invalid(format!("{field} '{value}' is not a valid CIDR: {e}")))
}

fn validate_cluster(cluster: &ClusterConfig) -> Result<(), Report<ConfigError>> {
    if cluster.name.is_empty() {
        return Err(invalid("cluster.name is required"));
    }
    if cluster.kubernetes_version.is_empty() {
        return Err(invalid("cluster.kubernetesVersion is required"));
    }
    if parse_kubernetes_version(&cluster.kubernetes_version).is_none() {
        return Err(invalid(format!(
            "cluster.kubernetesVersion '{}' is not a semantic version",
            cluster.kubernetes_version
        )));
    }
    if !SUPPORTED_RUNTIMES.contains(&cluster.container_runtime.as_str()) {
        return Err(invalid(format!(
            "cluster.containerRuntime '{}' is not supported (expected one of {})",
            cluster.container_runtime,
            SUPPORTED_RUNTIMES.join(", ")
        )));
    }

    validate_network("cluster.network", &cluster.network)?;
    validate_storage("cluster.storage", &cluster.storage)?;

    if cluster.nodes.is_empty() {
        return Err(invalid("cluster.nodes must contain at least one node"));
    }
    let mut addresses = BTreeSet::new();
    for (i, node) in cluster.nodes.iter().enumerate() {
        validate_node(node).map_err(|e| e.attach_printable(format!("cluster.nodes[{i}]")))?;
        if !addresses.insert(node.address.as_str()) {
            return Err(invalid(format!(
                "cluster.nodes[{i}]: duplicate node address '{}'",
                node.address
            )));
        }
    }
    if cluster.first_master().is_none() {
        return Err(invalid("cluster must have at least one master node"));
    }

    validate_base_os(&cluster.base_os)
}

fn validate_network(field: &str, network: &NetworkConfig) -> Result<(), Report<ConfigError>> {
    if network.plugin.is_empty() {
        return Err(invalid(format!("{field}.plugin is required")));
    }
    parse_cidr(&format!("{field}.podCIDR"), &network.pod_cidr)?;
    parse_cidr(&format!("{field}.serviceCIDR"), &network.service_cidr)?;
    if !network.dns_service_ip.is_empty() && network.dns_service_ip.parse::<IpAddr>().is_err() {
        return Err(invalid(format!(
            "{field}.dnsServiceIP '{}' is not a valid IP address",
            network.dns_service_ip
        )));
    }
    for (i, iface) in network.interfaces.iter().enumerate() {
        if iface.name.is_empty() {
            return Err(invalid(format!("{field}.interfaces[{i}].name is required")));
        }
        for addr in &iface.ip_addrs {
            parse_cidr(&format!("{field}.interfaces[{i}].ipAddrs"), addr)?;
        }
        if !iface.gateway.is_empty() && iface.gateway.parse::<IpAddr>().is_err() {
            return Err(invalid(format!(
                "{field}.interfaces[{i}].gateway '{}' is not a valid IP address",
                iface.gateway
            )));
        }
    }
    Ok(())
}

fn validate_storage(field: &str, storage: &StorageConfig) -> Result<(), Report<ConfigError>> {
    for (i, class) in storage.storage_classes.iter().enumerate() {
        if class.name.is_empty() {
            return Err(invalid(format!("{field}.storageClasses[{i}].name is required")));
        }
        if class.provisioner.is_empty() {
            return Err(invalid(format!(
                "{field}.storageClasses[{i}].provisioner is required"
            )));
        }
    }
    for (i, pv) in storage.pv_configs.iter().enumerate() {
        if pv.name.is_empty() {
            return Err(invalid(format!("{field}.pvConfigs[{i}].name is required")));
        }
        if pv.capacity.is_empty() {
            return Err(invalid(format!("{field}.pvConfigs[{i}].capacity is required")));
        }
        if pv.access_modes.is_empty() {
            return Err(invalid(format!(
                "{field}.pvConfigs[{i}].accessModes must not be empty"
            )));
        }
    }
    Ok(())
}

fn validate_base_os(base_os: &BaseOsConfig) -> Result<(), Report<ConfigError>> {
    if base_os.image.is_empty() {
        return Err(invalid("cluster.baseOS.image is required"));
    }
    for (i, file) in base_os.files.iter().enumerate() {
        if file.source.is_empty() || file.dest.is_empty() {
            return Err(invalid(format!(
                "cluster.baseOS.files[{i}] requires both source and dest"
            )));
        }
        if !file.mode.is_empty() && u32::from_str_radix(&file.mode, 8).is_err() {
            return Err(invalid(format!(
                "cluster.baseOS.files[{i}].mode '{}' is not an octal permission",
                file.mode
            )));
        }
    }
    for (i, user) in base_os.users.iter().enumerate() {
        if user.name.is_empty() {
            return Err(invalid(format!("cluster.baseOS.users[{i}].name is required")));
        }
    }
    Ok(())
}

/// Whether `address` is an IP address or a syntactically valid hostname.
pub fn is_valid_address(address: &str) -> bool {
    address.parse::<IpAddr>().is_ok() || is_valid_hostname(address)
}

fn is_valid_hostname(hostname: &str) -> bool {
    if hostname.is_empty() || hostname.len() > MAX_HOSTNAME_LEN {
        return false;
    }
    if hostname.starts_with('-') || hostname.ends_with('-') {
        return false;
    }
    // all-numeric dotted strings that failed IP parsing are malformed IPs
    if hostname.chars().all(|c| c.is_ascii_digit() || c == '.') {
        return false;
    }
    hostname.split('.').all(|label| {
        !label.is_empty()
            && label.len() <= 63
            && !label.starts_with('-')
            && !label.ends_with('-')
            && label.chars().all(|c| c.is_ascii_alphanumeric() || c == '-')
    })
}

/// Validates one node entry.
///
/// # Errors
///
/// - [`ConfigError::Validation`] describing the first violated rule
pub fn validate_node(node: &NodeConfig) -> Result<(), Report<ConfigError>> {
    if node.address.is_empty() {
        return Err(invalid("node address is required"));
    }
    if !is_valid_address(&node.address) {
        return Err(invalid(format!(
            "node address '{}' is neither a valid IP nor a valid hostname",
            node.address
        )));
    }
    if node.user.is_empty() {
        return Err(invalid(format!("node '{}': user is required", node.address)));
    }
    match (&node.password, &node.private_key) {
        (Some(_), Some(_)) => {
            return Err(invalid(format!(
                "node '{}': password and privateKey are mutually exclusive",
                node.address
            )))
        }
        (None, None) => {
            return Err(invalid(format!(
                "node '{}': one of password or privateKey is required",
                node.address
            )))
        }
        (Some(password), None) if password.is_empty() => {
            return Err(invalid(format!(
                "node '{}': password must not be empty",
                node.address
            )))
        }
        (None, Some(key)) if key.as_os_str().is_empty() => {
            return Err(invalid(format!(
                "node '{}': privateKey must not be empty",
                node.address
            )))
        }
        _ => {}
    }
    if node.port == 0 {
        return Err(invalid(format!(
            "node '{}': port must be between 1 and 65535",
            node.address
        )));
    }
    if node.roles.is_empty() {
        return Err(invalid(format!(
            "node '{}': at least one role is required",
            node.address
        )));
    }
    for key in node.sysctl.keys() {
        if key.is_empty() {
            return Err(invalid(format!(
                "node '{}': sysctl key must not be empty",
                node.address
            )));
        }
    }
    for taint in &node.taints {
        if !taint.contains(':') {
            return Err(invalid(format!(
                "node '{}': taint '{taint}' must be in key=value:Effect form",
                node.address
            )));
        }
    }
    for (i, disk) in node.disk_configs.iter().enumerate() {
        if disk.device.is_empty() {
            return Err(invalid(format!(
                "node '{}': diskConfigs[{i}].device is required",
                node.address
            )));
        }
        if !disk.mount_point.is_empty() && disk.filesystem.is_empty() {
            return Err(invalid(format!(
                "node '{}': diskConfigs[{i}].filesystem is required when mountPoint is set",
                node.address
            )));
        }
        if disk.format && disk.filesystem.is_empty() {
            return Err(invalid(format!(
                "node '{}': diskConfigs[{i}].filesystem is required when format is set",
                node.address
            )));
        }
    }
    Ok(())
}

fn validate_vcluster(key: &str, vcluster: &VClusterConfig) -> Result<(), Report<ConfigError>> {
    if vcluster.name.is_empty() {
        return Err(invalid("vcluster name is required"));
    }
    if vcluster.name != key {
        return Err(invalid(format!(
            "vcluster name '{}' does not match its key '{key}'",
            vcluster.name
        )));
    }
    if !is_valid_hostname(&vcluster.name) || vcluster.name.contains('.') {
        return Err(invalid(format!(
            "vcluster name '{}' must be a DNS label",
            vcluster.name
        )));
    }
    let expected_namespace = vcluster_namespace(&vcluster.name);
    if vcluster.namespace != expected_namespace {
        return Err(invalid(format!(
            "vcluster namespace '{}' must be '{expected_namespace}'",
            vcluster.namespace
        )));
    }
    if vcluster.kubernetes_version.is_empty() {
        return Err(invalid("vcluster kubernetesVersion is required"));
    }
    if !vcluster.service_cidr.is_empty() {
        parse_cidr("vcluster serviceCIDR", &vcluster.service_cidr)?;
    }
    if !vcluster.pod_cidr.is_empty() {
        parse_cidr("vcluster podCIDR", &vcluster.pod_cidr)?;
    }
    if let Some(network) = &vcluster.network {
        validate_network("vcluster network", network)?;
    }
    if let Some(storage) = &vcluster.storage {
        validate_storage("vcluster storage", storage)?;
    }
    Ok(())
}

fn validate_application(
    key: &str,
    app: &ApplicationConfig,
    config: &PlatformConfig,
) -> Result<(), Report<ConfigError>> {
    if app.name.is_empty() {
        return Err(invalid("application name is required"));
    }
    if app.name != key {
        return Err(invalid(format!(
            "application name '{}' does not match its key '{key}'",
            app.name
        )));
    }
    if app.vcluster_name.is_empty() {
        return Err(invalid("application vclusterName is required"));
    }
    if !config.vclusters.contains_key(&app.vcluster_name) {
        return Err(invalid(format!(
            "application references unknown vcluster '{}'",
            app.vcluster_name
        )));
    }
    if app.namespace.is_empty() {
        return Err(invalid("application namespace must not be empty"));
    }

    match app.manifest_source().map_err(|e| invalid(e.to_string()))? {
        ManifestSource::Helm(helm) => {
            if helm.chart.is_empty() {
                return Err(invalid("helmChart.chart is required"));
            }
            if helm.release_name.is_empty() {
                return Err(invalid("helmChart.releaseName is required"));
            }
        }
        ManifestSource::Kustomize(kustomize) => {
            if kustomize.path.is_empty() {
                return Err(invalid("kustomize.path is required"));
            }
        }
        ManifestSource::Raw(manifests) => {
            if manifests.iter().any(String::is_empty) {
                return Err(invalid("manifest paths must not be empty"));
            }
        }
    }
    Ok(())
}

/// Rejects any pair of overlapping CIDRs across the Host cluster and all
/// vclusters.
fn validate_cidr_overlaps(config: &PlatformConfig) -> Result<(), Report<ConfigError>> {
    let mut ranges: Vec<(String, IpNetwork)> = vec![
        (
            "cluster podCIDR".to_string(),
            parse_cidr("cluster.network.podCIDR", &config.cluster.network.pod_cidr)?,
        ),
        (
            "cluster serviceCIDR".to_string(),
            parse_cidr(
                "cluster.network.serviceCIDR",
                &config.cluster.network.service_cidr,
            )?,
        ),
    ];
    for (name, vcluster) in &config.vclusters {
        if !vcluster.pod_cidr.is_empty() {
            ranges.push((
                format!("vcluster '{name}' podCIDR"),
                parse_cidr("vcluster podCIDR", &vcluster.pod_cidr)?,
            ));
        }
        if !vcluster.service_cidr.is_empty() {
            ranges.push((
                format!("vcluster '{name}' serviceCIDR"),
                parse_cidr("vcluster serviceCIDR", &vcluster.service_cidr)?,
            ));
        }
    }

    for (i, (left_name, left)) in ranges.iter().enumerate() {
        for (right_name, right) in &ranges[i + 1..] {
            if cidrs_overlap(left, right) {
                return Err(invalid(format!(
                    "{left_name} {left} overlaps {right_name} {right}"
                )));
            }
        }
    }
    Ok(())
}

fn cidrs_overlap(a: &IpNetwork, b: &IpNetwork) -> bool {
    a.contains(b.network()) || b.contains(a.network())
}

fn validate_dfx(dfx: &DfxConfig) -> Result<(), Report<ConfigError>> {
    if dfx.logging.enabled {
        if dfx.logging.agent.is_empty() {
            return Err(invalid("dfx.logging.agent is required when logging is enabled"));
        }
        if let Some(output) = &dfx.logging.output {
            if output.kind.is_empty() {
                return Err(invalid("dfx.logging.output.type is required"));
            }
        }
    }
    if dfx.metrics.enabled && dfx.metrics.agent.is_empty() {
        return Err(invalid("dfx.metrics.agent is required when metrics are enabled"));
    }
    if dfx.tracing.enabled {
        if dfx.tracing.agent.is_empty() {
            return Err(invalid("dfx.tracing.agent is required when tracing is enabled"));
        }
        if dfx.tracing.endpoint.is_empty() {
            return Err(invalid(
                "dfx.tracing.endpoint is required when tracing is enabled",
            ));
        }
    }
    if dfx.healthz.enabled {
        for (field, value) in [
            ("interval", &dfx.healthz.interval),
            ("timeout", &dfx.healthz.timeout),
        ] {
            if !value.is_empty() {
                humantime::parse_duration(value).map_err(|e| {
                    invalid(format!("dfx.healthz.{field} '{value}' is not a duration: {e}"))
                })?;
            }
        }
    }
    for (field, target) in [
        ("configBackup", &dfx.reliability.config_backup),
        ("etcdBackup", &dfx.reliability.etcd_backup),
    ] {
        if target.enabled && target.location.is_empty() {
            return Err(invalid(format!(
                "dfx.reliability.{field}.location is required when enabled"
            )));
        }
    }
    Ok(())
}
