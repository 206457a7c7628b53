//! etcd snapshots and configuration archives.

use std::io::BufWriter;
use std::io::Write;
use std::path::Path;
use std::path::PathBuf;
use std::time::Duration;

use chrono::Utc;
use error_stack::Report;
use error_stack::ResultExt;
use flate2::write::GzEncoder;
use flate2::Compression;
use tracing::info;
use tracing::instrument;
use tracing::warn;

use super::LifecycleManager;
use super::ReliabilityError;
use crate::deployer::wait_nodes_ready;
use crate::infrastructure::k8s::ClusterApi;
use crate::infrastructure::remote::NodeShell;
use crate::platform::ClusterConfig;
use crate::platform::NodeConfig;
use crate::platform::PlatformConfig;
use crate::util::poll::poll_until;
use crate::util::poll::Attempt;
use crate::util::poll::PollError;
use crate::util::poll::PollSettings;

const ETCD_PKI_DIR: &str = "/etc/kubernetes/pki/etcd";
const ETCD_DATA_DIR: &str = "/var/lib/etcd";
const ETCD_RESTORE_DIR: &str = "/var/lib/etcd-restore";
const MANIFESTS_DIR: &str = "/etc/kubernetes/manifests";
const PARKED_MANIFESTS_DIR: &str = "/etc/kubernetes/manifests.chasi-bod-restore";
const NODE_STAGING_DIR: &str = "/var/lib/chasi-bod/backup";
const REMOTE_SNAPSHOT: &str = "/var/lib/chasi-bod/backup/etcd-snapshot.db";
const SNAPSHOT_PREFIX: &str = "etcd-snapshot-";
const CONFIG_ARCHIVE_PREFIX: &str = "config-backup-";

/// kubeadm and kubelet files archived from every master.
const NODE_CONFIG_FILES: [&str; 4] = [
    "/etc/kubernetes/kubeadm-config.yaml",
    "/var/lib/kubelet/config.yaml",
    "/var/lib/kubelet/kubeadm-flags.env",
    "/etc/default/kubelet",
];

fn etcdctl(args: &str) -> String {
    format!(
        "ETCDCTL_API=3 etcdctl --endpoints=https://127.0.0.1:2379 \
         --cacert={ETCD_PKI_DIR}/ca.crt --cert={ETCD_PKI_DIR}/server.crt \
         --key={ETCD_PKI_DIR}/server.key {args}"
    )
}

fn timestamp() -> String {
    Utc::now().format("%Y%m%d-%H%M%S").to_string()
}

/// Static pod containers that must be gone before the data directory moves.
const CONTROL_PLANE_CONTAINERS: &str = "crictl ps --name 'etcd|kube-apiserver' -q";

/// How long parked static pods get to exit.
const CONTROL_PLANE_EXIT_POLL: PollSettings =
    PollSettings::new(Duration::from_secs(2), Duration::from_secs(2 * 60));

fn park_manifests_command() -> String {
    format!("mkdir -p {PARKED_MANIFESTS_DIR} && mv {MANIFESTS_DIR}/*.yaml {PARKED_MANIFESTS_DIR}/")
}

/// Commands run once the control plane containers have exited, in order.
fn restore_commands() -> Vec<(&'static str, String)> {
    vec![
        ("stop kubelet", "systemctl stop kubelet".to_string()),
        (
            "restore snapshot",
            format!(
                "rm -rf {ETCD_RESTORE_DIR} && ETCDCTL_API=3 etcdctl snapshot restore {REMOTE_SNAPSHOT} \
                 --data-dir {ETCD_RESTORE_DIR}"
            ),
        ),
        (
            "swap data directory",
            format!(
                "rm -rf {ETCD_DATA_DIR}.previous && mv {ETCD_DATA_DIR} {ETCD_DATA_DIR}.previous \
                 && mv {ETCD_RESTORE_DIR} {ETCD_DATA_DIR}"
            ),
        ),
        (
            "start control plane",
            format!("mv {PARKED_MANIFESTS_DIR}/*.yaml {MANIFESTS_DIR}/ && systemctl start kubelet"),
        ),
    ]
}

/// Waits until kubelet has torn down the parked etcd and kube-apiserver pods.
async fn await_control_plane_exit(
    shell: &NodeShell,
    poll: PollSettings,
) -> Result<(), Report<PollError>> {
    poll_until(poll, || async {
        shell.run(CONTROL_PLANE_CONTAINERS).await.map(|running| {
            let ids: Vec<&str> = running.split_whitespace().collect();
            if ids.is_empty() {
                Attempt::Ready(())
            } else {
                Attempt::Pending(format!("containers still running: {}", ids.join(",")))
            }
        })
    })
    .await
}

fn collect(failure: &mut Option<Report<ReliabilityError>>, report: Report<ReliabilityError>) {
    match failure {
        Some(existing) => existing.extend_one(report),
        None => *failure = Some(report),
    }
}

/// Most recent `etcd-snapshot-*.db` in `location`, by its timestamped name.
fn newest_snapshot(location: &Path) -> Result<PathBuf, Report<ReliabilityError>> {
    let not_found = || ReliabilityError::SnapshotNotFound {
        location: location.display().to_string(),
    };
    let pattern = location.join(format!("{SNAPSHOT_PREFIX}*.db"));
    glob::glob(&pattern.to_string_lossy())
        .change_context_lazy(not_found)?
        .filter_map(Result::ok)
        .max_by(|a, b| a.file_name().cmp(&b.file_name()))
        .ok_or_else(|| Report::new(not_found()))
}

fn write_archive(archive: &Path, config_file: &Path, staged: &Path) -> std::io::Result<()> {
    let file = std::fs::File::create(archive)?;
    let mut builder = tar::Builder::new(GzEncoder::new(BufWriter::new(file), Compression::default()));
    builder.append_path_with_name(config_file, "platform/config.yaml")?;
    builder.append_dir_all("nodes", staged)?;
    let encoder = builder.into_inner()?;
    encoder.finish()?.flush()
}

impl LifecycleManager {
    async fn ready_master<'a>(
        &self,
        api: &dyn ClusterApi,
        cluster: &'a ClusterConfig,
    ) -> Result<&'a NodeConfig, Report<ReliabilityError>> {
        let nodes = api
            .list_nodes()
            .await
            .change_context(ReliabilityError::HostApi)?;
        cluster
            .masters()
            .find(|m| nodes.iter().any(|n| n.matches(&m.address) && n.ready))
            .ok_or_else(|| Report::new(ReliabilityError::NoReadyMaster))
    }

    /// Snapshots etcd on the first Ready master and copies it to
    /// `<location>/etcd-snapshot-<stamp>.db`.
    async fn backup_etcd(
        &self,
        cluster: &ClusterConfig,
        location: &str,
        stamp: &str,
    ) -> Result<PathBuf, Report<ReliabilityError>> {
        if location.is_empty() {
            return Err(Report::new(ReliabilityError::MissingLocation { target: "etcd" }));
        }
        let api = self
            .orchestrator
            .host()
            .host_api(cluster)
            .await
            .change_context(ReliabilityError::HostApi)?;
        let master = self.ready_master(api.as_ref(), cluster).await?;
        info!(master = %master.address, "Taking etcd snapshot");

        let shell = NodeShell::open(self.orchestrator.connector().as_ref(), master)
            .await
            .change_context(ReliabilityError::EtcdBackup)?;
        shell
            .run(&format!(
                "mkdir -p {NODE_STAGING_DIR} && {}",
                etcdctl(&format!("snapshot save {REMOTE_SNAPSHOT}"))
            ))
            .await
            .change_context(ReliabilityError::EtcdBackup)?;
        let written = shell
            .probe(&format!("test -s {REMOTE_SNAPSHOT}"))
            .await
            .change_context(ReliabilityError::EtcdBackup)?;
        if !written {
            return Err(Report::new(ReliabilityError::EtcdBackup)
                .attach_printable(format!("{REMOTE_SNAPSHOT} is missing or empty")));
        }

        tokio::fs::create_dir_all(location)
            .await
            .change_context(ReliabilityError::EtcdBackup)?;
        let local = Path::new(location).join(format!("{SNAPSHOT_PREFIX}{stamp}.db"));
        shell
            .download(REMOTE_SNAPSHOT, &local)
            .await
            .change_context(ReliabilityError::EtcdBackup)?;
        if let Err(report) = shell.run(&format!("rm -f {REMOTE_SNAPSHOT}")).await {
            warn!(master = %master.address, "Snapshot left on node: {report:?}");
        }
        info!(path = %local.display(), "etcd snapshot saved");
        Ok(local)
    }

    /// Packs the local platform document and the masters' kubeadm/kubelet
    /// files into `<location>/config-backup-<stamp>.tar.gz`.
    async fn backup_config(
        &self,
        cluster: &ClusterConfig,
        config_file: &Path,
        location: &str,
        stamp: &str,
    ) -> Result<PathBuf, Report<ReliabilityError>> {
        if location.is_empty() {
            return Err(Report::new(ReliabilityError::MissingLocation { target: "config" }));
        }
        let staging = tempfile::tempdir().change_context(ReliabilityError::ConfigBackup)?;

        for master in cluster.masters() {
            let shell = NodeShell::open(self.orchestrator.connector().as_ref(), master)
                .await
                .change_context(ReliabilityError::ConfigBackup)?;
            for path in NODE_CONFIG_FILES {
                let present = shell
                    .probe(&format!("test -f {path}"))
                    .await
                    .change_context(ReliabilityError::ConfigBackup)?;
                if !present {
                    warn!(node = %master.address, path, "Not present, skipping");
                    continue;
                }
                let local = staging
                    .path()
                    .join(&master.address)
                    .join(path.trim_start_matches('/'));
                if let Some(parent) = local.parent() {
                    tokio::fs::create_dir_all(parent)
                        .await
                        .change_context(ReliabilityError::ConfigBackup)?;
                }
                shell
                    .download(path, &local)
                    .await
                    .change_context(ReliabilityError::ConfigBackup)?;
            }
        }

        tokio::fs::create_dir_all(location)
            .await
            .change_context(ReliabilityError::ConfigBackup)?;
        let archive = Path::new(location).join(format!("{CONFIG_ARCHIVE_PREFIX}{stamp}.tar.gz"));
        let target = archive.clone();
        let config_file = config_file.to_path_buf();
        tokio::task::spawn_blocking(move || write_archive(&target, &config_file, staging.path()))
            .await
            .change_context(ReliabilityError::ConfigBackup)?
            .change_context(ReliabilityError::ConfigBackup)?;
        info!(path = %archive.display(), "Configuration archive saved");
        Ok(archive)
    }

    /// Runs every enabled backup target and returns the files written.
    /// Both targets are attempted even when the first one fails.
    ///
    /// # Errors
    ///
    /// - [`ReliabilityError::BackupFailed`] naming the failed targets, with
    ///   each target's report attached
    #[instrument(skip_all, fields(platform = %config.metadata.name))]
    pub async fn backup(
        &self,
        config: &PlatformConfig,
        config_file: &Path,
    ) -> Result<Vec<PathBuf>, Report<ReliabilityError>> {
        let reliability = &config.dfx.reliability;
        let stamp = timestamp();
        let mut written = Vec::new();
        let mut failed = Vec::new();
        let mut failure = None;

        if reliability.etcd_backup.enabled {
            match self
                .backup_etcd(&config.cluster, &reliability.etcd_backup.location, &stamp)
                .await
            {
                Ok(path) => written.push(path),
                Err(report) => {
                    failed.push("etcd");
                    collect(&mut failure, report);
                }
            }
        } else {
            info!("etcd backup is disabled, skipping");
        }

        if reliability.config_backup.enabled {
            match self
                .backup_config(
                    &config.cluster,
                    config_file,
                    &reliability.config_backup.location,
                    &stamp,
                )
                .await
            {
                Ok(path) => written.push(path),
                Err(report) => {
                    failed.push("config");
                    collect(&mut failure, report);
                }
            }
        } else {
            info!("Configuration backup is disabled, skipping");
        }

        if let Some(report) = failure {
            return Err(report.change_context(ReliabilityError::BackupFailed {
                targets: failed.join(", "),
            }));
        }
        Ok(written)
    }

    /// Restores etcd on the first master from the newest snapshot in
    /// `location`, then waits for every master to report Ready. Returns the
    /// snapshot used.
    ///
    /// # Errors
    ///
    /// - [`ReliabilityError::LocationRequired`] if `location` is blank
    /// - [`ReliabilityError::SnapshotNotFound`] if it holds no snapshot
    /// - [`ReliabilityError::RestoreIncomplete`] naming the step that failed
    #[instrument(skip_all, fields(location = %location))]
    pub async fn restore(
        &self,
        config: &PlatformConfig,
        location: &str,
    ) -> Result<PathBuf, Report<ReliabilityError>> {
        if location.trim().is_empty() {
            return Err(Report::new(ReliabilityError::LocationRequired));
        }
        let snapshot = newest_snapshot(Path::new(location))?;
        let cluster = &config.cluster;
        let master = cluster
            .first_master()
            .ok_or_else(|| Report::new(ReliabilityError::NoMaster))?;
        info!(snapshot = %snapshot.display(), master = %master.address, "Restoring etcd");

        let step = |name: &str| {
            let name = name.to_string();
            move || ReliabilityError::RestoreIncomplete { step: name }
        };
        let shell = NodeShell::open(self.orchestrator.connector().as_ref(), master)
            .await
            .change_context_lazy(step("connect"))?;
        shell
            .run(&format!("mkdir -p {NODE_STAGING_DIR}"))
            .await
            .change_context_lazy(step("upload snapshot"))?;
        shell
            .upload(&snapshot, REMOTE_SNAPSHOT)
            .await
            .change_context_lazy(step("upload snapshot"))?;

        shell
            .run(&park_manifests_command())
            .await
            .change_context_lazy(step("park manifests"))?;
        await_control_plane_exit(&shell, CONTROL_PLANE_EXIT_POLL)
            .await
            .change_context_lazy(step("wait for control plane exit"))?;

        for (name, command) in restore_commands() {
            info!(step = name, "Restore step");
            shell
                .run(&command)
                .await
                .change_context_lazy(step(name))?;
        }

        let api = self
            .orchestrator
            .host()
            .host_api(cluster)
            .await
            .change_context_lazy(step("verify health"))?;
        let masters: Vec<&str> = cluster.masters().map(|m| m.address.as_str()).collect();
        wait_nodes_ready(api.as_ref(), &masters, self.ready_poll)
            .await
            .change_context_lazy(step("verify health"))?;

        info!("etcd restored and control plane healthy");
        Ok(snapshot)
    }
}
