//! Day-2 operations on a running platform: image builds, rolling upgrades,
//! scaling, and etcd/config backup and restore.

mod backup;
mod image;
mod manager;

use core::error::Error;

pub use image::BuildError;
pub use image::ImageBuilder;
pub use image::PackerImageBuilder;
pub use image::DEFAULT_PACKER_TEMPLATE;
pub use manager::LifecycleManager;

/// Errors raised by upgrade and scale operations.
#[derive(Debug, derive_more::Display)]
pub enum LifecycleError {
    #[display("Failed to build the platform image")]
    ImageBuild,
    #[display("Invalid Kubernetes version '{version}'")]
    InvalidVersion { version: String },
    #[display("Kubernetes downgrade from {current} to {new} is not supported")]
    Downgrade { current: String, new: String },
    #[display(
        "Removal would leave {remaining} of {live} masters, quorum needs {required}"
    )]
    Quorum {
        live: usize,
        remaining: usize,
        required: usize,
    },
    #[display("Master {node} cannot be upgraded while masters {pending} are not Ready")]
    MastersNotReady { node: String, pending: String },
    #[display("Failed to upgrade node {node}")]
    UpgradeNode { node: String },
    #[display("Failed to add node {node}")]
    AddNode { node: String },
    #[display("Failed to remove node {node}")]
    RemoveNode { node: String },
    #[display("Host cluster API is unavailable")]
    HostApi,
}

impl Error for LifecycleError {}

/// Errors raised by backup and restore.
#[derive(Debug, derive_more::Display)]
pub enum ReliabilityError {
    #[display("No backup location configured for {target}")]
    MissingLocation { target: &'static str },
    #[display("No Ready master node available for etcd backup")]
    NoReadyMaster,
    #[display("Cluster has no master node")]
    NoMaster,
    #[display("etcd backup failed")]
    EtcdBackup,
    #[display("Configuration backup failed")]
    ConfigBackup,
    #[display("Backup failed for: {targets}")]
    BackupFailed { targets: String },
    #[display("A restore location must be specified")]
    LocationRequired,
    #[display("No etcd snapshot found in {location}")]
    SnapshotNotFound { location: String },
    #[display("Restore stopped at step '{step}'")]
    RestoreIncomplete { step: String },
    #[display("Host API is unavailable")]
    HostApi,
}

impl Error for ReliabilityError {}
