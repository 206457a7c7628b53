//! Remote command execution and file transfer on target nodes.

#[cfg(test)]
pub(crate) mod mock;
mod shell;
mod ssh;

use core::error::Error;
use std::path::Path;

use async_trait::async_trait;
use error_stack::Report;

pub use shell::quote;
pub use shell::NodeShell;
pub use ssh::SshConnector;

use crate::platform::NodeConfig;

/// Captured result of one remote command.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandOutput {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: i32,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }
}

/// Errors raised by the remote executor.
#[derive(Debug, derive_more::Display)]
pub enum RemoteError {
    #[display("Failed to connect to node {address}: {message}")]
    ConnectionFailed { address: String, message: String },
    #[display("Command on node {address} exited with code {exit_code}: {command}")]
    CommandFailed {
        address: String,
        command: String,
        exit_code: i32,
    },
    #[display("Failed to transfer {from} to {to} on node {address}")]
    TransferFailed {
        address: String,
        from: String,
        to: String,
    },
    #[display("Invalid remote command: {message}")]
    InvalidCommand { message: String },
}

impl Error for RemoteError {}

/// An open, authenticated channel to one node. Released on drop.
#[async_trait]
pub trait RemoteSession: Send + Sync {
    /// Address of the node this session is bound to
    fn address(&self) -> &str;

    /// Runs a shell command. A non-zero exit code is reported in the output,
    /// not as an error.
    async fn run_command(&self, command: &str) -> Result<CommandOutput, Report<RemoteError>>;

    /// Copies a local file to `remote` on the node
    async fn copy_to_remote(&self, local: &Path, remote: &str)
        -> Result<(), Report<RemoteError>>;

    /// Copies `remote` from the node to a local file
    async fn copy_from_remote(
        &self,
        remote: &str,
        local: &Path,
    ) -> Result<(), Report<RemoteError>>;
}

/// Opens sessions to nodes.
#[async_trait]
pub trait NodeConnector: Send + Sync {
    async fn connect(&self, node: &NodeConfig) -> Result<Box<dyn RemoteSession>, Report<RemoteError>>;
}
