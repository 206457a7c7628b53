//! OpenSSH client backed sessions.
//!
//! Each session starts a ControlMaster process whose socket lives in a
//! private temp directory. Commands and copies multiplex over it, so a
//! password is only ever handed to the master. Dropping the session kills
//! the master and removes the socket directory.

use std::path::Path;
use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use error_stack::Report;
use error_stack::ResultExt;
use tempfile::TempDir;
use tokio::process::Child;
use tokio::process::Command;
use tracing::debug;
use tracing::instrument;

use super::CommandOutput;
use super::NodeConnector;
use super::RemoteError;
use super::RemoteSession;
use crate::platform::NodeConfig;
use crate::platform::NodeCredentials;

const SSHPASS_ENV: &str = "SSHPASS";
const MASTER_CHECK_INTERVAL: Duration = Duration::from_millis(250);

/// Opens sessions with the system `ssh`/`scp` binaries.
#[derive(Debug, Clone)]
pub struct SshConnector {
    connect_timeout: Duration,
}

impl Default for SshConnector {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(30),
        }
    }
}

impl SshConnector {
    pub fn new(connect_timeout: Duration) -> Self {
        Self { connect_timeout }
    }
}

#[async_trait]
impl NodeConnector for SshConnector {
    #[instrument(skip(self, node), fields(address = %node.address))]
    async fn connect(
        &self,
        node: &NodeConfig,
    ) -> Result<Box<dyn RemoteSession>, Report<RemoteError>> {
        let connection_failed = |message: &str| RemoteError::ConnectionFailed {
            address: node.address.clone(),
            message: message.to_string(),
        };

        let credentials = node
            .credentials()
            .ok_or_else(|| Report::new(connection_failed("node has no usable credentials")))?;
        let control_dir = tempfile::Builder::new()
            .prefix("chasi-bod-ssh-")
            .tempdir()
            .change_context_lazy(|| connection_failed("cannot create control socket directory"))?;
        let control_path = control_dir.path().join("ctl");

        let target = format!("{}@{}", node.user, node.address);
        let mut master = match credentials {
            NodeCredentials::Password(password) => {
                let mut cmd = Command::new("sshpass");
                cmd.arg("-e").arg("ssh").env(SSHPASS_ENV, password);
                cmd
            }
            NodeCredentials::PrivateKey(key) => {
                let mut cmd = Command::new("ssh");
                cmd.arg("-i").arg(key).args(["-o", "BatchMode=yes"]);
                cmd
            }
        };
        master
            .args(["-M", "-N"])
            .args(common_options(&control_path, self.connect_timeout))
            .args(["-o", "ControlPersist=no"])
            .arg("-p")
            .arg(node.port.to_string())
            .arg(&target)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let mut master = master
            .spawn()
            .change_context_lazy(|| connection_failed("cannot launch ssh client"))?;

        let deadline = tokio::time::Instant::now() + self.connect_timeout;
        loop {
            if let Some(status) = master
                .try_wait()
                .change_context_lazy(|| connection_failed("cannot poll ssh client"))?
            {
                let stderr = match master.stderr.take() {
                    Some(mut pipe) => {
                        let mut buf = String::new();
                        let _ = tokio::io::AsyncReadExt::read_to_string(&mut pipe, &mut buf).await;
                        buf
                    }
                    None => String::new(),
                };
                return Err(Report::new(connection_failed(&format!(
                    "ssh exited with {status}"
                )))
                .attach_printable(stderr.trim().to_string()));
            }

            let check = Command::new("ssh")
                .args(["-O", "check"])
                .args(common_options(&control_path, self.connect_timeout))
                .arg(&target)
                .stdin(Stdio::null())
                .stdout(Stdio::null())
                .stderr(Stdio::null())
                .status()
                .await
                .change_context_lazy(|| connection_failed("cannot query control socket"))?;
            if check.success() {
                break;
            }
            if tokio::time::Instant::now() >= deadline {
                return Err(Report::new(connection_failed(&format!(
                    "no connection after {:?}",
                    self.connect_timeout
                ))));
            }
            tokio::time::sleep(MASTER_CHECK_INTERVAL).await;
        }

        debug!("SSH session established");
        Ok(Box::new(SshSession {
            address: node.address.clone(),
            target,
            port: node.port,
            control_path,
            connect_timeout: self.connect_timeout,
            _master: master,
            _control_dir: control_dir,
        }))
    }
}

fn common_options(control_path: &Path, connect_timeout: Duration) -> Vec<String> {
    vec![
        "-o".to_string(),
        format!("ControlPath={}", control_path.display()),
        "-o".to_string(),
        "StrictHostKeyChecking=accept-new".to_string(),
        "-o".to_string(),
        format!("ConnectTimeout={}", connect_timeout.as_secs().max(1)),
        "-o".to_string(),
        "ServerAliveInterval=15".to_string(),
    ]
}

struct SshSession {
    address: String,
    target: String,
    port: u16,
    control_path: PathBuf,
    connect_timeout: Duration,
    _master: Child,
    _control_dir: TempDir,
}

impl SshSession {
    async fn scp(&self, from: &str, to: &str) -> Result<(), Report<RemoteError>> {
        let transfer_failed = || RemoteError::TransferFailed {
            address: self.address.clone(),
            from: from.to_string(),
            to: to.to_string(),
        };

        let output = Command::new("scp")
            .args(["-q", "-P"])
            .arg(self.port.to_string())
            .args(common_options(&self.control_path, self.connect_timeout))
            .arg(from)
            .arg(to)
            .stdin(Stdio::null())
            .kill_on_drop(true)
            .output()
            .await
            .change_context_lazy(transfer_failed)?;
        if !output.status.success() {
            return Err(Report::new(transfer_failed())
                .attach_printable(String::from_utf8_lossy(&output.stderr).trim().to_string()));
        }
        Ok(())
    }
}

#[async_trait]
impl RemoteSession for SshSession {
    fn address(&self) -> &str {
        &self.address
    }

    async fn run_command(&self, command: &str) -> Result<CommandOutput, Report<RemoteError>> {
        debug!(address = %self.address, command, "Running remote command");
        let output = Command::new("ssh")
            .args(common_options(&self.control_path, self.connect_timeout))
            .arg("-p")
            .arg(self.port.to_string())
            .arg(&self.target)
            .arg("--")
            .arg(command)
            .stdin(Stdio::null())
            .kill_on_drop(true)
            .output()
            .await
            .change_context_lazy(|| RemoteError::ConnectionFailed {
                address: self.address.clone(),
                message: "cannot launch ssh client".to_string(),
            })?;

        // 255 is reserved by ssh for its own failures
        let exit_code = output.status.code().unwrap_or(-1);
        if exit_code == 255 {
            return Err(Report::new(RemoteError::ConnectionFailed {
                address: self.address.clone(),
                message: "ssh transport failure".to_string(),
            })
            .attach_printable(String::from_utf8_lossy(&output.stderr).trim().to_string()));
        }

        Ok(CommandOutput {
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
            exit_code,
        })
    }

    async fn copy_to_remote(&self, local: &Path, remote: &str) -> Result<(), Report<RemoteError>> {
        self.scp(
            &local.display().to_string(),
            &format!("{}:{remote}", self.target),
        )
        .await
    }

    async fn copy_from_remote(
        &self,
        remote: &str,
        local: &Path,
    ) -> Result<(), Report<RemoteError>> {
        self.scp(
            &format!("{}:{remote}", self.target),
            &local.display().to_string(),
        )
        .await
    }
}

#[cfg(test)]
mod tests {
    use similar_asserts::assert_eq;
    use test_log::test;

    use super::*;

    #[test]
    fn common_options_point_at_control_socket() {
        let options = common_options(Path::new("/tmp/x/ctl"), Duration::from_millis(10));

        assert_eq!(options[1], "ControlPath=/tmp/x/ctl");
        assert_eq!(options[5], "ConnectTimeout=1");
    }

    #[test(tokio::test)]
    async fn connect_without_credentials_fails_before_spawning() {
        let mut node = crate::platform::model::fixtures::node(
            "10.0.0.1",
            &[crate::platform::NodeRole::Master],
        );
        node.private_key = None;

        let err = match SshConnector::default().connect(&node).await {
            Ok(_) => panic!("connect should fail"),
            Err(err) => err,
        };

        assert!(matches!(
            err.current_context(),
            RemoteError::ConnectionFailed { .. }
        ));
    }
}
