use std::path::Path;

use error_stack::Report;

use super::CommandOutput;
use super::NodeConnector;
use super::RemoteError;
use super::RemoteSession;
use crate::platform::NodeConfig;

/// Command helper over a [`RemoteSession`].
///
/// Adds privilege escalation for non-root users, turns non-zero exits into
/// errors and quotes arguments with `shlex`.
pub struct NodeShell {
    session: Box<dyn RemoteSession>,
    needs_sudo: bool,
}

impl NodeShell {
    /// Opens a session to `node` through `connector`.
    ///
    /// # Errors
    ///
    /// - [`RemoteError::ConnectionFailed`] if the node cannot be reached
    pub async fn open(
        connector: &dyn NodeConnector,
        node: &NodeConfig,
    ) -> Result<Self, Report<RemoteError>> {
        let session = connector.connect(node).await?;
        Ok(Self {
            session,
            needs_sudo: node.user != "root",
        })
    }

    pub fn address(&self) -> &str {
        self.session.address()
    }

    /// Runs `command` as root, returning its stdout.
    ///
    /// # Errors
    ///
    /// - [`RemoteError::CommandFailed`] if the command exits non-zero
    /// - [`RemoteError::ConnectionFailed`] if the transport fails
    pub async fn run(&self, command: &str) -> Result<String, Report<RemoteError>> {
        let output = self.exec(command).await?;
        if !output.success() {
            return Err(Report::new(RemoteError::CommandFailed {
                address: self.address().to_string(),
                command: command.to_string(),
                exit_code: output.exit_code,
            })
            .attach_printable(output.stderr.trim().to_string()));
        }
        Ok(output.stdout)
    }

    /// Runs `command` as root and reports whether it exited zero.
    pub async fn probe(&self, command: &str) -> Result<bool, Report<RemoteError>> {
        Ok(self.exec(command).await?.success())
    }

    /// Runs `command` as root and returns the raw output.
    pub async fn exec(&self, command: &str) -> Result<CommandOutput, Report<RemoteError>> {
        let command = if self.needs_sudo {
            format!("sudo -n sh -c {}", quote(command)?)
        } else {
            command.to_string()
        };
        self.session.run_command(&command).await
    }

    /// Writes `content` to `path` as root with the given octal `mode`.
    pub async fn write_file(
        &self,
        path: &str,
        content: &str,
        mode: &str,
    ) -> Result<(), Report<RemoteError>> {
        let path_q = quote(path)?;
        let parent = Path::new(path)
            .parent()
            .map(|p| p.display().to_string())
            .unwrap_or_else(|| "/".to_string());
        self.run(&format!(
            "mkdir -p {} && printf '%s' {} > {path_q} && chmod {} {path_q}",
            quote(&parent)?,
            quote(content)?,
            quote(mode)?,
        ))
        .await
        .map(|_| ())
    }

    pub async fn upload(&self, local: &Path, remote: &str) -> Result<(), Report<RemoteError>> {
        self.session.copy_to_remote(local, remote).await
    }

    pub async fn download(&self, remote: &str, local: &Path) -> Result<(), Report<RemoteError>> {
        self.session.copy_from_remote(remote, local).await
    }
}

/// Quotes one shell word.
///
/// # Errors
///
/// - [`RemoteError::InvalidCommand`] if the word contains a NUL byte
pub fn quote(word: &str) -> Result<String, Report<RemoteError>> {
    shlex::try_quote(word)
        .map(|q| q.into_owned())
        .map_err(|e| {
            Report::new(RemoteError::InvalidCommand {
                message: format!("cannot quote '{word}': {e}"),
            })
        })
}

#[cfg(test)]
mod tests {
    use similar_asserts::assert_eq;
    use test_log::test;

    use super::*;
    use crate::infrastructure::remote::mock::MockConnector;
    use crate::platform::model::fixtures;
    use crate::platform::NodeRole;

    #[test(tokio::test)]
    async fn non_root_commands_are_wrapped_in_sudo() {
        let connector = MockConnector::new();
        let node = fixtures::node("10.0.0.1", &[NodeRole::Master]);
        let shell = NodeShell::open(&connector, &node)
            .await
            .expect("should connect");

        shell.run("systemctl restart kubelet").await.expect("should run");

        assert_eq!(
            connector.commands_for("10.0.0.1"),
            vec!["sudo -n sh -c 'systemctl restart kubelet'"]
        );
    }

    #[test(tokio::test)]
    async fn root_commands_run_verbatim() {
        let connector = MockConnector::new();
        let mut node = fixtures::node("10.0.0.1", &[NodeRole::Master]);
        node.user = "root".to_string();
        let shell = NodeShell::open(&connector, &node)
            .await
            .expect("should connect");

        shell.run("uname -r").await.expect("should run");

        assert_eq!(connector.commands_for("10.0.0.1"), vec!["uname -r"]);
    }

    #[test(tokio::test)]
    async fn non_zero_exit_is_command_failed() {
        let connector = MockConnector::new();
        connector.respond("false", 1, "", "boom");
        let node = fixtures::node("10.0.0.1", &[NodeRole::Worker]);
        let shell = NodeShell::open(&connector, &node)
            .await
            .expect("should connect");

        let err = shell.run("false").await.expect_err("should fail");

        assert!(matches!(
            err.current_context(),
            RemoteError::CommandFailed { exit_code: 1, .. }
        ));
        assert!(!shell.probe("false").await.expect("should probe"));
    }

    #[test]
    fn quote_rejects_nul() {
        assert!(quote("a\0b").is_err());
        assert_eq!(quote("a b").expect("should quote"), "'a b'");
    }
}
