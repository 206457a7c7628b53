//! Test adapters for the remote executor.

use std::collections::BTreeMap;
use std::collections::BTreeSet;
use std::path::Path;
use std::sync::Arc;
use std::sync::Mutex;

use async_trait::async_trait;
use error_stack::Report;

use super::CommandOutput;
use super::NodeConnector;
use super::RemoteError;
use super::RemoteSession;
use crate::platform::NodeConfig;

#[derive(Clone)]
struct Rule {
    pattern: String,
    address: Option<String>,
    output: CommandOutput,
}

#[derive(Default)]
struct State {
    log: Vec<(String, String)>,
    rules: Vec<Rule>,
    unreachable: BTreeSet<String>,
    remote_files: BTreeMap<String, Vec<u8>>,
}

/// Records every command per node and answers from scripted rules.
/// Unmatched commands succeed with empty output.
#[derive(Clone, Default)]
pub struct MockConnector {
    state: Arc<Mutex<State>>,
}

impl MockConnector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Answers commands containing `pattern` on any node. Later rules win.
    pub fn respond(&self, pattern: &str, exit_code: i32, stdout: &str, stderr: &str) {
        self.push_rule(pattern, None, exit_code, stdout, stderr);
    }

    /// Answers commands containing `pattern` on `address` only.
    pub fn respond_on(&self, address: &str, pattern: &str, exit_code: i32, stdout: &str) {
        self.push_rule(pattern, Some(address), exit_code, stdout, "");
    }

    fn push_rule(
        &self,
        pattern: &str,
        address: Option<&str>,
        exit_code: i32,
        stdout: &str,
        stderr: &str,
    ) {
        self.state.lock().unwrap().rules.push(Rule {
            pattern: pattern.to_string(),
            address: address.map(str::to_string),
            output: CommandOutput {
                stdout: stdout.to_string(),
                stderr: stderr.to_string(),
                exit_code,
            },
        });
    }

    pub fn set_unreachable(&self, address: &str) {
        self.state
            .lock()
            .unwrap()
            .unreachable
            .insert(address.to_string());
    }

    /// Content served by `copy_from_remote` for `path`.
    pub fn set_remote_file(&self, path: &str, content: &[u8]) {
        self.state
            .lock()
            .unwrap()
            .remote_files
            .insert(path.to_string(), content.to_vec());
    }

    pub fn commands_for(&self, address: &str) -> Vec<String> {
        self.state
            .lock()
            .unwrap()
            .log
            .iter()
            .filter(|(a, _)| a == address)
            .map(|(_, c)| c.clone())
            .collect()
    }

    pub fn all_commands(&self) -> Vec<(String, String)> {
        self.state.lock().unwrap().log.clone()
    }

    /// Whether any command on `address` contained `needle`.
    pub fn ran_on(&self, address: &str, needle: &str) -> bool {
        self.commands_for(address).iter().any(|c| c.contains(needle))
    }
}

#[async_trait]
impl NodeConnector for MockConnector {
    async fn connect(
        &self,
        node: &NodeConfig,
    ) -> Result<Box<dyn RemoteSession>, Report<RemoteError>> {
        if self.state.lock().unwrap().unreachable.contains(&node.address) {
            return Err(Report::new(RemoteError::ConnectionFailed {
                address: node.address.clone(),
                message: "unreachable".to_string(),
            }));
        }
        Ok(Box::new(MockSession {
            address: node.address.clone(),
            state: self.state.clone(),
        }))
    }
}

struct MockSession {
    address: String,
    state: Arc<Mutex<State>>,
}

#[async_trait]
impl RemoteSession for MockSession {
    fn address(&self) -> &str {
        &self.address
    }

    async fn run_command(&self, command: &str) -> Result<CommandOutput, Report<RemoteError>> {
        let mut state = self.state.lock().unwrap();
        state.log.push((self.address.clone(), command.to_string()));
        let output = state
            .rules
            .iter()
            .rev()
            .find(|rule| {
                command.contains(&rule.pattern)
                    && rule.address.as_ref().map_or(true, |a| a == &self.address)
            })
            .map(|rule| rule.output.clone())
            .unwrap_or_default();
        Ok(output)
    }

    async fn copy_to_remote(&self, local: &Path, remote: &str) -> Result<(), Report<RemoteError>> {
        let mut state = self.state.lock().unwrap();
        state.log.push((
            self.address.clone(),
            format!("copy_to_remote {} {remote}", local.display()),
        ));
        Ok(())
    }

    async fn copy_from_remote(
        &self,
        remote: &str,
        local: &Path,
    ) -> Result<(), Report<RemoteError>> {
        let content = {
            let mut state = self.state.lock().unwrap();
            state.log.push((
                self.address.clone(),
                format!("copy_from_remote {remote} {}", local.display()),
            ));
            state.remote_files.get(remote).cloned()
        };
        let Some(content) = content else {
            return Err(Report::new(RemoteError::TransferFailed {
                address: self.address.clone(),
                from: remote.to_string(),
                to: local.display().to_string(),
            }));
        };
        std::fs::write(local, content).map_err(|e| {
            Report::new(e).change_context(RemoteError::TransferFailed {
                address: self.address.clone(),
                from: remote.to_string(),
                to: local.display().to_string(),
            })
        })
    }
}
