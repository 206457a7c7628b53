//! Local tool invocation (packer, helm, kubectl).

use core::error::Error;
use std::process::Stdio;

use async_trait::async_trait;
use error_stack::Report;
use error_stack::ResultExt;
use tokio::process::Command;
use tracing::debug;

/// Errors raised while running a local program.
#[derive(Debug, derive_more::Display)]
pub enum CommandError {
    #[display("Failed to launch {program}")]
    Spawn { program: String },
    #[display("{program} exited with code {exit_code}")]
    Failed { program: String, exit_code: i32 },
}

impl Error for CommandError {}

/// Runs local programs to completion.
#[async_trait]
pub trait CommandRunner: Send + Sync {
    /// Runs `program` with `args` and returns its stdout.
    ///
    /// # Errors
    ///
    /// - [`CommandError::Spawn`] if the program cannot be started
    /// - [`CommandError::Failed`] if it exits non-zero; stderr is attached
    async fn run(&self, program: &str, args: &[String]) -> Result<String, Report<CommandError>>;
}

/// [`CommandRunner`] spawning real processes.
#[derive(Debug, Default, Clone)]
pub struct LocalRunner;

#[async_trait]
impl CommandRunner for LocalRunner {
    async fn run(&self, program: &str, args: &[String]) -> Result<String, Report<CommandError>> {
        debug!(program, ?args, "Running local command");
        let output = Command::new(program)
            .args(args)
            .stdin(Stdio::null())
            .kill_on_drop(true)
            .output()
            .await
            .change_context_lazy(|| CommandError::Spawn {
                program: program.to_string(),
            })?;

        if !output.status.success() {
            return Err(Report::new(CommandError::Failed {
                program: program.to_string(),
                exit_code: output.status.code().unwrap_or(-1),
            })
            .attach_printable(String::from_utf8_lossy(&output.stderr).trim().to_string()));
        }
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }
}
