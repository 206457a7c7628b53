//! Command layer - entry points behind each CLI subcommand

pub mod app;
pub mod context;
pub mod health;
pub mod platform;
pub mod vcluster;

use std::future::Future;

use anyhow::Result;
use error_stack::Context;
use error_stack::Report;
use tokio_util::sync::CancellationToken;

pub use context::CommandContext;

use crate::config::Commands;

/// Converts an error-stack result into `anyhow`, keeping the full report.
pub(crate) trait IntoAnyhow<T> {
    fn into_anyhow(self) -> Result<T>;
}

impl<T, C: Context> IntoAnyhow<T> for core::result::Result<T, Report<C>> {
    fn into_anyhow(self) -> Result<T> {
        self.map_err(|report| anyhow::anyhow!("{report:?}"))
    }
}

async fn until_cancelled<F>(shutdown: &CancellationToken, command: F) -> Result<()>
where
    F: Future<Output = Result<()>>,
{
    tokio::select! {
        result = command => result,
        _ = shutdown.cancelled() => Err(anyhow::anyhow!("Interrupted")),
    }
}

/// Runs `command`. Every command except a serving `healthz` is aborted
/// when `shutdown` fires.
pub async fn run(command: Commands, ctx: &CommandContext, shutdown: CancellationToken) -> Result<()> {
    match command {
        Commands::Healthz(args) => health::run_healthz(ctx, args, shutdown).await,
        Commands::Build(args) => until_cancelled(&shutdown, platform::run_build(ctx, args)).await,
        Commands::Deploy => until_cancelled(&shutdown, platform::run_deploy(ctx)).await,
        Commands::Upgrade(args) => {
            until_cancelled(&shutdown, platform::run_upgrade(ctx, args)).await
        }
        Commands::Scale(args) => until_cancelled(&shutdown, platform::run_scale(ctx, args)).await,
        Commands::Backup => until_cancelled(&shutdown, platform::run_backup(ctx)).await,
        Commands::Restore(args) => {
            until_cancelled(&shutdown, platform::run_restore(ctx, args)).await
        }
        Commands::Vcluster(command) => {
            until_cancelled(&shutdown, vcluster::run_vcluster(ctx, command)).await
        }
        Commands::App(command) => until_cancelled(&shutdown, app::run_app(ctx, command)).await,
    }
}
