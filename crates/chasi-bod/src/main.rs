use anyhow::Result;
use chasi_bod::cmd;
use chasi_bod::cmd::CommandContext;
use chasi_bod::config::Cli;
use clap::Parser;
use tokio_util::sync::CancellationToken;
use utils::version;

/// Sets up global panic hooks.
fn setup_global_hooks() {
    let default_hook = std::panic::take_hook();
    std::panic::set_hook(Box::new(move |panic_info| {
        default_hook(panic_info);
        tracing::error!("Thread panicked: {}", panic_info);
    }));
}

#[tokio::main]
async fn main() -> Result<()> {
    setup_global_hooks();

    let cli = Cli::parse();
    let _guard = utils::logging::init(cli.global.log_dir.as_deref())?;

    tracing::info!("chasi-bod {}", &**version::VERSION);

    let shutdown = CancellationToken::new();
    let interrupt = shutdown.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::warn!("Interrupt received, stopping");
            interrupt.cancel();
        }
    });

    let ctx = CommandContext::new(cli.global);
    cmd::run(cli.command, &ctx, shutdown).await
}
