use std::path::Path;
use std::sync::Arc;

use anyhow::Result;
use tracing::info;

use super::CommandContext;
use super::IntoAnyhow;
use crate::config::BuildArgs;
use crate::config::RestoreArgs;
use crate::config::ScaleArgs;
use crate::config::UpgradeArgs;
use crate::infrastructure::process::LocalRunner;
use crate::lifecycle::ImageBuilder;
use crate::lifecycle::PackerImageBuilder;
use crate::lifecycle::DEFAULT_PACKER_TEMPLATE;
use crate::platform::topology::NodeDiff;

pub async fn run_build(ctx: &CommandContext, args: BuildArgs) -> Result<()> {
    let config = ctx.load()?;
    let builder = PackerImageBuilder::new(Arc::new(LocalRunner), args.template);
    let image = builder.build(&config).await.into_anyhow()?;
    println!("{}", image.display());
    Ok(())
}

pub async fn run_deploy(ctx: &CommandContext) -> Result<()> {
    let config = ctx.load()?;
    info!(platform = %config.metadata.name, "Deploying platform");
    ctx.orchestrator().deploy(&config).await.into_anyhow()?;
    ctx.save_current(&config)?;
    info!("Platform deployed");
    Ok(())
}

pub async fn run_upgrade(ctx: &CommandContext, args: UpgradeArgs) -> Result<()> {
    let current = ctx.load_current(args.current.as_deref())?;
    let new = ctx.load()?;
    ctx.lifecycle(&args.template)
        .upgrade(&current, &new)
        .await
        .into_anyhow()?;
    ctx.save_current(&new)?;
    info!("Platform upgraded");
    Ok(())
}

pub async fn run_scale(ctx: &CommandContext, args: ScaleArgs) -> Result<()> {
    let current = ctx.load_current(args.current.as_deref())?;
    let new = ctx.load()?;
    let diff = NodeDiff::between(&current.cluster, &new.cluster);
    if diff.added.is_empty() && diff.removed.is_empty() {
        info!("Host node set unchanged, nothing to scale");
        return Ok(());
    }
    info!(
        add = diff.added.len(),
        remove = diff.removed.len(),
        "Scaling Host cluster"
    );
    ctx.lifecycle(Path::new(DEFAULT_PACKER_TEMPLATE))
        .scale(&current, &diff.added, &diff.removed, !args.keep_os)
        .await
        .into_anyhow()?;
    ctx.save_current(&new)?;
    Ok(())
}

pub async fn run_backup(ctx: &CommandContext) -> Result<()> {
    let config = ctx.load()?;
    let written = ctx
        .lifecycle(Path::new(DEFAULT_PACKER_TEMPLATE))
        .backup(&config, ctx.config_path())
        .await
        .into_anyhow()?;
    for path in written {
        println!("{}", path.display());
    }
    Ok(())
}

pub async fn run_restore(ctx: &CommandContext, args: RestoreArgs) -> Result<()> {
    let config = ctx.load()?;
    let snapshot = ctx
        .lifecycle(Path::new(DEFAULT_PACKER_TEMPLATE))
        .restore(&config, &args.location)
        .await
        .into_anyhow()?;
    println!("Restored etcd from {}", snapshot.display());
    Ok(())
}
