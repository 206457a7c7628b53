use anyhow::Context;
use anyhow::Result;
use tracing::info;

use super::CommandContext;
use super::IntoAnyhow;
use crate::config::VClusterCommands;

pub async fn run_vcluster(ctx: &CommandContext, command: VClusterCommands) -> Result<()> {
    let config = ctx.load()?;
    let manager = ctx.vclusters(&config).await?;

    match command {
        VClusterCommands::Create { name } => {
            let vcluster = config.vclusters.get(&name).with_context(|| {
                format!("vcluster '{name}' is not defined in the platform document")
            })?;
            manager.create(vcluster).await.into_anyhow()?;
            println!("vcluster '{name}' created");
        }
        VClusterCommands::Delete { name } => {
            manager.delete(&name).await.into_anyhow()?;
            println!("vcluster '{name}' deleted");
        }
        VClusterCommands::List => {
            for name in manager.list().await.into_anyhow()? {
                println!("{name}");
            }
        }
        VClusterCommands::Connect { name, output } => {
            let kubeconfig = manager.kubeconfig(&name).await.into_anyhow()?;
            match output {
                Some(path) => {
                    tokio::fs::write(&path, kubeconfig)
                        .await
                        .with_context(|| format!("cannot write {}", path.display()))?;
                    info!(path = %path.display(), "Wrote vcluster kubeconfig");
                }
                None => print!("{kubeconfig}"),
            }
        }
    }
    Ok(())
}
