use std::sync::Arc;

use anyhow::Result;
use error_stack::Report;

use super::CommandContext;
use super::IntoAnyhow;
use crate::application::ApplicationDeployer;
use crate::application::ApplicationError;
use crate::config::AppCommands;
use crate::infrastructure::process::LocalRunner;
use crate::vcluster::SecretClientResolver;

pub async fn run_app(ctx: &CommandContext, command: AppCommands) -> Result<()> {
    let config = ctx.load()?;
    let name = match &command {
        AppCommands::Deploy { name }
        | AppCommands::Upgrade { name }
        | AppCommands::Delete { name }
        | AppCommands::Status { name } => name.clone(),
    };
    let app = config
        .applications
        .get(&name)
        .ok_or_else(|| Report::new(ApplicationError::Unknown { name: name.clone() }))
        .into_anyhow()?;

    let host = ctx.host_api(&config).await?;
    let deployer = ApplicationDeployer::new(
        Arc::new(LocalRunner),
        Arc::new(SecretClientResolver::new(host)),
    );
    match command {
        AppCommands::Deploy { .. } => deployer.deploy(app).await.into_anyhow()?,
        AppCommands::Upgrade { .. } => deployer.upgrade(app).await.into_anyhow()?,
        AppCommands::Delete { .. } => deployer.delete(app).await.into_anyhow()?,
        AppCommands::Status { .. } => print!("{}", deployer.status(app).await.into_anyhow()?),
    }
    Ok(())
}
