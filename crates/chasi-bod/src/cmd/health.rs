use std::sync::Arc;

use anyhow::Context;
use anyhow::Result;
use tokio_util::sync::CancellationToken;
use tracing::warn;

use super::CommandContext;
use super::IntoAnyhow;
use crate::config::HealthzArgs;
use crate::health::run_cluster_checks;
use crate::health::HealthRegistry;
use crate::health::HealthServer;
use crate::health::HostApiChecker;
use crate::health::NodeReadinessChecker;
use crate::health::VClusterApiChecker;
use crate::vcluster::SecretClientResolver;
use crate::vcluster::TenantClientResolver;

pub async fn run_healthz(
    ctx: &CommandContext,
    args: HealthzArgs,
    shutdown: CancellationToken,
) -> Result<()> {
    let config = ctx.load()?;
    let host = ctx.host_api(&config).await?;
    let resolver: Arc<dyn TenantClientResolver> =
        Arc::new(SecretClientResolver::new(host.clone()));

    let registry = HealthRegistry::new();
    registry
        .register(Arc::new(HostApiChecker::new(host.clone())))
        .await;
    registry
        .register(Arc::new(NodeReadinessChecker::new(host.clone())))
        .await;
    for name in config.vclusters.keys() {
        registry
            .register(Arc::new(VClusterApiChecker::new(name, resolver.clone())))
            .await;
    }

    let overall = tokio::select! {
        overall = registry.overall_status() => overall,
        _ = shutdown.cancelled() => anyhow::bail!("Interrupted"),
    };
    println!(
        "{}",
        serde_json::to_string_pretty(&overall).context("cannot render health status")?
    );

    let checks = tokio::select! {
        checks = run_cluster_checks(host.as_ref(), resolver.as_ref(), &config) => {
            checks.into_anyhow()
        }
        _ = shutdown.cancelled() => anyhow::bail!("Interrupted"),
    };

    let Some(listen_addr) = args.serve else {
        return checks;
    };
    if let Err(e) = checks {
        warn!("Cluster checks failed: {e:?}");
    }
    HealthServer::new(listen_addr, registry)
        .run(shutdown)
        .await
        .into_anyhow()
}
