use std::collections::BTreeMap;
use std::path::Path;
use std::path::PathBuf;
use std::sync::Arc;

use error_stack::Report;
use error_stack::ResultExt;
use k8s_openapi::api::core::v1::ConfigMap;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use tempfile::TempDir;
use tracing::debug;
use tracing::info;
use tracing::instrument;

use super::commands;
use super::commands::Invocation;
use super::commands::Target;
use super::ApplicationError;
use crate::infrastructure::k8s::ClusterApi;
use crate::infrastructure::k8s::KubeObject;
use crate::infrastructure::k8s::MANAGED_BY_LABEL;
use crate::infrastructure::k8s::MANAGED_BY_VALUE;
use crate::infrastructure::process::CommandRunner;
use crate::platform::ApplicationConfig;
use crate::platform::ManifestSource;
use crate::vcluster::TenantClientResolver;

/// ConfigMap carrying the injected configuration of `app`.
pub fn injected_config_name(app: &str) -> String {
    format!("{app}-injected-config")
}

/// Scratch directory holding the tenant kubeconfig (and Helm values) for
/// one tool run. Removed on drop.
struct Workspace {
    dir: TempDir,
    kubeconfig: PathBuf,
}

impl Workspace {
    fn target<'a>(&'a self, app: &'a ApplicationConfig) -> Target<'a> {
        Target {
            kubeconfig: &self.kubeconfig,
            namespace: &app.namespace,
        }
    }
}

/// Deploys applications into their vcluster by driving `helm` or `kubectl`
/// with a temporary tenant kubeconfig.
pub struct ApplicationDeployer {
    runner: Arc<dyn CommandRunner>,
    resolver: Arc<dyn TenantClientResolver>,
}

impl ApplicationDeployer {
    pub fn new(runner: Arc<dyn CommandRunner>, resolver: Arc<dyn TenantClientResolver>) -> Self {
        Self { runner, resolver }
    }

    /// Installs the application and injects its configuration.
    ///
    /// # Errors
    ///
    /// - [`ApplicationError::InvalidSource`] if the application has no single manifest source
    /// - [`ApplicationError::TenantUnavailable`] if the vcluster cannot be reached
    /// - [`ApplicationError::Backend`] if `helm` or `kubectl` fails
    /// - [`ApplicationError::ConfigInjection`] if the ConfigMap cannot be applied
    #[instrument(skip_all, fields(app = %app.name, vcluster = %app.vcluster_name))]
    pub async fn deploy(&self, app: &ApplicationConfig) -> Result<(), Report<ApplicationError>> {
        self.rollout(app, "deploy").await
    }

    /// Upgrades the application in place. Helm releases are upgraded,
    /// Kustomize and raw manifests are re-applied.
    ///
    /// # Errors
    ///
    /// Same as [`ApplicationDeployer::deploy`].
    #[instrument(skip_all, fields(app = %app.name, vcluster = %app.vcluster_name))]
    pub async fn upgrade(&self, app: &ApplicationConfig) -> Result<(), Report<ApplicationError>> {
        self.rollout(app, "upgrade").await
    }

    /// Removes the application and its injected configuration.
    ///
    /// # Errors
    ///
    /// - [`ApplicationError::InvalidSource`] if the application has no single manifest source
    /// - [`ApplicationError::TenantUnavailable`] if no kubeconfig can be produced
    /// - [`ApplicationError::Backend`] if the tool fails
    #[instrument(skip_all, fields(app = %app.name, vcluster = %app.vcluster_name))]
    pub async fn delete(&self, app: &ApplicationConfig) -> Result<(), Report<ApplicationError>> {
        let source = manifest_source(app)?;
        let workspace = self.workspace(app).await?;
        let call = commands::remove(&source, workspace.target(app));
        self.invoke(&call, app, commands::backend(&source), "delete")
            .await?;

        if !app.config_injection.is_empty() {
            let call = Invocation {
                program: "kubectl",
                args: vec![
                    "--kubeconfig".to_string(),
                    workspace.kubeconfig.display().to_string(),
                    "delete".to_string(),
                    "--namespace".to_string(),
                    app.namespace.clone(),
                    "configmap".to_string(),
                    injected_config_name(&app.name),
                    "--ignore-not-found".to_string(),
                ],
            };
            self.runner
                .run(call.program, &call.args)
                .await
                .change_context_lazy(|| ApplicationError::ConfigInjection {
                    name: app.name.clone(),
                })?;
        }
        info!("Application deleted");
        Ok(())
    }

    /// Status report of the application as printed by the backend tool.
    ///
    /// # Errors
    ///
    /// Same as [`ApplicationDeployer::delete`].
    #[instrument(skip_all, fields(app = %app.name, vcluster = %app.vcluster_name))]
    pub async fn status(&self, app: &ApplicationConfig) -> Result<String, Report<ApplicationError>> {
        let source = manifest_source(app)?;
        let workspace = self.workspace(app).await?;
        let call = commands::status(&source, workspace.target(app));
        self.invoke(&call, app, commands::backend(&source), "query")
            .await
    }

    async fn rollout(
        &self,
        app: &ApplicationConfig,
        action: &'static str,
    ) -> Result<(), Report<ApplicationError>> {
        let source = manifest_source(app)?;
        let backend = commands::backend(&source);
        info!(backend, "Rolling out application");

        let tenant = self
            .resolver
            .resolve(&app.vcluster_name)
            .await
            .change_context_lazy(|| ApplicationError::TenantUnavailable {
                vcluster: app.vcluster_name.clone(),
            })?;
        ensure_namespace(tenant.as_ref(), app).await?;

        let workspace = self.workspace(app).await?;
        let values = match &source {
            ManifestSource::Helm(chart) => match &chart.values {
                Some(values) => Some(write_values(workspace.dir.path(), app, values).await?),
                None => None,
            },
            _ => None,
        };
        let call = commands::apply(&source, workspace.target(app), values.as_deref());
        self.invoke(&call, app, backend, action).await?;

        inject_config(tenant.as_ref(), app).await?;
        info!("Application {action} finished");
        Ok(())
    }

    async fn workspace(&self, app: &ApplicationConfig) -> Result<Workspace, Report<ApplicationError>> {
        let kubeconfig = self
            .resolver
            .kubeconfig(&app.vcluster_name)
            .await
            .change_context_lazy(|| ApplicationError::TenantUnavailable {
                vcluster: app.vcluster_name.clone(),
            })?;
        let workspace_error = || ApplicationError::Workspace {
            name: app.name.clone(),
        };
        let dir = tempfile::tempdir().change_context_lazy(workspace_error)?;
        let path = dir.path().join("kubeconfig");
        tokio::fs::write(&path, kubeconfig)
            .await
            .change_context_lazy(workspace_error)?;
        Ok(Workspace {
            dir,
            kubeconfig: path,
        })
    }

    async fn invoke(
        &self,
        call: &Invocation,
        app: &ApplicationConfig,
        backend: &'static str,
        action: &'static str,
    ) -> Result<String, Report<ApplicationError>> {
        debug!(program = call.program, "Invoking backend");
        self.runner
            .run(call.program, &call.args)
            .await
            .change_context_lazy(|| ApplicationError::Backend {
                name: app.name.clone(),
                backend,
                action,
            })
    }
}

fn manifest_source(app: &ApplicationConfig) -> Result<ManifestSource<'_>, Report<ApplicationError>> {
    app.manifest_source().map_err(|reason| {
        Report::new(ApplicationError::InvalidSource {
            name: app.name.clone(),
            reason: reason.to_string(),
        })
    })
}

async fn write_values(
    dir: &Path,
    app: &ApplicationConfig,
    values: &serde_yaml::Value,
) -> Result<PathBuf, Report<ApplicationError>> {
    let workspace_error = || ApplicationError::Workspace {
        name: app.name.clone(),
    };
    let rendered = serde_yaml::to_string(values).change_context_lazy(workspace_error)?;
    let path = dir.join("values.yaml");
    tokio::fs::write(&path, rendered)
        .await
        .change_context_lazy(workspace_error)?;
    Ok(path)
}

async fn ensure_namespace(
    tenant: &dyn ClusterApi,
    app: &ApplicationConfig,
) -> Result<(), Report<ApplicationError>> {
    match tenant.create_namespace(&app.namespace, BTreeMap::new()).await {
        Ok(()) => {
            info!(namespace = %app.namespace, "Created application namespace");
            Ok(())
        }
        Err(report) if report.current_context().is_already_exists() => Ok(()),
        Err(report) => Err(report.change_context(ApplicationError::Namespace {
            vcluster: app.vcluster_name.clone(),
            namespace: app.namespace.clone(),
        })),
    }
}

async fn inject_config(
    tenant: &dyn ClusterApi,
    app: &ApplicationConfig,
) -> Result<(), Report<ApplicationError>> {
    if app.config_injection.is_empty() {
        return Ok(());
    }
    let config_map = ConfigMap {
        metadata: ObjectMeta {
            name: Some(injected_config_name(&app.name)),
            namespace: Some(app.namespace.clone()),
            labels: Some(BTreeMap::from([
                (MANAGED_BY_LABEL.to_string(), MANAGED_BY_VALUE.to_string()),
                ("app.kubernetes.io/name".to_string(), app.name.clone()),
            ])),
            ..Default::default()
        },
        data: Some(app.config_injection.clone()),
        ..Default::default()
    };
    tenant
        .apply(&app.namespace, &KubeObject::ConfigMap(config_map))
        .await
        .change_context_lazy(|| ApplicationError::ConfigInjection {
            name: app.name.clone(),
        })?;
    info!(keys = app.config_injection.len(), "Injected application configuration");
    Ok(())
}

#[cfg(test)]
mod tests {
    use similar_asserts::assert_eq;
    use test_log::test;

    use super::*;
    use crate::infrastructure::k8s::mock::MockClusterApi;
    use crate::infrastructure::process::mock::RecordingRunner;
    use crate::platform::HelmChartConfig;
    use crate::platform::KustomizeConfig;
    use crate::vcluster::mock::MockResolver;

    struct Fixture {
        runner: RecordingRunner,
        tenant: MockClusterApi,
        deployer: ApplicationDeployer,
    }

    fn fixture() -> Fixture {
        let runner = RecordingRunner::default();
        let tenant = MockClusterApi::new();
        let resolver = MockResolver::new();
        resolver.register("biz-a", tenant.clone());
        let deployer = ApplicationDeployer::new(Arc::new(runner.clone()), Arc::new(resolver));
        Fixture {
            runner,
            tenant,
            deployer,
        }
    }

    fn helm_app() -> ApplicationConfig {
        ApplicationConfig {
            name: "web".to_string(),
            vcluster_name: "biz-a".to_string(),
            namespace: "shop".to_string(),
            helm_chart: Some(HelmChartConfig {
                chart: "nginx".to_string(),
                values: Some(serde_yaml::from_str("replicaCount: 2").expect("should parse values")),
                release_name: "web".to_string(),
                ..Default::default()
            }),
            config_injection: BTreeMap::from([("LOG_LEVEL".to_string(), "debug".to_string())]),
            ..Default::default()
        }
    }

    fn kustomize_app() -> ApplicationConfig {
        ApplicationConfig {
            name: "api".to_string(),
            vcluster_name: "biz-a".to_string(),
            namespace: "shop".to_string(),
            kustomize: Some(KustomizeConfig {
                path: "./deploy/api".to_string(),
            }),
            ..Default::default()
        }
    }

    #[test(tokio::test)]
    async fn helm_deploy_installs_release_and_injects_config() {
        let f = fixture();

        f.deployer
            .deploy(&helm_app())
            .await
            .expect("should deploy");

        let invocations = f.runner.invocations();
        assert_eq!(invocations.len(), 1);
        assert!(invocations[0].starts_with("helm upgrade --install web nginx --namespace shop"));
        assert!(invocations[0].contains("--values "));
        assert!(f.tenant.has_namespace("shop"));
        assert_eq!(
            f.tenant.applied(),
            vec![(
                "shop".to_string(),
                "ConfigMap".to_string(),
                "web-injected-config".to_string()
            )]
        );
    }

    #[test(tokio::test)]
    async fn existing_namespace_is_reused() {
        let f = fixture();
        f.tenant.add_namespace("shop");

        f.deployer
            .upgrade(&kustomize_app())
            .await
            .expect("should upgrade");

        let invocations = f.runner.invocations();
        assert_eq!(invocations.len(), 1);
        assert!(invocations[0].starts_with("kubectl --kubeconfig "));
        assert!(invocations[0].ends_with(" apply --namespace shop -k ./deploy/api"));
        assert!(f.tenant.applied().is_empty());
    }

    #[test(tokio::test)]
    async fn ambiguous_source_fails_before_any_tool_runs() {
        let f = fixture();
        let mut app = helm_app();
        app.manifests = vec!["extra.yaml".to_string()];

        let err = f.deployer.deploy(&app).await.expect_err("should fail");

        assert!(matches!(
            err.current_context(),
            ApplicationError::InvalidSource { reason, .. } if reason.contains("only one")
        ));
        assert!(f.runner.invocations().is_empty());
    }

    #[test(tokio::test)]
    async fn unknown_vcluster_is_reported() {
        let f = fixture();
        let mut app = kustomize_app();
        app.vcluster_name = "biz-z".to_string();

        let err = f.deployer.deploy(&app).await.expect_err("should fail");

        assert!(matches!(
            err.current_context(),
            ApplicationError::TenantUnavailable { vcluster } if vcluster == "biz-z"
        ));
    }

    #[test(tokio::test)]
    async fn backend_failure_names_tool_and_action() {
        let f = fixture();
        f.runner.fail_program("kubectl");
        let app = ApplicationConfig {
            manifests: vec!["app.yaml".to_string()],
            kustomize: None,
            ..kustomize_app()
        };

        let err = f.deployer.deploy(&app).await.expect_err("should fail");

        assert!(matches!(
            err.current_context(),
            ApplicationError::Backend {
                backend: "kubectl",
                action: "deploy",
                ..
            }
        ));
    }

    #[test(tokio::test)]
    async fn delete_removes_release_and_injected_config() {
        let f = fixture();

        f.deployer
            .delete(&helm_app())
            .await
            .expect("should delete");

        let invocations = f.runner.invocations();
        assert_eq!(invocations.len(), 2);
        assert!(invocations[0].starts_with("helm uninstall web --namespace shop"));
        assert!(invocations[1]
            .ends_with("delete --namespace shop configmap web-injected-config --ignore-not-found"));
    }

    #[test(tokio::test)]
    async fn status_queries_the_backend() {
        let f = fixture();

        f.deployer
            .status(&kustomize_app())
            .await
            .expect("should report status");

        let invocations = f.runner.invocations();
        assert!(invocations[0].ends_with(" get --namespace shop -k ./deploy/api"));
    }
}
