use core::error::Error;
use std::io::Write;
use std::path::Path;
use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use error_stack::Report;
use error_stack::ResultExt;
use serde_json::json;
use tracing::info;
use tracing::instrument;

use crate::infrastructure::process::CommandRunner;
use crate::platform::PlatformConfig;

/// Packer template used when none is configured.
pub const DEFAULT_PACKER_TEMPLATE: &str = "/etc/chasi-bod/packer/platform.pkr.hcl";

#[derive(Debug, derive_more::Display)]
pub enum BuildError {
    #[display("Cannot create output directory {}", path.display())]
    OutputDir { path: PathBuf },
    #[display("Cannot write packer variables")]
    Variables,
    #[display("packer build failed")]
    Packer,
    #[display("Build finished but {} does not exist", path.display())]
    MissingArtifact { path: PathBuf },
}

impl Error for BuildError {}

/// Produces the bootable platform image described by a document.
#[async_trait]
pub trait ImageBuilder: Send + Sync {
    /// Builds the image and returns its path.
    async fn build(&self, config: &PlatformConfig) -> Result<PathBuf, Report<BuildError>>;
}

/// [`ImageBuilder`] driving `packer build` with a variables file derived
/// from the output and base-OS sections.
pub struct PackerImageBuilder {
    runner: Arc<dyn CommandRunner>,
    template: PathBuf,
}

impl PackerImageBuilder {
    pub fn new(runner: Arc<dyn CommandRunner>, template: impl Into<PathBuf>) -> Self {
        Self {
            runner,
            template: template.into(),
        }
    }
}

fn packer_variables(config: &PlatformConfig) -> serde_json::Value {
    let base_os = &config.cluster.base_os;
    let mut sysctl = config.sysctl.clone();
    sysctl.extend(base_os.sysctl.clone());
    json!({
        "platform_name": config.metadata.name,
        "base_image": base_os.image,
        "packages": base_os.packages,
        "kernel_args": base_os.kernel_args.join(" "),
        "commands": base_os.commands,
        "sysctl": sysctl,
        "ssh_authorized_keys": base_os.ssh_authorized_keys,
        "kubernetes_version": config.cluster.kubernetes_version,
        "container_runtime": config.cluster.container_runtime,
        "format": config.output.format.to_string(),
        "output_dir": config.output.output_dir,
        "image_name": config.output.image_name,
    })
}

fn write_variables(dir: &Path, config: &PlatformConfig) -> Result<PathBuf, Report<BuildError>> {
    let path = dir.join("variables.pkrvars.json");
    let mut file = std::fs::File::create(&path).change_context(BuildError::Variables)?;
    serde_json::to_writer_pretty(&mut file, &packer_variables(config))
        .change_context(BuildError::Variables)?;
    file.flush().change_context(BuildError::Variables)?;
    Ok(path)
}

#[async_trait]
impl ImageBuilder for PackerImageBuilder {
    #[instrument(skip_all, fields(image = %config.output.image_name, format = %config.output.format))]
    async fn build(&self, config: &PlatformConfig) -> Result<PathBuf, Report<BuildError>> {
        let output_dir = &config.output.output_dir;
        tokio::fs::create_dir_all(output_dir)
            .await
            .change_context_lazy(|| BuildError::OutputDir {
                path: output_dir.clone(),
            })?;

        let scratch = tempfile::tempdir().change_context(BuildError::Variables)?;
        let variables = write_variables(scratch.path(), config)?;
        let args = vec![
            "build".to_string(),
            "-force".to_string(),
            format!("-var-file={}", variables.display()),
            self.template.display().to_string(),
        ];
        info!(template = %self.template.display(), "Running packer");
        self.runner
            .run("packer", &args)
            .await
            .change_context(BuildError::Packer)?;

        let image = config.output.image_path();
        if !tokio::fs::try_exists(&image).await.unwrap_or(false) {
            return Err(Report::new(BuildError::MissingArtifact { path: image }));
        }
        info!(path = %image.display(), "Platform image built");
        Ok(image)
    }
}

#[cfg(test)]
mod tests {
    use similar_asserts::assert_eq;
    use test_log::test;

    use super::*;
    use crate::infrastructure::process::mock::RecordingRunner;
    use crate::platform::model::fixtures;
    use crate::platform::NodeRole;

    #[test]
    fn variables_merge_global_and_base_os_sysctl() {
        let mut config = fixtures::platform(vec![fixtures::node("10.0.0.1", &[NodeRole::Master])]);
        config
            .sysctl
            .insert("net.ipv4.ip_forward".to_string(), "1".to_string());
        config
            .cluster
            .base_os
            .sysctl
            .insert("vm.swappiness".to_string(), "0".to_string());

        let vars = packer_variables(&config);

        assert_eq!(vars["sysctl"]["net.ipv4.ip_forward"], json!("1"));
        assert_eq!(vars["sysctl"]["vm.swappiness"], json!("0"));
        assert_eq!(vars["format"], json!("qcow2"));
        assert_eq!(vars["image_name"], json!("edge"));
    }

    #[test(tokio::test)]
    async fn build_runs_packer_and_returns_the_image() {
        let out = tempfile::tempdir().expect("should create temp dir");
        let mut config = fixtures::platform(vec![fixtures::node("10.0.0.1", &[NodeRole::Master])]);
        config.output.output_dir = out.path().to_path_buf();
        std::fs::write(config.output.image_path(), b"image").expect("should write image");
        let runner = RecordingRunner::default();
        let builder = PackerImageBuilder::new(Arc::new(runner.clone()), "/opt/platform.pkr.hcl");

        let image = builder.build(&config).await.expect("should build");

        assert_eq!(image, out.path().join("edge.qcow2"));
        let invocations = runner.invocations();
        assert_eq!(invocations.len(), 1);
        assert!(invocations[0].starts_with("packer build -force -var-file="));
        assert!(invocations[0].ends_with(" /opt/platform.pkr.hcl"));
    }

    #[test(tokio::test)]
    async fn missing_artifact_is_an_error() {
        let out = tempfile::tempdir().expect("should create temp dir");
        let mut config = fixtures::platform(vec![fixtures::node("10.0.0.1", &[NodeRole::Master])]);
        config.output.output_dir = out.path().to_path_buf();
        let builder =
            PackerImageBuilder::new(Arc::new(RecordingRunner::default()), DEFAULT_PACKER_TEMPLATE);

        let err = builder.build(&config).await.expect_err("should fail");

        assert!(matches!(
            err.current_context(),
            BuildError::MissingArtifact { .. }
        ));
    }

    #[test(tokio::test)]
    async fn packer_failure_is_reported() {
        let out = tempfile::tempdir().expect("should create temp dir");
        let mut config = fixtures::platform(vec![fixtures::node("10.0.0.1", &[NodeRole::Master])]);
        config.output.output_dir = out.path().to_path_buf();
        let runner = RecordingRunner::default();
        runner.fail_program("packer");
        let builder = PackerImageBuilder::new(Arc::new(runner), DEFAULT_PACKER_TEMPLATE);

        let err = builder.build(&config).await.expect_err("should fail");

        assert!(matches!(err.current_context(), BuildError::Packer));
    }
}
