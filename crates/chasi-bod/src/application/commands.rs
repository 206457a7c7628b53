use std::path::Path;

use crate::platform::ManifestSource;

/// A local tool call against one tenant.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(super) struct Invocation {
    pub program: &'static str,
    pub args: Vec<String>,
}

/// Where the tool points: the tenant kubeconfig and the target namespace.
#[derive(Debug, Clone, Copy)]
pub(super) struct Target<'a> {
    pub kubeconfig: &'a Path,
    pub namespace: &'a str,
}

pub(super) fn backend(source: &ManifestSource<'_>) -> &'static str {
    match source {
        ManifestSource::Helm(_) => "helm",
        ManifestSource::Kustomize(_) => "kustomize",
        ManifestSource::Raw(_) => "kubectl",
    }
}

fn kubectl(target: Target<'_>, verb: &str, extra: &[&str], source: &[String]) -> Invocation {
    let mut args = vec![
        "--kubeconfig".to_string(),
        target.kubeconfig.display().to_string(),
        verb.to_string(),
        "--namespace".to_string(),
        target.namespace.to_string(),
    ];
    args.extend(extra.iter().map(|s| s.to_string()));
    args.extend(source.iter().cloned());
    Invocation {
        program: "kubectl",
        args,
    }
}

fn raw_files(manifests: &[String]) -> Vec<String> {
    manifests
        .iter()
        .flat_map(|m| ["-f".to_string(), m.clone()])
        .collect()
}

/// Installs or upgrades in place. `values` is the rendered Helm values file.
pub(super) fn apply(
    source: &ManifestSource<'_>,
    target: Target<'_>,
    values: Option<&Path>,
) -> Invocation {
    match source {
        ManifestSource::Helm(chart) => {
            let mut args = vec![
                "upgrade".to_string(),
                "--install".to_string(),
                chart.release_name.clone(),
                chart.chart.clone(),
                "--namespace".to_string(),
                target.namespace.to_string(),
                "--create-namespace".to_string(),
                "--kubeconfig".to_string(),
                target.kubeconfig.display().to_string(),
            ];
            if !chart.repo.is_empty() {
                args.extend(["--repo".to_string(), chart.repo.clone()]);
            }
            if !chart.version.is_empty() {
                args.extend(["--version".to_string(), chart.version.clone()]);
            }
            if let Some(values) = values {
                args.extend(["--values".to_string(), values.display().to_string()]);
            }
            args.push("--wait".to_string());
            Invocation {
                program: "helm",
                args,
            }
        }
        ManifestSource::Kustomize(kustomize) => kubectl(
            target,
            "apply",
            &[],
            &["-k".to_string(), kustomize.path.clone()],
        ),
        ManifestSource::Raw(manifests) => kubectl(target, "apply", &[], &raw_files(manifests)),
    }
}

pub(super) fn remove(source: &ManifestSource<'_>, target: Target<'_>) -> Invocation {
    match source {
        ManifestSource::Helm(chart) => Invocation {
            program: "helm",
            args: vec![
                "uninstall".to_string(),
                chart.release_name.clone(),
                "--namespace".to_string(),
                target.namespace.to_string(),
                "--kubeconfig".to_string(),
                target.kubeconfig.display().to_string(),
            ],
        },
        ManifestSource::Kustomize(kustomize) => kubectl(
            target,
            "delete",
            &["--ignore-not-found"],
            &["-k".to_string(), kustomize.path.clone()],
        ),
        ManifestSource::Raw(manifests) => kubectl(
            target,
            "delete",
            &["--ignore-not-found"],
            &raw_files(manifests),
        ),
    }
}

pub(super) fn status(source: &ManifestSource<'_>, target: Target<'_>) -> Invocation {
    match source {
        ManifestSource::Helm(chart) => Invocation {
            program: "helm",
            args: vec![
                "status".to_string(),
                chart.release_name.clone(),
                "--namespace".to_string(),
                target.namespace.to_string(),
                "--kubeconfig".to_string(),
                target.kubeconfig.display().to_string(),
            ],
        },
        ManifestSource::Kustomize(kustomize) => kubectl(
            target,
            "get",
            &[],
            &["-k".to_string(), kustomize.path.clone()],
        ),
        ManifestSource::Raw(manifests) => kubectl(target, "get", &[], &raw_files(manifests)),
    }
}
