use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use api_types::HealthCheckResult;
use api_types::HealthStatus;
use api_types::OverallHealthStatus;
use async_trait::async_trait;
use futures::future::join_all;
use tokio::sync::RwLock;
use tracing::debug;
use tracing::warn;

/// Upper bound for a single check before it is reported as unknown.
pub const CHECK_TIMEOUT: Duration = Duration::from_secs(5);

/// A named probe of one platform component.
#[async_trait]
pub trait HealthChecker: Send + Sync {
    fn name(&self) -> &str;

    async fn check(&self) -> HealthCheckResult;
}

/// Named health checkers, shared between the CLI and the HTTP endpoint.
#[derive(Clone)]
pub struct HealthRegistry {
    checkers: Arc<RwLock<BTreeMap<String, Arc<dyn HealthChecker>>>>,
    check_timeout: Duration,
}

impl Default for HealthRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl HealthRegistry {
    pub fn new() -> Self {
        Self {
            checkers: Arc::new(RwLock::new(BTreeMap::new())),
            check_timeout: CHECK_TIMEOUT,
        }
    }

    pub fn with_check_timeout(mut self, check_timeout: Duration) -> Self {
        self.check_timeout = check_timeout;
        self
    }

    /// Registers `checker` under its name, replacing any previous checker
    /// with the same name.
    pub async fn register(&self, checker: Arc<dyn HealthChecker>) {
        let name = checker.name().to_string();
        let mut checkers = self.checkers.write().await;
        if checkers.insert(name.clone(), checker).is_some() {
            warn!(check = %name, "Replacing already registered health checker");
        } else {
            debug!(check = %name, "Registered health checker");
        }
    }

    pub async fn len(&self) -> usize {
        self.checkers.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.checkers.read().await.is_empty()
    }

    /// Runs every registered checker concurrently and folds the results.
    pub async fn overall_status(&self) -> OverallHealthStatus {
        let checkers: Vec<Arc<dyn HealthChecker>> =
            self.checkers.read().await.values().cloned().collect();
        let limit = self.check_timeout;

        let checks = join_all(checkers.iter().map(|checker| async move {
            match tokio::time::timeout(limit, checker.check()).await {
                Ok(result) => result,
                Err(_) => {
                    warn!(check = checker.name(), "Health check timed out");
                    HealthCheckResult::with_error(
                        checker.name(),
                        HealthStatus::Unknown,
                        "Health check timed out",
                        format!("no result within {}", humantime::format_duration(limit)),
                    )
                }
            }
        }))
        .await;

        OverallHealthStatus {
            status: aggregate(&checks),
            checks,
        }
    }
}

/// Folds individual results: any unhealthy wins, then any degraded,
/// otherwise healthy. Unknown results do not change the outcome.
pub fn aggregate(results: &[HealthCheckResult]) -> HealthStatus {
    let mut overall = HealthStatus::Healthy;
    for result in results {
        match result.status {
            HealthStatus::Unhealthy => return HealthStatus::Unhealthy,
            HealthStatus::Degraded => overall = HealthStatus::Degraded,
            HealthStatus::Healthy | HealthStatus::Unknown => {}
        }
    }
    overall
}

#[cfg(test)]
pub(crate) mod tests {
    use similar_asserts::assert_eq;
    use test_log::test;

    use super::*;

    /// Reports a fixed status, optionally after a delay.
    pub(crate) struct StaticChecker {
        pub name: String,
        pub status: HealthStatus,
        pub delay: Duration,
    }

    impl StaticChecker {
        pub(crate) fn new(name: &str, status: HealthStatus) -> Arc<Self> {
            Arc::new(Self {
                name: name.to_string(),
                status,
                delay: Duration::ZERO,
            })
        }
    }

    #[async_trait]
    impl HealthChecker for StaticChecker {
        fn name(&self) -> &str {
            &self.name
        }

        async fn check(&self) -> HealthCheckResult {
            tokio::time::sleep(self.delay).await;
            HealthCheckResult {
                name: self.name.clone(),
                status: self.status,
                message: self.status.to_string(),
                error: None,
            }
        }
    }

    fn result(status: HealthStatus) -> HealthCheckResult {
        HealthCheckResult {
            name: "c".to_string(),
            status,
            message: String::new(),
            error: None,
        }
    }

    #[test]
    fn aggregate_folds_worst_status() {
        use HealthStatus::*;
        let cases: [(&[HealthStatus], HealthStatus); 6] = [
            (&[], Healthy),
            (&[Healthy, Healthy], Healthy),
            (&[Healthy, Degraded], Degraded),
            (&[Healthy, Unhealthy, Degraded], Unhealthy),
            (&[Unknown], Healthy),
            (&[Unknown, Degraded], Degraded),
        ];
        for (statuses, expected) in cases {
            let results: Vec<_> = statuses.iter().copied().map(result).collect();
            assert_eq!(aggregate(&results), expected, "{statuses:?}");
        }
    }

    #[test(tokio::test)]
    async fn registering_same_name_replaces_checker() {
        let registry = HealthRegistry::new();
        registry
            .register(StaticChecker::new("host-api", HealthStatus::Unhealthy))
            .await;
        registry
            .register(StaticChecker::new("host-api", HealthStatus::Healthy))
            .await;

        let overall = registry.overall_status().await;

        assert_eq!(registry.len().await, 1);
        assert_eq!(overall.status, HealthStatus::Healthy);
    }

    #[test(tokio::test)]
    async fn overall_status_runs_every_checker() {
        let registry = HealthRegistry::new();
        registry
            .register(StaticChecker::new("host-api", HealthStatus::Healthy))
            .await;
        registry
            .register(StaticChecker::new("nodes", HealthStatus::Degraded))
            .await;

        let overall = registry.overall_status().await;

        assert_eq!(overall.status, HealthStatus::Degraded);
        let names: Vec<_> = overall.checks.iter().map(|c| c.name.as_str()).collect();
        assert_eq!(names, vec!["host-api", "nodes"]);
    }

    #[test(tokio::test(start_paused = true))]
    async fn slow_checker_reports_unknown() {
        let registry = HealthRegistry::new();
        registry
            .register(Arc::new(StaticChecker {
                name: "stuck".to_string(),
                status: HealthStatus::Unhealthy,
                delay: Duration::from_secs(60),
            }))
            .await;
        registry
            .register(StaticChecker::new("host-api", HealthStatus::Healthy))
            .await;

        let overall = registry.overall_status().await;

        let stuck = overall
            .checks
            .iter()
            .find(|c| c.name == "stuck")
            .expect("should report the stuck checker");
        assert_eq!(stuck.status, HealthStatus::Unknown);
        assert_eq!(overall.status, HealthStatus::Healthy);
    }

    #[test(tokio::test)]
    async fn empty_registry_is_healthy() {
        let overall = HealthRegistry::new().overall_status().await;

        assert!(overall.checks.is_empty());
        assert_eq!(overall.status, HealthStatus::Healthy);
    }
}
