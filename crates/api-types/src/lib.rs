//! Shared API type definitions
//!
//! Health report types exchanged between the chasi-bod health aggregator,
//! its `/healthz` endpoint and the `healthz` command output.

use serde::Deserialize;
use serde::Serialize;

/// Status reported by a single health check or by the aggregate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Healthy,
    Degraded,
    Unhealthy,
    Unknown,
}

impl std::fmt::Display for HealthStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            HealthStatus::Healthy => "healthy",
            HealthStatus::Degraded => "degraded",
            HealthStatus::Unhealthy => "unhealthy",
            HealthStatus::Unknown => "unknown",
        };
        f.write_str(s)
    }
}

/// Result of one named health check.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HealthCheckResult {
    /// Name of the component that was checked
    pub name: String,
    pub status: HealthStatus,
    /// Human readable summary
    pub message: String,
    /// Error detail when the check did not pass
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl HealthCheckResult {
    pub fn healthy(name: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            status: HealthStatus::Healthy,
            message: message.into(),
            error: None,
        }
    }

    pub fn with_error(
        name: impl Into<String>,
        status: HealthStatus,
        message: impl Into<String>,
        error: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            status,
            message: message.into(),
            error: Some(error.into()),
        }
    }
}

/// Aggregated health of all registered checks.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OverallHealthStatus {
    pub status: HealthStatus,
    pub checks: Vec<HealthCheckResult>,
}
