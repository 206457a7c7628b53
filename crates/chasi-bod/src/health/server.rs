use api_types::HealthStatus;
use api_types::OverallHealthStatus;
use error_stack::Report;
use poem::get;
use poem::handler;
use poem::http::StatusCode;
use poem::listener::TcpListener;
use poem::middleware::Tracing;
use poem::web::Data;
use poem::web::Json;
use poem::Endpoint;
use poem::EndpointExt;
use poem::IntoResponse;
use poem::Response;
use poem::Route;
use poem::Server;
use tokio_util::sync::CancellationToken;
use tracing::error;
use tracing::info;

use super::HealthError;
use super::HealthRegistry;

/// Aggregated status as JSON; 200 only when healthy.
#[handler]
async fn healthz(registry: Data<&HealthRegistry>) -> Response {
    let overall: OverallHealthStatus = registry.overall_status().await;
    let status = if overall.status == HealthStatus::Healthy {
        StatusCode::OK
    } else {
        StatusCode::INTERNAL_SERVER_ERROR
    };
    Json(overall).with_status(status).into_response()
}

fn routes(registry: HealthRegistry) -> impl Endpoint {
    Route::new()
        .at("/healthz", get(healthz))
        .data(registry)
        .with(Tracing)
}

/// Serves `/healthz` backed by a [`HealthRegistry`].
pub struct HealthServer {
    listen_addr: String,
    registry: HealthRegistry,
}

impl HealthServer {
    pub fn new(listen_addr: impl Into<String>, registry: HealthRegistry) -> Self {
        Self {
            listen_addr: listen_addr.into(),
            registry,
        }
    }

    /// Serves until `shutdown` is cancelled.
    ///
    /// # Errors
    ///
    /// - [`HealthError::Server`] if the listener cannot bind or the server fails
    pub async fn run(self, shutdown: CancellationToken) -> Result<(), Report<HealthError>> {
        info!("Starting health endpoint on {}", self.listen_addr);

        let app = routes(self.registry);
        let server = Server::new(TcpListener::bind(&self.listen_addr));

        tokio::select! {
            result = server.run(app) => {
                match result {
                    Ok(()) => {
                        info!("Health endpoint stopped");
                        Ok(())
                    }
                    Err(e) => {
                        error!("Health endpoint failed: {e}");
                        Err(Report::new(HealthError::Server {
                            message: e.to_string(),
                        }))
                    }
                }
            }
            _ = shutdown.cancelled() => {
                info!("Health endpoint shutdown requested");
                Ok(())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use poem::test::TestClient;
    use similar_asserts::assert_eq;
    use test_log::test;

    use super::*;
    use crate::health::registry::tests::StaticChecker;

    #[test(tokio::test)]
    async fn healthy_registry_returns_ok() {
        let registry = HealthRegistry::new();
        registry
            .register(StaticChecker::new("host-api", HealthStatus::Healthy))
            .await;
        let client = TestClient::new(routes(registry));

        let resp = client.get("/healthz").send().await;

        resp.assert_status_is_ok();
        let body: OverallHealthStatus = resp
            .json()
            .await
            .value()
            .deserialize();
        assert_eq!(body.status, HealthStatus::Healthy);
        assert_eq!(body.checks.len(), 1);
    }

    #[test(tokio::test)]
    async fn degraded_registry_returns_server_error() {
        let registry = HealthRegistry::new();
        registry
            .register(StaticChecker::new("host-api", HealthStatus::Healthy))
            .await;
        registry
            .register(StaticChecker::new("host-nodes", HealthStatus::Degraded))
            .await;
        let client = TestClient::new(routes(registry));

        let resp = client.get("/healthz").send().await;

        resp.assert_status(StatusCode::INTERNAL_SERVER_ERROR);
        let body: OverallHealthStatus = resp
            .json()
            .await
            .value()
            .deserialize();
        assert_eq!(body.status, HealthStatus::Degraded);
    }

    #[test(tokio::test)]
    async fn cancelled_server_returns() {
        let shutdown = CancellationToken::new();
        shutdown.cancel();

        HealthServer::new("127.0.0.1:0", HealthRegistry::new())
            .run(shutdown)
            .await
            .expect("should stop on cancellation");
    }
}
