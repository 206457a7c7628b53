use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use error_stack::Report;
use error_stack::ResultExt;
use tracing::debug;

use super::manifests::SERVICE_PORT;
use super::VClusterError;
use crate::infrastructure::k8s::client_from_kubeconfig_yaml;
use crate::infrastructure::k8s::ClusterApi;
use crate::infrastructure::k8s::KubeClusterApi;
use crate::platform::vcluster_namespace;

/// Secret holding the tenant API server CA, under key `ca.crt`.
const CERTS_SECRET_SUFFIX: &str = "-certs";
const CA_KEY: &str = "ca.crt";
/// Secret holding the tenant admin token, under key `token`.
const TOKEN_SECRET_SUFFIX: &str = "-token";
const TOKEN_KEY: &str = "token";

/// Where the API of a tenant is reachable from inside the Host cluster.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TenantEndpoint {
    pub name: String,
    pub namespace: String,
    pub server: String,
}

pub fn tenant_endpoint(name: &str) -> TenantEndpoint {
    let namespace = vcluster_namespace(name);
    let server = format!("https://{name}.{namespace}.svc.cluster.local:{SERVICE_PORT}");
    TenantEndpoint {
        name: name.to_string(),
        namespace,
        server,
    }
}

/// Turns a tenant name into an API client for that tenant.
#[async_trait]
pub trait TenantClientResolver: Send + Sync {
    async fn resolve(&self, name: &str) -> Result<Arc<dyn ClusterApi>, Report<VClusterError>>;

    /// Kubeconfig document for the tenant `name`, for external tools.
    async fn kubeconfig(&self, name: &str) -> Result<String, Report<VClusterError>>;
}

/// Resolves tenant clients from the credential Secrets in the tenant namespace.
pub struct SecretClientResolver {
    host: Arc<dyn ClusterApi>,
}

struct TenantCredentials {
    ca: Vec<u8>,
    token: String,
}

impl SecretClientResolver {
    pub fn new(host: Arc<dyn ClusterApi>) -> Self {
        Self { host }
    }

    async fn secret_value(
        &self,
        endpoint: &TenantEndpoint,
        suffix: &str,
        key: &str,
    ) -> Result<Vec<u8>, Report<VClusterError>> {
        let secret = format!("{}{suffix}", endpoint.name);
        let data = match self.host.secret_data(&endpoint.namespace, &secret).await {
            Ok(data) => data,
            Err(report) => {
                let missing = report.current_context().is_not_found();
                let context = if missing {
                    VClusterError::SecretMissing {
                        name: endpoint.name.clone(),
                        namespace: endpoint.namespace.clone(),
                        secret,
                    }
                } else {
                    VClusterError::ClientFailed {
                        name: endpoint.name.clone(),
                    }
                };
                return Err(report.change_context(context));
            }
        };
        data.get(key)
            .filter(|value| !value.is_empty())
            .cloned()
            .ok_or_else(|| {
                Report::new(VClusterError::CredentialMissing {
                    name: endpoint.name.clone(),
                    secret,
                    key: key.to_string(),
                })
            })
    }

    async fn credentials(
        &self,
        endpoint: &TenantEndpoint,
    ) -> Result<TenantCredentials, Report<VClusterError>> {
        let ca = self
            .secret_value(endpoint, CERTS_SECRET_SUFFIX, CA_KEY)
            .await?;
        let token = self
            .secret_value(endpoint, TOKEN_SECRET_SUFFIX, TOKEN_KEY)
            .await?;
        let missing = || VClusterError::CredentialMissing {
            name: endpoint.name.clone(),
            secret: format!("{}{TOKEN_SECRET_SUFFIX}", endpoint.name),
            key: TOKEN_KEY.to_string(),
        };
        let token = String::from_utf8(token)
            .change_context_lazy(missing)?
            .trim()
            .to_string();
        if token.is_empty() {
            return Err(Report::new(missing()));
        }
        Ok(TenantCredentials { ca, token })
    }
}

fn render_kubeconfig(
    endpoint: &TenantEndpoint,
    credentials: &TenantCredentials,
) -> Result<String, Report<VClusterError>> {
    let name = &endpoint.name;
    let document = serde_json::json!({
        "apiVersion": "v1",
        "kind": "Config",
        "clusters": [{
            "name": name,
            "cluster": {
                "server": endpoint.server,
                "certificate-authority-data": BASE64.encode(&credentials.ca),
            },
        }],
        "users": [{
            "name": format!("{name}-admin"),
            "user": { "token": credentials.token },
        }],
        "contexts": [{
            "name": name,
            "context": {
                "cluster": name,
                "user": format!("{name}-admin"),
                "namespace": "default",
            },
        }],
        "current-context": name,
        "preferences": BTreeMap::<String, String>::new(),
    });
    serde_yaml::to_string(&document).change_context_lazy(|| VClusterError::ClientFailed {
        name: name.clone(),
    })
}

#[async_trait]
impl TenantClientResolver for SecretClientResolver {
    async fn resolve(&self, name: &str) -> Result<Arc<dyn ClusterApi>, Report<VClusterError>> {
        let kubeconfig = self.kubeconfig(name).await?;
        let client = client_from_kubeconfig_yaml(&kubeconfig)
            .await
            .change_context_lazy(|| VClusterError::ClientFailed {
                name: name.to_string(),
            })?;
        debug!(vcluster = name, "Resolved tenant API client");
        Ok(Arc::new(KubeClusterApi::new(client)))
    }

    /// Renders a kubeconfig document for the tenant `name`.
    ///
    /// # Errors
    ///
    /// - [`VClusterError::SecretMissing`] if a credential Secret does not exist
    /// - [`VClusterError::CredentialMissing`] if a Secret lacks its entry
    async fn kubeconfig(&self, name: &str) -> Result<String, Report<VClusterError>> {
        let endpoint = tenant_endpoint(name);
        let credentials = self.credentials(&endpoint).await?;
        render_kubeconfig(&endpoint, &credentials)
    }
}

#[cfg(test)]
pub(crate) mod mock {
    use std::collections::BTreeMap;
    use std::sync::Arc;
    use std::sync::Mutex;

    use async_trait::async_trait;
    use error_stack::Report;

    use super::TenantClientResolver;
    use crate::infrastructure::k8s::mock::MockClusterApi;
    use crate::infrastructure::k8s::ClusterApi;
    use crate::vcluster::VClusterError;

    /// Hands out a registered mock API per tenant.
    #[derive(Clone, Default)]
    pub struct MockResolver {
        tenants: Arc<Mutex<BTreeMap<String, MockClusterApi>>>,
    }

    impl MockResolver {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn register(&self, name: &str, api: MockClusterApi) {
            self.tenants.lock().unwrap().insert(name.to_string(), api);
        }
    }

    #[async_trait]
    impl TenantClientResolver for MockResolver {
        async fn resolve(
            &self,
            name: &str,
        ) -> Result<Arc<dyn ClusterApi>, Report<VClusterError>> {
            self.tenants
                .lock()
                .unwrap()
                .get(name)
                .cloned()
                .map(|api| Arc::new(api) as Arc<dyn ClusterApi>)
                .ok_or_else(|| missing(name))
        }

        async fn kubeconfig(&self, name: &str) -> Result<String, Report<VClusterError>> {
            if !self.tenants.lock().unwrap().contains_key(name) {
                return Err(missing(name));
            }
            Ok(format!("apiVersion: v1\nkind: Config\ncurrent-context: {name}\n"))
        }
    }

    fn missing(name: &str) -> Report<VClusterError> {
        Report::new(VClusterError::SecretMissing {
            name: name.to_string(),
            namespace: format!("vcluster-{name}"),
            secret: format!("{name}-certs"),
        })
    }
}

#[cfg(test)]
mod tests {
    use similar_asserts::assert_eq;
    use test_log::test;

    use super::*;
    use crate::infrastructure::k8s::mock::MockClusterApi;

    #[test]
    fn endpoint_points_at_tenant_service() {
        let endpoint = tenant_endpoint("biz-a");

        assert_eq!(endpoint.namespace, "vcluster-biz-a");
        assert_eq!(
            endpoint.server,
            "https://biz-a.vcluster-biz-a.svc.cluster.local:443"
        );
    }

    #[test(tokio::test)]
    async fn kubeconfig_embeds_ca_and_token() {
        let host = MockClusterApi::new();
        host.set_secret("vcluster-biz-a", "biz-a-certs", &[("ca.crt", b"CA-PEM")]);
        host.set_secret("vcluster-biz-a", "biz-a-token", &[("token", b"secret-token\n")]);
        let resolver = SecretClientResolver::new(Arc::new(host));

        let kubeconfig = resolver
            .kubeconfig("biz-a")
            .await
            .expect("should render kubeconfig");

        let parsed: serde_yaml::Value =
            serde_yaml::from_str(&kubeconfig).expect("should be valid yaml");
        assert_eq!(
            parsed["clusters"][0]["cluster"]["certificate-authority-data"].as_str(),
            Some(BASE64.encode(b"CA-PEM").as_str())
        );
        assert_eq!(
            parsed["users"][0]["user"]["token"].as_str(),
            Some("secret-token")
        );
        assert_eq!(parsed["current-context"].as_str(), Some("biz-a"));
    }

    #[test(tokio::test)]
    async fn missing_secret_is_reported() {
        let resolver = SecretClientResolver::new(Arc::new(MockClusterApi::new()));

        let err = resolver
            .kubeconfig("biz-a")
            .await
            .expect_err("should fail without secrets");

        assert!(matches!(
            err.current_context(),
            VClusterError::SecretMissing { secret, .. } if secret == "biz-a-certs"
        ));
    }

    #[test(tokio::test)]
    async fn empty_token_is_reported() {
        for payload in [&b""[..], b" \n", b"\t\r\n"] {
            let host = MockClusterApi::new();
            host.set_secret("vcluster-biz-a", "biz-a-certs", &[("ca.crt", b"CA-PEM")]);
            host.set_secret("vcluster-biz-a", "biz-a-token", &[("token", payload)]);
            let resolver = SecretClientResolver::new(Arc::new(host));

            let err = resolver
                .kubeconfig("biz-a")
                .await
                .expect_err("should reject blank token");

            assert!(matches!(
                err.current_context(),
                VClusterError::CredentialMissing { key, .. } if key == "token"
            ));
        }
    }
}
