//! OIDC provider lifecycle.
//!
//! One `OidcProvider` per configured identity provider. A single background
//! task refreshes the discovery document and JWKS on a fixed interval and
//! publishes `{endpoints, verifier}` under a write lock; request handlers read
//! under the shared lock. A refresh failure after the first success keeps the
//! previously published state (stale-but-available over unavailable).

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use jsonwebtoken::jwk::JwkSet;
use jsonwebtoken::{decode, decode_header, Algorithm, DecodingKey, Validation};
use serde::Deserialize;
use thiserror::Error;
use tokio::sync::{watch, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::config::ProviderConfig;

const REFRESH_INTERVAL: Duration = Duration::from_secs(60);

#[derive(Debug, Error)]
pub enum ProviderError {
    #[error("identity provider not yet initialized{}", detail_suffix(.0))]
    NotInitialized(Option<String>),
    #[error("discovery failed: {0}")]
    Discovery(String),
    #[error("token verification failed: {0}")]
    Verification(String),
    #[error("token nonce does not match the login nonce")]
    NonceMismatch,
}

fn detail_suffix(detail: &Option<String>) -> String {
    match detail {
        Some(d) => format!(": {}", d),
        None => String::new(),
    }
}

/// Discovery metadata this layer consumes.
#[derive(Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct Endpoints {
    pub issuer: String,
    pub authorization_endpoint: String,
    pub token_endpoint: String,
    pub jwks_uri: String,
}

/// JWKS-backed ID token verifier, rebuilt on every successful discovery.
pub struct Verifier {
    keys: HashMap<String, DecodingKey>,
    issuer: String,
    client_id: String,
}

impl Verifier {
    fn new(jwks: &JwkSet, issuer: String, client_id: String) -> Self {
        let mut keys = HashMap::new();
        for jwk in &jwks.keys {
            let Some(kid) = jwk.common.key_id.clone() else {
                continue;
            };
            match DecodingKey::from_jwk(jwk) {
                Ok(key) => {
                    keys.insert(kid, key);
                }
                Err(e) => warn!("Skipping JWKS key '{}': {}", kid, e),
            }
        }
        Verifier {
            keys,
            issuer,
            client_id,
        }
    }

    /// Verifies signature, issuer, audience and expiry, plus nonce equality
    /// when the login attempt issued a nonce. Returns the raw claims.
    pub fn verify(
        &self,
        token: &str,
        expected_nonce: Option<&str>,
    ) -> Result<serde_json::Value, ProviderError> {
        let header =
            decode_header(token).map_err(|e| ProviderError::Verification(e.to_string()))?;

        match header.alg {
            Algorithm::RS256 | Algorithm::RS384 | Algorithm::RS512 => {}
            other => {
                return Err(ProviderError::Verification(format!(
                    "unsupported algorithm {:?}",
                    other
                )))
            }
        }

        let kid = header
            .kid
            .ok_or_else(|| ProviderError::Verification("missing kid in token header".into()))?;
        let key = self
            .keys
            .get(&kid)
            .ok_or_else(|| ProviderError::Verification(format!("no JWKS key for kid {}", kid)))?;

        let mut validation = Validation::new(header.alg);
        validation.set_issuer(&[&self.issuer]);
        validation.set_audience(&[&self.client_id]);

        let decoded = decode::<serde_json::Value>(token, key, &validation)
            .map_err(|e| ProviderError::Verification(e.to_string()))?;

        if let Some(expected) = expected_nonce {
            let got = decoded.claims.get("nonce").and_then(|n| n.as_str());
            if got != Some(expected) {
                return Err(ProviderError::NonceMismatch);
            }
        }

        Ok(decoded.claims)
    }
}

struct Published {
    endpoints: Endpoints,
    verifier: Arc<Verifier>,
}

#[derive(Default)]
struct ProviderState {
    published: Option<Arc<Published>>,
    last_error: Option<String>,
}

/// Background-refreshed OIDC discovery state. Owned by the DI root; request
/// handlers hold an `Arc` and only ever take the read lock.
pub struct OidcProvider {
    config: ProviderConfig,
    http: reqwest::Client,
    state: RwLock<ProviderState>,
    refresh_task: std::sync::Mutex<Option<(watch::Sender<bool>, JoinHandle<()>)>>,
}

impl OidcProvider {
    pub fn new(config: ProviderConfig) -> Self {
        OidcProvider {
            config,
            http: reqwest::Client::new(),
            state: RwLock::new(ProviderState::default()),
            refresh_task: std::sync::Mutex::new(None),
        }
    }

    /// Runs discovery once eagerly, then keeps refreshing on a fixed interval
    /// until `close` is called. A failed eager discovery is not fatal: the
    /// provider stays uninitialized until the next tick succeeds.
    pub async fn start(self: &Arc<Self>) {
        self.refresh_once().await;

        let provider = Arc::clone(self);
        let (tx, mut rx) = watch::channel(false);
        let handle = tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = rx.changed() => break,
                    _ = tokio::time::sleep(REFRESH_INTERVAL) => provider.refresh_once().await,
                }
            }
            debug!("Provider refresh task stopped");
        });

        let mut guard = self.refresh_task.lock().expect("refresh task lock poisoned");
        *guard = Some((tx, handle));
    }

    /// Cooperative shutdown: signals the refresh task and waits for it,
    /// bounded by `deadline`.
    pub async fn close(&self, deadline: Duration) {
        let task = self
            .refresh_task
            .lock()
            .expect("refresh task lock poisoned")
            .take();
        let Some((tx, handle)) = task else {
            return;
        };
        let _ = tx.send(true);
        if tokio::time::timeout(deadline, handle).await.is_err() {
            warn!("Provider refresh task did not stop before the deadline");
        }
    }

    /// Current discovery endpoints, or a not-initialized error carrying the
    /// last discovery failure.
    pub async fn endpoints(&self) -> Result<Endpoints, ProviderError> {
        let state = self.state.read().await;
        match &state.published {
            Some(p) => Ok(p.endpoints.clone()),
            None => Err(ProviderError::NotInitialized(state.last_error.clone())),
        }
    }

    pub async fn verifier(&self) -> Result<Arc<Verifier>, ProviderError> {
        let state = self.state.read().await;
        match &state.published {
            Some(p) => Ok(Arc::clone(&p.verifier)),
            None => Err(ProviderError::NotInitialized(state.last_error.clone())),
        }
    }

    /// Verify a token against the currently published verifier.
    pub async fn verify(
        &self,
        token: &str,
        expected_nonce: Option<&str>,
    ) -> Result<serde_json::Value, ProviderError> {
        self.verifier().await?.verify(token, expected_nonce)
    }

    pub async fn refresh_once(&self) {
        match self.discover().await {
            Ok(published) => {
                let mut state = self.state.write().await;
                let first = state.published.is_none();
                state.published = Some(Arc::new(published));
                state.last_error = None;
                if first {
                    info!(issuer = %self.config.issuer_url, "Identity provider initialized");
                }
            }
            Err(e) => {
                let mut state = self.state.write().await;
                if state.published.is_none() {
                    error!(issuer = %self.config.issuer_url, "Discovery failed before initialization: {}", e);
                    state.last_error = Some(e.to_string());
                } else {
                    // Keep serving the stale endpoints and verifier.
                    warn!(issuer = %self.config.issuer_url, "Discovery refresh failed, keeping previous state: {}", e);
                }
            }
        }
    }

    async fn discover(&self) -> Result<Published, ProviderError> {
        let discovery_url = format!(
            "{}/.well-known/openid-configuration",
            self.config.issuer_url.trim_end_matches('/')
        );

        let endpoints = self
            .fetch_json::<Endpoints>(&discovery_url)
            .await
            .map_err(ProviderError::Discovery)?;
        let jwks = self
            .fetch_json::<JwkSet>(&endpoints.jwks_uri)
            .await
            .map_err(ProviderError::Discovery)?;

        let verifier = Verifier::new(
            &jwks,
            endpoints.issuer.clone(),
            self.config.client_id.clone(),
        );
        Ok(Published {
            endpoints,
            verifier: Arc::new(verifier),
        })
    }

    async fn fetch_json<T: serde::de::DeserializeOwned>(&self, url: &str) -> Result<T, String> {
        let res = self
            .http
            .get(url)
            .send()
            .await
            .map_err(|e| format!("failed to fetch {}: {}", url, e))?;
        if !res.status().is_success() {
            return Err(format!("failed to fetch {}: {}", url, res.status()));
        }
        res.json::<T>()
            .await
            .map_err(|e| format!("failed to parse {}: {}", url, e))
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use crate::config::ProviderConfig;

    use super::*;

    fn test_config(issuer: &str) -> ProviderConfig {
        ProviderConfig {
            name: "Test IdP".to_string(),
            issuer_url: issuer.to_string(),
            client_id: "dashboard".to_string(),
            client_secret: "secret".to_string(),
            redirect_url: "https://dash.example.com/oauth2/callback".to_string(),
            scopes: vec!["openid".to_string()],
            claims: Default::default(),
        }
    }

    fn discovery_body(base: &str) -> String {
        json!({
            "issuer": base,
            "authorization_endpoint": format!("{base}/authorize"),
            "token_endpoint": format!("{base}/token"),
            "jwks_uri": format!("{base}/jwks"),
        })
        .to_string()
    }

    #[tokio::test]
    async fn uninitialized_provider_reports_not_initialized() {
        let provider = OidcProvider::new(test_config("https://idp.invalid"));
        assert!(matches!(
            provider.endpoints().await,
            Err(ProviderError::NotInitialized(_))
        ));
        assert!(matches!(
            provider.verifier().await,
            Err(ProviderError::NotInitialized(_))
        ));
    }

    #[tokio::test]
    async fn failed_discovery_records_error_until_first_success() {
        let mut server = mockito::Server::new_async().await;
        let failing = server
            .mock("GET", "/.well-known/openid-configuration")
            .with_status(500)
            .create_async()
            .await;

        let provider = OidcProvider::new(test_config(&server.url()));
        provider.refresh_once().await;
        match provider.endpoints().await {
            Err(ProviderError::NotInitialized(Some(detail))) => {
                assert!(detail.contains("500"), "detail: {}", detail)
            }
            other => panic!("expected NotInitialized with detail, got {:?}", other.map(|_| ())),
        }
        failing.assert_async().await;
    }

    #[tokio::test]
    async fn refresh_failure_keeps_stale_endpoints() {
        let mut server = mockito::Server::new_async().await;
        let base = server.url();
        let good = server
            .mock("GET", "/.well-known/openid-configuration")
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(discovery_body(&base))
            .expect(1)
            .create_async()
            .await;
        let jwks = server
            .mock("GET", "/jwks")
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(json!({"keys": []}).to_string())
            .expect(1)
            .create_async()
            .await;

        let provider = OidcProvider::new(test_config(&base));
        provider.refresh_once().await;
        let published = provider.endpoints().await.unwrap();
        assert_eq!(published.token_endpoint, format!("{base}/token"));
        good.assert_async().await;
        jwks.assert_async().await;

        // Next refresh fails; the last good endpoints must survive.
        server
            .mock("GET", "/.well-known/openid-configuration")
            .with_status(503)
            .create_async()
            .await;
        provider.refresh_once().await;
        assert_eq!(provider.endpoints().await.unwrap(), published);
        assert!(provider.verifier().await.is_ok());
    }

    #[tokio::test]
    async fn close_without_start_is_a_no_op() {
        let provider = OidcProvider::new(test_config("https://idp.invalid"));
        provider.close(Duration::from_millis(10)).await;
    }
}
