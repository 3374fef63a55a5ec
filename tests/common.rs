use std::sync::Arc;

use authgate::auth::{Authenticator, OidcProvider};
use authgate::config::{CacheConfig, ConfigV1, LoggingConfig, ProviderConfig, SessionConfig};
use authgate::kubeclient::memory::MemoryCluster;
use authgate::kubeclient::{AccessTarget, ClientCache};
use authgate::routes::create_router;
use authgate::state::AppState;
use axum::body::Body;
use axum::http::{header, Method, Request};
use axum::Router;

pub fn test_config(issuer_url: &str) -> ConfigV1 {
    ConfigV1 {
        bind_address: "127.0.0.1:0".to_string(),
        provider: ProviderConfig {
            name: "Test IdP".to_string(),
            issuer_url: issuer_url.to_string(),
            client_id: "dashboard".to_string(),
            client_secret: "test-client-secret".to_string(),
            redirect_url: "http://dashboard.local/oauth2/callback".to_string(),
            scopes: vec!["openid".to_string(), "email".to_string()],
            claims: Default::default(),
        },
        session: SessionConfig::default(),
        cache: CacheConfig::default(),
        logging: LoggingConfig::default(),
    }
}

/// Builds the app against a mockito-served provider. Discovery runs once
/// before the router is returned; whether it succeeded is up to the mocks the
/// test registered.
pub async fn build_app(config: ConfigV1) -> Router {
    let config = Arc::new(config);
    let provider = Arc::new(OidcProvider::new(config.provider.clone()));
    provider.refresh_once().await;

    let authenticator =
        Arc::new(Authenticator::new(&config, Arc::clone(&provider)).expect("valid default claims"));

    let cluster = Arc::new(
        MemoryCluster::new(["dev", "prod"])
            .with_grant("u@example.com", "dev")
            .with_cluster_wide("admin@example.com"),
    );
    let clients = Arc::new(ClientCache::new(
        Arc::new(Arc::clone(&cluster)),
        cluster.privileged_reader(),
        AccessTarget {
            group: "clusters.example.io".to_string(),
            resource: "managedclusters".to_string(),
        },
        8,
        60,
    ));

    create_router(AppState {
        config,
        authenticator,
        provider,
        clients,
    })
}

pub fn get_request(path: &str) -> Request<Body> {
    Request::builder()
        .method(Method::GET)
        .uri(path)
        .body(Body::empty())
        .expect("failed to build request")
}

pub fn get_request_with_cookies(path: &str, cookies: &str) -> Request<Body> {
    Request::builder()
        .method(Method::GET)
        .uri(path)
        .header(header::COOKIE, cookies)
        .body(Body::empty())
        .expect("failed to build request")
}

/// First `Set-Cookie` value for `name`, without attributes.
pub fn set_cookie_value(response: &axum::http::Response<Body>, name: &str) -> Option<String> {
    response
        .headers()
        .get_all(header::SET_COOKIE)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .find(|v| v.starts_with(&format!("{}=", name)))
        .map(|v| {
            let rest = &v[name.len() + 1..];
            rest.split(';').next().unwrap_or("").to_string()
        })
}
