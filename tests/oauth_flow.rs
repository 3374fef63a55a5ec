mod common;

use axum::http::{header, Method, Request, StatusCode};
use axum::body::Body;
use serde_json::json;
use tower::ServiceExt;
use url::Url;

use common::{build_app, get_request, get_request_with_cookies, set_cookie_value, test_config};

async fn mock_discovery(server: &mut mockito::ServerGuard) {
    let base = server.url();
    server
        .mock("GET", "/.well-known/openid-configuration")
        .with_status(200)
        .with_header("content-type", "application/json")
        .with_body(
            json!({
                "issuer": base,
                "authorization_endpoint": format!("{base}/authorize"),
                "token_endpoint": format!("{base}/token"),
                "jwks_uri": format!("{base}/jwks"),
            })
            .to_string(),
        )
        .create_async()
        .await;
    server
        .mock("GET", "/jwks")
        .with_status(200)
        .with_header("content-type", "application/json")
        .with_body(json!({"keys": []}).to_string())
        .create_async()
        .await;
}

#[tokio::test]
async fn health_check_is_open() {
    let app = build_app(test_config("http://idp.invalid")).await;
    let response = app.oneshot(get_request("/healthz")).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
}

#[tokio::test]
async fn index_renders_unauthenticated_without_cookies() {
    let app = build_app(test_config("http://idp.invalid")).await;
    let response = app.oneshot(get_request("/")).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    let html = String::from_utf8(body.to_vec()).unwrap();
    assert!(html.contains("data-authenticated=\"false\""));
    assert!(html.contains("/oauth2/authorize"));
}

#[tokio::test]
async fn api_requires_authentication() {
    let app = build_app(test_config("http://idp.invalid")).await;
    let response = app.oneshot(get_request("/api/me")).await.unwrap();
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn logout_rejects_non_post_methods() {
    let app = build_app(test_config("http://idp.invalid")).await;
    let response = app.clone().oneshot(get_request("/logout")).await.unwrap();
    assert_eq!(response.status(), StatusCode::METHOD_NOT_ALLOWED);

    let post = Request::builder()
        .method(Method::POST)
        .uri("/logout")
        .body(Body::empty())
        .unwrap();
    let response = app.oneshot(post).await.unwrap();
    assert!(response.status().is_redirection());
    // Storage cookies are cleared down to the last chunk slot.
    assert_eq!(set_cookie_value(&response, "auth-storage").as_deref(), Some(""));
    assert_eq!(set_cookie_value(&response, "auth-storage-9").as_deref(), Some(""));
}

#[tokio::test]
async fn authorize_fails_closed_when_provider_uninitialized() {
    // No discovery mocks: the provider never initializes.
    let app = build_app(test_config("http://idp.invalid")).await;
    let response = app.oneshot(get_request("/oauth2/authorize")).await.unwrap();
    assert!(response.status().is_redirection());
    assert_eq!(response.headers().get(header::LOCATION).unwrap(), "/");
    assert!(set_cookie_value(&response, "auth-error").is_some());
}

#[tokio::test]
async fn authorize_redirects_to_provider_with_pkce_state_and_nonce() {
    let mut server = mockito::Server::new_async().await;
    mock_discovery(&mut server).await;
    let app = build_app(test_config(&server.url())).await;

    let response = app
        .oneshot(get_request("/oauth2/authorize?originalPath=/clusters/prod"))
        .await
        .unwrap();
    assert!(response.status().is_redirection());

    let location = response
        .headers()
        .get(header::LOCATION)
        .unwrap()
        .to_str()
        .unwrap();
    let url = Url::parse(location).unwrap();
    assert_eq!(url.path(), "/authorize");
    let pairs: std::collections::HashMap<_, _> = url.query_pairs().into_owned().collect();
    assert_eq!(pairs["response_type"], "code");
    assert_eq!(pairs["client_id"], "dashboard");
    assert_eq!(pairs["code_challenge_method"], "S256");
    assert!(!pairs["code_challenge"].is_empty());
    assert!(!pairs["nonce"].is_empty());

    // The state parameter and the state cookie carry the same sealed value.
    let cookie_state = set_cookie_value(&response, "oauth2-state").unwrap();
    assert_eq!(pairs["state"], cookie_state);
    assert!(set_cookie_value(&response, "auth-provider").is_some());
}

/// Runs authorize, then feeds the resulting state into a callback request
/// with the given extra query parameters.
async fn callback_after_authorize(
    server: &mut mockito::ServerGuard,
    original_path: &str,
    extra_query: &str,
) -> axum::http::Response<Body> {
    mock_discovery(server).await;
    let app = build_app(test_config(&server.url())).await;

    let authorize = app
        .clone()
        .oneshot(get_request(&format!(
            "/oauth2/authorize?originalPath={}",
            original_path
        )))
        .await
        .unwrap();
    let state = set_cookie_value(&authorize, "oauth2-state").unwrap();

    app.oneshot(get_request_with_cookies(
        &format!("/oauth2/callback?state={}&{}", state, extra_query),
        &format!("oauth2-state={}", state),
    ))
    .await
    .unwrap()
}

#[tokio::test]
async fn callback_delivers_provider_errors_via_redirect() {
    let mut server = mockito::Server::new_async().await;
    let response =
        callback_after_authorize(&mut server, "/clusters/prod", "error=access_denied").await;

    assert!(response.status().is_redirection());
    // The original path is recovered from state even on failure.
    assert_eq!(
        response.headers().get(header::LOCATION).unwrap(),
        "/clusters/prod"
    );
    assert!(set_cookie_value(&response, "auth-error").is_some());
}

#[tokio::test]
async fn callback_never_redirects_to_unsafe_targets() {
    let mut server = mockito::Server::new_async().await;
    let response =
        callback_after_authorize(&mut server, "//evil.com", "error=access_denied").await;

    assert!(response.status().is_redirection());
    assert_eq!(response.headers().get(header::LOCATION).unwrap(), "/");
}

#[tokio::test]
async fn callback_without_state_cookie_is_an_expired_attempt() {
    let mut server = mockito::Server::new_async().await;
    mock_discovery(&mut server).await;
    let app = build_app(test_config(&server.url())).await;

    let authorize = app
        .clone()
        .oneshot(get_request("/oauth2/authorize"))
        .await
        .unwrap();
    let state = set_cookie_value(&authorize, "oauth2-state").unwrap();

    // Query state still decodes, but the cookie copy is gone.
    let response = app
        .oneshot(get_request(&format!(
            "/oauth2/callback?state={}&code=abc",
            state
        )))
        .await
        .unwrap();
    assert!(response.status().is_redirection());
    assert!(set_cookie_value(&response, "auth-error").is_some());
}

#[tokio::test]
async fn callback_rejects_mismatched_state() {
    let mut server = mockito::Server::new_async().await;
    mock_discovery(&mut server).await;
    let app = build_app(test_config(&server.url())).await;

    let first = app
        .clone()
        .oneshot(get_request("/oauth2/authorize"))
        .await
        .unwrap();
    let second = app
        .clone()
        .oneshot(get_request("/oauth2/authorize"))
        .await
        .unwrap();
    let state_a = set_cookie_value(&first, "oauth2-state").unwrap();
    let state_b = set_cookie_value(&second, "oauth2-state").unwrap();
    assert_ne!(state_a, state_b);

    let response = app
        .oneshot(get_request_with_cookies(
            &format!("/oauth2/callback?state={}&code=abc", state_a),
            &format!("oauth2-state={}", state_b),
        ))
        .await
        .unwrap();
    assert!(response.status().is_redirection());
    assert!(set_cookie_value(&response, "auth-error").is_some());
}
