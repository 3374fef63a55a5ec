//! OAuth2 endpoints: authorize redirect, provider callback, logout.

use axum::extract::{RawQuery, State};
use axum::response::Response;
use axum::routing::{get, post};
use axum::Router;
use axum_extra::extract::cookie::CookieJar;

use crate::state::AppState;

pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/oauth2/authorize", get(authorize))
        .route("/oauth2/callback", get(callback))
        // Method routing answers 405 for anything but POST.
        .route("/logout", post(logout))
}

/// Starts a login attempt: mints login state and redirects to the provider.
/// An `originalPath` query parameter requests the post-login redirect target.
async fn authorize(
    State(state): State<AppState>,
    jar: CookieJar,
    RawQuery(query): RawQuery,
) -> Response {
    state.authenticator.authorize(jar, query.as_deref()).await
}

/// Completes a login attempt and redirects back to the original path, whether
/// the attempt succeeded or not.
async fn callback(
    State(state): State<AppState>,
    jar: CookieJar,
    RawQuery(query): RawQuery,
) -> Response {
    state.authenticator.callback(jar, query.as_deref()).await
}

/// Clears all storage cookies.
async fn logout(State(state): State<AppState>, jar: CookieJar) -> Response {
    state.authenticator.logout(jar)
}
