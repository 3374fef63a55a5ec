//! HTTP route definitions and handlers.
//!
//! Endpoints are grouped per concern: the OAuth2 flow, the authenticated API,
//! the index page and health checks.

mod api_routes;
mod health_routes;
mod index_routes;
mod oauth_routes;

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Router;

use crate::state::AppState;

/// Creates the application router with all configured routes.
pub fn create_router(state: AppState) -> Router {
    Router::new()
        .merge(oauth_routes::routes())
        .merge(api_routes::routes(state.clone()))
        .merge(index_routes::routes())
        .merge(health_routes::routes())
        .with_state(state)
}

/// A general purpose HTTP error type that can be converted into an `IntoResponse`.
pub struct HTTPError {
    status: StatusCode,
    message: String,
}

impl HTTPError {
    /// Creates a new HTTP error with the given status code and message.
    pub fn new(status: StatusCode, message: impl Into<String>) -> Self {
        HTTPError {
            status,
            message: message.into(),
        }
    }
}

/// Converts our `HTTPError` into an HTTP response.
impl IntoResponse for HTTPError {
    fn into_response(self) -> Response {
        let body = serde_json::json!({ "error": self.message }).to_string();
        Response::builder()
            .status(self.status)
            .header("Content-Type", "application/json")
            .body(body.into())
            .unwrap()
    }
}
