//! Health check endpoint.

use axum::response::IntoResponse;
use axum::routing::get;
use axum::Router;

use crate::state::AppState;

pub fn routes() -> Router<AppState> {
    Router::new().route("/healthz", get(health_check))
}

async fn health_check() -> impl IntoResponse {
    "OK"
}
