//! Authenticated API endpoints.
//!
//! Every `/api/*` request passes through `require_auth`, which verifies the
//! stored token (refreshing it once if needed), resolves the impersonated
//! cluster client for the identity and attaches both to the request before
//! the handler runs.

use std::sync::Arc;

use axum::extract::{Path, Request, State};
use axum::http::StatusCode;
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Extension, Json, Router};
use axum_extra::extract::cookie::CookieJar;
use serde::Serialize;
use tracing::{debug, error};

use crate::auth::{ApiAuthOutcome, Details};
use crate::kubeclient::ImpersonatedClient;
use crate::state::AppState;

use super::HTTPError;

pub fn routes(state: AppState) -> Router<AppState> {
    Router::new()
        .route("/api/me", get(me))
        .route("/api/namespaces", get(namespaces))
        .route("/api/namespaces/:namespace/permissions", get(permissions))
        .layer(middleware::from_fn_with_state(state, require_auth))
}

async fn require_auth(
    State(state): State<AppState>,
    jar: CookieJar,
    mut request: Request,
    next: Next,
) -> Response {
    match state.authenticator.authenticate_api(&jar).await {
        ApiAuthOutcome::Authenticated {
            details,
            refreshed_storage,
        } => {
            let client = match state.clients.get_client(&details) {
                Ok(client) => client,
                Err(e) => {
                    error!(username = %details.username, "Failed to build impersonated client: {}", e);
                    return HTTPError::new(
                        StatusCode::INTERNAL_SERVER_ERROR,
                        "Failed to resolve cluster access",
                    )
                    .into_response();
                }
            };
            debug!(username = %details.username, "Authenticated API request");
            request.extensions_mut().insert(details);
            request.extensions_mut().insert(client);
            let response = next.run(request).await;

            // Rotate the storage cookies when the token was refreshed.
            if let Some(sealed) = refreshed_storage {
                match state.authenticator.cookies.set_storage(CookieJar::new(), &sealed) {
                    Ok(jar) => (jar, response).into_response(),
                    Err(e) => {
                        error!("Failed to rewrite refreshed storage cookies: {}", e);
                        response
                    }
                }
            } else {
                response
            }
        }
        ApiAuthOutcome::Unauthorized { clear_storage } => {
            let unauthorized =
                HTTPError::new(StatusCode::UNAUTHORIZED, "Unauthorized access").into_response();
            if clear_storage {
                let jar = state.authenticator.cookies.clear_storage(CookieJar::new());
                (jar, unauthorized).into_response()
            } else {
                unauthorized
            }
        }
    }
}

#[derive(Serialize)]
struct MeResponse {
    profile_name: String,
    username: String,
    groups: Vec<String>,
}

/// The authenticated identity, as the frontend displays it.
async fn me(Extension(details): Extension<Details>) -> Json<MeResponse> {
    Json(MeResponse {
        profile_name: details.profile_name,
        username: details.username,
        groups: details.groups,
    })
}

#[derive(Serialize)]
struct NamespacesResponse {
    namespaces: Vec<String>,
    cluster_wide: bool,
}

/// Namespaces the identity may see, filtered by access rights.
async fn namespaces(
    State(state): State<AppState>,
    Extension(details): Extension<Details>,
    Extension(client): Extension<Arc<ImpersonatedClient>>,
) -> Result<Json<NamespacesResponse>, HTTPError> {
    let entry = state
        .clients
        .list_accessible_namespaces(&details, &client)
        .await
        .map_err(|e| {
            error!(username = %details.username, "Namespace listing failed: {}", e);
            HTTPError::new(
                StatusCode::INTERNAL_SERVER_ERROR,
                "Failed to list namespaces",
            )
        })?;
    Ok(Json(NamespacesResponse {
        namespaces: entry.namespaces,
        cluster_wide: entry.cluster_wide,
    }))
}

#[derive(Serialize)]
struct PermissionsResponse {
    patch: bool,
}

/// What the identity may do in a namespace; the frontend uses this to decide
/// which controls to render.
async fn permissions(
    State(state): State<AppState>,
    Path(namespace): Path<String>,
    Extension(client): Extension<Arc<ImpersonatedClient>>,
) -> Result<Json<PermissionsResponse>, HTTPError> {
    let patch = state
        .clients
        .can_patch_resource(Some(&client), &namespace)
        .await
        .map_err(|e| {
            error!("Access review failed: {}", e);
            HTTPError::new(StatusCode::INTERNAL_SERVER_ERROR, "Access review failed")
        })?;
    Ok(Json(PermissionsResponse { patch }))
}
