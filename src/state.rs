//! Shared application state.
//!
//! The dependency-injection root: every piece with lifecycle or caches lives
//! here behind an `Arc` and is cloned into request handlers.

use std::sync::Arc;

use crate::auth::{Authenticator, OidcProvider};
use crate::config::ConfigV1;
use crate::kubeclient::ClientCache;

/// Application state shared across all HTTP handlers.
#[derive(Clone)]
pub struct AppState {
    /// Application configuration loaded at startup.
    pub config: Arc<ConfigV1>,
    /// The OAuth2 authenticator driving login and API authentication.
    pub authenticator: Arc<Authenticator>,
    /// Background-refreshed OIDC discovery state.
    pub provider: Arc<OidcProvider>,
    /// Per-identity impersonated client and namespace-access caches.
    pub clients: Arc<ClientCache>,
}
