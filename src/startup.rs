//! Application startup and server initialization.
//!
//! Wires the provider lifecycle, authenticator and client cache together,
//! binds the HTTP server and handles graceful shutdown.

use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpListener;
use tracing::info;

use crate::auth::{Authenticator, OidcProvider};
use crate::config::ConfigV1;
use crate::kubeclient::{AccessTarget, ClientCache, ClusterReader, TransportFactory};
use crate::routes;
use crate::state::AppState;

const SHUTDOWN_DEADLINE: Duration = Duration::from_secs(5);

/// The cluster-side collaborators this layer consumes. The concrete transport
/// is built by the embedding control plane.
pub struct ClusterDependencies {
    pub factory: Arc<dyn TransportFactory>,
    /// The service's own unimpersonated client.
    pub privileged: Arc<dyn ClusterReader>,
    /// The operator resource kind probed by access reviews.
    pub operator_target: AccessTarget,
}

/// Initializes and runs the application server.
///
/// Starts the provider's background discovery refresh, builds the
/// authenticator and client cache, and serves until interrupted. On shutdown
/// the provider refresh task is closed with a bounded deadline.
pub async fn run(
    config: Arc<ConfigV1>,
    cluster: ClusterDependencies,
) -> Result<(), Box<dyn std::error::Error>> {
    let provider = Arc::new(OidcProvider::new(config.provider.clone()));
    provider.start().await;

    let authenticator = Arc::new(Authenticator::new(&config, Arc::clone(&provider))?);
    let clients = Arc::new(ClientCache::new(
        cluster.factory,
        cluster.privileged,
        cluster.operator_target,
        config.cache.client_capacity,
        config.cache.namespace_ttl_secs,
    ));

    let state = AppState {
        config: config.clone(),
        authenticator,
        provider: Arc::clone(&provider),
        clients,
    };

    info!("Starting server on {}", config.bind_address);
    let app = routes::create_router(state);
    let listener = TcpListener::bind(&config.bind_address).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    provider.close(SHUTDOWN_DEADLINE).await;
    Ok(())
}

async fn shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
    info!("Shutdown signal received");
}
