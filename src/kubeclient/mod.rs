//! Cluster API seam.
//!
//! The dashboard talks to the cluster through these traits; the concrete
//! transport (kube config handling, informer caches, wire protocol) lives
//! outside this crate and is injected at startup.

pub mod cache;
pub mod memory;

pub use cache::{ClientCache, ImpersonatedClient, NamespaceAccessEntry};

use std::sync::Arc;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ClusterError {
    #[error("cluster API error: {0}")]
    Api(String),
    #[error("failed to build impersonated client: {0}")]
    Construction(String),
}

/// Impersonation headers attached to every request made as an identity.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImpersonationConfig {
    pub username: String,
    /// Sorted; the canonical cache key depends on it.
    pub groups: Vec<String>,
}

/// A resource kind an access review can name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AccessTarget {
    pub group: String,
    pub resource: String,
}

/// One SelfSubjectAccessReview-equivalent question: can the calling identity
/// perform `verb` on `target`, optionally scoped to a namespace.
#[derive(Debug, Clone)]
pub struct AccessReview<'a> {
    pub verb: &'a str,
    pub target: &'a AccessTarget,
    pub namespace: Option<&'a str>,
}

/// Read access to the cluster, either direct or through a shared read cache.
#[async_trait::async_trait]
pub trait ClusterReader: Send + Sync {
    async fn list_namespaces(&self) -> Result<Vec<String>, ClusterError>;
    async fn can_i(&self, review: &AccessReview<'_>) -> Result<bool, ClusterError>;
}

/// Resource kinds excluded from a shared read cache. Secrets and config maps
/// stay out so one identity's cached reads never leak to another.
#[derive(Debug, Clone)]
pub struct CacheOptions {
    pub exclude_resources: Vec<String>,
}

impl Default for CacheOptions {
    fn default() -> Self {
        CacheOptions {
            exclude_resources: vec!["secrets".to_string(), "configmaps".to_string()],
        }
    }
}

/// Builds per-identity API accessors over the underlying transport.
pub trait TransportFactory: Send + Sync {
    /// An uncached reader issuing requests directly, as `impersonation`.
    fn direct(
        &self,
        impersonation: &ImpersonationConfig,
    ) -> Result<Arc<dyn ClusterReader>, ClusterError>;

    /// A reader backed by the shared read cache, as `impersonation`, with the
    /// given kinds excluded from caching.
    fn cached(
        &self,
        impersonation: &ImpersonationConfig,
        options: &CacheOptions,
    ) -> Result<Arc<dyn ClusterReader>, ClusterError>;
}
