//! In-memory cluster backing.
//!
//! Stands in for the real cluster transport in development mode and in
//! integration tests: a fixed namespace list with per-identity access grants.

use std::collections::HashSet;
use std::sync::Arc;

use super::{
    AccessReview, CacheOptions, ClusterError, ClusterReader, ImpersonationConfig, TransportFactory,
};

#[derive(Default)]
pub struct MemoryCluster {
    namespaces: Vec<String>,
    cluster_wide_users: HashSet<String>,
    grants: HashSet<(String, String)>,
}

impl MemoryCluster {
    pub fn new<I, S>(namespaces: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        MemoryCluster {
            namespaces: namespaces.into_iter().map(Into::into).collect(),
            ..MemoryCluster::default()
        }
    }

    /// Grant `username` the cluster-wide check.
    pub fn with_cluster_wide(mut self, username: impl Into<String>) -> Self {
        self.cluster_wide_users.insert(username.into());
        self
    }

    /// Grant `username` access to one namespace.
    pub fn with_grant(mut self, username: impl Into<String>, namespace: impl Into<String>) -> Self {
        self.grants.insert((username.into(), namespace.into()));
        self
    }

    /// A reader acting as the service itself (sees everything).
    pub fn privileged_reader(self: &Arc<Self>) -> Arc<dyn ClusterReader> {
        Arc::new(MemoryReader {
            cluster: Arc::clone(self),
            username: None,
        })
    }
}

struct MemoryReader {
    cluster: Arc<MemoryCluster>,
    /// `None` means the privileged, unimpersonated service identity.
    username: Option<String>,
}

#[async_trait::async_trait]
impl ClusterReader for MemoryReader {
    async fn list_namespaces(&self) -> Result<Vec<String>, ClusterError> {
        Ok(self.cluster.namespaces.clone())
    }

    async fn can_i(&self, review: &AccessReview<'_>) -> Result<bool, ClusterError> {
        let Some(username) = &self.username else {
            return Ok(true);
        };
        match review.namespace {
            None => Ok(self.cluster.cluster_wide_users.contains(username)),
            Some(ns) => Ok(self
                .cluster
                .grants
                .contains(&(username.clone(), ns.to_string()))),
        }
    }
}

impl TransportFactory for Arc<MemoryCluster> {
    fn direct(
        &self,
        impersonation: &ImpersonationConfig,
    ) -> Result<Arc<dyn ClusterReader>, ClusterError> {
        Ok(Arc::new(MemoryReader {
            cluster: Arc::clone(self),
            username: Some(impersonation.username.clone()),
        }))
    }

    fn cached(
        &self,
        impersonation: &ImpersonationConfig,
        _options: &CacheOptions,
    ) -> Result<Arc<dyn ClusterReader>, ClusterError> {
        // No shared read cache to exclude kinds from in the in-memory backing.
        self.direct(impersonation)
    }
}
