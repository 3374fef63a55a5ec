//! Per-identity client cache and namespace access filtering.
//!
//! Two caches with deliberately different consistency:
//! - the client cache is atomic get-or-create (lock held across the cheap,
//!   synchronous construction) over a bounded LRU of immutable entries;
//! - the namespace cache is cache-aside with a TTL: concurrent misses may
//!   recompute redundantly, but no caller ever waits on another's multi-call
//!   network recompute.

use std::sync::{Arc, Mutex};

use cached::stores::{SizedCache, TimedCache};
use cached::Cached;
use chrono::{DateTime, Utc};
use tracing::debug;

use crate::auth::claims::Details;

use super::{
    AccessReview, AccessTarget, CacheOptions, ClusterError, ClusterReader, ImpersonationConfig,
    TransportFactory,
};

/// API accessors bound to one identity's impersonation headers. Immutable
/// after construction; evicted only by LRU pressure.
pub struct ImpersonatedClient {
    pub impersonation: ImpersonationConfig,
    /// Direct, uncached reads.
    pub reader: Arc<dyn ClusterReader>,
    /// Reads through the shared cache, secrets and config maps excluded.
    pub cached: Arc<dyn ClusterReader>,
}

/// One identity's namespace visibility, valid for the cache TTL.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NamespaceAccessEntry {
    /// Sorted.
    pub namespaces: Vec<String>,
    /// The identity passed the cluster-wide check; no per-namespace filtering
    /// was applied.
    pub cluster_wide: bool,
    pub cached_at: DateTime<Utc>,
}

pub struct ClientCache {
    factory: Arc<dyn TransportFactory>,
    /// The service's own unimpersonated client, used for the full namespace
    /// listing and privileged short-circuits.
    privileged: Arc<dyn ClusterReader>,
    /// The kind probed by the cluster-wide access check.
    operator_target: AccessTarget,
    clients: Mutex<SizedCache<String, Arc<ImpersonatedClient>>>,
    namespaces: Mutex<TimedCache<String, NamespaceAccessEntry>>,
}

impl ClientCache {
    pub fn new(
        factory: Arc<dyn TransportFactory>,
        privileged: Arc<dyn ClusterReader>,
        operator_target: AccessTarget,
        client_capacity: usize,
        namespace_ttl_secs: u64,
    ) -> Self {
        ClientCache {
            factory,
            privileged,
            operator_target,
            // SizedCache panics on a zero capacity; the knob is
            // operator-supplied, so clamp instead.
            clients: Mutex::new(SizedCache::with_size(client_capacity.max(1))),
            namespaces: Mutex::new(TimedCache::with_lifespan(namespace_ttl_secs)),
        }
    }

    /// Memoized client construction. Existing entries are reused
    /// unconditionally; the lock is held across construction so at most one
    /// client is ever built per key.
    pub fn get_client(&self, details: &Details) -> Result<Arc<ImpersonatedClient>, ClusterError> {
        let key = details.cache_key();
        let mut clients = self.clients.lock().expect("client cache lock poisoned");
        if let Some(existing) = clients.cache_get(&key) {
            return Ok(Arc::clone(existing));
        }

        debug!(username = %details.username, "Building impersonated client");
        let impersonation = ImpersonationConfig {
            username: details.username.clone(),
            groups: details.groups.clone(),
        };
        let reader = self.factory.direct(&impersonation)?;
        let cached = self.factory.cached(&impersonation, &CacheOptions::default())?;
        let client = Arc::new(ImpersonatedClient {
            impersonation,
            reader,
            cached,
        });
        clients.cache_set(key, Arc::clone(&client));
        Ok(client)
    }

    /// Namespaces visible to `details`, cache-aside with a TTL.
    ///
    /// On recompute: list every namespace with the privileged client, then one
    /// cluster-wide `get` check as the identity; if allowed, everything is
    /// visible. Otherwise one check per namespace. Concurrent callers missing
    /// the cache recompute redundantly rather than serializing.
    pub async fn list_accessible_namespaces(
        &self,
        details: &Details,
        client: &ImpersonatedClient,
    ) -> Result<NamespaceAccessEntry, ClusterError> {
        let key = details.cache_key();
        {
            let mut cache = self.namespaces.lock().expect("namespace cache lock poisoned");
            if let Some(entry) = cache.cache_get(&key) {
                return Ok(entry.clone());
            }
        }

        let mut all = self.privileged.list_namespaces().await?;
        all.sort_unstable();

        let cluster_wide = client
            .reader
            .can_i(&AccessReview {
                verb: "get",
                target: &self.operator_target,
                namespace: None,
            })
            .await?;

        let namespaces = if cluster_wide {
            all
        } else {
            let mut allowed = Vec::new();
            for namespace in all {
                let ok = client
                    .reader
                    .can_i(&AccessReview {
                        verb: "get",
                        target: &self.operator_target,
                        namespace: Some(&namespace),
                    })
                    .await?;
                if ok {
                    allowed.push(namespace);
                }
            }
            allowed
        };

        let entry = NamespaceAccessEntry {
            namespaces,
            cluster_wide,
            cached_at: Utc::now(),
        };
        self.namespaces
            .lock()
            .expect("namespace cache lock poisoned")
            .cache_set(key, entry.clone());
        Ok(entry)
    }

    /// Can this client patch the operator's resource kind in `namespace`?
    /// `None` means the caller runs with the service's own privileged client,
    /// which is always allowed.
    pub async fn can_patch_resource(
        &self,
        client: Option<&ImpersonatedClient>,
        namespace: &str,
    ) -> Result<bool, ClusterError> {
        let Some(client) = client else {
            return Ok(true);
        };
        client
            .reader
            .can_i(&AccessReview {
                verb: "patch",
                target: &self.operator_target,
                namespace: Some(namespace),
            })
            .await
    }
}
