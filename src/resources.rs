//! Reference data a registration form reads while offline.
//!
//! Fetched from the server while connected and served from the local cache
//! afterwards, so the form can offer identifier types, relationship types and
//! the address layout with no network.

use crate::db::{CachedResource, ResourceCache};
use crate::models::ResourceKind;
use crate::sync::{HttpSubmitter, SubmitError};

#[derive(Debug, thiserror::Error)]
pub enum ResourceError {
    #[error("Resource cache unavailable: {0}")]
    Cache(#[from] sqlx::Error),

    #[error("Could not fetch {kind}: {source}")]
    Fetch {
        kind: ResourceKind,
        source: SubmitError,
    },

    #[error("No remote server configured")]
    NoRemote,

    #[error("{0} has not been fetched yet; connect once to prefetch it")]
    NotCached(ResourceKind),
}

/// Outcome of refreshing every resource kind
#[derive(Debug, Default)]
pub struct RefreshReport {
    pub refreshed: Vec<ResourceKind>,
    pub failed: Vec<(ResourceKind, String)>,
}

#[derive(Clone)]
pub struct OfflineResources {
    cache: ResourceCache,
    remote: Option<HttpSubmitter>,
}

impl OfflineResources {
    pub fn new(cache: ResourceCache, remote: Option<HttpSubmitter>) -> Self {
        Self { cache, remote }
    }

    /// Fetches one resource and replaces the cached copy.
    pub async fn refresh(&self, kind: ResourceKind) -> Result<CachedResource, ResourceError> {
        let remote = self.remote.as_ref().ok_or(ResourceError::NoRemote)?;
        let body = remote
            .get_json(kind.endpoint())
            .await
            .map_err(|source| ResourceError::Fetch { kind, source })?;

        self.cache.put(kind, &body).await?;
        tracing::debug!(%kind, "offline resource refreshed");

        self.cache
            .get(kind)
            .await?
            .ok_or(ResourceError::NotCached(kind))
    }

    /// Refreshes every kind; one failure does not stop the others.
    pub async fn refresh_all(&self) -> RefreshReport {
        let mut report = RefreshReport::default();
        for kind in ResourceKind::ALL {
            match self.refresh(kind).await {
                Ok(_) => report.refreshed.push(kind),
                Err(e) => {
                    tracing::warn!(%kind, error = %e, "could not refresh offline resource");
                    report.failed.push((kind, e.to_string()));
                }
            }
        }
        report
    }

    /// The cached copy only; never touches the network.
    pub async fn cached(&self, kind: ResourceKind) -> Result<CachedResource, ResourceError> {
        self.cache
            .get(kind)
            .await?
            .ok_or(ResourceError::NotCached(kind))
    }

    /// A fresh copy when the server answers, the cached copy otherwise.
    pub async fn load(&self, kind: ResourceKind) -> Result<CachedResource, ResourceError> {
        match self.refresh(kind).await {
            Ok(resource) => Ok(resource),
            Err(e @ ResourceError::Cache(_)) => Err(e),
            Err(e) => {
                tracing::debug!(%kind, error = %e, "serving cached resource");
                self.cached(kind).await
            }
        }
    }
}
