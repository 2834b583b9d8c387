//! HTTP clients for the external lookup services.
//!
//! Both peers are stateless and retryable; responses are only meaningful for
//! the timestamp they were requested at. Client instances are cached per
//! segmentation-source key through [`ClientRegistry`].

use std::sync::Arc;

use url::Url;

pub mod cache;
pub mod graph;
pub mod volume;

pub use self::{
    cache::KeyedCache,
    graph::GraphClient,
    volume::VolumeClient,
};

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Error calling lookup service: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Invalid service endpoint: {0}")]
    InvalidEndpoint(String),

    #[error("Graph service answered {received} roots for {sent} supervoxels")]
    BatchSizeMismatch { sent: usize, received: usize },
}

impl Error {
    /// Whether retrying the call could help.
    pub fn is_transient(&self) -> bool {
        match self {
            Error::Http(err) => {
                err.is_timeout()
                    || err.is_connect()
                    || err
                        .status()
                        .map_or(false, |status| status.is_server_error())
            }
            _ => false,
        }
    }
}

/// Caches one graph and one volume client per segmentation source.
///
/// Owned by the process and passed by reference into the workflows; clients
/// are cheap to clone (they share the underlying HTTP connection pool).
pub struct ClientRegistry {
    graph_base_url: Url,
    volume_base_url: Url,
    graph_clients: KeyedCache<Arc<GraphClient>>,
    volume_clients: KeyedCache<Arc<VolumeClient>>,
}

impl ClientRegistry {
    pub fn new(graph_base_url: Url, volume_base_url: Url) -> Self {
        Self {
            graph_base_url,
            volume_base_url,
            graph_clients: KeyedCache::new(),
            volume_clients: KeyedCache::new(),
        }
    }

    /// The graph client for a graph-service table.
    pub fn graph(&self, table: &str) -> Arc<GraphClient> {
        self.graph_clients
            .get_or_try_insert_with::<std::convert::Infallible>(table, || {
                Ok(Arc::new(GraphClient::new(
                    self.graph_base_url.clone(),
                    table,
                )))
            })
            .unwrap_or_else(|infallible| match infallible {})
    }

    /// The volume client for a segmentation source.
    pub fn volume(&self, source: &str) -> Arc<VolumeClient> {
        self.volume_clients
            .get_or_try_insert_with::<std::convert::Infallible>(source, || {
                Ok(Arc::new(VolumeClient::new(
                    self.volume_base_url.clone(),
                    source,
                )))
            })
            .unwrap_or_else(|infallible| match infallible {})
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn registry_reuses_clients_per_key() {
        let registry = ClientRegistry::new(
            "https://graph.example.com/".parse().unwrap(),
            "https://volume.example.com/".parse().unwrap(),
        );

        let first = registry.graph("minnie3_v1");
        let second = registry.graph("minnie3_v1");
        let other = registry.graph("pinky100");

        assert!(Arc::ptr_eq(&first, &second));
        assert!(!Arc::ptr_eq(&first, &other));
    }
}
