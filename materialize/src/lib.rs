//! Materialization workflows.
//!
//! Two entry points: [`live_update::run_live_update`] resolves missing root
//! ids into the live segmentation tables in bounded, parallel, retryable
//! chunks; [`frozen::create_frozen_snapshot`] freezes the resolved state
//! into a versioned read-only database. Both fan out independent units,
//! barrier on all of them, then finalize.

use std::sync::Arc;

use annotation_db::DbPools;
use clients::ClientRegistry;

pub mod chunks;
pub mod config;
pub mod frozen;
pub mod info;
pub mod leases;
pub mod live_update;
pub mod pipeline;
pub mod retry;

pub use self::{
    chunks::{id_chunks, ChunkRange},
    config::Config,
    frozen::{create_frozen_snapshot, create_virtual_version, FrozenReport, FrozenSnapshotOptions},
    info::TableRunInfo,
    leases::{LeaseId, LeaseRegistry},
    live_update::{run_live_update, RunReport},
    pipeline::ChunkStatus,
    retry::{RetryOutcome, RetryPolicy},
};

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error(transparent)]
    Store(#[from] annotation_db::Error),

    #[error(transparent)]
    Query(#[from] query_engine::Error),

    #[error("Lookup service error: {0}")]
    Lookup(#[from] clients::Error),

    #[error("Invalid configuration: {0}")]
    Config(String),

    #[error("scan result is missing column {0}")]
    MissingColumn(String),
}

impl Error {
    /// Whether retrying the operation could help.
    pub fn is_transient(&self) -> bool {
        match self {
            Error::Store(err) => err.is_connection_error(),
            Error::Query(err) => err.is_transient(),
            Error::Lookup(err) => err.is_transient(),
            _ => false,
        }
    }
}

/// Shared context for one workflow run: connection pools per logical
/// database, cached service clients, the lease registry, and configuration.
#[derive(Clone)]
pub struct MatCtx {
    pub pools: DbPools,
    pub clients: Arc<ClientRegistry>,
    pub leases: LeaseRegistry,
    pub config: Config,
}

impl MatCtx {
    pub fn new(config: Config) -> Self {
        let pools = DbPools::new(config.database_url.clone());
        let clients = Arc::new(ClientRegistry::new(
            config.graph_service_url.clone(),
            config.volume_service_url.clone(),
        ));
        Self {
            pools,
            clients,
            leases: LeaseRegistry::new(),
            config,
        }
    }
}
