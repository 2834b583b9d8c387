//! Internal connection and connection pool implementations

use std::{collections::HashMap, sync::Arc, time::Duration};

use sqlx::{
    migrate::{MigrateError, Migrator},
    postgres::PgPoolOptions,
    Pool, Postgres,
};
use tokio::sync::Mutex;
use tracing::instrument;
use url::Url;

/// Default pool size per logical database.
pub const DEFAULT_POOL_SIZE: u32 = 10;

/// Errors that can occur when connecting to an annotation database.
#[derive(Debug, thiserror::Error)]
pub enum ConnError {
    /// Error connecting to the database.
    #[error("Error connecting to annotation db: {0}")]
    ConnectionError(#[source] sqlx::Error),

    /// An error occurred while running migrations.
    #[error("Error running migrations: {0}")]
    MigrationFailed(#[source] MigrateError),

    /// The base URL could not be rewritten for a logical database name.
    #[error("Invalid database url: {0}")]
    InvalidUrl(Url),
}

/// A connection pool to one logical database.
#[derive(Debug, Clone)]
pub struct DbConnPool(Pool<Postgres>);

impl DbConnPool {
    /// Set up a connection pool to a database.
    #[instrument(skip_all, err)]
    pub async fn connect(url: &str, pool_size: u32) -> Result<Self, ConnError> {
        PgPoolOptions::new()
            .max_connections(pool_size)
            .acquire_timeout(Duration::from_secs(5))
            .connect(url)
            .await
            .map(Self)
            .map_err(ConnError::ConnectionError)
    }

    /// Set up a connection pool with exponential backoff retry.
    ///
    /// Retries while receiving error code 57P03 (database starting up). Used
    /// against ephemeral databases that may still be booting.
    #[instrument(skip_all, err)]
    pub async fn connect_with_retry(url: &str, pool_size: u32) -> Result<Self, ConnError> {
        use backon::{ExponentialBuilder, Retryable};

        let retry_policy = ExponentialBuilder::default()
            .with_min_delay(Duration::from_millis(10))
            .with_max_delay(Duration::from_millis(100))
            .with_max_times(20);

        fn is_db_starting_up(err: &ConnError) -> bool {
            matches!(
                err,
                ConnError::ConnectionError(sqlx::Error::Database(db_err))
                if db_err.code().as_deref() == Some("57P03")
            )
        }

        fn notify_retry(err: &ConnError, dur: Duration) {
            tracing::warn!(
                error = %err,
                "Database still starting up during connection. Retrying in {:.1}s",
                dur.as_secs_f32()
            );
        }

        (|| Self::connect(url, pool_size))
            .retry(retry_policy)
            .when(is_db_starting_up)
            .notify(notify_retry)
            .await
    }

    /// Runs migrations on the database.
    ///
    /// SQLx does the right things:
    /// - Locks the DB before running migrations.
    /// - Never runs the same migration twice.
    /// - Errors on changes to old migrations.
    #[instrument(skip(self), err)]
    pub async fn run_migrations(&self) -> Result<(), ConnError> {
        static MIGRATOR: Migrator = sqlx::migrate!();
        MIGRATOR
            .run(&self.0)
            .await
            .map_err(ConnError::MigrationFailed)
    }
}

impl std::ops::Deref for DbConnPool {
    type Target = Pool<Postgres>;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

/// Connection pools keyed by logical database name.
///
/// Snapshot databases live next to the live database on the same server, so a
/// pool is derived from the base URL by swapping the path segment. Pools are
/// created lazily and reused across tasks in the same process.
#[derive(Debug, Clone)]
pub struct DbPools {
    base_url: Url,
    pool_size: u32,
    pools: Arc<Mutex<HashMap<String, DbConnPool>>>,
}

impl DbPools {
    pub fn new(base_url: Url) -> Self {
        Self::with_pool_size(base_url, DEFAULT_POOL_SIZE)
    }

    pub fn with_pool_size(base_url: Url, pool_size: u32) -> Self {
        Self {
            base_url,
            pool_size,
            pools: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// The connection URL for a logical database name.
    pub fn url_for(&self, database: &str) -> Result<Url, ConnError> {
        let mut url = self.base_url.clone();
        url.set_path(database);
        if url.path() != format!("/{database}") {
            return Err(ConnError::InvalidUrl(url));
        }
        Ok(url)
    }

    /// Returns the pool for a logical database, connecting on first use.
    #[instrument(skip(self), err)]
    pub async fn get(&self, database: &str) -> Result<DbConnPool, ConnError> {
        let mut pools = self.pools.lock().await;
        if let Some(pool) = pools.get(database) {
            return Ok(pool.clone());
        }
        let url = self.url_for(database)?;
        let pool = DbConnPool::connect(url.as_str(), self.pool_size).await?;
        pools.insert(database.to_owned(), pool.clone());
        Ok(pool)
    }

    /// Drops the cached pool for a database, closing its connections.
    ///
    /// Used before dropping or recreating a snapshot database.
    pub async fn evict(&self, database: &str) {
        let pool = self.pools.lock().await.remove(database);
        if let Some(pool) = pool {
            pool.close().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn url_for_swaps_database_path() {
        let pools = DbPools::new("postgres://postgres:pw@localhost:5432/live".parse().unwrap());

        let url = pools.url_for("live_v3").unwrap();

        assert_eq!(url.as_str(), "postgres://postgres:pw@localhost:5432/live_v3");
    }
}
