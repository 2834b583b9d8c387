//! Relational store layer for annotation and segmentation data.
//!
//! One [`AnnotationDb`] wraps the pool of a single logical database; the
//! process-wide [`DbPools`] registry hands them out per database name so
//! snapshot databases share nothing with the live one except the server.

use chrono::{DateTime, Utc};
use tracing::instrument;

pub mod annotations;
pub mod cell;
mod conn;
pub mod row_counts;
pub mod schema;
pub mod segmentation;
pub mod tables;
pub mod upsert;
pub mod versions;
pub mod wkb;

pub use self::{
    cell::{Cell, CellError},
    conn::{ConnError, DbConnPool, DbPools, DEFAULT_POOL_SIZE},
    schema::{ColumnDesc, ColumnKind, TableSchema},
    segmentation::SegmentationTableMeta,
    tables::VersionedTable,
    versions::{Version, VersionId},
};

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Error connecting to annotation db: {0}")]
    ConnectionError(#[source] sqlx::Error),

    #[error("Error running migrations: {0}")]
    MigrationError(#[from] sqlx::migrate::MigrateError),

    #[error("Error executing database query: {0}")]
    DbError(#[from] sqlx::Error),

    #[error("Error decoding row value: {0}")]
    CellError(#[from] CellError),

    #[error("Invalid database url: {0}")]
    InvalidUrl(url::Url),
}

impl Error {
    /// Returns `true` if the error is likely to be a transient connection issue.
    ///
    /// This is used to determine if an operation should be retried. Constraint
    /// violations and other database-side errors are not considered transient.
    pub fn is_connection_error(&self) -> bool {
        match self {
            Error::ConnectionError(_) => true,
            Error::DbError(err) => matches!(
                err,
                sqlx::Error::Io(_)
                    | sqlx::Error::Tls(_)
                    | sqlx::Error::PoolTimedOut
                    | sqlx::Error::PoolClosed
            ),
            _ => false,
        }
    }
}

impl From<ConnError> for Error {
    fn from(err: ConnError) -> Self {
        match err {
            ConnError::ConnectionError(err) => Error::ConnectionError(err),
            ConnError::MigrationFailed(err) => Error::MigrationError(err),
            ConnError::InvalidUrl(url) => Error::InvalidUrl(url),
        }
    }
}

/// Handle to one logical database. Clones share the same pool.
#[derive(Debug, Clone)]
pub struct AnnotationDb {
    pool: DbConnPool,
    database: String,
}

impl AnnotationDb {
    /// Opens (or reuses) the pool for a logical database name.
    ///
    /// Does not run migrations; snapshot databases get their tables from the
    /// freeze workflow, not from the migrator.
    #[instrument(skip(pools), err)]
    pub async fn open(pools: &DbPools, database: &str) -> Result<Self, Error> {
        let pool = pools.get(database).await?;
        Ok(Self {
            pool,
            database: database.to_owned(),
        })
    }

    /// Opens the live database and runs migrations for the metadata tables.
    #[instrument(skip(pools), err)]
    pub async fn open_live(pools: &DbPools, database: &str) -> Result<Self, Error> {
        let db = Self::open(pools, database).await?;
        db.pool.run_migrations().await?;
        Ok(db)
    }

    pub fn pool(&self) -> &DbConnPool {
        &self.pool
    }

    pub fn database(&self) -> &str {
        &self.database
    }
}

/// Version metadata API
impl AnnotationDb {
    /// Allocates the next version number in a namespace and inserts the record.
    #[instrument(skip(self), err)]
    pub async fn create_version(
        &self,
        namespace: &str,
        time_stamp: DateTime<Utc>,
        expires_on: Option<DateTime<Utc>>,
        is_merged: bool,
    ) -> Result<Version, Error> {
        Ok(versions::create(&**self.pool(), namespace, time_stamp, expires_on, is_merged).await?)
    }

    /// Inserts a derived version sharing its parent's timestamp and number.
    #[instrument(skip(self, parent), err)]
    pub async fn create_derived_version(
        &self,
        namespace: &str,
        parent: &Version,
        expires_on: Option<DateTime<Utc>>,
    ) -> Result<Version, Error> {
        Ok(versions::create_derived(&**self.pool(), namespace, parent, expires_on).await?)
    }

    pub async fn get_version(
        &self,
        namespace: &str,
        version: i32,
    ) -> Result<Option<Version>, Error> {
        Ok(versions::get(&**self.pool(), namespace, version).await?)
    }

    pub async fn list_valid_versions(&self, namespace: &str) -> Result<Vec<Version>, Error> {
        Ok(versions::list_valid(&**self.pool(), namespace).await?)
    }

    /// The nearest valid versions strictly before and strictly after the
    /// timestamp.
    pub async fn closest_versions(
        &self,
        namespace: &str,
        timestamp: DateTime<Utc>,
    ) -> Result<(Option<Version>, Option<Version>), Error> {
        let past = versions::closest_past(&**self.pool(), namespace, timestamp).await?;
        let future = versions::closest_future(&**self.pool(), namespace, timestamp).await?;
        Ok((past, future))
    }

    pub async fn mark_version_invalid(&self, id: VersionId) -> Result<(), Error> {
        Ok(versions::mark_invalid(&**self.pool(), id).await?)
    }

    pub async fn set_version_expiration(
        &self,
        id: VersionId,
        expires_on: DateTime<Utc>,
    ) -> Result<(), Error> {
        Ok(versions::set_expiration(&**self.pool(), id, expires_on).await?)
    }
}

/// Table-in-version metadata API
impl AnnotationDb {
    /// Registers a table under a version; `false` when already registered.
    #[instrument(skip(self), err)]
    pub async fn register_version_table(
        &self,
        version_id: VersionId,
        table_name: &str,
        schema_type: &str,
        created: DateTime<Utc>,
    ) -> Result<bool, Error> {
        Ok(tables::register(&**self.pool(), version_id, table_name, schema_type, created).await?)
    }

    pub async fn version_tables(&self, version_id: VersionId) -> Result<Vec<VersionedTable>, Error> {
        Ok(tables::list_for_version(&**self.pool(), version_id).await?)
    }
}

/// Segmentation metadata API
impl AnnotationDb {
    /// Inserts the metadata row for a segmentation table unless present.
    #[instrument(skip(self, meta), fields(table = %meta.table_name), err)]
    pub async fn register_segmentation_table(
        &self,
        meta: &SegmentationTableMeta,
    ) -> Result<bool, Error> {
        Ok(segmentation::register(&**self.pool(), meta).await?)
    }

    pub async fn segmentation_table_meta(
        &self,
        table_name: &str,
    ) -> Result<Option<SegmentationTableMeta>, Error> {
        Ok(segmentation::get(&**self.pool(), table_name).await?)
    }

    #[instrument(skip(self), err)]
    pub async fn set_segmentation_last_updated(
        &self,
        table_name: &str,
        last_updated: DateTime<Utc>,
    ) -> Result<(), Error> {
        Ok(segmentation::set_last_updated(&**self.pool(), table_name, last_updated).await?)
    }
}

/// Annotation table API
impl AnnotationDb {
    pub async fn valid_annotation_tables(
        &self,
    ) -> Result<Vec<annotations::AnnotationTableInfo>, Error> {
        Ok(annotations::list_valid(&**self.pool()).await?)
    }

    pub async fn annotation_table_info(
        &self,
        table_name: &str,
    ) -> Result<Option<annotations::AnnotationTableInfo>, Error> {
        Ok(annotations::get(&**self.pool(), table_name).await?)
    }

    pub async fn max_annotation_id(&self, table_name: &str) -> Result<Option<i64>, Error> {
        Ok(annotations::max_id(&**self.pool(), table_name).await?)
    }

    pub async fn table_schema(&self, table_name: &str) -> Result<TableSchema, Error> {
        Ok(TableSchema::introspect(self.pool(), table_name).await?)
    }
}
