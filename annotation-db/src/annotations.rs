//! Annotation table registry queries
//!
//! The annotation tables themselves are created by the ingest side and only
//! read here; this module covers the registry rows describing them plus the
//! handful of whole-table scans the materialization workflows need.

use chrono::{DateTime, Utc};
use sqlx::Postgres;

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct AnnotationTableInfo {
    pub table_name: String,

    pub schema_type: String,

    pub valid: bool,

    pub created: DateTime<Utc>,

    /// Bumped whenever rows are inserted or marked deleted.
    pub last_modified: DateTime<Utc>,

    pub voxel_resolution_x: f64,
    pub voxel_resolution_y: f64,
    pub voxel_resolution_z: f64,
}

impl AnnotationTableInfo {
    pub fn voxel_resolution(&self) -> [f64; 3] {
        [
            self.voxel_resolution_x,
            self.voxel_resolution_y,
            self.voxel_resolution_z,
        ]
    }
}

/// Lists the valid annotation tables of the database.
pub async fn list_valid<'c, E>(exe: E) -> Result<Vec<AnnotationTableInfo>, sqlx::Error>
where
    E: sqlx::Executor<'c, Database = Postgres>,
{
    let query = indoc::indoc! {r#"
        SELECT table_name, schema_type, valid, created, last_modified,
               voxel_resolution_x, voxel_resolution_y, voxel_resolution_z
        FROM annotation_tables
        WHERE valid = TRUE
        ORDER BY table_name ASC
    "#};
    sqlx::query_as(query).fetch_all(exe).await
}

/// Gets the registry row for one annotation table.
pub async fn get<'c, E>(
    exe: E,
    table_name: &str,
) -> Result<Option<AnnotationTableInfo>, sqlx::Error>
where
    E: sqlx::Executor<'c, Database = Postgres>,
{
    let query = indoc::indoc! {r#"
        SELECT table_name, schema_type, valid, created, last_modified,
               voxel_resolution_x, voxel_resolution_y, voxel_resolution_z
        FROM annotation_tables
        WHERE table_name = $1
    "#};
    sqlx::query_as(query)
        .bind(table_name)
        .fetch_optional(exe)
        .await
}

/// The highest row id in an annotation table, or `None` when it is empty.
///
/// Chunk ranges for the resolution pipeline are computed from this value.
pub async fn max_id<'c, E>(exe: E, table_name: &str) -> Result<Option<i64>, sqlx::Error>
where
    E: sqlx::Executor<'c, Database = Postgres>,
{
    let query = format!("SELECT MAX(id) FROM \"{table_name}\"");
    sqlx::query_scalar(&query).fetch_one(exe).await
}

/// Counts the rows of a table. Used to persist frozen row counts.
pub async fn row_count<'c, E>(exe: E, table_name: &str) -> Result<i64, sqlx::Error>
where
    E: sqlx::Executor<'c, Database = Postgres>,
{
    let query = format!("SELECT COUNT(*) FROM \"{table_name}\"");
    sqlx::query_scalar(&query).fetch_one(exe).await
}
