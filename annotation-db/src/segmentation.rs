//! Segmentation table metadata
//!
//! Every annotation table gets a companion segmentation table per graph
//! source, named `{annotation_table}__{graph_table}`. The metadata row tracks
//! when the resolution pipeline last brought the companion up to date, which
//! is what decides whether a temporal query needs a live delta.

use chrono::{DateTime, Utc};
use sqlx::Postgres;

/// Builds the segmentation-table name for an annotation table and graph source.
pub fn segmentation_table_name(annotation_table: &str, graph_table: &str) -> String {
    format!("{annotation_table}__{graph_table}")
}

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct SegmentationTableMeta {
    /// Segmentation table name.
    pub table_name: String,

    /// The annotation table this segmentation data belongs to.
    pub annotation_table: String,

    pub schema_type: String,

    /// Graph-service table the root ids are resolved against.
    pub graph_table: String,

    pub valid: bool,

    pub created: DateTime<Utc>,

    /// When the resolution pipeline last completed for this table. `None`
    /// until the first run finishes.
    pub last_updated: Option<DateTime<Utc>>,
}

/// Inserts the metadata row for a segmentation table unless it exists.
///
/// Returns `false` when the row was already present.
pub async fn register<'c, E>(
    exe: E,
    meta: &SegmentationTableMeta,
) -> Result<bool, sqlx::Error>
where
    E: sqlx::Executor<'c, Database = Postgres>,
{
    let query = indoc::indoc! {r#"
        INSERT INTO segmentation_metadata
            (table_name, annotation_table, schema_type, graph_table, valid, created, last_updated)
        VALUES ($1, $2, $3, $4, $5, $6, $7)
        ON CONFLICT (table_name) DO NOTHING
    "#};
    let result = sqlx::query(query)
        .bind(&meta.table_name)
        .bind(&meta.annotation_table)
        .bind(&meta.schema_type)
        .bind(&meta.graph_table)
        .bind(meta.valid)
        .bind(meta.created)
        .bind(meta.last_updated)
        .execute(exe)
        .await?;
    Ok(result.rows_affected() > 0)
}

pub async fn get<'c, E>(
    exe: E,
    table_name: &str,
) -> Result<Option<SegmentationTableMeta>, sqlx::Error>
where
    E: sqlx::Executor<'c, Database = Postgres>,
{
    let query = indoc::indoc! {r#"
        SELECT table_name, annotation_table, schema_type, graph_table, valid, created, last_updated
        FROM segmentation_metadata
        WHERE table_name = $1
    "#};
    sqlx::query_as(query)
        .bind(table_name)
        .fetch_optional(exe)
        .await
}

/// Records the completion timestamp of a resolution run.
pub async fn set_last_updated<'c, E>(
    exe: E,
    table_name: &str,
    last_updated: DateTime<Utc>,
) -> Result<(), sqlx::Error>
where
    E: sqlx::Executor<'c, Database = Postgres>,
{
    let query = indoc::indoc! {r#"
        UPDATE segmentation_metadata
        SET last_updated = $1
        WHERE table_name = $2
    "#};
    sqlx::query(query)
        .bind(last_updated)
        .bind(table_name)
        .execute(exe)
        .await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn table_name_joins_annotation_and_graph() {
        assert_eq!(
            segmentation_table_name("synapses", "minnie3_v1"),
            "synapses__minnie3_v1"
        );
    }
}
