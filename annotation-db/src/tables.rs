//! Table-in-version metadata

use chrono::{DateTime, Utc};
use sqlx::Postgres;

use super::versions::VersionId;

/// A table frozen into a specific version.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct VersionedTable {
    pub id: i64,

    /// Owning version.
    pub version_id: VersionId,

    /// Table name, unique within the version.
    pub table_name: String,

    /// Schema identifier the table was created from.
    pub schema_type: String,

    pub valid: bool,

    pub created: DateTime<Utc>,
}

/// Registers a table under a version, unless it is already registered.
///
/// Returns `false` if a row for the `(version, table)` pair already existed.
/// The existence guard keeps snapshot creation idempotent across re-runs.
pub async fn register<'c, E>(
    exe: E,
    version_id: VersionId,
    table_name: &str,
    schema_type: &str,
    created: DateTime<Utc>,
) -> Result<bool, sqlx::Error>
where
    E: sqlx::Executor<'c, Database = Postgres>,
{
    let query = indoc::indoc! {r#"
        INSERT INTO version_tables (version_id, table_name, schema_type, valid, created)
        VALUES ($1, $2, $3, TRUE, $4)
        ON CONFLICT (version_id, table_name) DO NOTHING
    "#};
    let result = sqlx::query(query)
        .bind(version_id)
        .bind(table_name)
        .bind(schema_type)
        .bind(created)
        .execute(exe)
        .await?;
    Ok(result.rows_affected() > 0)
}

/// Lists the valid tables registered under a version, by name.
pub async fn list_for_version<'c, E>(
    exe: E,
    version_id: VersionId,
) -> Result<Vec<VersionedTable>, sqlx::Error>
where
    E: sqlx::Executor<'c, Database = Postgres>,
{
    let query = indoc::indoc! {r#"
        SELECT id, version_id, table_name, schema_type, valid, created
        FROM version_tables
        WHERE version_id = $1 AND valid = TRUE
        ORDER BY table_name ASC
    "#};
    sqlx::query_as(query).bind(version_id).fetch_all(exe).await
}

/// Gets one table's registration under a version.
pub async fn get<'c, E>(
    exe: E,
    version_id: VersionId,
    table_name: &str,
) -> Result<Option<VersionedTable>, sqlx::Error>
where
    E: sqlx::Executor<'c, Database = Postgres>,
{
    let query = indoc::indoc! {r#"
        SELECT id, version_id, table_name, schema_type, valid, created
        FROM version_tables
        WHERE version_id = $1 AND table_name = $2
    "#};
    sqlx::query_as(query)
        .bind(version_id)
        .bind(table_name)
        .fetch_optional(exe)
        .await
}
