//! Materialized row-count metadata
//!
//! Stored inside each frozen database. A known-zero count lets a query
//! short-circuit to an empty result without scanning the frozen table.

use sqlx::Postgres;

/// Creates the row-count table in a freshly created frozen database.
pub async fn ensure_table<'c, E>(exe: E) -> Result<(), sqlx::Error>
where
    E: sqlx::Executor<'c, Database = Postgres>,
{
    let query = indoc::indoc! {r#"
        CREATE TABLE IF NOT EXISTS materialized_row_counts (
            table_name TEXT PRIMARY KEY,
            row_count BIGINT NOT NULL
        )
    "#};
    sqlx::query(query).execute(exe).await?;
    Ok(())
}

/// Records the row count copied into a frozen table.
pub async fn set<'c, E>(exe: E, table_name: &str, row_count: i64) -> Result<(), sqlx::Error>
where
    E: sqlx::Executor<'c, Database = Postgres>,
{
    let query = indoc::indoc! {r#"
        INSERT INTO materialized_row_counts (table_name, row_count)
        VALUES ($1, $2)
        ON CONFLICT (table_name) DO UPDATE SET row_count = EXCLUDED.row_count
    "#};
    sqlx::query(query)
        .bind(table_name)
        .bind(row_count)
        .execute(exe)
        .await?;
    Ok(())
}

/// The persisted row count for a frozen table, if recorded.
pub async fn get<'c, E>(exe: E, table_name: &str) -> Result<Option<i64>, sqlx::Error>
where
    E: sqlx::Executor<'c, Database = Postgres>,
{
    let query = indoc::indoc! {r#"
        SELECT row_count
        FROM materialized_row_counts
        WHERE table_name = $1
    "#};
    sqlx::query_scalar(query)
        .bind(table_name)
        .fetch_optional(exe)
        .await
}
