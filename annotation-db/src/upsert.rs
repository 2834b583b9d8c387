//! Idempotent batch upsert keyed by row id.
//!
//! Re-running the resolution pipeline over a chunk must leave the
//! segmentation table unchanged, so all writes go through an
//! insert-or-update keyed on `id`. Each call commits independently; there is
//! never a transaction spanning more than one chunk.

use sqlx::{PgPool, Postgres, QueryBuilder};
use tracing::instrument;

use crate::cell::Cell;

/// Postgres caps bind parameters per statement at 65535; stay comfortably
/// below it when splitting large chunks into statements.
const MAX_BIND_PARAMS: usize = 60_000;

/// Upserts rows into `table`. The first column must be `id`.
///
/// Returns the number of rows written. An empty `rows` slice is a no-op.
#[instrument(skip(pool, rows), fields(rows = rows.len()), err)]
pub async fn upsert_rows(
    pool: &PgPool,
    table: &str,
    columns: &[String],
    rows: &[Vec<Cell>],
) -> Result<u64, sqlx::Error> {
    debug_assert_eq!(columns.first().map(String::as_str), Some("id"));
    if rows.is_empty() {
        return Ok(0);
    }

    let rows_per_statement = (MAX_BIND_PARAMS / columns.len()).max(1);
    let mut written = 0u64;
    for batch in rows.chunks(rows_per_statement) {
        let mut builder: QueryBuilder<'_, Postgres> = QueryBuilder::new(insert_prefix(table, columns));
        builder.push_values(batch, |mut b, row| {
            for cell in row {
                cell.push_bind_separated(&mut b);
            }
        });
        builder.push(conflict_clause(columns));
        written += builder.build().execute(pool).await?.rows_affected();
    }
    Ok(written)
}

fn insert_prefix(table: &str, columns: &[String]) -> String {
    let quoted: Vec<String> = columns.iter().map(|c| format!("\"{c}\"")).collect();
    format!("INSERT INTO \"{table}\" ({}) ", quoted.join(", "))
}

/// `ON CONFLICT` update assignments for every non-id column.
fn conflict_clause(columns: &[String]) -> String {
    let assignments: Vec<String> = columns
        .iter()
        .filter(|c| c.as_str() != "id")
        .map(|c| format!("\"{c}\" = EXCLUDED.\"{c}\""))
        .collect();
    if assignments.is_empty() {
        " ON CONFLICT (id) DO NOTHING".to_owned()
    } else {
        format!(" ON CONFLICT (id) DO UPDATE SET {}", assignments.join(", "))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn conflict_clause_updates_every_non_id_column() {
        let columns = vec![
            "id".to_owned(),
            "pt_supervoxel_id".to_owned(),
            "pt_root_id".to_owned(),
        ];

        let clause = conflict_clause(&columns);

        assert_eq!(
            clause,
            " ON CONFLICT (id) DO UPDATE SET \"pt_supervoxel_id\" = EXCLUDED.\"pt_supervoxel_id\", \
             \"pt_root_id\" = EXCLUDED.\"pt_root_id\""
        );
    }

    #[test]
    fn id_only_upsert_degrades_to_do_nothing() {
        let columns = vec!["id".to_owned()];

        assert_eq!(conflict_clause(&columns), " ON CONFLICT (id) DO NOTHING");
    }
}
