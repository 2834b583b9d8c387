//! Frozen-snapshot creation.
//!
//! Freezing a namespace allocates a new version record, creates the
//! destination database from the template, then per table: creates the
//! flattened (CRUD-free) destination table, registers it under the version,
//! and copies the rows alive at freeze time. Every step checks existence
//! first so a crashed run can simply be re-run.

use annotation_db::{
    row_counts, segmentation,
    schema::{ColumnKind, TableSchema},
    AnnotationDb, Cell, Version,
};
use chrono::{DateTime, Duration, Utc};
use query_engine::Frame;
use sqlx::{postgres::PgArguments, query::Query, Postgres};
use tracing::instrument;

use crate::{Error, MatCtx};

/// Postgres error code for "database already exists".
const DUPLICATE_DATABASE: &str = "42P04";
/// Stay comfortably below the 65535 bind-parameter cap when batching the
/// row copy.
const MAX_BIND_PARAMS: usize = 60_000;

#[derive(Debug, Clone)]
pub struct FrozenSnapshotOptions {
    /// Lifetime of the snapshot in days; falls back to the configured
    /// default, `None` never expires.
    pub days_to_expire: Option<i64>,
    /// Merge segmentation columns into the flat annotation tables.
    pub merge_tables: bool,
}

impl Default for FrozenSnapshotOptions {
    fn default() -> Self {
        Self {
            days_to_expire: None,
            merge_tables: true,
        }
    }
}

#[derive(Debug)]
pub struct FrozenTableReport {
    pub table: String,
    pub rows_copied: u64,
}

#[derive(Debug)]
pub struct FrozenReport {
    pub version: Version,
    pub tables: Vec<FrozenTableReport>,
}

/// Creates a frozen snapshot of a namespace.
#[instrument(skip(ctx, opts), err)]
pub async fn create_frozen_snapshot(
    ctx: &MatCtx,
    live_database: &str,
    graph_table: &str,
    opts: &FrozenSnapshotOptions,
) -> Result<FrozenReport, Error> {
    let live = AnnotationDb::open_live(&ctx.pools, live_database).await?;
    let now = Utc::now();
    let expires_on = opts
        .days_to_expire
        .or(ctx.config.days_to_expire)
        .map(|days| now + Duration::days(days));

    let version = live
        .create_version(live_database, now, expires_on, opts.merge_tables)
        .await?;
    tracing::info!(version = version.version, "version allocated");

    let database = version.database_name();
    create_database_if_absent(&live, &database, &ctx.config.snapshot_template).await?;

    let frozen = AnnotationDb::open(&ctx.pools, &database).await?;
    row_counts::ensure_table(&**frozen.pool())
        .await
        .map_err(annotation_db::Error::from)?;

    let mut tables = Vec::new();
    for table in live.valid_annotation_tables().await? {
        let annotation_schema = live.table_schema(&table.table_name).await?;
        if annotation_schema.columns.is_empty() {
            continue;
        }
        let segmentation_table =
            segmentation::segmentation_table_name(&table.table_name, graph_table);
        let segmentation_schema = match live.table_schema(&segmentation_table).await? {
            schema if schema.columns.is_empty() => None,
            schema => Some(schema),
        };
        let segmentation_schema = if opts.merge_tables {
            segmentation_schema
        } else {
            None
        };

        // Destination table strictly precedes any row copy into it.
        let dest_schema = merged_flat_schema(&annotation_schema, segmentation_schema.as_ref());
        dest_schema
            .create_table(&**frozen.pool())
            .await
            .map_err(annotation_db::Error::from)?;
        live.register_version_table(version.id, &table.table_name, &table.schema_type, now)
            .await?;

        let rows_copied = copy_table(
            &live,
            &frozen,
            &annotation_schema,
            segmentation_schema.as_ref(),
            &segmentation_table,
            now,
        )
        .await?;
        row_counts::set(&**frozen.pool(), &table.table_name, rows_copied as i64)
            .await
            .map_err(annotation_db::Error::from)?;

        tracing::info!(table = %table.table_name, rows_copied, "table frozen");
        tables.push(FrozenTableReport {
            table: table.table_name,
            rows_copied,
        });
    }

    Ok(FrozenReport { version, tables })
}

/// Derives a virtual version from an existing frozen one.
///
/// The derived version shares the parent's timestamp, number, and data; only
/// the named tables are re-registered under it. A parent close to expiry is
/// extended so the shared data outlives the derivation.
#[instrument(skip(ctx), err)]
pub async fn create_virtual_version(
    ctx: &MatCtx,
    live_database: &str,
    target_version: i32,
    virtual_name: &str,
    tables_to_include: &[String],
) -> Result<Version, Error> {
    if tables_to_include.is_empty() {
        return Err(Error::Query(query_engine::Error::InvalidQuery(
            "no tables included".to_owned(),
        )));
    }

    let live = AnnotationDb::open_live(&ctx.pools, live_database).await?;
    let parent = live
        .get_version(live_database, target_version)
        .await?
        .filter(|version| version.valid)
        .ok_or_else(|| {
            Error::Query(query_engine::Error::InvalidQuery(format!(
                "version {target_version} is not a valid version"
            )))
        })?;

    let included: Vec<_> = live
        .version_tables(parent.id)
        .await?
        .into_iter()
        .filter(|table| tables_to_include.contains(&table.table_name))
        .collect();
    if included.is_empty() {
        return Err(Error::Query(query_engine::Error::InvalidQuery(format!(
            "no tables {tables_to_include:?} found in target version {target_version}"
        ))));
    }

    let now = Utc::now();
    let namespace = format!("{virtual_name}_v{}", parent.version);
    let expires_on = annotation_db::versions::derived_expiration(parent.expires_on, now);

    let derived = live
        .create_derived_version(&namespace, &parent, expires_on)
        .await?;
    for table in &included {
        live.register_version_table(derived.id, &table.table_name, &table.schema_type, now)
            .await?;
    }
    if let Some(expires_on) = expires_on {
        live.set_version_expiration(parent.id, expires_on).await?;
    }
    tracing::info!(namespace = %namespace, version = derived.version, "virtual version created");
    Ok(derived)
}

/// Creates the snapshot database unless it already exists.
///
/// A lost creation race (or a re-run after a crash) surfaces as a
/// duplicate-database error; both are treated as already-done.
async fn create_database_if_absent(
    live: &AnnotationDb,
    database: &str,
    template: &str,
) -> Result<(), Error> {
    let exists: Option<i32> =
        sqlx::query_scalar("SELECT 1 FROM pg_catalog.pg_database WHERE datname = $1")
            .bind(database)
            .fetch_optional(&**live.pool())
            .await
            .map_err(annotation_db::Error::from)?;
    if exists.is_some() {
        tracing::warn!(database, "snapshot database already exists, reusing");
        return Ok(());
    }

    let ddl = format!("CREATE DATABASE \"{database}\" TEMPLATE \"{template}\"");
    match sqlx::query(&ddl).execute(&**live.pool()).await {
        Ok(_) => {
            tracing::info!(database, "snapshot database created");
            Ok(())
        }
        Err(sqlx::Error::Database(db_err))
            if db_err.code().as_deref() == Some(DUPLICATE_DATABASE) =>
        {
            tracing::warn!(database, "snapshot database created concurrently");
            Ok(())
        }
        Err(err) => Err(annotation_db::Error::from(err).into()),
    }
}

/// The flattened destination descriptor: annotation columns without CRUD
/// bookkeeping, plus the segmentation columns when merging.
fn merged_flat_schema(
    annotation: &TableSchema,
    segmentation: Option<&TableSchema>,
) -> TableSchema {
    let mut merged = annotation.flattened();
    if let Some(segmentation) = segmentation {
        for column in &segmentation.columns {
            if matches!(column.kind, ColumnKind::Id) {
                continue;
            }
            merged.columns.push(column.clone());
        }
    }
    merged
}

/// Copies the rows alive at `frozen_at` into the destination table.
async fn copy_table(
    live: &AnnotationDb,
    frozen: &AnnotationDb,
    annotation: &TableSchema,
    segmentation: Option<&TableSchema>,
    segmentation_table: &str,
    frozen_at: DateTime<Utc>,
) -> Result<u64, Error> {
    // Column list mirrors the destination schema ordering.
    let mut select = Vec::new();
    let mut columns = Vec::new();
    let mut point_columns = Vec::new();
    for column in &annotation.flattened().columns {
        if matches!(column.kind, ColumnKind::Point { .. }) {
            select.push(format!("ST_AsBinary(a.\"{0}\") AS \"{0}\"", column.name));
            point_columns.push(columns.len());
        } else {
            select.push(format!("a.\"{0}\" AS \"{0}\"", column.name));
        }
        columns.push(column.name.clone());
    }
    if let Some(segmentation) = segmentation {
        for column in &segmentation.columns {
            if matches!(column.kind, ColumnKind::Id) {
                continue;
            }
            select.push(format!("s.\"{0}\" AS \"{0}\"", column.name));
            columns.push(column.name.clone());
        }
    }

    let mut sql = format!(
        "SELECT {} FROM \"{}\" a",
        select.join(", "),
        annotation.table
    );
    if segmentation.is_some() {
        sql.push_str(&format!(
            " LEFT OUTER JOIN \"{segmentation_table}\" s ON a.\"id\" = s.\"id\""
        ));
    }
    sql.push_str(" WHERE (a.\"deleted\" IS NULL OR a.\"deleted\" > $1) AND a.\"valid\" = TRUE");

    let pg_rows = sqlx::query(&sql)
        .bind(frozen_at)
        .fetch_all(&**live.pool())
        .await
        .map_err(annotation_db::Error::from)?;
    let frame = Frame::from_pg_rows(columns.clone(), &pg_rows).map_err(annotation_db::Error::from)?;

    insert_frame(frozen, &annotation.table, &frame, &point_columns).await
}

/// Batched insert of a frame into a frozen table.
///
/// Geometry cells travel as WKB and are rebuilt with `ST_GeomFromWKB`;
/// `ON CONFLICT DO NOTHING` keeps a re-run from duplicating rows.
async fn insert_frame(
    frozen: &AnnotationDb,
    table: &str,
    frame: &Frame,
    point_columns: &[usize],
) -> Result<u64, Error> {
    if frame.is_empty() {
        return Ok(0);
    }
    let columns = frame.columns();
    let quoted: Vec<String> = columns.iter().map(|c| format!("\"{c}\"")).collect();
    let rows_per_statement = (MAX_BIND_PARAMS / columns.len()).max(1);

    let rows: Vec<&[Cell]> = frame.rows().collect();
    let mut written = 0u64;
    for batch in rows.chunks(rows_per_statement) {
        let mut sql = format!("INSERT INTO \"{table}\" ({}) VALUES ", quoted.join(", "));
        let mut placeholder = 0usize;
        let values: Vec<String> = batch
            .iter()
            .map(|row| {
                let cells: Vec<String> = (0..row.len())
                    .map(|index| {
                        placeholder += 1;
                        if point_columns.contains(&index) {
                            format!("ST_GeomFromWKB(${placeholder})")
                        } else {
                            format!("${placeholder}")
                        }
                    })
                    .collect();
                format!("({})", cells.join(", "))
            })
            .collect();
        sql.push_str(&values.join(", "));
        sql.push_str(" ON CONFLICT (id) DO NOTHING");

        let mut query = sqlx::query(&sql);
        for row in batch {
            for (index, cell) in row.iter().enumerate() {
                query = bind_copy_cell(query, cell, point_columns.contains(&index));
            }
        }
        written += query
            .execute(&**frozen.pool())
            .await
            .map_err(annotation_db::Error::from)?
            .rows_affected();
    }
    Ok(written)
}

fn bind_copy_cell<'q>(
    query: Query<'q, Postgres, PgArguments>,
    cell: &'q Cell,
    is_point: bool,
) -> Query<'q, Postgres, PgArguments> {
    match cell {
        // A null in a geometry slot must carry the bytea type for
        // `ST_GeomFromWKB` to accept the parameter.
        Cell::Null if is_point => query.bind(Option::<Vec<u8>>::None),
        Cell::Null => query.bind(Option::<i64>::None),
        Cell::Bool(v) => query.bind(*v),
        Cell::Int(v) => query.bind(*v),
        Cell::Float(v) => query.bind(*v),
        Cell::Text(v) => query.bind(v.as_str()),
        Cell::Timestamp(v) => query.bind(*v),
        Cell::Point(p) => query.bind(annotation_db::wkb::encode_point_z(*p)),
        Cell::Bytes(b) => query.bind(b.as_slice()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn merged_flat_schema_drops_crud_and_seg_id() {
        let annotation = TableSchema::from_columns(
            "synapses",
            &[
                ("id", "int8"),
                ("created", "timestamptz"),
                ("deleted", "timestamptz"),
                ("superseded_id", "int8"),
                ("valid", "bool"),
                ("pt_position", "geometry"),
            ],
        );
        let segmentation = TableSchema::from_columns(
            "synapses__graph_v1",
            &[
                ("id", "int8"),
                ("pt_supervoxel_id", "int8"),
                ("pt_root_id", "int8"),
            ],
        );

        let merged = merged_flat_schema(&annotation, Some(&segmentation));

        let names: Vec<&str> = merged.column_names().collect();
        assert_eq!(
            names,
            vec![
                "id",
                "valid",
                "pt_position",
                "pt_supervoxel_id",
                "pt_root_id"
            ]
        );
    }
}
