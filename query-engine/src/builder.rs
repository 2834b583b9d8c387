//! Composable query construction over annotation tables.
//!
//! Two modes share one spec type: **frozen** queries run against the merged
//! flat tables of a snapshot database (joins allowed), **live** queries run
//! against the split annotation + segmentation tables of the production
//! database (no user joins; the segmentation companion is outer-joined in).
//!
//! Root-id columns are derived per-timestamp by the graph service, so a join
//! or filter on one would silently pick an arbitrary resolution. The builder
//! rejects those outright.

use std::collections::BTreeMap;

use annotation_db::{
    schema::{ColumnKind, TableSchema, ROOT_ID_SUFFIX},
    Cell,
};
use chrono::{DateTime, Utc};
use sqlx::{postgres::PgArguments, query::Query, PgPool, Postgres};
use tracing::instrument;

use crate::{column_map::ColumnMap, frame::Frame, Error};

/// Server-side cap on result size. Requested limits above it are silently
/// clamped rather than rejected.
pub const DEFAULT_LIMIT_CEILING: i64 = 500_000;

/// Axis-aligned spatial bounds on a point column, inclusive on both ends.
#[derive(Debug, Clone, PartialEq)]
pub struct BoundingBox {
    pub min: [f64; 3],
    pub max: [f64; 3],
}

/// One step of a join chain.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Join {
    pub left_table: String,
    pub left_column: String,
    pub right_table: String,
    pub right_column: String,
}

/// A declarative query over one table, possibly joined to others.
#[derive(Debug, Clone, Default)]
pub struct QuerySpec {
    /// The primary table.
    pub table: String,
    /// Requested columns per table key; a missing entry means all columns.
    pub select_columns: BTreeMap<String, Vec<String>>,
    /// Set-inclusion filters: `table → column → allowed values`.
    pub filter_in: BTreeMap<String, BTreeMap<String, Vec<Cell>>>,
    /// Set-exclusion filters.
    pub filter_out: BTreeMap<String, BTreeMap<String, Vec<Cell>>>,
    /// Equality filters.
    pub filter_equal: BTreeMap<String, BTreeMap<String, Cell>>,
    /// Spatial bounding-box filters on point columns.
    pub filter_spatial: BTreeMap<String, BTreeMap<String, BoundingBox>>,
    /// Join chain; only valid for frozen queries.
    pub joins: Vec<Join>,
    /// Explicit result suffixes per table key.
    pub suffixes: BTreeMap<String, String>,
    pub offset: Option<i64>,
    pub limit: Option<i64>,
}

impl QuerySpec {
    pub fn new(table: impl Into<String>) -> Self {
        Self {
            table: table.into(),
            ..Default::default()
        }
    }

    pub fn filter_equal(mut self, table: &str, column: &str, value: impl Into<Cell>) -> Self {
        self.filter_equal
            .entry(table.to_owned())
            .or_default()
            .insert(column.to_owned(), value.into());
        self
    }

    pub fn filter_in(mut self, table: &str, column: &str, values: Vec<Cell>) -> Self {
        self.filter_in
            .entry(table.to_owned())
            .or_default()
            .insert(column.to_owned(), values);
        self
    }

    pub fn filter_out(mut self, table: &str, column: &str, values: Vec<Cell>) -> Self {
        self.filter_out
            .entry(table.to_owned())
            .or_default()
            .insert(column.to_owned(), values);
        self
    }

    pub fn filter_spatial(mut self, table: &str, column: &str, bounds: BoundingBox) -> Self {
        self.filter_spatial
            .entry(table.to_owned())
            .or_default()
            .insert(column.to_owned(), bounds);
        self
    }

    pub fn join(mut self, left: (&str, &str), right: (&str, &str)) -> Self {
        self.joins.push(Join {
            left_table: left.0.to_owned(),
            left_column: left.1.to_owned(),
            right_table: right.0.to_owned(),
            right_column: right.1.to_owned(),
        });
        self
    }

    pub fn limit(mut self, limit: i64) -> Self {
        self.limit = Some(limit);
        self
    }

    /// Rejects joins and filters addressing derived root-id columns.
    pub fn validate(&self) -> Result<(), Error> {
        for join in &self.joins {
            for column in [&join.left_column, &join.right_column] {
                if column.ends_with(ROOT_ID_SUFFIX) {
                    return Err(Error::InvalidQuery(format!(
                        "joins on root-id columns are not supported: {column}"
                    )));
                }
            }
        }
        let filter_columns = self
            .filter_in
            .values()
            .chain(self.filter_out.values())
            .flat_map(|by_col| by_col.keys())
            .chain(self.filter_equal.values().flat_map(|by_col| by_col.keys()));
        for column in filter_columns {
            if column.ends_with(ROOT_ID_SUFFIX) {
                return Err(Error::InvalidQuery(format!(
                    "filters on root-id columns are not supported: {column}"
                )));
            }
        }
        Ok(())
    }

    /// A copy with all root-id filters removed.
    ///
    /// The live-delta leg cannot evaluate root-id predicates: the stored
    /// resolutions belong to the materialization timestamp, not the requested
    /// one. Filtering happens after reconciliation instead.
    pub fn without_root_id_filters(&self) -> QuerySpec {
        let mut stripped = self.clone();
        for by_col in stripped
            .filter_in
            .values_mut()
            .chain(stripped.filter_out.values_mut())
        {
            by_col.retain(|column, _| !column.ends_with(ROOT_ID_SUFFIX));
        }
        for by_col in stripped.filter_equal.values_mut() {
            by_col.retain(|column, _| !column.ends_with(ROOT_ID_SUFFIX));
        }
        stripped
    }
}

/// Options specific to the live (split-table) mode.
#[derive(Debug, Clone, Default)]
pub struct LiveOptions {
    /// CRUD time window: rows created or deleted inside `[start, end)`.
    pub window: Option<(DateTime<Utc>, DateTime<Utc>)>,
    /// Restrict to annotation ids in `[start, end)`.
    pub id_range: Option<(i64, i64)>,
    /// Only rows whose segmentation counterpart has an unresolved supervoxel
    /// column (the resolution pipeline's scan).
    pub missing_supervoxels_only: bool,
    pub order_by_id: bool,
}

/// An executable query: SQL, bind values, and the column map describing the
/// produced frame.
#[derive(Debug, Clone)]
pub struct QueryPlan {
    pub sql: String,
    binds: Vec<Cell>,
    pub column_map: ColumnMap,
    output_columns: Vec<String>,
    pub limit: i64,
}

impl QueryPlan {
    /// The physical column names of the produced frame, in order.
    pub fn output_columns(&self) -> &[String] {
        &self.output_columns
    }

    /// Runs the plan, decoding rows into a frame.
    ///
    /// Returns the frame plus human-readable warnings (currently only result
    /// truncation at the limit).
    #[instrument(skip_all, fields(sql = %self.sql), err)]
    pub async fn fetch(&self, pool: &PgPool) -> Result<(Frame, Vec<String>), Error> {
        let mut query = sqlx::query(&self.sql);
        for cell in &self.binds {
            query = bind_cell(query, cell);
        }
        let rows = query
            .fetch_all(pool)
            .await
            .map_err(annotation_db::Error::from)?;
        let frame = Frame::from_pg_rows(self.output_columns.clone(), &rows)
            .map_err(annotation_db::Error::from)?;

        let mut warnings = Vec::new();
        if frame.len() as i64 >= self.limit {
            warnings.push(format!(
                "result has {} entries, which is equal or more than the limit of {}; \
                 there may be more results which are not shown",
                frame.len(),
                self.limit
            ));
        }
        Ok((frame, warnings))
    }
}

fn bind_cell<'q>(
    query: Query<'q, Postgres, PgArguments>,
    cell: &'q Cell,
) -> Query<'q, Postgres, PgArguments> {
    match cell {
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

/// One table instance inside a query; self-joins produce several occurrences
/// of the same table with distinct aliases and suffixes.
struct Occurrence {
    /// The key filters and the column map address this occurrence by.
    key: String,
    table: String,
    alias: String,
    suffix: String,
    schema: TableSchema,
}

struct Renderer {
    select: Vec<String>,
    joins: Vec<String>,
    conditions: Vec<String>,
    binds: Vec<Cell>,
    column_map: ColumnMap,
    output_columns: Vec<String>,
}

impl Renderer {
    fn new() -> Self {
        Self {
            select: Vec::new(),
            joins: Vec::new(),
            conditions: Vec::new(),
            binds: Vec::new(),
            column_map: ColumnMap::new(),
            output_columns: Vec::new(),
        }
    }

    fn placeholder(&mut self, cell: Cell) -> String {
        self.binds.push(cell);
        format!("${}", self.binds.len())
    }

    fn select_column(&mut self, occ_key: &str, alias: &str, desc_kind: &ColumnKind, logical: &str, physical: &str) {
        let expr = match desc_kind {
            // Geometry comes back as WKB so the cell codec can decode plain
            // coordinates.
            ColumnKind::Point { .. } => {
                format!("ST_AsBinary({alias}.\"{logical}\") AS \"{physical}\"")
            }
            _ => format!("{alias}.\"{logical}\" AS \"{physical}\""),
        };
        self.select.push(expr);
        self.column_map.insert(occ_key, logical, physical);
        self.output_columns.push(physical.to_owned());
    }

    fn render(
        &mut self,
        from: &str,
        limit: i64,
        offset: Option<i64>,
        order_by: Option<&str>,
    ) -> String {
        let mut sql = format!("SELECT {} FROM {from}", self.select.join(", "));
        for join in &self.joins {
            sql.push(' ');
            sql.push_str(join);
        }
        if !self.conditions.is_empty() {
            sql.push_str(" WHERE ");
            sql.push_str(&self.conditions.join(" AND "));
        }
        if let Some(order_by) = order_by {
            sql.push_str(" ORDER BY ");
            sql.push_str(order_by);
        }
        sql.push_str(&format!(" LIMIT {limit}"));
        if let Some(offset) = offset {
            sql.push_str(&format!(" OFFSET {offset}"));
        }
        sql
    }
}

/// Builds the plan for a frozen (merged snapshot) query.
pub fn plan_frozen(
    spec: &QuerySpec,
    schemas: &BTreeMap<String, TableSchema>,
    limit_ceiling: i64,
) -> Result<QueryPlan, Error> {
    spec.validate()?;

    let mut renderer = Renderer::new();
    let mut occurrences: Vec<Occurrence> = Vec::new();
    push_occurrence(&mut occurrences, &spec.table, spec, schemas)?;

    for join in &spec.joins {
        let left = find_occurrence(&occurrences, &join.left_table).ok_or_else(|| {
            Error::InvalidQuery(format!("join references unknown table {}", join.left_table))
        })?;
        let left_alias = left.alias.clone();
        let right = push_occurrence(&mut occurrences, &join.right_table, spec, schemas)?;
        renderer.joins.push(format!(
            "JOIN \"{}\" {} ON {}.\"{}\" = {}.\"{}\"",
            right.table, right.alias, left_alias, join.left_column, right.alias, join.right_column
        ));
    }

    // Physical naming: suffix a column only when its name appears in more
    // than one occurrence's selection.
    let selections: Vec<Vec<String>> = occurrences
        .iter()
        .map(|occ| selected_columns(spec, occ))
        .collect();
    let mut name_counts: BTreeMap<&str, usize> = BTreeMap::new();
    for columns in &selections {
        for column in columns {
            *name_counts.entry(column.as_str()).or_default() += 1;
        }
    }
    for (occ, columns) in occurrences.iter().zip(&selections) {
        for column in columns {
            let desc = occ.schema.column(column).ok_or_else(|| {
                Error::InvalidQuery(format!("unknown column {column} on table {}", occ.table))
            })?;
            let collides = name_counts[column.as_str()] > 1;
            let physical = if collides && !occ.suffix.is_empty() {
                format!("{column}{}", occ.suffix)
            } else {
                column.clone()
            };
            renderer.select_column(&occ.key, &occ.alias, &desc.kind, column, &physical);
        }
    }

    apply_filters(&mut renderer, spec, |table, column| {
        let occ = find_occurrence(&occurrences, table)?;
        occ.schema.column(column)?;
        Some(occ.alias.clone())
    })?;

    let primary = &occurrences[0];
    let from = format!("\"{}\" {}", primary.table, primary.alias);
    let limit = clamp_limit(spec.limit, limit_ceiling);
    let sql = renderer.render(&from, limit, spec.offset, None);
    Ok(QueryPlan {
        sql,
        binds: std::mem::take(&mut renderer.binds),
        column_map: renderer.column_map.clone(),
        output_columns: renderer.output_columns.clone(),
        limit,
    })
}

/// Builds the plan for a live (split annotation + segmentation) query.
///
/// All result columns live under the logical annotation table name in the
/// column map; the segmentation join is an implementation detail.
pub fn plan_live(
    spec: &QuerySpec,
    annotation: &TableSchema,
    segmentation: &TableSchema,
    opts: &LiveOptions,
    limit_ceiling: i64,
) -> Result<QueryPlan, Error> {
    spec.validate()?;
    if !spec.joins.is_empty() {
        return Err(Error::InvalidQuery(
            "joins are not supported on live queries".to_owned(),
        ));
    }

    let mut renderer = Renderer::new();
    let table_key = spec.table.as_str();

    let requested = spec.select_columns.get(table_key);
    for desc in &annotation.columns {
        // CRUD columns and the id are always selected: the reconciler needs
        // them even when the caller asked for a narrow projection.
        let forced = matches!(
            desc.kind,
            ColumnKind::Id | ColumnKind::Created | ColumnKind::Deleted | ColumnKind::SupersededId
        );
        if !forced && !requested.map_or(true, |cols| cols.contains(&desc.name)) {
            continue;
        }
        renderer.select_column(table_key, "a", &desc.kind, &desc.name, &desc.name);
    }
    for desc in &segmentation.columns {
        if matches!(desc.kind, ColumnKind::Id) {
            continue;
        }
        if !requested.map_or(true, |cols| cols.contains(&desc.name)) {
            continue;
        }
        renderer.select_column(table_key, "s", &desc.kind, &desc.name, &desc.name);
    }

    renderer.joins.push(format!(
        "LEFT OUTER JOIN \"{}\" s ON a.\"id\" = s.\"id\"",
        segmentation.table
    ));

    if let Some((start, end)) = opts.id_range {
        let start = renderer.placeholder(Cell::Int(start));
        let end = renderer.placeholder(Cell::Int(end));
        renderer
            .conditions
            .push(format!("a.\"id\" >= {start} AND a.\"id\" < {end}"));
    }
    if let Some((start, end)) = opts.window {
        let s = renderer.placeholder(Cell::Timestamp(start));
        let e = renderer.placeholder(Cell::Timestamp(end));
        renderer.conditions.push(format!(
            "((a.\"created\" >= {s} AND a.\"created\" < {e}) \
             OR (a.\"deleted\" >= {s} AND a.\"deleted\" < {e}))"
        ));
    }
    if opts.missing_supervoxels_only {
        let mut missing: Vec<String> = segmentation
            .columns
            .iter()
            .filter(|c| matches!(c.kind, ColumnKind::SupervoxelId { .. }))
            .map(|c| format!("s.\"{}\" IS NULL", c.name))
            .collect();
        missing.push("s.\"id\" IS NULL".to_owned());
        renderer.conditions.push(format!("({})", missing.join(" OR ")));
    }

    apply_filters(&mut renderer, spec, |table, column| {
        if table != table_key {
            return None;
        }
        if annotation.column(column).is_some() {
            Some("a".to_owned())
        } else if segmentation.column(column).is_some() {
            Some("s".to_owned())
        } else {
            None
        }
    })?;

    let from = format!("\"{}\" a", annotation.table);
    let limit = clamp_limit(spec.limit, limit_ceiling);
    let order_by = opts.order_by_id.then_some("a.\"id\" ASC");
    let sql = renderer.render(&from, limit, spec.offset, order_by);
    Ok(QueryPlan {
        sql,
        binds: std::mem::take(&mut renderer.binds),
        column_map: renderer.column_map.clone(),
        output_columns: renderer.output_columns.clone(),
        limit,
    })
}

fn clamp_limit(requested: Option<i64>, ceiling: i64) -> i64 {
    requested.map_or(ceiling, |limit| limit.min(ceiling))
}

fn selected_columns(spec: &QuerySpec, occ: &Occurrence) -> Vec<String> {
    match spec.select_columns.get(&occ.key) {
        Some(columns) => columns.clone(),
        None => occ.schema.column_names().map(str::to_owned).collect(),
    }
}

fn find_occurrence<'a>(occurrences: &'a [Occurrence], key: &str) -> Option<&'a Occurrence> {
    occurrences
        .iter()
        .find(|occ| occ.key == key)
        .or_else(|| occurrences.iter().rev().find(|occ| occ.table == key))
}

fn push_occurrence<'a>(
    occurrences: &'a mut Vec<Occurrence>,
    table: &str,
    spec: &QuerySpec,
    schemas: &BTreeMap<String, TableSchema>,
) -> Result<&'a Occurrence, Error> {
    let schema = schemas
        .get(table)
        .ok_or_else(|| Error::InvalidQuery(format!("unknown table {table}")))?
        .clone();
    let index = occurrences.iter().filter(|occ| occ.table == table).count();
    let suffix = match spec.suffixes.get(table) {
        Some(suffix) if index == 0 => suffix.clone(),
        Some(suffix) => format!("{suffix}_{}", index + 1),
        None if index == 0 => String::new(),
        None => format!("_{}", index + 1),
    };
    let key = if index == 0 {
        table.to_owned()
    } else {
        format!("{table}{suffix}")
    };
    let alias = format!("t{}", occurrences.len());
    occurrences.push(Occurrence {
        key,
        table: table.to_owned(),
        alias,
        suffix,
        schema,
    });
    Ok(occurrences.last().expect("just pushed"))
}

/// Renders the user filter clauses, resolving `(table key, column)` to a
/// qualified alias through `resolve`.
fn apply_filters<F>(renderer: &mut Renderer, spec: &QuerySpec, resolve: F) -> Result<(), Error>
where
    F: Fn(&str, &str) -> Option<String>,
{
    let resolve = |table: &str, column: &str| {
        resolve(table, column).ok_or_else(|| {
            Error::InvalidQuery(format!("unknown filter column {table}.{column}"))
        })
    };

    for (table, by_col) in &spec.filter_equal {
        for (column, value) in by_col {
            let alias = resolve(table, column)?;
            let placeholder = renderer.placeholder(value.clone());
            renderer
                .conditions
                .push(format!("{alias}.\"{column}\" = {placeholder}"));
        }
    }
    for (table, by_col) in &spec.filter_in {
        for (column, values) in by_col {
            let alias = resolve(table, column)?;
            let placeholders: Vec<String> = values
                .iter()
                .map(|value| renderer.placeholder(value.clone()))
                .collect();
            renderer.conditions.push(format!(
                "{alias}.\"{column}\" IN ({})",
                placeholders.join(", ")
            ));
        }
    }
    for (table, by_col) in &spec.filter_out {
        for (column, values) in by_col {
            let alias = resolve(table, column)?;
            let placeholders: Vec<String> = values
                .iter()
                .map(|value| renderer.placeholder(value.clone()))
                .collect();
            renderer.conditions.push(format!(
                "{alias}.\"{column}\" NOT IN ({})",
                placeholders.join(", ")
            ));
        }
    }
    for (table, by_col) in &spec.filter_spatial {
        for (column, bounds) in by_col {
            let alias = resolve(table, column)?;
            let mut clauses = Vec::with_capacity(3);
            for (axis, accessor) in ["ST_X", "ST_Y", "ST_Z"].iter().enumerate() {
                let min = renderer.placeholder(Cell::Float(bounds.min[axis]));
                let max = renderer.placeholder(Cell::Float(bounds.max[axis]));
                clauses.push(format!(
                    "{accessor}({alias}.\"{column}\") >= {min} AND \
                     {accessor}({alias}.\"{column}\") <= {max}"
                ));
            }
            renderer.conditions.push(format!("({})", clauses.join(" AND ")));
        }
    }
    Ok(())
}

/// Applies the user's value filters to an already merged frame.
///
/// The reconciled result can mix snapshot and delta rows, so include/exclude
/// and equality filters are evaluated here rather than per leg.
pub fn apply_user_filters(
    frame: &mut Frame,
    spec: &QuerySpec,
    column_map: &ColumnMap,
) -> Result<(), Error> {
    let physical = |table: &str, column: &str| -> Result<String, Error> {
        column_map
            .physical(table, column)
            .map(str::to_owned)
            .ok_or_else(|| Error::InvalidQuery(format!("unknown filter column {table}.{column}")))
    };

    for (table, by_col) in &spec.filter_equal {
        for (column, value) in by_col {
            let name = physical(table, column)?;
            let Some(index) = frame.column_index(&name) else {
                continue;
            };
            frame.retain_rows(|row| &row[index] == value);
        }
    }
    for (table, by_col) in &spec.filter_in {
        for (column, values) in by_col {
            let name = physical(table, column)?;
            let Some(index) = frame.column_index(&name) else {
                continue;
            };
            frame.retain_rows(|row| values.contains(&row[index]));
        }
    }
    for (table, by_col) in &spec.filter_out {
        for (column, values) in by_col {
            let name = physical(table, column)?;
            let Some(index) = frame.column_index(&name) else {
                continue;
            };
            frame.retain_rows(|row| !values.contains(&row[index]));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn synapse_schema(table: &str) -> TableSchema {
        TableSchema::from_columns(
            table,
            &[
                ("id", "int8"),
                ("valid", "bool"),
                ("pt_position", "geometry"),
                ("size", "float8"),
            ],
        )
    }

    fn live_schemas() -> (TableSchema, TableSchema) {
        let annotation = TableSchema::from_columns(
            "synapses",
            &[
                ("id", "int8"),
                ("created", "timestamptz"),
                ("deleted", "timestamptz"),
                ("superseded_id", "int8"),
                ("valid", "bool"),
                ("pt_position", "geometry"),
                ("size", "float8"),
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
        (annotation, segmentation)
    }

    fn schemas_for(tables: &[&str]) -> BTreeMap<String, TableSchema> {
        tables
            .iter()
            .map(|t| ((*t).to_owned(), synapse_schema(t)))
            .collect()
    }

    #[test]
    fn frozen_plan_selects_all_columns_with_wkb_geometry() {
        //* Given
        let spec = QuerySpec::new("synapses");

        //* When
        let plan = plan_frozen(&spec, &schemas_for(&["synapses"]), 1000).unwrap();

        //* Then
        assert!(plan.sql.contains("t0.\"id\" AS \"id\""));
        assert!(plan
            .sql
            .contains("ST_AsBinary(t0.\"pt_position\") AS \"pt_position\""));
        assert!(plan.sql.ends_with("FROM \"synapses\" t0 LIMIT 1000"));
        assert_eq!(plan.column_map.physical("synapses", "size"), Some("size"));
    }

    #[test]
    fn limit_above_ceiling_is_silently_clamped() {
        //* Given
        let spec = QuerySpec::new("synapses").limit(9_999_999);

        //* When
        let plan = plan_frozen(&spec, &schemas_for(&["synapses"]), 1000).unwrap();

        //* Then
        assert_eq!(plan.limit, 1000);
        assert!(plan.sql.ends_with("LIMIT 1000"));
    }

    #[test]
    fn joins_on_root_id_columns_are_rejected() {
        //* Given
        let spec =
            QuerySpec::new("synapses").join(("synapses", "pt_root_id"), ("cells", "pt_root_id"));

        //* When
        let result = plan_frozen(&spec, &schemas_for(&["synapses", "cells"]), 1000);

        //* Then
        assert!(matches!(result, Err(Error::InvalidQuery(_))));
    }

    #[test]
    fn filters_on_root_id_columns_are_rejected() {
        let spec = QuerySpec::new("synapses").filter_equal("synapses", "pt_root_id", 42i64);

        let result = plan_frozen(&spec, &schemas_for(&["synapses"]), 1000);

        assert!(matches!(result, Err(Error::InvalidQuery(_))));
    }

    #[test]
    fn without_root_id_filters_strips_only_root_filters() {
        let spec = QuerySpec::new("synapses")
            .filter_equal("synapses", "pt_root_id", 42i64)
            .filter_equal("synapses", "size", Cell::Float(1.0));

        let stripped = spec.without_root_id_filters();

        let by_col = &stripped.filter_equal["synapses"];
        assert!(!by_col.contains_key("pt_root_id"));
        assert!(by_col.contains_key("size"));
    }

    #[test]
    fn self_join_suffixes_colliding_columns() {
        //* Given
        let spec = QuerySpec::new("synapses").join(("synapses", "id"), ("synapses", "id"));

        //* When
        let plan = plan_frozen(&spec, &schemas_for(&["synapses"]), 1000).unwrap();

        //* Then
        assert!(plan
            .sql
            .contains("JOIN \"synapses\" t1 ON t0.\"id\" = t1.\"id\""));
        assert_eq!(plan.column_map.physical("synapses", "id"), Some("id"));
        assert_eq!(plan.column_map.physical("synapses_2", "id"), Some("id_2"));
    }

    #[test]
    fn filters_render_with_bind_placeholders() {
        //* Given
        let spec = QuerySpec::new("synapses")
            .filter_equal("synapses", "valid", true)
            .filter_in("synapses", "id", vec![Cell::Int(1), Cell::Int(2)])
            .filter_spatial(
                "synapses",
                "pt_position",
                BoundingBox {
                    min: [0.0, 0.0, 0.0],
                    max: [10.0, 10.0, 10.0],
                },
            );

        //* When
        let plan = plan_frozen(&spec, &schemas_for(&["synapses"]), 1000).unwrap();

        //* Then
        assert!(plan.sql.contains("t0.\"valid\" = $1"));
        assert!(plan.sql.contains("t0.\"id\" IN ($2, $3)"));
        assert!(plan.sql.contains("ST_X(t0.\"pt_position\") >= $4"));
        assert!(plan.sql.contains("ST_Z(t0.\"pt_position\") <= $9"));
    }

    #[test]
    fn unknown_filter_column_is_invalid() {
        let spec = QuerySpec::new("synapses").filter_equal("synapses", "nope", 1i64);

        let result = plan_frozen(&spec, &schemas_for(&["synapses"]), 1000);

        assert!(matches!(result, Err(Error::InvalidQuery(_))));
    }

    #[test]
    fn live_plan_outer_joins_segmentation_and_forces_crud() {
        //* Given
        let (annotation, segmentation) = live_schemas();
        let mut spec = QuerySpec::new("synapses");
        spec.select_columns
            .insert("synapses".into(), vec!["id".into(), "size".into()]);
        let opts = LiveOptions {
            window: Some((
                "2020-01-01T00:00:00Z".parse().unwrap(),
                "2020-06-01T00:00:00Z".parse().unwrap(),
            )),
            ..Default::default()
        };

        //* When
        let plan = plan_live(&spec, &annotation, &segmentation, &opts, 1000).unwrap();

        //* Then
        assert!(plan
            .sql
            .contains("LEFT OUTER JOIN \"synapses__graph_v1\" s ON a.\"id\" = s.\"id\""));
        // CRUD columns ride along even under a narrow projection.
        assert!(plan.sql.contains("a.\"created\" AS \"created\""));
        assert!(plan.sql.contains("a.\"deleted\" AS \"deleted\""));
        assert!(plan
            .sql
            .contains("(a.\"created\" >= $1 AND a.\"created\" < $2)"));
        assert!(plan
            .sql
            .contains("(a.\"deleted\" >= $1 AND a.\"deleted\" < $2)"));
        // The narrow projection still drops unselected payload columns.
        assert!(!plan.sql.contains("pt_position"));
    }

    #[test]
    fn live_plan_rejects_user_joins() {
        let (annotation, segmentation) = live_schemas();
        let spec = QuerySpec::new("synapses").join(("synapses", "id"), ("cells", "id"));

        let result = plan_live(&spec, &annotation, &segmentation, &LiveOptions::default(), 1000);

        assert!(matches!(result, Err(Error::InvalidQuery(_))));
    }

    #[test]
    fn scan_options_render_id_range_and_missing_filter() {
        //* Given
        let (annotation, segmentation) = live_schemas();
        let spec = QuerySpec::new("synapses").filter_equal("synapses", "valid", true);
        let opts = LiveOptions {
            id_range: Some((100, 200)),
            missing_supervoxels_only: true,
            order_by_id: true,
            ..Default::default()
        };

        //* When
        let plan = plan_live(&spec, &annotation, &segmentation, &opts, 1000).unwrap();

        //* Then
        assert!(plan.sql.contains("a.\"id\" >= $1 AND a.\"id\" < $2"));
        assert!(plan
            .sql
            .contains("(s.\"pt_supervoxel_id\" IS NULL OR s.\"id\" IS NULL)"));
        assert!(plan.sql.contains("ORDER BY a.\"id\" ASC"));
        assert!(plan.sql.contains("a.\"valid\" = $3"));
    }

    #[test]
    fn seg_filter_columns_resolve_to_seg_alias() {
        let (annotation, segmentation) = live_schemas();
        let spec = QuerySpec::new("synapses").filter_in(
            "synapses",
            "pt_supervoxel_id",
            vec![Cell::Int(7)],
        );

        let plan =
            plan_live(&spec, &annotation, &segmentation, &LiveOptions::default(), 1000).unwrap();

        assert!(plan.sql.contains("s.\"pt_supervoxel_id\" IN ($1)"));
    }
}
