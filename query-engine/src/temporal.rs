//! End-to-end temporal query flow.
//!
//! A request carries a target timestamp. The nearest frozen version anchors
//! the query; when the live table changed after the anchor (or after the
//! request), a delta leg bounded by the two timestamps is fetched from the
//! production database and reconciled in. User value filters run last, over
//! the merged frame.

use std::collections::BTreeMap;

use annotation_db::{row_counts, segmentation, AnnotationDb, DbPools};
use chrono::{DateTime, Utc};
use tracing::instrument;

use crate::{
    builder::{self, LiveOptions, QueryPlan, QuerySpec, DEFAULT_LIMIT_CEILING},
    column_map::ColumnMap,
    frame::Frame,
    reconcile::reconcile,
    version_select::choose_anchor,
    Error,
};

/// The caller-facing result of a temporal query.
#[derive(Debug)]
pub struct QueryOutput {
    pub frame: Frame,
    /// Logical-to-physical column names per table, for downstream
    /// disambiguation.
    pub column_names: ColumnMap,
    /// Human-readable warnings (truncation, pending lookups).
    pub warnings: Vec<String>,
}

/// Everything needed to resolve queries for one namespace.
#[derive(Debug, Clone)]
pub struct TemporalQuery {
    pools: DbPools,
    /// The live (production) database name.
    live_database: String,
    /// Namespace key the frozen versions are registered under.
    namespace: String,
    /// Graph-service table segmentation companions are named after.
    graph_table: String,
    limit_ceiling: i64,
}

impl TemporalQuery {
    pub fn new(
        pools: DbPools,
        live_database: impl Into<String>,
        namespace: impl Into<String>,
        graph_table: impl Into<String>,
    ) -> Self {
        Self {
            pools,
            live_database: live_database.into(),
            namespace: namespace.into(),
            graph_table: graph_table.into(),
            limit_ceiling: DEFAULT_LIMIT_CEILING,
        }
    }

    pub fn with_limit_ceiling(mut self, limit_ceiling: i64) -> Self {
        self.limit_ceiling = limit_ceiling;
        self
    }

    /// Answers `spec` as of `timestamp`.
    #[instrument(skip(self, spec), fields(table = %spec.table), err)]
    pub async fn execute(
        &self,
        spec: &QuerySpec,
        timestamp: DateTime<Utc>,
    ) -> Result<QueryOutput, Error> {
        spec.validate()?;
        // Joins are only coherent against a single frozen timestamp; the
        // snapshot+delta merge is strictly single-table.
        if !spec.joins.is_empty() {
            return Err(Error::InvalidQuery(
                "joins are not supported for temporal queries; query a frozen version directly"
                    .to_owned(),
            ));
        }

        let live = AnnotationDb::open(&self.pools, &self.live_database).await?;
        let (past, future) = live.closest_versions(&self.namespace, timestamp).await?;
        let anchor = choose_anchor(past, future, timestamp)?;
        tracing::debug!(
            version = anchor.version,
            anchor_time = %anchor.time_stamp,
            "anchoring query"
        );

        let mut warnings = Vec::new();
        let (snapshot, mut column_map) = self
            .snapshot_leg(spec, &anchor.database_name(), &mut warnings)
            .await?;

        let table_info = live
            .annotation_table_info(&spec.table)
            .await?
            .ok_or_else(|| Error::InvalidQuery(format!("unknown table {}", spec.table)))?;

        // The anchor answers the query alone unless the table changed after
        // it (or after the requested time when projecting backward).
        let needs_delta =
            table_info.last_modified > anchor.time_stamp || table_info.last_modified > timestamp;
        let delta = if needs_delta {
            let (frame, map) = self
                .delta_leg(spec, &live, anchor.time_stamp, timestamp, &mut warnings)
                .await?;
            column_map = map;
            Some(frame)
        } else {
            None
        };

        let mut frame = reconcile(
            snapshot,
            delta,
            anchor.time_stamp,
            timestamp,
            &spec.table,
            &column_map,
        )?;
        builder::apply_user_filters(&mut frame, spec, &column_map)?;
        frame.sort_by_int_column(column_map.physical(&spec.table, "id").unwrap_or("id"));

        Ok(QueryOutput {
            frame,
            column_names: column_map,
            warnings,
        })
    }

    /// Fetches the frozen leg. A known-zero row count short-circuits to an
    /// empty frame without scanning; a table absent from the snapshot
    /// database yields no frame at all.
    async fn snapshot_leg(
        &self,
        spec: &QuerySpec,
        frozen_database: &str,
        warnings: &mut Vec<String>,
    ) -> Result<(Option<Frame>, ColumnMap), Error> {
        let frozen = AnnotationDb::open(&self.pools, frozen_database).await?;

        let schema = frozen.table_schema(&spec.table).await?;
        if schema.columns.is_empty() {
            return Ok((None, ColumnMap::new()));
        }

        let mut schemas = BTreeMap::new();
        schemas.insert(spec.table.clone(), schema);

        let frozen_spec = spec
            .clone()
            .filter_equal(&spec.table, "valid", true);
        let plan = builder::plan_frozen(&frozen_spec, &schemas, self.limit_ceiling)?;

        let row_count = row_counts::get(&**frozen.pool(), &spec.table)
            .await
            .map_err(annotation_db::Error::from)?;
        if row_count == Some(0) {
            let empty = Frame::new(plan.output_columns().to_vec());
            return Ok((Some(empty), plan.column_map));
        }

        let (frame, mut leg_warnings) = plan.fetch(frozen.pool()).await?;
        warnings.append(&mut leg_warnings);
        Ok((Some(frame), plan.column_map))
    }

    /// Fetches the live delta: rows created or deleted between the anchor and
    /// the requested time, CRUD columns included for the reconciler.
    async fn delta_leg(
        &self,
        spec: &QuerySpec,
        live: &AnnotationDb,
        anchor: DateTime<Utc>,
        requested: DateTime<Utc>,
        warnings: &mut Vec<String>,
    ) -> Result<(Frame, ColumnMap), Error> {
        let annotation_schema = live.table_schema(&spec.table).await?;
        if annotation_schema.columns.is_empty() {
            return Err(Error::InvalidQuery(format!("unknown table {}", spec.table)));
        }
        let segmentation_table =
            segmentation::segmentation_table_name(&spec.table, &self.graph_table);
        let segmentation_schema = live.table_schema(&segmentation_table).await?;

        let window = if anchor < requested {
            (anchor, requested)
        } else {
            (requested, anchor)
        };
        let live_spec = spec.without_root_id_filters();
        let opts = LiveOptions {
            window: Some(window),
            ..Default::default()
        };
        let plan: QueryPlan = builder::plan_live(
            &live_spec,
            &annotation_schema,
            &segmentation_schema,
            &opts,
            self.limit_ceiling,
        )?;

        let (frame, mut leg_warnings) = plan.fetch(live.pool()).await?;
        warnings.append(&mut leg_warnings);
        Ok((frame, plan.column_map))
    }
}
