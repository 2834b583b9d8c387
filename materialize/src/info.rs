//! Per-run table metadata.
//!
//! A materialization run starts by walking the annotation table registry and
//! collecting one descriptor per resolvable table. Descriptors live for the
//! run only; nothing here is persisted.

use annotation_db::{segmentation, AnnotationDb};
use chrono::{DateTime, Utc};
use tracing::instrument;

use crate::{config::Config, Error};

/// Everything a chunk task needs to know about its table.
#[derive(Debug, Clone)]
pub struct TableRunInfo {
    /// Logical database / namespace the table lives in.
    pub namespace: String,
    pub schema_type: String,
    pub annotation_table: String,
    pub segmentation_table: String,
    /// Graph-service table root ids are resolved against.
    pub graph_table: String,
    /// Source identifier of the segmentation volume.
    pub segmentation_source: String,
    /// Voxel resolution the stored point coordinates are expressed in.
    pub coord_resolution: [f64; 3],
    /// Highest annotation id; chunk ranges are computed from it.
    pub max_id: i64,
    /// When the resolution pipeline last completed for this table.
    pub last_updated: Option<DateTime<Utc>>,
    /// The timestamp this run resolves roots at.
    pub materialization_time: DateTime<Utc>,
    pub chunk_size: i64,
}

/// Collects run descriptors for every annotation table with rows to resolve.
///
/// Tables without rows are skipped; a missing segmentation-metadata row just
/// means the companion table has never been updated.
#[instrument(skip(db, config), err)]
pub async fn gather(
    db: &AnnotationDb,
    graph_table: &str,
    segmentation_source: &str,
    config: &Config,
    materialization_time: DateTime<Utc>,
) -> Result<Vec<TableRunInfo>, Error> {
    let mut infos = Vec::new();
    for table in db.valid_annotation_tables().await? {
        let Some(max_id) = db.max_annotation_id(&table.table_name).await? else {
            tracing::debug!(table = %table.table_name, "no rows, skipping");
            continue;
        };

        let segmentation_table =
            segmentation::segmentation_table_name(&table.table_name, graph_table);
        let last_updated = db
            .segmentation_table_meta(&segmentation_table)
            .await?
            .and_then(|meta| meta.last_updated);

        infos.push(TableRunInfo {
            namespace: db.database().to_owned(),
            schema_type: table.schema_type.clone(),
            annotation_table: table.table_name.clone(),
            segmentation_table,
            graph_table: graph_table.to_owned(),
            segmentation_source: segmentation_source.to_owned(),
            coord_resolution: table.voxel_resolution(),
            max_id,
            last_updated,
            materialization_time,
            chunk_size: config.chunk_size_for(&table.schema_type),
        });
    }
    Ok(infos)
}
