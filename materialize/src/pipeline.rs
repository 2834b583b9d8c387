//! The per-chunk root-id resolution pipeline.
//!
//! One chunk runs the four-step state machine: scan annotation rows with
//! unresolved segmentation data, look up missing supervoxel ids from the
//! volumetric service, resolve root ids through the graph service at the
//! run's materialization timestamp, and upsert the results. Each chunk
//! commits independently; a chunk with nothing to resolve short-circuits
//! with [`ChunkStatus::Empty`].

use std::collections::BTreeMap;

use annotation_db::{
    schema::{self, TableSchema},
    upsert, AnnotationDb, Cell,
};
use clients::{GraphClient, VolumeClient};
use query_engine::{plan_live, Frame, LiveOptions, QuerySpec};
use tracing::instrument;

use crate::{chunks::ChunkRange, info::TableRunInfo, Error};

/// Terminal status of one chunk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChunkStatus {
    /// At least one segmentation row was written.
    Updated { rows: u64 },
    /// Nothing to resolve in this id range.
    Empty,
}

/// One scanned annotation row with its segmentation state, per point prefix.
#[derive(Debug, Clone)]
struct ScanRow {
    id: i64,
    points: BTreeMap<String, Option<[f64; 3]>>,
    supervoxels: BTreeMap<String, Option<i64>>,
    roots: BTreeMap<String, Option<i64>>,
    /// Set when any column was filled in this run.
    updated: bool,
}

impl ScanRow {
    /// Root lookup only touches rows where every root column is still null;
    /// a partially resolved multi-point row is left for a later pass.
    fn eligible_for_root_lookup(&self) -> bool {
        self.roots.values().all(Option::is_none)
    }
}

/// Runs the resolution state machine over one chunk.
#[instrument(skip(db, graph, volume, info), fields(table = %info.annotation_table, range = %range), err)]
pub async fn process_chunk(
    db: &AnnotationDb,
    graph: &GraphClient,
    volume: &VolumeClient,
    info: &TableRunInfo,
    range: ChunkRange,
) -> Result<ChunkStatus, Error> {
    let annotation_schema = db.table_schema(&info.annotation_table).await?;
    let mut segmentation_schema = db.table_schema(&info.segmentation_table).await?;
    if segmentation_schema.columns.is_empty() {
        segmentation_schema =
            schema::segmentation_schema(&annotation_schema, &info.segmentation_table);
    }

    let frame = scan(db, &annotation_schema, &segmentation_schema, info, range).await?;
    if frame.is_empty() {
        return Ok(ChunkStatus::Empty);
    }

    let prefixes: Vec<String> = annotation_schema
        .point_prefixes()
        .into_iter()
        .map(str::to_owned)
        .collect();
    let mut rows = decode_rows(&frame, &prefixes)?;

    let supervoxels_found = lookup_missing_supervoxels(volume, info, &prefixes, &mut rows).await?;
    let roots_found = lookup_missing_roots(graph, info, &prefixes, &mut rows).await?;
    if supervoxels_found == 0 && roots_found == 0 {
        return Ok(ChunkStatus::Empty);
    }

    let written = write_rows(db, &segmentation_schema, &prefixes, &rows).await?;
    tracing::info!(
        table = %info.annotation_table,
        range = %range,
        supervoxels_found,
        roots_found,
        written,
        "chunk resolved"
    );
    Ok(ChunkStatus::Updated { rows: written })
}

/// Step 1: valid annotation rows in the id range whose segmentation
/// counterpart is missing a supervoxel id, geometry decoded to coordinates.
async fn scan(
    db: &AnnotationDb,
    annotation_schema: &TableSchema,
    segmentation_schema: &TableSchema,
    info: &TableRunInfo,
    range: ChunkRange,
) -> Result<Frame, Error> {
    let spec = QuerySpec::new(&info.annotation_table).filter_equal(
        &info.annotation_table,
        "valid",
        true,
    );
    let opts = LiveOptions {
        id_range: Some((range.start, range.end)),
        missing_supervoxels_only: true,
        order_by_id: true,
        ..Default::default()
    };
    let plan = plan_live(
        &spec,
        annotation_schema,
        segmentation_schema,
        &opts,
        query_engine::DEFAULT_LIMIT_CEILING,
    )?;
    let (frame, _) = plan.fetch(db.pool()).await?;
    Ok(frame)
}

fn decode_rows(frame: &Frame, prefixes: &[String]) -> Result<Vec<ScanRow>, Error> {
    let column = |name: &str| {
        frame
            .column_index(name)
            .ok_or_else(|| Error::MissingColumn(name.to_owned()))
    };
    let id_col = column("id")?;
    let mut layout = Vec::with_capacity(prefixes.len());
    for prefix in prefixes {
        let point = column(&format!("{prefix}{}", schema::POSITION_SUFFIX))?;
        let supervoxel = column(&format!("{prefix}{}", schema::SUPERVOXEL_SUFFIX))?;
        let root = column(&format!("{prefix}{}", schema::ROOT_ID_SUFFIX))?;
        layout.push((prefix.clone(), point, supervoxel, root));
    }

    let mut rows = Vec::with_capacity(frame.len());
    for raw in frame.rows() {
        let Some(id) = raw[id_col].as_i64() else {
            continue;
        };
        let mut row = ScanRow {
            id,
            points: BTreeMap::new(),
            supervoxels: BTreeMap::new(),
            roots: BTreeMap::new(),
            updated: false,
        };
        for (prefix, point, supervoxel, root) in &layout {
            row.points.insert(prefix.clone(), raw[*point].as_point());
            row.supervoxels.insert(prefix.clone(), raw[*supervoxel].as_i64());
            row.roots.insert(prefix.clone(), raw[*root].as_i64());
        }
        rows.push(row);
    }
    Ok(rows)
}

/// Step 2: point lookups for every still-null supervoxel column.
async fn lookup_missing_supervoxels(
    volume: &VolumeClient,
    info: &TableRunInfo,
    prefixes: &[String],
    rows: &mut [ScanRow],
) -> Result<u64, Error> {
    let mut found = 0u64;
    for row in rows.iter_mut() {
        for prefix in prefixes {
            if row.supervoxels[prefix].is_some() {
                continue;
            }
            let Some(point) = row.points[prefix] else {
                continue;
            };
            let supervoxel_id = volume.download_point(point, info.coord_resolution).await?;
            row.supervoxels.insert(prefix.clone(), Some(supervoxel_id));
            row.updated = true;
            found += 1;
        }
    }
    Ok(found)
}

/// Step 3: batched root-id resolution at the materialization timestamp.
async fn lookup_missing_roots(
    graph: &GraphClient,
    info: &TableRunInfo,
    prefixes: &[String],
    rows: &mut [ScanRow],
) -> Result<u64, Error> {
    // Eligibility is decided once per chunk, before any column is filled, so
    // a multi-point row resolves all of its columns in the same pass.
    let eligible: Vec<usize> = rows
        .iter()
        .enumerate()
        .filter(|(_, row)| row.eligible_for_root_lookup())
        .map(|(index, _)| index)
        .collect();

    let mut found = 0u64;
    for prefix in prefixes {
        let batch: Vec<usize> = eligible
            .iter()
            .copied()
            .filter(|&index| rows[index].supervoxels[prefix].is_some())
            .collect();
        if batch.is_empty() {
            continue;
        }
        let supervoxel_ids: Vec<i64> = batch
            .iter()
            .map(|&index| rows[index].supervoxels[prefix].expect("filtered to resolved"))
            .collect();
        let root_ids = graph
            .get_roots(&supervoxel_ids, info.materialization_time)
            .await?;
        for (&index, root_id) in batch.iter().zip(root_ids) {
            rows[index].roots.insert(prefix.clone(), Some(root_id));
            rows[index].updated = true;
            found += 1;
        }
    }
    Ok(found)
}

/// Step 4: id-keyed upsert of the rows that gained a column.
async fn write_rows(
    db: &AnnotationDb,
    segmentation_schema: &TableSchema,
    prefixes: &[String],
    rows: &[ScanRow],
) -> Result<u64, Error> {
    let mut columns = vec!["id".to_owned()];
    for prefix in prefixes {
        columns.push(format!("{prefix}{}", schema::SUPERVOXEL_SUFFIX));
        columns.push(format!("{prefix}{}", schema::ROOT_ID_SUFFIX));
    }

    let cells: Vec<Vec<Cell>> = rows
        .iter()
        .filter(|row| row.updated)
        .map(|row| {
            let mut out = vec![Cell::Int(row.id)];
            for prefix in prefixes {
                out.push(Cell::from(row.supervoxels[prefix]));
                out.push(Cell::from(row.roots[prefix]));
            }
            out
        })
        .collect();

    let written = upsert::upsert_rows(
        db.pool(),
        &segmentation_schema.table,
        &columns,
        &cells,
    )
    .await
    .map_err(annotation_db::Error::from)?;
    Ok(written)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scan_frame() -> Frame {
        let mut frame = Frame::new(vec![
            "id".into(),
            "pt_position".into(),
            "pt_supervoxel_id".into(),
            "pt_root_id".into(),
        ]);
        frame.push_row(vec![
            Cell::Int(1),
            Cell::Point([1.0, 2.0, 3.0]),
            Cell::Null,
            Cell::Null,
        ]);
        frame.push_row(vec![
            Cell::Int(2),
            Cell::Point([4.0, 5.0, 6.0]),
            Cell::Int(77),
            Cell::Int(9001),
        ]);
        frame
    }

    #[test]
    fn decode_rows_reads_per_prefix_state() {
        let rows = decode_rows(&scan_frame(), &["pt".to_owned()]).unwrap();

        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].id, 1);
        assert_eq!(rows[0].points["pt"], Some([1.0, 2.0, 3.0]));
        assert_eq!(rows[0].supervoxels["pt"], None);
        assert_eq!(rows[1].supervoxels["pt"], Some(77));
        assert_eq!(rows[1].roots["pt"], Some(9001));
    }

    #[test]
    fn partially_resolved_rows_are_not_eligible_for_root_lookup() {
        let mut row = ScanRow {
            id: 1,
            points: BTreeMap::new(),
            supervoxels: BTreeMap::new(),
            roots: BTreeMap::from([
                ("pre_pt".to_owned(), Some(11i64)),
                ("post_pt".to_owned(), None),
            ]),
            updated: false,
        };

        assert!(!row.eligible_for_root_lookup());

        row.roots.insert("pre_pt".to_owned(), None);
        assert!(row.eligible_for_root_lookup());
    }

    #[test]
    fn missing_scan_column_is_an_error() {
        let frame = Frame::new(vec!["id".into()]);

        let result = decode_rows(&frame, &["pt".to_owned()]);

        assert!(matches!(result, Err(Error::MissingColumn(_))));
    }
}
