//! Live-update orchestration.
//!
//! Fans the resolution pipeline out over id-range chunks per table, waits on
//! the barrier, then finalizes per-table metadata. Chunks are independent:
//! one chunk exhausting its retries never blocks or rolls back its siblings,
//! and the run report says exactly which ranges failed.

use std::sync::Arc;

use annotation_db::{schema, segmentation::SegmentationTableMeta, AnnotationDb};
use backon::{ExponentialBuilder, Retryable};
use chrono::Utc;
use monitoring::logging;
use tokio::{sync::Semaphore, task::JoinSet};
use tracing::instrument;

use crate::{
    chunks::{id_chunks, ChunkRange},
    info::{self, TableRunInfo},
    pipeline::{self, ChunkStatus},
    retry::{RetryOutcome, RetryPolicy},
    Error, MatCtx,
};

/// Terminal state of one fanned-out chunk.
#[derive(Debug)]
pub enum ChunkResult {
    Completed(ChunkStatus),
    Failed { attempts: u32, error: String },
}

#[derive(Debug)]
pub struct ChunkReport {
    pub range: ChunkRange,
    pub result: ChunkResult,
}

#[derive(Debug)]
pub struct TableReport {
    pub table: String,
    pub chunks: Vec<ChunkReport>,
    pub rows_updated: u64,
}

impl TableReport {
    pub fn failed_chunks(&self) -> usize {
        self.chunks
            .iter()
            .filter(|chunk| matches!(chunk.result, ChunkResult::Failed { .. }))
            .count()
    }

    pub fn is_complete(&self) -> bool {
        self.failed_chunks() == 0
    }
}

#[derive(Debug)]
pub struct RunReport {
    pub tables: Vec<TableReport>,
}

impl RunReport {
    /// Whether every chunk of every table reached a successful terminal
    /// state. A partial run is still a usable run.
    pub fn is_complete(&self) -> bool {
        self.tables.iter().all(TableReport::is_complete)
    }

    pub fn rows_updated(&self) -> u64 {
        self.tables.iter().map(|table| table.rows_updated).sum()
    }
}

/// Runs the live-update workflow over every resolvable table.
#[instrument(skip(ctx), err)]
pub async fn run_live_update(
    ctx: &MatCtx,
    live_database: &str,
    graph_table: &str,
    segmentation_source: &str,
) -> Result<RunReport, Error> {
    let db = AnnotationDb::open_live(&ctx.pools, live_database).await?;
    let materialization_time = Utc::now();
    let infos = info::gather(
        &db,
        graph_table,
        segmentation_source,
        &ctx.config,
        materialization_time,
    )
    .await?;
    tracing::info!(tables = infos.len(), "starting live update");

    let mut tables = Vec::with_capacity(infos.len());
    for table_info in infos {
        ensure_segmentation_table(&db, &table_info).await?;
        let report = update_table(ctx, &db, &table_info).await?;
        if !report.is_complete() {
            tracing::error!(
                table = %report.table,
                failed = report.failed_chunks(),
                "table resolution incomplete"
            );
        }
        tables.push(report);
    }
    Ok(RunReport { tables })
}

/// Creates the segmentation companion table and its metadata row when absent.
async fn ensure_segmentation_table(db: &AnnotationDb, info: &TableRunInfo) -> Result<(), Error> {
    let annotation_schema = db.table_schema(&info.annotation_table).await?;
    let segmentation_schema =
        schema::segmentation_schema(&annotation_schema, &info.segmentation_table);
    segmentation_schema
        .create_table(&**db.pool())
        .await
        .map_err(annotation_db::Error::from)?;

    let registered = db
        .register_segmentation_table(&SegmentationTableMeta {
            table_name: info.segmentation_table.clone(),
            annotation_table: info.annotation_table.clone(),
            schema_type: info.schema_type.clone(),
            graph_table: info.graph_table.clone(),
            valid: true,
            created: info.materialization_time,
            last_updated: None,
        })
        .await?;
    if registered {
        tracing::info!(table = %info.segmentation_table, "segmentation table created");
    }
    Ok(())
}

/// Fan-out, barrier, fan-in for one table.
async fn update_table(
    ctx: &MatCtx,
    db: &AnnotationDb,
    info: &TableRunInfo,
) -> Result<TableReport, Error> {
    let chunks = id_chunks(info.max_id, info.chunk_size);
    let semaphore = Arc::new(Semaphore::new(ctx.config.worker_concurrency));
    let policy = RetryPolicy::default();
    let graph = ctx.clients.graph(&info.graph_table);
    let volume = ctx.clients.volume(&info.segmentation_source);

    let mut join_set = JoinSet::new();
    for range in chunks {
        let semaphore = Arc::clone(&semaphore);
        let db = db.clone();
        let graph = Arc::clone(&graph);
        let volume = Arc::clone(&volume);
        let info = info.clone();
        let leases = ctx.leases.clone();
        join_set.spawn(async move {
            let _permit = semaphore.acquire().await.expect("semaphore closed");
            let _lease = leases.acquire(&info.annotation_table, range);
            let outcome = policy
                .run(
                    || pipeline::process_chunk(&db, &graph, &volume, &info, range),
                    // Any chunk failure is retried as a whole; the retry
                    // budget is the only bound.
                    |_| true,
                )
                .await;
            (range, outcome)
        });
    }

    // Barrier: the finalize step must not run before every chunk is terminal.
    let mut chunk_reports = Vec::new();
    let mut rows_updated = 0u64;
    while let Some(joined) = join_set.join_next().await {
        let (range, outcome) = match joined {
            Ok(result) => result,
            Err(join_error) => {
                tracing::error!(error = %join_error, "chunk task aborted");
                continue;
            }
        };
        let result = match outcome {
            RetryOutcome::Success(status) => {
                if let ChunkStatus::Updated { rows } = status {
                    rows_updated += rows;
                }
                ChunkResult::Completed(status)
            }
            RetryOutcome::Exhausted { attempts, error } => {
                tracing::error!(
                    table = %info.annotation_table,
                    range = %range,
                    attempts,
                    error = %error, error_source = logging::error_source(&error),
                    "chunk failed after retries"
                );
                ChunkResult::Failed {
                    attempts,
                    error: error.to_string(),
                }
            }
            RetryOutcome::Fatal(error) => ChunkResult::Failed {
                attempts: 1,
                error: error.to_string(),
            },
        };
        chunk_reports.push(ChunkReport { range, result });
    }
    chunk_reports.sort_by_key(|chunk| chunk.range.start);

    let report = TableReport {
        table: info.annotation_table.clone(),
        chunks: chunk_reports,
        rows_updated,
    };

    // Fan-in: the last-updated watermark only moves when every chunk made it,
    // so failed ranges are picked up again by the next run.
    if report.is_complete() {
        (|| db.set_segmentation_last_updated(&info.segmentation_table, info.materialization_time))
            .retry(ExponentialBuilder::default())
            .when(annotation_db::Error::is_connection_error)
            .notify(|err, dur| {
                tracing::warn!(
                    table = %info.segmentation_table,
                    error = %err, error_source = logging::error_source(err),
                    "Connection error while updating table metadata. Retrying in {:.1}s",
                    dur.as_secs_f32()
                );
            })
            .await?;
    }
    Ok(report)
}
