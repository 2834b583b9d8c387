#![cfg(feature = "temp-db")]

use annotation_db::{AnnotationDb, DbPools, SegmentationTableMeta};
use chrono::Utc;
use pgtemp::PgTempDB;
use url::Url;

async fn temp_annotation_db(temp_db: &PgTempDB) -> AnnotationDb {
    let url: Url = temp_db
        .connection_uri()
        .parse()
        .expect("Invalid temp db uri");
    let database = url.path().trim_start_matches('/').to_owned();
    let pools = DbPools::new(url);
    AnnotationDb::open_live(&pools, &database)
        .await
        .expect("Failed to connect to annotation db")
}

#[tokio::test]
async fn version_numbers_increase_monotonically() {
    //* Given
    let temp_db = PgTempDB::new();
    let db = temp_annotation_db(&temp_db).await;

    //* When
    let first = db
        .create_version("minnie65", Utc::now(), None, true)
        .await
        .expect("Failed to create version");
    let second = db
        .create_version("minnie65", Utc::now(), None, true)
        .await
        .expect("Failed to create version");

    //* Then
    assert_eq!(first.version, 1);
    assert_eq!(second.version, 2);
    assert!(second.valid);
}

#[tokio::test]
async fn closest_versions_straddle_the_timestamp() {
    //* Given
    let temp_db = PgTempDB::new();
    let db = temp_annotation_db(&temp_db).await;

    let early = "2020-01-01T00:00:00Z".parse().unwrap();
    let late = "2020-03-01T00:00:00Z".parse().unwrap();
    db.create_version("minnie65", early, None, true)
        .await
        .expect("Failed to create version");
    db.create_version("minnie65", late, None, true)
        .await
        .expect("Failed to create version");

    //* When
    let (past, future) = db
        .closest_versions("minnie65", "2020-02-01T00:00:00Z".parse().unwrap())
        .await
        .expect("Failed to query closest versions");

    //* Then
    assert_eq!(past.expect("No past version").time_stamp, early);
    assert_eq!(future.expect("No future version").time_stamp, late);
}

#[tokio::test]
async fn invalid_versions_are_not_anchors() {
    //* Given
    let temp_db = PgTempDB::new();
    let db = temp_annotation_db(&temp_db).await;

    let version = db
        .create_version("minnie65", "2020-01-01T00:00:00Z".parse().unwrap(), None, true)
        .await
        .expect("Failed to create version");

    //* When
    db.mark_version_invalid(version.id)
        .await
        .expect("Failed to invalidate version");
    let (past, future) = db
        .closest_versions("minnie65", "2020-02-01T00:00:00Z".parse().unwrap())
        .await
        .expect("Failed to query closest versions");

    //* Then
    assert!(past.is_none());
    assert!(future.is_none());
}

#[tokio::test]
async fn version_table_registration_is_guarded() {
    //* Given
    let temp_db = PgTempDB::new();
    let db = temp_annotation_db(&temp_db).await;

    let version = db
        .create_version("minnie65", Utc::now(), None, true)
        .await
        .expect("Failed to create version");

    //* When
    let first = db
        .register_version_table(version.id, "synapses", "synapse", Utc::now())
        .await
        .expect("Failed to register table");
    let second = db
        .register_version_table(version.id, "synapses", "synapse", Utc::now())
        .await
        .expect("Failed to register table twice");

    //* Then
    assert!(first);
    assert!(!second, "duplicate registration must be a no-op");
    let tables = db
        .version_tables(version.id)
        .await
        .expect("Failed to list version tables");
    assert_eq!(tables.len(), 1);
}

#[tokio::test]
async fn segmentation_metadata_tracks_last_updated() {
    //* Given
    let temp_db = PgTempDB::new();
    let db = temp_annotation_db(&temp_db).await;

    sqlx::query(
        "INSERT INTO annotation_tables (table_name, schema_type, created, last_modified)
         VALUES ('synapses', 'synapse', now(), now())",
    )
    .execute(&**db.pool())
    .await
    .expect("Failed to insert annotation table row");

    let meta = SegmentationTableMeta {
        table_name: "synapses__minnie3_v1".into(),
        annotation_table: "synapses".into(),
        schema_type: "synapse".into(),
        graph_table: "minnie3_v1".into(),
        valid: true,
        created: Utc::now(),
        last_updated: None,
    };

    //* When
    let registered = db
        .register_segmentation_table(&meta)
        .await
        .expect("Failed to register segmentation table");
    let resolved_at = Utc::now();
    db.set_segmentation_last_updated("synapses__minnie3_v1", resolved_at)
        .await
        .expect("Failed to set last updated");

    //* Then
    assert!(registered);
    let fetched = db
        .segmentation_table_meta("synapses__minnie3_v1")
        .await
        .expect("Failed to fetch metadata")
        .expect("Metadata row missing");
    let fetched_at = fetched.last_updated.expect("last_updated not set");
    // Postgres stores microseconds; compare at that precision.
    assert_eq!(fetched_at.timestamp_micros(), resolved_at.timestamp_micros());
}
