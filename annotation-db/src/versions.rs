//! Frozen-snapshot version metadata

use chrono::{DateTime, Duration, Utc};
use sqlx::Postgres;

/// A version created close to its expiry gets pushed out this far when a
/// derived version pins it.
const DERIVED_EXPIRY_EXTENSION_DAYS: i64 = 36_525;
/// Remaining lifetime below which a pinned parent is extended.
const DERIVED_EXPIRY_THRESHOLD_DAYS: i64 = 1_000;

/// A unique identifier for a frozen version
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    sqlx::Type,
    serde::Serialize,
    serde::Deserialize,
)]
#[repr(transparent)]
#[serde(transparent)]
#[sqlx(transparent)]
pub struct VersionId(i64);

impl VersionId {
    /// Convert the [`VersionId`] to an `i64`
    pub fn to_i64(self) -> i64 {
        self.0
    }
}

impl From<VersionId> for i64 {
    fn from(id: VersionId) -> Self {
        id.0
    }
}

impl From<i64> for VersionId {
    fn from(id: i64) -> Self {
        VersionId(id)
    }
}

impl std::fmt::Display for VersionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// One frozen snapshot of a namespace.
///
/// Created at snapshot-freeze time with the next monotonic version number.
/// Rows are never mutated afterwards, except that `valid` is cleared when the
/// version is superseded or expires, and `expires_on` is pushed out when a
/// derived version pins this one.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct Version {
    pub id: VersionId,

    /// Logical namespace the snapshot belongs to.
    pub namespace: String,

    /// Monotonically increasing number within the namespace.
    pub version: i32,

    /// The instant the snapshot is consistent with.
    pub time_stamp: DateTime<Utc>,

    pub valid: bool,

    pub expires_on: Option<DateTime<Utc>>,

    /// Set on derived (virtual) versions; references the frozen version the
    /// derived one shares data with.
    pub parent_version: Option<VersionId>,

    /// Whether annotation and segmentation data were merged into flat tables
    /// at freeze time, or kept as split tables.
    pub is_merged: bool,
}

impl Version {
    /// The name of the database holding this version's frozen tables.
    pub fn database_name(&self) -> String {
        format!("{}_v{}", self.namespace, self.version)
    }

    /// Absolute distance between the version and a requested timestamp.
    pub fn distance_to(&self, timestamp: DateTime<Utc>) -> Duration {
        (self.time_stamp - timestamp).abs()
    }
}

/// Allocates the next version number in a namespace and inserts the record.
///
/// The `UNIQUE (namespace, version)` constraint turns a lost race into a
/// constraint violation rather than a duplicated number.
pub async fn create<'c, E>(
    exe: E,
    namespace: &str,
    time_stamp: DateTime<Utc>,
    expires_on: Option<DateTime<Utc>>,
    is_merged: bool,
) -> Result<Version, sqlx::Error>
where
    E: sqlx::Executor<'c, Database = Postgres>,
{
    let query = indoc::indoc! {r#"
        INSERT INTO versions (namespace, version, time_stamp, valid, expires_on, is_merged)
        SELECT $1, COALESCE(MAX(version), 0) + 1, $2, TRUE, $3, $4
        FROM versions
        WHERE namespace = $1
        RETURNING id, namespace, version, time_stamp, valid, expires_on, parent_version, is_merged
    "#};
    sqlx::query_as(query)
        .bind(namespace)
        .bind(time_stamp)
        .bind(expires_on)
        .bind(is_merged)
        .fetch_one(exe)
        .await
}

/// Inserts a derived version that shares its parent's timestamp and number.
pub async fn create_derived<'c, E>(
    exe: E,
    namespace: &str,
    parent: &Version,
    expires_on: Option<DateTime<Utc>>,
) -> Result<Version, sqlx::Error>
where
    E: sqlx::Executor<'c, Database = Postgres>,
{
    let query = indoc::indoc! {r#"
        INSERT INTO versions
            (namespace, version, time_stamp, valid, expires_on, parent_version, is_merged)
        VALUES ($1, $2, $3, TRUE, $4, $5, $6)
        RETURNING id, namespace, version, time_stamp, valid, expires_on, parent_version, is_merged
    "#};
    sqlx::query_as(query)
        .bind(namespace)
        .bind(parent.version)
        .bind(parent.time_stamp)
        .bind(expires_on)
        .bind(parent.id)
        .bind(parent.is_merged)
        .fetch_one(exe)
        .await
}

/// Gets a version by namespace and version number.
pub async fn get<'c, E>(
    exe: E,
    namespace: &str,
    version: i32,
) -> Result<Option<Version>, sqlx::Error>
where
    E: sqlx::Executor<'c, Database = Postgres>,
{
    let query = indoc::indoc! {r#"
        SELECT id, namespace, version, time_stamp, valid, expires_on, parent_version, is_merged
        FROM versions
        WHERE namespace = $1 AND version = $2
    "#};
    sqlx::query_as(query)
        .bind(namespace)
        .bind(version)
        .fetch_optional(exe)
        .await
}

/// Lists all valid versions of a namespace, oldest first.
pub async fn list_valid<'c, E>(exe: E, namespace: &str) -> Result<Vec<Version>, sqlx::Error>
where
    E: sqlx::Executor<'c, Database = Postgres>,
{
    let query = indoc::indoc! {r#"
        SELECT id, namespace, version, time_stamp, valid, expires_on, parent_version, is_merged
        FROM versions
        WHERE namespace = $1 AND valid = TRUE
        ORDER BY version ASC
    "#};
    sqlx::query_as(query).bind(namespace).fetch_all(exe).await
}

/// The nearest valid version strictly before the timestamp.
pub async fn closest_past<'c, E>(
    exe: E,
    namespace: &str,
    timestamp: DateTime<Utc>,
) -> Result<Option<Version>, sqlx::Error>
where
    E: sqlx::Executor<'c, Database = Postgres>,
{
    let query = indoc::indoc! {r#"
        SELECT id, namespace, version, time_stamp, valid, expires_on, parent_version, is_merged
        FROM versions
        WHERE namespace = $1 AND valid = TRUE AND time_stamp < $2
        ORDER BY time_stamp DESC
        LIMIT 1
    "#};
    sqlx::query_as(query)
        .bind(namespace)
        .bind(timestamp)
        .fetch_optional(exe)
        .await
}

/// The nearest valid version strictly after the timestamp.
pub async fn closest_future<'c, E>(
    exe: E,
    namespace: &str,
    timestamp: DateTime<Utc>,
) -> Result<Option<Version>, sqlx::Error>
where
    E: sqlx::Executor<'c, Database = Postgres>,
{
    let query = indoc::indoc! {r#"
        SELECT id, namespace, version, time_stamp, valid, expires_on, parent_version, is_merged
        FROM versions
        WHERE namespace = $1 AND valid = TRUE AND time_stamp > $2
        ORDER BY time_stamp ASC
        LIMIT 1
    "#};
    sqlx::query_as(query)
        .bind(namespace)
        .bind(timestamp)
        .fetch_optional(exe)
        .await
}

/// Clears the `valid` flag on a superseded or expired version.
pub async fn mark_invalid<'c, E>(exe: E, id: VersionId) -> Result<(), sqlx::Error>
where
    E: sqlx::Executor<'c, Database = Postgres>,
{
    sqlx::query("UPDATE versions SET valid = FALSE WHERE id = $1")
        .bind(id)
        .execute(exe)
        .await?;
    Ok(())
}

/// Pushes out the expiration of a version pinned by a derived one.
pub async fn set_expiration<'c, E>(
    exe: E,
    id: VersionId,
    expires_on: DateTime<Utc>,
) -> Result<(), sqlx::Error>
where
    E: sqlx::Executor<'c, Database = Postgres>,
{
    sqlx::query("UPDATE versions SET expires_on = $1 WHERE id = $2")
        .bind(expires_on)
        .bind(id)
        .execute(exe)
        .await?;
    Ok(())
}

/// The expiration a derived version (and its pinned parent) should carry.
///
/// A parent close to its own expiry is extended far into the future so the
/// derived version's data does not disappear under it.
pub fn derived_expiration(
    parent_expires_on: Option<DateTime<Utc>>,
    now: DateTime<Utc>,
) -> Option<DateTime<Utc>> {
    let expires_on = parent_expires_on?;
    if (expires_on - now).num_days() < DERIVED_EXPIRY_THRESHOLD_DAYS {
        Some(expires_on + Duration::days(DERIVED_EXPIRY_EXTENSION_DAYS))
    } else {
        Some(expires_on)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn version(number: i32, time_stamp: DateTime<Utc>) -> Version {
        Version {
            id: VersionId(number as i64),
            namespace: "minnie65".into(),
            version: number,
            time_stamp,
            valid: true,
            expires_on: None,
            parent_version: None,
            is_merged: true,
        }
    }

    #[test]
    fn database_name_carries_version_number() {
        let ts = "2020-01-01T00:00:00Z".parse().unwrap();

        assert_eq!(version(7, ts).database_name(), "minnie65_v7");
    }

    #[test]
    fn distance_is_symmetric() {
        let ts = "2020-01-01T00:00:00Z".parse().unwrap();
        let v = version(1, ts);

        let before = v.distance_to("2019-12-31T00:00:00Z".parse().unwrap());
        let after = v.distance_to("2020-01-02T00:00:00Z".parse().unwrap());

        assert_eq!(before, after);
    }

    #[test]
    fn derived_expiration_extends_when_close() {
        let now: DateTime<Utc> = "2020-01-01T00:00:00Z".parse().unwrap();
        let soon = now + Duration::days(30);
        let far = now + Duration::days(2_000);

        let extended = derived_expiration(Some(soon), now).unwrap();
        let untouched = derived_expiration(Some(far), now).unwrap();

        assert_eq!(extended, soon + Duration::days(36_525));
        assert_eq!(untouched, far);
        assert_eq!(derived_expiration(None, now), None);
    }
}
