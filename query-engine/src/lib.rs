//! Query construction and temporal reconciliation over the annotation store.
//!
//! The store's frozen snapshots are each correct at a single instant; this
//! crate stitches the nearest snapshot together with the live delta to answer
//! queries at arbitrary timestamps, and owns the query-construction layer
//! both legs are built with.

use chrono::{DateTime, Utc};

pub mod builder;
pub mod column_map;
pub mod frame;
pub mod reconcile;
pub mod temporal;
pub mod version_select;

pub use self::{
    builder::{
        apply_user_filters, plan_frozen, plan_live, BoundingBox, Join, LiveOptions, QueryPlan,
        QuerySpec, DEFAULT_LIMIT_CEILING,
    },
    column_map::ColumnMap,
    frame::Frame,
    reconcile::reconcile,
    temporal::{QueryOutput, TemporalQuery},
    version_select::choose_anchor,
};

#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// A malformed filter, join, or timestamp combination. User-caused and
    /// not retryable.
    #[error("invalid query: {0}")]
    InvalidQuery(String),

    /// No valid frozen version exists on either side of the requested
    /// timestamp. A service-state problem, not a user error.
    #[error("no valid version before or after {timestamp}")]
    NoAnchorVersion { timestamp: DateTime<Utc> },

    /// Both the snapshot and the delta leg came back absent.
    #[error("query on table {table} returned no results")]
    NoResults { table: String },

    #[error(transparent)]
    Store(#[from] annotation_db::Error),
}

impl Error {
    /// Whether retrying the operation could help.
    pub fn is_transient(&self) -> bool {
        match self {
            Error::Store(err) => err.is_connection_error(),
            _ => false,
        }
    }
}
