//! Anchor-version selection for temporal queries.

use annotation_db::Version;
use chrono::{DateTime, Utc};

use crate::Error;

/// Picks the anchor snapshot for a requested timestamp.
///
/// `past` and `future` are the nearest valid versions strictly before and
/// strictly after the timestamp. The closer one wins; on a tie the past
/// version does. With no version on either side no temporal query is
/// possible.
pub fn choose_anchor(
    past: Option<Version>,
    future: Option<Version>,
    timestamp: DateTime<Utc>,
) -> Result<Version, Error> {
    match (past, future) {
        (Some(past), Some(future)) => {
            if past.distance_to(timestamp) <= future.distance_to(timestamp) {
                Ok(past)
            } else {
                Ok(future)
            }
        }
        (Some(past), None) => Ok(past),
        (None, Some(future)) => Ok(future),
        (None, None) => Err(Error::NoAnchorVersion { timestamp }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn version(number: i32, time_stamp: &str) -> Version {
        Version {
            id: i64::from(number).into(),
            namespace: "minnie65".into(),
            version: number,
            time_stamp: time_stamp.parse().unwrap(),
            valid: true,
            expires_on: None,
            parent_version: None,
            is_merged: true,
        }
    }

    #[test]
    fn picks_the_closer_version() {
        let past = version(1, "2020-01-01T00:00:00Z");
        let future = version(2, "2020-01-10T00:00:00Z");

        let anchor = choose_anchor(
            Some(past),
            Some(future),
            "2020-01-08T00:00:00Z".parse().unwrap(),
        )
        .unwrap();

        assert_eq!(anchor.version, 2);
    }

    #[test]
    fn past_wins_ties() {
        let past = version(1, "2020-01-01T00:00:00Z");
        let future = version(2, "2020-01-03T00:00:00Z");

        let anchor = choose_anchor(
            Some(past),
            Some(future),
            "2020-01-02T00:00:00Z".parse().unwrap(),
        )
        .unwrap();

        assert_eq!(anchor.version, 1);
    }

    #[test]
    fn single_sided_version_is_used() {
        let past = version(1, "2020-01-01T00:00:00Z");

        let anchor =
            choose_anchor(Some(past), None, "2020-06-01T00:00:00Z".parse().unwrap()).unwrap();

        assert_eq!(anchor.version, 1);
    }

    #[test]
    fn no_versions_is_an_error() {
        let result = choose_anchor(None, None, "2020-06-01T00:00:00Z".parse().unwrap());

        assert!(matches!(result, Err(Error::NoAnchorVersion { .. })));
    }
}
