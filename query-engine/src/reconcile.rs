//! Snapshot + delta reconciliation.
//!
//! A frozen snapshot is only correct at its own timestamp. To answer a query
//! at any other time the snapshot result is combined with the live delta
//! (the rows created or deleted between the two instants) into the single
//! result set valid at the requested time.
//!
//! Projection runs in either direction. Forward (anchor before request):
//! rows deleted inside the window leave the snapshot, rows created inside it
//! arrive from the delta. Backward: the roles of `created` and `deleted`
//! swap, with the identical comparison structure. Rows both created and
//! deleted inside the window never survive either direction.

use std::collections::BTreeMap;

use annotation_db::Cell;
use chrono::{DateTime, Utc};

use crate::{column_map::ColumnMap, frame::Frame, Error};

/// Indices of the bookkeeping columns inside a delta frame.
struct CrudIndices {
    id: usize,
    created: usize,
    deleted: usize,
}

impl CrudIndices {
    fn resolve(frame: &Frame, table: &str, column_map: &ColumnMap) -> Result<Self, Error> {
        let index = |logical: &str| -> Result<usize, Error> {
            let physical = column_map.physical(table, logical).ok_or_else(|| {
                Error::InvalidQuery(format!("column map is missing {table}.{logical}"))
            })?;
            frame.column_index(physical).ok_or_else(|| {
                Error::InvalidQuery(format!("delta result is missing column {physical}"))
            })
        };
        Ok(Self {
            id: index("id")?,
            created: index("created")?,
            deleted: index("deleted")?,
        })
    }
}

/// Produces the result set valid at `requested` from a snapshot frozen at
/// `anchor` and the live delta between the two timestamps.
///
/// Either input may be absent: no snapshot means the anchor table was empty
/// (or not materialized), no delta means nothing changed in the window. Both
/// absent is an error. The merge is keyed by row id, with a row present in
/// both inputs contributing its delta version, and the CRUD bookkeeping columns
/// are stripped from the final frame after the decisions are made.
pub fn reconcile(
    snapshot: Option<Frame>,
    delta: Option<Frame>,
    anchor: DateTime<Utc>,
    requested: DateTime<Utc>,
    table: &str,
    column_map: &ColumnMap,
) -> Result<Frame, Error> {
    let (start, end) = if anchor < requested {
        (anchor, requested)
    } else {
        (requested, anchor)
    };
    let forward = anchor < requested;

    let Some(delta) = delta else {
        // Nothing changed in the window; the snapshot already answers the
        // request once the bookkeeping columns are gone.
        let snapshot = snapshot.ok_or_else(|| Error::NoResults {
            table: table.to_owned(),
        })?;
        return Ok(strip_crud(snapshot, column_map));
    };

    let crud = CrudIndices::resolve(&delta, table, column_map)?;
    let in_window = |cell: &Cell| -> bool {
        cell.as_timestamp()
            .map_or(false, |ts| ts > start && ts < end)
    };

    // Row ids the snapshot must not contribute: forward projection drops
    // rows deleted in-window, backward projection drops rows that only came
    // to exist in-window.
    let mut removed_from_snapshot: Vec<i64> = Vec::new();
    // Keyed delta rows that belong in the result.
    let mut merged: BTreeMap<i64, Vec<Cell>> = BTreeMap::new();

    for row in delta.rows() {
        let Some(id) = row[crud.id].as_i64() else {
            continue;
        };
        let created_in = in_window(&row[crud.created]);
        let deleted_in = in_window(&row[crud.deleted]);

        let (arrives, departs) = if forward {
            (created_in, deleted_in)
        } else {
            (deleted_in, created_in)
        };

        if departs {
            removed_from_snapshot.push(id);
            continue;
        }
        // With a snapshot present every surviving delta row participates in
        // the keyed merge (overwriting its snapshot counterpart); without one
        // only the net additions over the window belong in the result.
        if snapshot.is_some() || arrives {
            merged.insert(id, row.to_vec());
        }
    }

    let columns: Vec<String> = delta.columns().to_vec();
    let mut combined = Frame::new(columns.clone());
    let delta_column_count = columns.len();

    if let Some(snapshot) = &snapshot {
        let id_physical = column_map.physical(table, "id").unwrap_or("id");
        let Some(snapshot_id) = snapshot.column_index(id_physical) else {
            return Err(Error::InvalidQuery(format!(
                "snapshot result is missing column {id_physical}"
            )));
        };
        // Align snapshot rows onto the delta column layout; the snapshot has
        // no CRUD columns, those cells stay null and are stripped below.
        let aligned: Vec<Option<usize>> = columns
            .iter()
            .map(|name| snapshot.column_index(name))
            .collect();
        for row in snapshot.rows() {
            let Some(id) = row[snapshot_id].as_i64() else {
                continue;
            };
            if removed_from_snapshot.contains(&id) || merged.contains_key(&id) {
                continue;
            }
            let cells: Vec<Cell> = aligned
                .iter()
                .map(|source| source.map_or(Cell::Null, |i| row[i].clone()))
                .collect();
            debug_assert_eq!(cells.len(), delta_column_count);
            merged.insert(id, cells);
        }
    }

    for (_, row) in merged {
        combined.push_row(row);
    }
    Ok(strip_crud(combined, column_map))
}

fn strip_crud(frame: Frame, column_map: &ColumnMap) -> Frame {
    frame.drop_columns(&column_map.crud_physical_columns())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ts(s: &str) -> DateTime<Utc> {
        s.parse().unwrap()
    }

    fn column_map() -> ColumnMap {
        let mut map = ColumnMap::new();
        for col in ["id", "created", "deleted", "superseded_id", "size"] {
            map.insert("synapses", col, col);
        }
        map
    }

    fn snapshot(rows: &[(i64, f64)]) -> Frame {
        let mut frame = Frame::new(vec!["id".into(), "size".into()]);
        for (id, size) in rows {
            frame.push_row(vec![Cell::Int(*id), Cell::Float(*size)]);
        }
        frame
    }

    fn delta(rows: &[(i64, &str, Option<&str>, f64)]) -> Frame {
        let mut frame = Frame::new(vec![
            "id".into(),
            "created".into(),
            "deleted".into(),
            "superseded_id".into(),
            "size".into(),
        ]);
        for (id, created, deleted, size) in rows {
            frame.push_row(vec![
                Cell::Int(*id),
                Cell::Timestamp(ts(created)),
                deleted.map(|d| Cell::Timestamp(ts(d))).unwrap_or(Cell::Null),
                Cell::Null,
                Cell::Float(*size),
            ]);
        }
        frame
    }

    fn ids(frame: &Frame) -> Vec<i64> {
        frame
            .column_values("id")
            .unwrap()
            .iter()
            .map(|c| c.as_i64().unwrap())
            .collect()
    }

    #[test]
    fn forward_adds_created_and_removes_deleted() {
        //* Given
        // Snapshot at t=10 holds rows 1 and 2. In (10, 20): row 2 deleted,
        // row 3 created.
        let snap = snapshot(&[(1, 1.0), (2, 2.0)]);
        let del = delta(&[
            (2, "2020-01-05T00:00:00Z", Some("2020-01-15T00:00:00Z"), 2.0),
            (3, "2020-01-12T00:00:00Z", None, 3.0),
        ]);

        //* When
        let result = reconcile(
            Some(snap),
            Some(del),
            ts("2020-01-10T00:00:00Z"),
            ts("2020-01-20T00:00:00Z"),
            "synapses",
            &column_map(),
        )
        .unwrap();

        //* Then
        assert_eq!(ids(&result), vec![1, 3]);
        assert!(result.column_index("created").is_none());
        assert!(result.column_index("deleted").is_none());
        assert!(result.column_index("superseded_id").is_none());
    }

    #[test]
    fn forward_excludes_rows_created_and_deleted_in_window() {
        //* Given
        // Row 9 created 2020-03-01 and deleted 2020-04-01; snapshot at
        // 2020-01-01 never saw it; query at 2020-05-01 must not see it either.
        let snap = snapshot(&[(1, 1.0)]);
        let del = delta(&[(
            9,
            "2020-03-01T00:00:00Z",
            Some("2020-04-01T00:00:00Z"),
            9.0,
        )]);

        //* When
        let result = reconcile(
            Some(snap),
            Some(del),
            ts("2020-01-01T00:00:00Z"),
            ts("2020-05-01T00:00:00Z"),
            "synapses",
            &column_map(),
        )
        .unwrap();

        //* Then
        assert_eq!(ids(&result), vec![1]);
    }

    #[test]
    fn row_in_snapshot_and_delta_appears_once() {
        //* Given
        // Row 1 exists since before the snapshot and was touched in-window
        // (appears in the delta with no in-window deletion).
        let snap = snapshot(&[(1, 1.0)]);
        let del = delta(&[(1, "2019-06-01T00:00:00Z", None, 1.5)]);

        //* When
        let result = reconcile(
            Some(snap),
            Some(del),
            ts("2020-01-01T00:00:00Z"),
            ts("2020-06-01T00:00:00Z"),
            "synapses",
            &column_map(),
        )
        .unwrap();

        //* Then
        assert_eq!(ids(&result), vec![1]);
        // The delta version of the row wins the merge.
        assert_eq!(result.cell(0, "size"), Some(&Cell::Float(1.5)));
    }

    #[test]
    fn backward_swaps_created_and_deleted_roles() {
        //* Given
        // Snapshot at t=30. Row 4 was created in (20, 30), so it must not
        // exist at t=20. Row 5 was deleted in (20, 30): absent from the
        // snapshot but alive at t=20, it comes back from the delta.
        let snap = snapshot(&[(1, 1.0), (4, 4.0)]);
        let del = delta(&[
            (4, "2020-01-25T00:00:00Z", None, 4.0),
            (5, "2019-01-01T00:00:00Z", Some("2020-01-28T00:00:00Z"), 5.0),
        ]);

        //* When
        let result = reconcile(
            Some(snap),
            Some(del),
            ts("2020-01-30T00:00:00Z"),
            ts("2020-01-20T00:00:00Z"),
            "synapses",
            &column_map(),
        )
        .unwrap();

        //* Then
        assert_eq!(ids(&result), vec![1, 5]);
    }

    #[test]
    fn forward_and_backward_agree_on_shared_history() {
        //* Given
        // Underlying history: row 1 alive throughout, row 2 deleted at
        // 2020-01-15, row 3 created 2020-01-12. Version A frozen at
        // 2020-01-10, version B frozen at 2020-01-30, request at 2020-01-20.
        let request = ts("2020-01-20T00:00:00Z");
        let history = |window: (&str, &str)| {
            let rows: Vec<(i64, &str, Option<&str>, f64)> = vec![
                (2, "2020-01-01T00:00:00Z", Some("2020-01-15T00:00:00Z"), 2.0),
                (3, "2020-01-12T00:00:00Z", None, 3.0),
            ];
            let (start, end) = (ts(window.0), ts(window.1));
            let mut frame = delta(&rows);
            frame.retain_rows(|row| {
                let created = row[1].as_timestamp().unwrap();
                let deleted = row[2].as_timestamp();
                (created > start && created < end)
                    || deleted.map_or(false, |d| d > start && d < end)
            });
            frame
        };

        //* When
        let forward = reconcile(
            Some(snapshot(&[(1, 1.0), (2, 2.0)])),
            Some(history(("2020-01-10T00:00:00Z", "2020-01-20T00:00:00Z"))),
            ts("2020-01-10T00:00:00Z"),
            request,
            "synapses",
            &column_map(),
        )
        .unwrap();
        let backward = reconcile(
            Some(snapshot(&[(1, 1.0), (3, 3.0)])),
            Some(history(("2020-01-20T00:00:00Z", "2020-01-30T00:00:00Z"))),
            ts("2020-01-30T00:00:00Z"),
            request,
            "synapses",
            &column_map(),
        )
        .unwrap();

        //* Then
        assert_eq!(ids(&forward), vec![1, 3]);
        assert_eq!(ids(&backward), vec![1, 3]);
    }

    #[test]
    fn empty_snapshot_without_delta_returns_empty() {
        //* Given
        let snap = snapshot(&[]);

        //* When
        let result = reconcile(
            Some(snap),
            None,
            ts("2020-01-01T00:00:00Z"),
            ts("2020-06-01T00:00:00Z"),
            "synapses",
            &column_map(),
        )
        .unwrap();

        //* Then
        assert!(result.is_empty());
    }

    #[test]
    fn both_absent_is_no_results() {
        let result = reconcile(
            None,
            None,
            ts("2020-01-01T00:00:00Z"),
            ts("2020-06-01T00:00:00Z"),
            "synapses",
            &column_map(),
        );

        assert!(matches!(result, Err(Error::NoResults { .. })));
    }

    #[test]
    fn delta_only_adds_net_new_rows() {
        //* Given
        // No snapshot result (zero frozen rows); a row created in-window.
        let del = delta(&[(7, "2020-02-01T00:00:00Z", None, 7.0)]);

        //* When
        let result = reconcile(
            None,
            Some(del),
            ts("2020-01-01T00:00:00Z"),
            ts("2020-06-01T00:00:00Z"),
            "synapses",
            &column_map(),
        )
        .unwrap();

        //* Then
        assert_eq!(ids(&result), vec![7]);
    }
}
