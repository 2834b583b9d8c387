//! Row-major tabular results.
//!
//! A [`Frame`] is what every query leg produces and what the reconciler
//! merges: an ordered list of column names plus rows of dynamically typed
//! cells. Nothing here knows about logical-vs-physical column naming; that
//! lives in the [`crate::column_map::ColumnMap`] produced alongside.

use annotation_db::{Cell, CellError};
use sqlx::{postgres::PgRow, Row as _};

#[derive(Debug, Clone, PartialEq)]
pub struct Frame {
    columns: Vec<String>,
    rows: Vec<Vec<Cell>>,
}

impl Frame {
    pub fn new(columns: Vec<String>) -> Self {
        Self {
            columns,
            rows: Vec::new(),
        }
    }

    /// Decodes fetched Postgres rows into a frame.
    ///
    /// With zero rows the column set is still recovered from the row
    /// metadata-less case by the caller passing `columns`; sqlx only exposes
    /// columns on actual rows.
    pub fn from_pg_rows(columns: Vec<String>, pg_rows: &[PgRow]) -> Result<Self, CellError> {
        let mut frame = Self::new(columns);
        for pg_row in pg_rows {
            debug_assert_eq!(pg_row.columns().len(), frame.columns.len());
            let mut row = Vec::with_capacity(frame.columns.len());
            for index in 0..pg_row.columns().len() {
                row.push(Cell::from_pg_row(pg_row, index)?);
            }
            frame.rows.push(row);
        }
        Ok(frame)
    }

    pub fn columns(&self) -> &[String] {
        &self.columns
    }

    pub fn column_index(&self, name: &str) -> Option<usize> {
        self.columns.iter().position(|c| c == name)
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn rows(&self) -> impl Iterator<Item = &[Cell]> {
        self.rows.iter().map(Vec::as_slice)
    }

    pub fn push_row(&mut self, row: Vec<Cell>) {
        debug_assert_eq!(row.len(), self.columns.len());
        self.rows.push(row);
    }

    /// The cell at `(row, column name)`, if both exist.
    pub fn cell(&self, row: usize, column: &str) -> Option<&Cell> {
        let index = self.column_index(column)?;
        self.rows.get(row)?.get(index)
    }

    /// Keeps only rows satisfying the predicate.
    pub fn retain_rows<F>(&mut self, mut predicate: F)
    where
        F: FnMut(&[Cell]) -> bool,
    {
        self.rows.retain(|row| predicate(row));
    }

    /// A new frame without the named columns. Unknown names are ignored.
    pub fn drop_columns(&self, names: &[String]) -> Frame {
        let kept: Vec<usize> = self
            .columns
            .iter()
            .enumerate()
            .filter(|(_, c)| !names.contains(c))
            .map(|(i, _)| i)
            .collect();
        let columns = kept.iter().map(|&i| self.columns[i].clone()).collect();
        let rows = self
            .rows
            .iter()
            .map(|row| kept.iter().map(|&i| row[i].clone()).collect())
            .collect();
        Frame { columns, rows }
    }

    /// Values of one column across all rows.
    pub fn column_values(&self, name: &str) -> Option<Vec<&Cell>> {
        let index = self.column_index(name)?;
        Some(self.rows.iter().map(|row| &row[index]).collect())
    }

    /// Sorts rows ascending by an integer column. Nulls sort first.
    pub fn sort_by_int_column(&mut self, name: &str) {
        if let Some(index) = self.column_index(name) {
            self.rows.sort_by_key(|row| row[index].as_i64());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> Frame {
        let mut frame = Frame::new(vec!["id".into(), "size".into()]);
        frame.push_row(vec![Cell::Int(2), Cell::Float(0.5)]);
        frame.push_row(vec![Cell::Int(1), Cell::Float(1.5)]);
        frame
    }

    #[test]
    fn drop_columns_preserves_row_order() {
        let frame = sample();

        let dropped = frame.drop_columns(&["size".into(), "missing".into()]);

        assert_eq!(dropped.columns(), &["id".to_owned()]);
        assert_eq!(dropped.cell(0, "id"), Some(&Cell::Int(2)));
        assert_eq!(dropped.cell(1, "id"), Some(&Cell::Int(1)));
    }

    #[test]
    fn sort_by_int_column_orders_ascending() {
        let mut frame = sample();

        frame.sort_by_int_column("id");

        assert_eq!(frame.cell(0, "id"), Some(&Cell::Int(1)));
        assert_eq!(frame.cell(1, "id"), Some(&Cell::Int(2)));
    }

    #[test]
    fn retain_rows_filters_in_place() {
        let mut frame = sample();

        frame.retain_rows(|row| row[0].as_i64() == Some(1));

        assert_eq!(frame.len(), 1);
        assert_eq!(frame.cell(0, "id"), Some(&Cell::Int(1)));
    }
}
