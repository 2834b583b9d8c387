//! Dynamically typed cell values for tabular results.
//!
//! The query layer works against tables whose column sets are only known at
//! run time, so rows are decoded into [`Cell`] values using the column type
//! reported by Postgres rather than a compile-time row struct.

use chrono::{DateTime, NaiveDateTime, Utc};
use sqlx::{
    postgres::{PgRow, Postgres},
    Column, Row, TypeInfo, ValueRef,
};

use crate::wkb;

/// A single dynamically typed value.
#[derive(Debug, Clone, PartialEq)]
pub enum Cell {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
    Timestamp(DateTime<Utc>),
    /// Decoded point geometry, plain `[x, y, z]` coordinates.
    Point([f64; 3]),
    /// Raw bytes that are not a known geometry encoding.
    Bytes(Vec<u8>),
}

#[derive(Debug, thiserror::Error)]
pub enum CellError {
    #[error("column {column} has unsupported type {type_name}")]
    UnsupportedType { column: String, type_name: String },

    #[error("failed to decode column {column}: {source}")]
    Decode {
        column: String,
        #[source]
        source: sqlx::Error,
    },
}

impl Cell {
    /// The value as a row identifier, if it is one.
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Cell::Int(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_timestamp(&self) -> Option<DateTime<Utc>> {
        match self {
            Cell::Timestamp(ts) => Some(*ts),
            _ => None,
        }
    }

    pub fn as_point(&self) -> Option<[f64; 3]> {
        match self {
            Cell::Point(p) => Some(*p),
            _ => None,
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Cell::Null)
    }

    /// Decodes the cell at `index` from a Postgres row.
    ///
    /// `BYTEA` columns are attempted as WKB points first, since the query
    /// layer selects geometry columns through `ST_AsBinary`; blobs that do not
    /// parse stay as raw bytes.
    pub fn from_pg_row(row: &PgRow, index: usize) -> Result<Self, CellError> {
        let column = row.column(index);
        let name = column.name().to_owned();

        let raw = row.try_get_raw(index).map_err(|source| CellError::Decode {
            column: name.clone(),
            source,
        })?;
        if raw.is_null() {
            return Ok(Cell::Null);
        }

        let type_name = raw.type_info().name().to_owned();
        let decode_err = |source| CellError::Decode {
            column: name.clone(),
            source,
        };
        let cell = match type_name.as_str() {
            "BOOL" => Cell::Bool(row.try_get::<bool, _>(index).map_err(decode_err)?),
            "INT2" => Cell::Int(row.try_get::<i16, _>(index).map_err(decode_err)? as i64),
            "INT4" => Cell::Int(row.try_get::<i32, _>(index).map_err(decode_err)? as i64),
            "INT8" => Cell::Int(row.try_get::<i64, _>(index).map_err(decode_err)?),
            "FLOAT4" => Cell::Float(row.try_get::<f32, _>(index).map_err(decode_err)? as f64),
            "FLOAT8" => Cell::Float(row.try_get::<f64, _>(index).map_err(decode_err)?),
            "TEXT" | "VARCHAR" | "BPCHAR" | "NAME" => {
                Cell::Text(row.try_get::<String, _>(index).map_err(decode_err)?)
            }
            "TIMESTAMPTZ" => {
                Cell::Timestamp(row.try_get::<DateTime<Utc>, _>(index).map_err(decode_err)?)
            }
            "TIMESTAMP" => {
                let naive = row.try_get::<NaiveDateTime, _>(index).map_err(decode_err)?;
                Cell::Timestamp(naive.and_utc())
            }
            "BYTEA" => {
                let bytes = row.try_get::<Vec<u8>, _>(index).map_err(decode_err)?;
                match wkb::decode_point(&bytes) {
                    Ok(point) => Cell::Point(point),
                    Err(_) => Cell::Bytes(bytes),
                }
            }
            _ => {
                return Err(CellError::UnsupportedType {
                    column: name,
                    type_name,
                })
            }
        };
        Ok(cell)
    }

    /// Appends the value as a bind parameter on a dynamically built query.
    pub fn push_bind(&self, builder: &mut sqlx::QueryBuilder<'_, Postgres>) {
        match self {
            Cell::Null => builder.push_bind(Option::<i64>::None),
            Cell::Bool(v) => builder.push_bind(*v),
            Cell::Int(v) => builder.push_bind(*v),
            Cell::Float(v) => builder.push_bind(*v),
            Cell::Text(v) => builder.push_bind(v.clone()),
            Cell::Timestamp(v) => builder.push_bind(*v),
            Cell::Point(p) => builder.push_bind(wkb::encode_point_z(*p)),
            Cell::Bytes(b) => builder.push_bind(b.clone()),
        };
    }

    /// Appends the value inside a `push_values` tuple.
    pub fn push_bind_separated<'qb, 'args>(
        &self,
        builder: &mut sqlx::query_builder::Separated<'qb, 'args, Postgres, &'static str>,
    ) {
        match self {
            Cell::Null => builder.push_bind(Option::<i64>::None),
            Cell::Bool(v) => builder.push_bind(*v),
            Cell::Int(v) => builder.push_bind(*v),
            Cell::Float(v) => builder.push_bind(*v),
            Cell::Text(v) => builder.push_bind(v.clone()),
            Cell::Timestamp(v) => builder.push_bind(*v),
            Cell::Point(p) => builder.push_bind(wkb::encode_point_z(*p)),
            Cell::Bytes(b) => builder.push_bind(b.clone()),
        };
    }
}

impl std::fmt::Display for Cell {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Cell::Null => f.write_str("null"),
            Cell::Bool(v) => write!(f, "{v}"),
            Cell::Int(v) => write!(f, "{v}"),
            Cell::Float(v) => write!(f, "{v}"),
            Cell::Text(v) => f.write_str(v),
            Cell::Timestamp(v) => write!(f, "{}", v.to_rfc3339()),
            Cell::Point([x, y, z]) => write!(f, "({x}, {y}, {z})"),
            Cell::Bytes(b) => write!(f, "<{} bytes>", b.len()),
        }
    }
}

impl From<i64> for Cell {
    fn from(v: i64) -> Self {
        Cell::Int(v)
    }
}

impl From<bool> for Cell {
    fn from(v: bool) -> Self {
        Cell::Bool(v)
    }
}

impl From<&str> for Cell {
    fn from(v: &str) -> Self {
        Cell::Text(v.to_owned())
    }
}

impl From<DateTime<Utc>> for Cell {
    fn from(v: DateTime<Utc>) -> Self {
        Cell::Timestamp(v)
    }
}

impl<T> From<Option<T>> for Cell
where
    T: Into<Cell>,
{
    fn from(v: Option<T>) -> Self {
        v.map_or(Cell::Null, Into::into)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn as_i64_only_for_ints() {
        assert_eq!(Cell::Int(42).as_i64(), Some(42));
        assert_eq!(Cell::Text("42".into()).as_i64(), None);
        assert_eq!(Cell::Null.as_i64(), None);
    }

    #[test]
    fn option_conversion_maps_none_to_null() {
        assert_eq!(Cell::from(Option::<i64>::None), Cell::Null);
        assert_eq!(Cell::from(Some(7i64)), Cell::Int(7));
    }
}
