//! Table-driven schema descriptors.
//!
//! The store holds many annotation tables whose column sets differ per
//! schema type, so a [`TableSchema`] is built once per table from Postgres
//! introspection and consulted wherever column roles matter: which columns
//! are CRUD bookkeeping, which are stored point geometries, and which
//! supervoxel/root pairs a segmentation table carries.

use sqlx::{PgPool, Postgres, Row};

/// Column-name suffix for stored point geometries.
pub const POSITION_SUFFIX: &str = "_position";
/// Column-name suffix for supervoxel identifier columns.
pub const SUPERVOXEL_SUFFIX: &str = "_supervoxel_id";
/// Column-name suffix for derived root identifier columns.
pub const ROOT_ID_SUFFIX: &str = "_root_id";

/// The CRUD bookkeeping columns carried by every annotation row.
pub const CRUD_COLUMNS: &[&str] = &["created", "deleted", "superseded_id"];

/// The role a column plays, derived from its name and Postgres type.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ColumnKind {
    /// The row identifier; shared between an annotation row and its
    /// segmentation counterpart.
    Id,
    /// A stored point geometry; the prefix names the bound point.
    Point { prefix: String },
    /// A supervoxel id resolved from a point lookup.
    SupervoxelId { prefix: String },
    /// A root id resolved by the graph service at a timestamp.
    RootId { prefix: String },
    Created,
    Deleted,
    SupersededId,
    Valid,
    /// Any other payload column.
    Scalar,
}

/// One column of a described table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ColumnDesc {
    pub name: String,
    pub kind: ColumnKind,
    pub pg_type: String,
}

/// Ordered column descriptor for one table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableSchema {
    pub table: String,
    pub columns: Vec<ColumnDesc>,
}

impl TableSchema {
    /// Builds the descriptor from explicit `(name, pg_type)` pairs.
    pub fn from_columns(table: &str, columns: &[(&str, &str)]) -> Self {
        let columns = columns
            .iter()
            .map(|(name, pg_type)| ColumnDesc {
                name: (*name).to_owned(),
                kind: classify(name),
                pg_type: (*pg_type).to_owned(),
            })
            .collect();
        Self {
            table: table.to_owned(),
            columns,
        }
    }

    /// Builds the descriptor by introspecting a live table.
    pub async fn introspect(pool: &PgPool, table: &str) -> Result<Self, sqlx::Error> {
        let query = indoc::indoc! {r#"
            SELECT column_name, udt_name
            FROM information_schema.columns
            WHERE table_name = $1
            ORDER BY ordinal_position
        "#};
        let rows = sqlx::query(query).bind(table).fetch_all(pool).await?;
        let columns = rows
            .iter()
            .map(|row| {
                let name: String = row.get(0);
                let pg_type: String = row.get(1);
                ColumnDesc {
                    kind: classify(&name),
                    name,
                    pg_type,
                }
            })
            .collect();
        Ok(Self {
            table: table.to_owned(),
            columns,
        })
    }

    pub fn column_names(&self) -> impl Iterator<Item = &str> {
        self.columns.iter().map(|c| c.name.as_str())
    }

    pub fn column(&self, name: &str) -> Option<&ColumnDesc> {
        self.columns.iter().find(|c| c.name == name)
    }

    /// Prefixes of the bound points, in column order.
    pub fn point_prefixes(&self) -> Vec<&str> {
        self.columns
            .iter()
            .filter_map(|c| match &c.kind {
                ColumnKind::Point { prefix } => Some(prefix.as_str()),
                _ => None,
            })
            .collect()
    }

    /// Supervoxel-column prefixes, in column order.
    pub fn supervoxel_prefixes(&self) -> Vec<&str> {
        self.columns
            .iter()
            .filter_map(|c| match &c.kind {
                ColumnKind::SupervoxelId { prefix } => Some(prefix.as_str()),
                _ => None,
            })
            .collect()
    }

    /// Root-id column prefixes, in column order.
    pub fn root_id_prefixes(&self) -> Vec<&str> {
        self.columns
            .iter()
            .filter_map(|c| match &c.kind {
                ColumnKind::RootId { prefix } => Some(prefix.as_str()),
                _ => None,
            })
            .collect()
    }

    pub fn is_crud_column(name: &str) -> bool {
        CRUD_COLUMNS.contains(&name)
    }

    /// The flattened form used for frozen snapshot tables: every column except
    /// the CRUD bookkeeping ones.
    pub fn flattened(&self) -> TableSchema {
        TableSchema {
            table: self.table.clone(),
            columns: self
                .columns
                .iter()
                .filter(|c| {
                    !matches!(
                        c.kind,
                        ColumnKind::Created | ColumnKind::Deleted | ColumnKind::SupersededId
                    )
                })
                .cloned()
                .collect(),
        }
    }

    /// Renders `CREATE TABLE IF NOT EXISTS` DDL for this descriptor.
    pub fn create_table_ddl(&self) -> String {
        let columns: Vec<String> = self
            .columns
            .iter()
            .map(|c| {
                let sql_type = match &c.kind {
                    ColumnKind::Id => "BIGINT PRIMARY KEY".to_owned(),
                    ColumnKind::Point { .. } => "geometry(POINTZ)".to_owned(),
                    ColumnKind::SupervoxelId { .. } | ColumnKind::RootId { .. } => {
                        "BIGINT".to_owned()
                    }
                    ColumnKind::Created => "TIMESTAMPTZ NOT NULL".to_owned(),
                    ColumnKind::Deleted => "TIMESTAMPTZ".to_owned(),
                    ColumnKind::SupersededId => "BIGINT".to_owned(),
                    ColumnKind::Valid => "BOOLEAN NOT NULL DEFAULT TRUE".to_owned(),
                    ColumnKind::Scalar => c.pg_type.to_uppercase(),
                };
                format!("\"{}\" {}", c.name, sql_type)
            })
            .collect();
        format!(
            "CREATE TABLE IF NOT EXISTS \"{}\" ({})",
            self.table,
            columns.join(", ")
        )
    }

    /// Executes the descriptor's DDL. Create-if-absent keeps re-runs cheap.
    pub async fn create_table<'c, E>(&self, exe: E) -> Result<(), sqlx::Error>
    where
        E: sqlx::Executor<'c, Database = Postgres>,
    {
        sqlx::query(&self.create_table_ddl()).execute(exe).await?;
        Ok(())
    }
}

/// Derives the segmentation-table descriptor paired with an annotation table:
/// the shared id plus a supervoxel/root column pair per bound point.
pub fn segmentation_schema(annotation: &TableSchema, segmentation_table: &str) -> TableSchema {
    let mut columns = vec![ColumnDesc {
        name: "id".to_owned(),
        kind: ColumnKind::Id,
        pg_type: "int8".to_owned(),
    }];
    for prefix in annotation.point_prefixes() {
        columns.push(ColumnDesc {
            name: format!("{prefix}{SUPERVOXEL_SUFFIX}"),
            kind: ColumnKind::SupervoxelId {
                prefix: prefix.to_owned(),
            },
            pg_type: "int8".to_owned(),
        });
        columns.push(ColumnDesc {
            name: format!("{prefix}{ROOT_ID_SUFFIX}"),
            kind: ColumnKind::RootId {
                prefix: prefix.to_owned(),
            },
            pg_type: "int8".to_owned(),
        });
    }
    TableSchema {
        table: segmentation_table.to_owned(),
        columns,
    }
}

fn classify(name: &str) -> ColumnKind {
    if name == "id" {
        ColumnKind::Id
    } else if name == "created" {
        ColumnKind::Created
    } else if name == "deleted" {
        ColumnKind::Deleted
    } else if name == "superseded_id" {
        ColumnKind::SupersededId
    } else if name == "valid" {
        ColumnKind::Valid
    } else if let Some(prefix) = name.strip_suffix(POSITION_SUFFIX) {
        ColumnKind::Point {
            prefix: prefix.to_owned(),
        }
    } else if let Some(prefix) = name.strip_suffix(SUPERVOXEL_SUFFIX) {
        ColumnKind::SupervoxelId {
            prefix: prefix.to_owned(),
        }
    } else if let Some(prefix) = name.strip_suffix(ROOT_ID_SUFFIX) {
        ColumnKind::RootId {
            prefix: prefix.to_owned(),
        }
    } else {
        ColumnKind::Scalar
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn synapse_schema() -> TableSchema {
        TableSchema::from_columns(
            "synapses",
            &[
                ("id", "int8"),
                ("created", "timestamptz"),
                ("deleted", "timestamptz"),
                ("superseded_id", "int8"),
                ("valid", "bool"),
                ("pre_pt_position", "geometry"),
                ("post_pt_position", "geometry"),
                ("size", "float8"),
            ],
        )
    }

    #[test]
    fn classifies_point_columns_by_suffix() {
        let schema = synapse_schema();

        assert_eq!(schema.point_prefixes(), vec!["pre_pt", "post_pt"]);
        assert_eq!(
            schema.column("pre_pt_position").unwrap().kind,
            ColumnKind::Point {
                prefix: "pre_pt".into()
            }
        );
    }

    #[test]
    fn flattened_drops_crud_columns_only() {
        let schema = synapse_schema();

        let flat = schema.flattened();

        let names: Vec<&str> = flat.column_names().collect();
        assert_eq!(
            names,
            vec!["id", "valid", "pre_pt_position", "post_pt_position", "size"]
        );
    }

    #[test]
    fn segmentation_schema_pairs_columns_per_point() {
        let schema = synapse_schema();

        let seg = segmentation_schema(&schema, "synapses__seg_graph_v1");

        let names: Vec<&str> = seg.column_names().collect();
        assert_eq!(
            names,
            vec![
                "id",
                "pre_pt_supervoxel_id",
                "pre_pt_root_id",
                "post_pt_supervoxel_id",
                "post_pt_root_id",
            ]
        );
        assert_eq!(seg.root_id_prefixes(), vec!["pre_pt", "post_pt"]);
    }

    #[test]
    fn ddl_renders_types_by_kind() {
        let schema = synapse_schema();

        let ddl = schema.flattened().create_table_ddl();

        assert!(ddl.starts_with("CREATE TABLE IF NOT EXISTS \"synapses\""));
        assert!(ddl.contains("\"id\" BIGINT PRIMARY KEY"));
        assert!(ddl.contains("\"pre_pt_position\" geometry(POINTZ)"));
        assert!(!ddl.contains("\"created\""));
    }
}
