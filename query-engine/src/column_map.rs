//! Logical-to-physical column naming.
//!
//! Joining a table against itself (or against a differently versioned copy)
//! forces suffixes onto otherwise identical column names. Callers keep
//! addressing columns logically; the map records what each logical column is
//! called in the result frame.

use std::collections::BTreeMap;

/// `table → logical column → physical column` for one query result.
#[derive(Debug, Clone, Default, PartialEq, Eq, serde::Serialize)]
pub struct ColumnMap(BTreeMap<String, BTreeMap<String, String>>);

impl ColumnMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, table: &str, logical: &str, physical: &str) {
        self.0
            .entry(table.to_owned())
            .or_default()
            .insert(logical.to_owned(), physical.to_owned());
    }

    /// The physical name of a logical column.
    pub fn physical(&self, table: &str, logical: &str) -> Option<&str> {
        self.0.get(table)?.get(logical).map(String::as_str)
    }

    pub fn tables(&self) -> impl Iterator<Item = &str> {
        self.0.keys().map(String::as_str)
    }

    pub fn table_columns(&self, table: &str) -> Option<&BTreeMap<String, String>> {
        self.0.get(table)
    }

    /// Physical names of the CRUD bookkeeping columns across all tables.
    pub fn crud_physical_columns(&self) -> Vec<String> {
        let mut out = Vec::new();
        for columns in self.0.values() {
            for crud in annotation_db::schema::CRUD_COLUMNS {
                if let Some(physical) = columns.get(*crud) {
                    out.push(physical.clone());
                }
            }
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn physical_lookup_resolves_suffixes() {
        let mut map = ColumnMap::new();
        map.insert("synapses", "id", "id");
        map.insert("synapses_ref", "id", "id_2");

        assert_eq!(map.physical("synapses", "id"), Some("id"));
        assert_eq!(map.physical("synapses_ref", "id"), Some("id_2"));
        assert_eq!(map.physical("synapses", "missing"), None);
    }

    #[test]
    fn crud_columns_collected_across_tables() {
        let mut map = ColumnMap::new();
        map.insert("synapses", "created", "created");
        map.insert("synapses", "deleted", "deleted");
        map.insert("synapses", "superseded_id", "superseded_id");
        map.insert("synapses", "id", "id");

        let mut crud = map.crud_physical_columns();
        crud.sort();

        assert_eq!(crud, vec!["created", "deleted", "superseded_id"]);
    }
}
