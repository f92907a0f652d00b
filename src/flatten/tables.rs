// src/flatten/tables.rs
//! Row accumulation and final table schemas.
//!
//! Rows with the same table name accumulate into one logical table; the
//! schema is only fixed once all rows are known, because columns are the
//! union of every row's scalar keys.

use indexmap::IndexMap;
use serde_json::Value;

use crate::policy::ExtractionPolicy;

/// One output row. Insertion order is preserved so repeated flattening of
/// the same document yields identical output.
pub type Row = IndexMap<String, Value>;

/// Accumulated rows grouped by table name.
#[derive(Debug, Default)]
pub struct TableSet {
    tables: IndexMap<String, Vec<Row>>,
}

impl TableSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, table: &str, row: Row) {
        self.tables.entry(table.to_string()).or_default().push(row);
    }

    /// Appends every row of `other`, preserving both orders.
    pub fn merge(&mut self, other: TableSet) {
        for (name, rows) in other.tables {
            self.tables.entry(name).or_default().extend(rows);
        }
    }

    pub fn is_empty(&self) -> bool {
        self.tables.values().all(Vec::is_empty)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &[Row])> {
        self.tables.iter().map(|(n, r)| (n.as_str(), r.as_slice()))
    }

    pub fn rows(&self, table: &str) -> Option<&[Row]> {
        self.tables.get(table).map(Vec::as_slice)
    }

    /// Freezes the accumulated rows into per-table schemas: column union in
    /// preferred order and the derived primary key.
    pub fn into_final_tables(self, policy: &ExtractionPolicy) -> Vec<FinalTable> {
        self.tables
            .into_iter()
            .filter(|(_, rows)| !rows.is_empty())
            .map(|(name, rows)| {
                let mut union: Vec<String> = Vec::new();
                for row in &rows {
                    for key in row.keys() {
                        if !union.iter().any(|c| c == key) {
                            union.push(key.clone());
                        }
                    }
                }
                let columns = policy.order_columns(&union);
                let primary_key = policy.primary_key_for(&columns);
                FinalTable {
                    name,
                    columns,
                    primary_key,
                    incremental: true,
                    rows,
                }
            })
            .collect()
    }
}

/// A finished table ready for the output sink.
#[derive(Debug)]
pub struct FinalTable {
    pub name: String,
    pub columns: Vec<String>,
    pub primary_key: Vec<String>,
    pub incremental: bool,
    pub rows: Vec<Row>,
}
