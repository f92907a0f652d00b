// src/output/csv.rs
//! Pure CSV and manifest rendering for finished tables.

use serde_json::{json, Value};

use crate::flatten::FinalTable;

/// Renders a table as CSV text: header row, then every data row in the
/// table's column order. Cells missing from a row render empty.
pub fn render_csv(table: &FinalTable) -> String {
    let mut out = String::new();
    out.push_str(&encode_record(
        table.columns.iter().map(String::as_str).collect::<Vec<_>>(),
    ));
    for row in &table.rows {
        let cells: Vec<String> = table
            .columns
            .iter()
            .map(|column| cell_text(row.get(column)))
            .collect();
        out.push_str(&encode_record(
            cells.iter().map(String::as_str).collect::<Vec<_>>(),
        ));
    }
    out
}

/// Renders the companion manifest describing how the table loads.
pub fn render_manifest(table: &FinalTable) -> String {
    let manifest = json!({
        "primary_key": table.primary_key,
        "incremental": table.incremental,
        "columns": table.columns,
    });
    // json! never produces unserializable values
    serde_json::to_string_pretty(&manifest).unwrap_or_default()
}

/// Sanitized file stem for a table name.
pub fn table_file_stem(name: &str) -> String {
    name.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '_' || c == '-' {
                c
            } else {
                '_'
            }
        })
        .collect()
}

fn cell_text(value: Option<&Value>) -> String {
    match value {
        None | Some(Value::Null) => String::new(),
        Some(Value::String(s)) => s.clone(),
        Some(other) => other.to_string(),
    }
}

fn encode_record(cells: Vec<&str>) -> String {
    let mut line = String::new();
    for (index, cell) in cells.iter().enumerate() {
        if index > 0 {
            line.push(',');
        }
        line.push_str(&encode_cell(cell));
    }
    line.push('\n');
    line
}

fn encode_cell(cell: &str) -> String {
    if cell.contains(',') || cell.contains('"') || cell.contains('\n') || cell.contains('\r') {
        format!("\"{}\"", cell.replace('"', "\"\""))
    } else {
        cell.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::flatten::Row;
    use pretty_assertions::assert_eq;

    fn table(columns: &[&str], rows: Vec<Row>) -> FinalTable {
        FinalTable {
            name: "feed".to_string(),
            columns: columns.iter().map(|c| c.to_string()).collect(),
            primary_key: vec!["id".to_string()],
            incremental: true,
            rows,
        }
    }

    fn row(pairs: &[(&str, Value)]) -> Row {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.clone()))
            .collect()
    }

    #[test]
    fn renders_header_and_rows_in_column_order() {
        let t = table(
            &["id", "message"],
            vec![
                row(&[("message", json!("hi")), ("id", json!("p1"))]),
                row(&[("id", json!("p2"))]),
            ],
        );
        assert_eq!(render_csv(&t), "id,message\np1,hi\np2,\n");
    }

    #[test]
    fn quotes_cells_with_separators() {
        let t = table(
            &["id", "message"],
            vec![row(&[
                ("id", json!("p1")),
                ("message", json!("hello, \"world\"")),
            ])],
        );
        assert_eq!(
            render_csv(&t),
            "id,message\np1,\"hello, \"\"world\"\"\"\n"
        );
    }

    #[test]
    fn non_string_cells_render_as_json() {
        let t = table(
            &["id", "value"],
            vec![row(&[("id", json!("p1")), ("value", json!(42))])],
        );
        assert_eq!(render_csv(&t), "id,value\np1,42\n");
    }

    #[test]
    fn manifest_carries_key_and_columns() {
        let t = table(&["id", "message"], vec![]);
        let manifest: Value = serde_json::from_str(&render_manifest(&t)).unwrap();
        assert_eq!(manifest["primary_key"], json!(["id"]));
        assert_eq!(manifest["incremental"], json!(true));
        assert_eq!(manifest["columns"], json!(["id", "message"]));
    }

    #[test]
    fn file_stems_are_sanitized() {
        assert_eq!(table_file_stem("feed_comments"), "feed_comments");
        assert_eq!(table_file_stem("weird/name"), "weird_name");
    }
}
