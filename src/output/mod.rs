// src/output/mod.rs
//! Output handling with clear separation of planning and execution.
//!
//! Finished tables are rendered to CSV text and companion manifests by
//! pure functions, collected into an `OutputPlan`, and only then written
//! to disk by the writer.

mod csv;
mod types;
mod writer;

pub use csv::{render_csv, render_manifest, table_file_stem};
pub use types::{DeliveryTarget, OutputPlan, OutputReport};
pub use writer::deliver;

use std::path::Path;

use crate::flatten::FinalTable;

/// Plans the file writes for a set of finished tables: one CSV and one
/// manifest per table, under `output_dir`.
pub fn plan_tables(output_dir: &Path, tables: &[FinalTable]) -> OutputPlan {
    let mut plan = OutputPlan::new().with_operation(DeliveryTarget::CreateDirectory {
        path: output_dir.to_path_buf(),
    });
    for table in tables {
        let stem = table_file_stem(&table.name);
        plan = plan
            .with_operation(DeliveryTarget::WriteFile {
                path: output_dir.join(format!("{stem}.csv")),
                content: render_csv(table),
            })
            .with_operation(DeliveryTarget::WriteFile {
                path: output_dir.join(format!("{stem}.csv.manifest")),
                content: render_manifest(table),
            });
    }
    plan
}
