//! Cleaned extracts and the data quality report.

use clap::ValueEnum;
use databoard_core::models::CollectionSchema;
use databoard_core::{AuditReport, EntityStore, Record, ReconcileError, Result};
use std::path::{Path, PathBuf};
use tracing::info;

/// File name of the report written next to the extracts.
pub const REPORT_FILE: &str = "data_quality_report.json";

/// Extract file formats
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum ExportFormat {
    /// One CSV file per collection
    Csv,
    /// One JSON array per collection
    Json,
    /// Both CSV and JSON
    Both,
    /// No extracts, report only
    ReportOnly,
}

impl ExportFormat {
    fn csv(self) -> bool {
        matches!(self, ExportFormat::Csv | ExportFormat::Both)
    }

    fn json(self) -> bool {
        matches!(self, ExportFormat::Json | ExportFormat::Both)
    }
}

fn io_error(context: String, source: std::io::Error) -> ReconcileError {
    ReconcileError::Io { context, source }
}

/// Writes records as CSV with the schema's fields as header; nulls are empty
/// cells.
///
/// # Errors
/// Returns error if the file cannot be written.
pub fn write_csv(path: &Path, schema: &CollectionSchema, records: &[Record]) -> Result<()> {
    let context = || format!("Failed to write {}", path.display());
    let mut writer =
        csv::Writer::from_path(path).map_err(|e| io_error(context(), e.into()))?;

    let header: Vec<&str> = schema.field_names().collect();
    writer
        .write_record(&header)
        .map_err(|e| io_error(context(), e.into()))?;
    for record in records {
        let row: Vec<String> = header.iter().map(|f| record.get(f).to_string()).collect();
        writer
            .write_record(&row)
            .map_err(|e| io_error(context(), e.into()))?;
    }
    writer.flush().map_err(|e| io_error(context(), e))
}

/// Writes records as a pretty JSON array of objects.
///
/// # Errors
/// Returns error if the file cannot be written.
pub fn write_json(path: &Path, records: &[Record]) -> Result<()> {
    let rows: Vec<_> = records.iter().map(|r| &r.fields).collect();
    let json = serde_json::to_string_pretty(&rows).map_err(|e| ReconcileError::Serialization {
        context: format!("Failed to serialize {}", path.display()),
        source: e,
    })?;
    std::fs::write(path, json).map_err(|e| io_error(format!("Failed to write {}", path.display()), e))
}

/// Writes the report as pretty JSON.
///
/// # Errors
/// Returns error if the file cannot be written.
pub fn write_report(path: &Path, report: &AuditReport) -> Result<()> {
    let json = report.to_json_pretty()?;
    std::fs::write(path, json).map_err(|e| io_error(format!("Failed to write {}", path.display()), e))
}

/// Exports every collection of the store into `dir` and returns the written
/// files.
///
/// # Errors
/// Returns error if the directory cannot be created, a collection cannot be
/// read, or a file cannot be written.
pub async fn export_collections(
    store: &dyn EntityStore,
    dir: &Path,
    format: ExportFormat,
) -> Result<Vec<PathBuf>> {
    std::fs::create_dir_all(dir)
        .map_err(|e| io_error(format!("Failed to create {}", dir.display()), e))?;

    let mut written = Vec::new();
    for collection in store.collections() {
        let schema = store.require_schema(&collection)?;
        let records = store.select(&collection, None).await?;
        if format.csv() {
            let path = dir.join(format!("{}.csv", collection));
            write_csv(&path, schema, &records)?;
            written.push(path);
        }
        if format.json() {
            let path = dir.join(format!("{}.json", collection));
            write_json(&path, &records)?;
            written.push(path);
        }
        info!("Exported {} records of '{}'", records.len(), collection);
    }
    Ok(written)
}
