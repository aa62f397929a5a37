//! CSV rollup functionality for archiving the acknowledgment WAL.
//!
//! Implements atomic WAL-to-CSV conversion with proper error handling to
//! prevent data loss.

use crate::types::AcknowledgmentRecord;
use crate::Result;
use std::fs::OpenOptions;
use std::path::Path;

/// A row in the CSV archive
#[derive(Debug, serde::Serialize)]
struct CsvRow {
    medication_id: String,
    slot: String,
    outcome: String,
    recorded_at: String,
}

const MINUTE_FORMAT: &str = "%Y-%m-%dT%H:%M";

impl From<&AcknowledgmentRecord> for CsvRow {
    fn from(record: &AcknowledgmentRecord) -> Self {
        CsvRow {
            medication_id: record.key.medication_id.to_string(),
            slot: record.key.slot.format(MINUTE_FORMAT).to_string(),
            outcome: format!("{:?}", record.outcome).to_lowercase(),
            recorded_at: record.recorded_at.format(MINUTE_FORMAT).to_string(),
        }
    }
}

/// Roll up WAL records into CSV and archive the WAL atomically
///
/// 1. Reads all records from the WAL
/// 2. Appends them to the CSV file (creates with headers if needed)
/// 3. Syncs the CSV to disk
/// 4. Renames the WAL to .processed
/// 5. Returns the number of records processed
///
/// The CSV is fsynced before the WAL is renamed, and the WAL is renamed
/// rather than deleted so manual recovery stays possible.
pub fn wal_to_csv_and_archive(wal_path: &Path, csv_path: &Path) -> Result<usize> {
    let records = crate::wal::read_records(wal_path)?;

    if records.is_empty() {
        tracing::info!("No acknowledgments in WAL to roll up");
        return Ok(0);
    }

    if let Some(parent) = csv_path.parent() {
        std::fs::create_dir_all(parent)?;
    }

    let file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(csv_path)?;

    let needs_headers = file.metadata()?.len() == 0;

    let mut writer = csv::WriterBuilder::new()
        .has_headers(needs_headers)
        .from_writer(file);

    for record in &records {
        writer.serialize(CsvRow::from(record))?;
    }

    writer.flush()?;
    let file = writer
        .into_inner()
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e))?;
    file.sync_all()?;

    tracing::info!("Wrote {} acknowledgments to CSV", records.len());

    let processed_path = wal_path.with_extension("wal.processed");
    std::fs::rename(wal_path, &processed_path)?;

    tracing::info!("Archived WAL to {:?}", processed_path);

    Ok(records.len())
}

/// Remove all `.wal.processed` files in the given directory.
pub fn cleanup_processed_wals(dir: &Path) -> Result<usize> {
    if !dir.exists() {
        return Ok(0);
    }

    let mut count = 0;
    for entry in std::fs::read_dir(dir)? {
        let entry = entry?;
        let path = entry.path();

        if let Some(extension) = path.extension() {
            if extension == "processed" {
                std::fs::remove_file(&path)?;
                tracing::debug!("Removed processed WAL: {:?}", path);
                count += 1;
            }
        }
    }

    if count > 0 {
        tracing::info!("Cleaned up {} processed WAL files", count);
    }

    Ok(count)
}
