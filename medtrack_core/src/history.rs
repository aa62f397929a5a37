//! Acknowledgment history loading.
//!
//! Loads recent acknowledgment records from both the WAL and the CSV
//! archive, deduplicated by occurrence key, for ledger seeding and the
//! history view.

use crate::types::{AckOutcome, AcknowledgmentRecord, OccurrenceKey};
use crate::Result;
use chrono::{Duration, NaiveDateTime};
use csv::ReaderBuilder;
use serde::Deserialize;
use std::collections::HashSet;
use std::path::Path;
use uuid::Uuid;

/// CSV row format for reading archived records
#[derive(Debug, Deserialize)]
struct CsvRow {
    medication_id: String,
    slot: String,
    outcome: String,
    recorded_at: String,
}

const MINUTE_FORMAT: &str = "%Y-%m-%dT%H:%M";

impl TryFrom<CsvRow> for AcknowledgmentRecord {
    type Error = crate::Error;

    fn try_from(row: CsvRow) -> Result<Self> {
        let medication_id = Uuid::parse_str(&row.medication_id)
            .map_err(|e| crate::Error::Other(format!("Invalid UUID: {}", e)))?;

        let slot = NaiveDateTime::parse_from_str(&row.slot, MINUTE_FORMAT)
            .map_err(|e| crate::Error::Other(format!("Invalid slot: {}", e)))?;

        let recorded_at = NaiveDateTime::parse_from_str(&row.recorded_at, MINUTE_FORMAT)
            .map_err(|e| crate::Error::Other(format!("Invalid timestamp: {}", e)))?;

        let outcome = match row.outcome.as_str() {
            "acknowledged" => AckOutcome::Acknowledged,
            "postponed" => AckOutcome::Postponed,
            "escalated" => AckOutcome::Escalated,
            other => {
                return Err(crate::Error::Other(format!("Unknown outcome: {}", other)));
            }
        };

        Ok(AcknowledgmentRecord {
            key: OccurrenceKey::new(medication_id, slot),
            outcome,
            recorded_at,
        })
    }
}

/// Load records from the last N days from both WAL and CSV, relative to
/// `now`.
///
/// Returns records sorted by recorded_at (newest first), deduplicated by
/// occurrence key with the WAL taking precedence.
pub fn load_recent_records(
    wal_path: &Path,
    csv_path: &Path,
    days: i64,
    now: NaiveDateTime,
) -> Result<Vec<AcknowledgmentRecord>> {
    let cutoff = now - Duration::days(days);
    let mut records = Vec::new();
    let mut seen_keys = HashSet::new();

    // WAL first: it holds the most recent, not-yet-archived records
    if wal_path.exists() {
        for record in crate::wal::read_records(wal_path)? {
            if record.recorded_at >= cutoff && seen_keys.insert(record.key) {
                records.push(record);
            }
        }
    }

    if csv_path.exists() {
        let mut reader = ReaderBuilder::new().has_headers(true).from_path(csv_path)?;
        for result in reader.deserialize::<CsvRow>() {
            let row = match result {
                Ok(row) => row,
                Err(e) => {
                    tracing::warn!("Skipping malformed CSV row: {}", e);
                    continue;
                }
            };
            match AcknowledgmentRecord::try_from(row) {
                Ok(record) => {
                    if record.recorded_at >= cutoff && seen_keys.insert(record.key) {
                        records.push(record);
                    }
                }
                Err(e) => tracing::warn!("Skipping invalid CSV record: {}", e),
            }
        }
    }

    records.sort_by(|a, b| b.recorded_at.cmp(&a.recorded_at));
    tracing::debug!("Loaded {} recent acknowledgment records", records.len());
    Ok(records)
}
