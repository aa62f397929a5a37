//! Append-only log of settled acknowledgment records.
//!
//! Records are appended to a JSONL (JSON Lines) file with file locking
//! so the UI path and the sweep path can write safely.

use crate::types::AcknowledgmentRecord;
use crate::Result;
use fs2::FileExt;
use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};

/// Sink for durable acknowledgment records
pub trait AckSink {
    fn append(&mut self, record: &AcknowledgmentRecord) -> Result<()>;
}

/// JSONL-based acknowledgment sink with file locking
pub struct JsonlSink {
    path: PathBuf,
}

impl JsonlSink {
    /// Create a new JSONL sink for the given path
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    fn ensure_parent_dir(&self) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        Ok(())
    }
}

impl AckSink for JsonlSink {
    fn append(&mut self, record: &AcknowledgmentRecord) -> Result<()> {
        self.ensure_parent_dir()?;

        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?;

        file.lock_exclusive()?;

        let mut writer = std::io::BufWriter::new(&file);
        let line = serde_json::to_string(record)?;
        writer.write_all(line.as_bytes())?;
        writer.write_all(b"\n")?;
        writer.flush()?;

        file.unlock()?;

        tracing::debug!(key = %record.key, "appended acknowledgment to WAL");
        Ok(())
    }
}

/// Read all acknowledgment records from a WAL file
pub fn read_records(path: &Path) -> Result<Vec<AcknowledgmentRecord>> {
    if !path.exists() {
        return Ok(Vec::new());
    }

    let file = File::open(path)?;
    file.lock_shared()?;

    let reader = BufReader::new(&file);
    let mut records = Vec::new();

    for (line_num, line_result) in reader.lines().enumerate() {
        let line = line_result?;
        if line.trim().is_empty() {
            continue;
        }

        match serde_json::from_str::<AcknowledgmentRecord>(&line) {
            Ok(record) => records.push(record),
            Err(e) => {
                tracing::warn!("Failed to parse record at line {}: {}", line_num + 1, e);
                // Continue reading, don't fail completely
            }
        }
    }

    file.unlock()?;
    tracing::debug!("Read {} acknowledgment records from WAL", records.len());
    Ok(records)
}
