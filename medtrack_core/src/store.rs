//! Persisted state shape and file-backed persistence.
//!
//! The engine defines the serialized shape of its medication records; the
//! durability mechanism is a collaborator behind [`PersistenceStore`]. The
//! shape is a flat camelCase record list: recurrence flattened to a daily
//! flag plus an optional weekday list (Sunday = 0), reminder times as
//! index-aligned parallel hour/minute arrays, and the emergency contact as
//! flattened string fields (empty string = absent).

use crate::error::{Error, Result};
use crate::types::{EmergencyContact, Medication, MedicationType, Recurrence};
use chrono::{NaiveTime, Timelike, Weekday};
use fs2::FileExt;
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use tempfile::NamedTempFile;
use uuid::Uuid;

/// Top-level persisted document.
#[derive(Clone, Debug, Serialize, Deserialize, Default, PartialEq)]
pub struct StoredMedications {
    #[serde(rename = "medicationsData", default)]
    pub medications: Vec<MedicationData>,
}

/// One flattened medication record.
#[derive(Clone, Debug, Serialize, Deserialize, Default, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct MedicationData {
    pub id: String,
    pub name: String,
    pub description: String,
    #[serde(rename = "type")]
    pub kind: i64,
    pub quantity: i64,
    pub initial_quantity: i64,
    pub dosage_per_time: i64,
    pub is_daily: bool,
    pub reminder_hours: Vec<i64>,
    pub reminder_minutes: Vec<i64>,
    pub days_of_week: Vec<i64>,
    pub emergency_contact_name: String,
    pub emergency_contact_phone: String,
    pub emergency_contact_email: String,
    pub emergency_contact_telegram: String,
    pub emergency_contact_whats_app: String,
}

/// Flatten registry records into the persisted shape.
pub fn encode(medications: &[Medication]) -> StoredMedications {
    StoredMedications {
        medications: medications.iter().map(MedicationData::from).collect(),
    }
}

/// Rebuild medication records from the persisted shape.
///
/// Tolerant by construction: mismatched parallel arrays are truncated to
/// the shorter length, out-of-range times and weekday codes are skipped,
/// and quantities are clamped to their invariants. Nothing here indexes
/// out of bounds or fails the whole load over one bad field.
pub fn decode(stored: StoredMedications) -> Vec<Medication> {
    stored
        .medications
        .into_iter()
        .map(MedicationData::into_medication)
        .collect()
}

impl From<&Medication> for MedicationData {
    fn from(medication: &Medication) -> Self {
        let (is_daily, days_of_week) = match &medication.recurrence {
            Recurrence::Daily => (true, Vec::new()),
            Recurrence::WeeklyOn(days) => (
                false,
                days.iter()
                    .map(|day| i64::from(day.num_days_from_sunday()))
                    .collect(),
            ),
        };

        let contact = medication.emergency_contact.clone().unwrap_or_default();
        let field = |value: Option<String>| value.unwrap_or_default();

        Self {
            id: medication.id.to_string(),
            name: medication.name.clone(),
            description: medication.description.clone(),
            kind: medication.kind.code(),
            quantity: i64::from(medication.quantity_remaining),
            initial_quantity: i64::from(medication.quantity_initial),
            dosage_per_time: i64::from(medication.dose_per_time),
            is_daily,
            reminder_hours: medication
                .reminder_times
                .iter()
                .map(|t| i64::from(t.hour()))
                .collect(),
            reminder_minutes: medication
                .reminder_times
                .iter()
                .map(|t| i64::from(t.minute()))
                .collect(),
            days_of_week,
            emergency_contact_name: contact.name,
            emergency_contact_phone: field(contact.phone),
            emergency_contact_email: field(contact.email),
            emergency_contact_telegram: field(contact.telegram_id),
            emergency_contact_whats_app: field(contact.whatsapp),
        }
    }
}

impl MedicationData {
    fn into_medication(self) -> Medication {
        // An unparseable id gets a fresh one rather than failing the load.
        let id = Uuid::parse_str(&self.id).unwrap_or_else(|_| Uuid::new_v4());
        let kind = MedicationType::from_code(self.kind);

        // Parallel arrays: zip truncates to the shorter length.
        let reminder_times: Vec<NaiveTime> = self
            .reminder_hours
            .iter()
            .zip(self.reminder_minutes.iter())
            .filter_map(|(&hour, &minute)| {
                NaiveTime::from_hms_opt(u32::try_from(hour).ok()?, u32::try_from(minute).ok()?, 0)
            })
            .collect();

        let recurrence = if self.is_daily {
            Recurrence::Daily
        } else {
            Recurrence::WeeklyOn(
                self.days_of_week
                    .iter()
                    .filter_map(|&code| weekday_from_sunday_index(code))
                    .collect(),
            )
        };

        let initial = u32::try_from(self.initial_quantity.max(0)).unwrap_or(u32::MAX);
        let remaining = u32::try_from(self.quantity.max(0))
            .unwrap_or(u32::MAX)
            .min(initial);
        let dose = u32::try_from(self.dosage_per_time.max(1)).unwrap_or(1);

        let emergency_contact = if self.emergency_contact_name.trim().is_empty() {
            None
        } else {
            let field = |value: String| (!value.is_empty()).then_some(value);
            Some(EmergencyContact {
                name: self.emergency_contact_name,
                phone: field(self.emergency_contact_phone),
                telegram_id: field(self.emergency_contact_telegram),
                whatsapp: field(self.emergency_contact_whats_app),
                email: field(self.emergency_contact_email),
            })
        };

        Medication {
            id,
            name: self.name,
            description: self.description,
            kind,
            quantity_remaining: remaining,
            quantity_initial: initial,
            dose_per_time: dose,
            recurrence,
            reminder_times,
            emergency_contact,
        }
    }
}

fn weekday_from_sunday_index(code: i64) -> Option<Weekday> {
    Some(match code {
        0 => Weekday::Sun,
        1 => Weekday::Mon,
        2 => Weekday::Tue,
        3 => Weekday::Wed,
        4 => Weekday::Thu,
        5 => Weekday::Fri,
        6 => Weekday::Sat,
        _ => return None,
    })
}

/// Durability collaborator for the persisted document.
pub trait PersistenceStore {
    fn save(&mut self, state: &StoredMedications) -> Result<()>;
    fn load(&self) -> Result<Option<StoredMedications>>;
}

/// JSON file store with file locking and atomic replacement.
pub struct JsonFileStore {
    path: PathBuf,
}

impl JsonFileStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl PersistenceStore for JsonFileStore {
    /// Atomically replace the state file:
    /// 1. Write to a locked temp file in the same directory
    /// 2. Sync to disk
    /// 3. Rename over the original
    fn save(&mut self, state: &StoredMedications) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let temp = NamedTempFile::new_in(self.path.parent().ok_or_else(|| {
            std::io::Error::new(std::io::ErrorKind::Other, "store path missing parent")
        })?)?;

        temp.as_file().lock_exclusive()?;

        {
            let mut writer = std::io::BufWriter::new(temp.as_file());
            let contents = serde_json::to_string(state)?;
            writer.write_all(contents.as_bytes())?;
            writer.flush()?;
        }

        temp.as_file().sync_all()?;
        temp.as_file().unlock()?;

        temp.persist(&self.path).map_err(|e| Error::Io(e.error))?;

        tracing::debug!(medications = state.medications.len(), "saved state to {:?}", self.path);
        Ok(())
    }

    /// Load with a shared lock. A missing, unreadable, or corrupted file
    /// yields `None` with a warning rather than an error.
    fn load(&self) -> Result<Option<StoredMedications>> {
        if !self.path.exists() {
            tracing::info!("No state file found at {:?}", self.path);
            return Ok(None);
        }

        let file = match File::open(&self.path) {
            Ok(f) => f,
            Err(e) => {
                tracing::warn!("Unable to open state file {:?}: {}", self.path, e);
                return Ok(None);
            }
        };

        if let Err(e) = file.lock_shared() {
            tracing::warn!("Unable to lock state file {:?}: {}", self.path, e);
            return Ok(None);
        }

        let mut contents = String::new();
        let mut reader = std::io::BufReader::new(&file);
        if let Err(e) = reader.read_to_string(&mut contents) {
            let _ = file.unlock();
            tracing::warn!("Failed to read state file {:?}: {}", self.path, e);
            return Ok(None);
        }

        file.unlock()?;

        match serde_json::from_str::<StoredMedications>(&contents) {
            Ok(state) => {
                tracing::debug!(medications = state.medications.len(), "loaded state from {:?}", self.path);
                Ok(Some(state))
            }
            Err(e) => {
                tracing::warn!("Failed to parse state file {:?}: {}", self.path, e);
                Ok(None)
            }
        }
    }
}
