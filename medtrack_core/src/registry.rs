//! Authoritative medication registry.
//!
//! Owns the collection of medications; all mutation goes through the
//! operations here. Validation happens at this boundary and a rejected
//! operation leaves the collection untouched.

use crate::error::ValidationError;
use crate::types::{DoseOutcome, Medication, MedicationUpdate};
use std::collections::HashMap;
use uuid::Uuid;

/// The set of registered medications.
#[derive(Debug, Default)]
pub struct Registry {
    medications: HashMap<Uuid, Medication>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Rebuild a registry from loaded records, dropping any that no longer
    /// validate (corrupt or hand-edited state should not poison the rest).
    pub fn from_records(records: Vec<Medication>) -> Self {
        let mut registry = Self::new();
        for medication in records {
            let name = medication.name.clone();
            if let Err(err) = registry.add(medication) {
                tracing::warn!(medication = %name, %err, "dropping invalid stored medication");
            }
        }
        registry
    }

    /// Register a medication, assigning identity if absent.
    ///
    /// Fails with a [`ValidationError`] and leaves the registry unchanged if
    /// the record is invalid.
    pub fn add(&mut self, mut medication: Medication) -> Result<Uuid, ValidationError> {
        validate(&medication)?;
        if medication.id.is_nil() {
            medication.id = Uuid::new_v4();
        }
        let id = medication.id;
        tracing::info!(medication = %medication.name, %id, "medication registered");
        self.medications.insert(id, medication);
        Ok(id)
    }

    /// Apply a partial update to an existing medication.
    ///
    /// Identity is preserved. Returns `Ok(false)` (a no-op, not an error)
    /// when the id is unknown. An update that fails validation leaves the
    /// stored record exactly as it was.
    pub fn edit(&mut self, id: Uuid, update: MedicationUpdate) -> Result<bool, ValidationError> {
        let Some(existing) = self.medications.get(&id) else {
            return Ok(false);
        };

        let mut edited = existing.clone();
        apply_update(&mut edited, update);
        edited.id = id;
        validate(&edited)?;

        tracing::info!(medication = %edited.name, %id, "medication updated");
        self.medications.insert(id, edited);
        Ok(true)
    }

    /// Delete a medication, returning the removed record so the caller can
    /// cancel its pending wake-ups and timers. No-op if the id is unknown.
    pub fn remove(&mut self, id: Uuid) -> Option<Medication> {
        let removed = self.medications.remove(&id);
        if let Some(ref medication) = removed {
            tracing::info!(medication = %medication.name, %id, "medication removed");
        }
        removed
    }

    /// Consume one dose of the given medication. `None` if the id is unknown.
    pub fn take_dose(&mut self, id: Uuid) -> Option<DoseOutcome> {
        self.medications.get_mut(&id).map(Medication::take_dose)
    }

    pub fn get(&self, id: Uuid) -> Option<&Medication> {
        self.medications.get(&id)
    }

    /// Cloned record for external callers; `None` marks absence explicitly.
    pub fn get_by_id(&self, id: Uuid) -> Option<Medication> {
        self.medications.get(&id).cloned()
    }

    /// Defensive copy of every medication, ordered by name then id for
    /// stable listing. Callers can never mutate registry state through it.
    pub fn snapshot(&self) -> Vec<Medication> {
        let mut all: Vec<Medication> = self.medications.values().cloned().collect();
        all.sort_by(|a, b| a.name.cmp(&b.name).then(a.id.cmp(&b.id)));
        all
    }

    pub fn len(&self) -> usize {
        self.medications.len()
    }

    pub fn is_empty(&self) -> bool {
        self.medications.is_empty()
    }
}

fn apply_update(medication: &mut Medication, update: MedicationUpdate) {
    if let Some(name) = update.name {
        medication.name = name;
    }
    if let Some(description) = update.description {
        medication.description = description;
    }
    if let Some(kind) = update.kind {
        medication.kind = kind;
    }
    if let Some(quantity) = update.quantity {
        // A quantity edit is a refill: both counters reset together.
        medication.quantity_remaining = quantity;
        medication.quantity_initial = quantity;
    }
    if let Some(dose) = update.dose_per_time {
        medication.dose_per_time = dose;
    }
    if let Some(recurrence) = update.recurrence {
        medication.recurrence = recurrence;
    }
    if let Some(times) = update.reminder_times {
        medication.reminder_times = times;
    }
    if let Some(contact) = update.emergency_contact {
        medication.emergency_contact = contact;
    }
}

fn validate(medication: &Medication) -> Result<(), ValidationError> {
    if medication.name.trim().is_empty() {
        return Err(ValidationError::EmptyName);
    }
    if medication.reminder_times.is_empty() {
        return Err(ValidationError::NoReminderTimes);
    }
    if medication.dose_per_time < 1 {
        return Err(ValidationError::InvalidDose);
    }
    if medication.kind.is_countable()
        && (medication.quantity_initial == 0
            || medication.quantity_remaining > medication.quantity_initial)
    {
        return Err(ValidationError::InvalidQuantity);
    }
    Ok(())
}
