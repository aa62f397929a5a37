//! Core domain types for the medication reminder system.
//!
//! This module defines the fundamental types used throughout the engine:
//! - Medications and their dosing properties
//! - Recurrence rules (daily / weekly-on-days)
//! - Emergency contacts and their channels
//! - Occurrence identity and acknowledgment records

use chrono::{NaiveDateTime, NaiveTime, Timelike, Weekday};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

// ============================================================================
// Medication Types
// ============================================================================

/// Kind of medication (determines whether stock is tracked)
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum MedicationType {
    Pill,
    Capsule,
    Syrup,
    Injection,
    Inhaler,
    Drops,
    Cream,
    Other,
}

impl MedicationType {
    /// Countable kinds track a remaining-quantity stock that is decremented
    /// on every taken dose. All other kinds ignore quantity entirely.
    pub fn is_countable(self) -> bool {
        matches!(self, MedicationType::Pill | MedicationType::Capsule)
    }

    /// Stable integer code used in the persisted state shape.
    pub fn code(self) -> i64 {
        match self {
            MedicationType::Pill => 0,
            MedicationType::Capsule => 1,
            MedicationType::Syrup => 2,
            MedicationType::Injection => 3,
            MedicationType::Inhaler => 4,
            MedicationType::Drops => 5,
            MedicationType::Cream => 6,
            MedicationType::Other => 7,
        }
    }

    /// Decode a persisted integer code. Unknown codes map to `Other` so
    /// loading never fails on data written by a newer version.
    pub fn from_code(code: i64) -> Self {
        match code {
            0 => MedicationType::Pill,
            1 => MedicationType::Capsule,
            2 => MedicationType::Syrup,
            3 => MedicationType::Injection,
            4 => MedicationType::Inhaler,
            5 => MedicationType::Drops,
            6 => MedicationType::Cream,
            _ => MedicationType::Other,
        }
    }
}

// ============================================================================
// Recurrence
// ============================================================================

/// When a medication's reminder times are valid.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case", tag = "rule", content = "days")]
pub enum Recurrence {
    /// Fires every calendar day.
    Daily,
    /// Fires only on the listed weekdays. An empty list produces no
    /// occurrences at all.
    WeeklyOn(Vec<Weekday>),
}

impl Recurrence {
    /// Whether the rule allows an occurrence on the given weekday.
    pub fn fires_on(&self, weekday: Weekday) -> bool {
        match self {
            Recurrence::Daily => true,
            Recurrence::WeeklyOn(days) => days.contains(&weekday),
        }
    }

    /// A rule that can never produce an occurrence.
    pub fn is_empty(&self) -> bool {
        matches!(self, Recurrence::WeeklyOn(days) if days.is_empty())
    }
}

// ============================================================================
// Emergency Contact
// ============================================================================

/// Contact notified when a reminder is missed. Owned exclusively by its
/// medication; there is no independent contact lifecycle.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct EmergencyContact {
    pub name: String,
    pub phone: Option<String>,
    pub telegram_id: Option<String>,
    pub whatsapp: Option<String>,
    pub email: Option<String>,
}

impl EmergencyContact {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }

    /// Email and SMS are the only channels the engine dispatches on.
    /// Telegram/WhatsApp are stored but carried by other integrations.
    pub fn has_deliverable_channel(&self) -> bool {
        let filled = |field: &Option<String>| {
            field.as_deref().is_some_and(|value| !value.trim().is_empty())
        };
        filled(&self.email) || filled(&self.phone)
    }
}

// ============================================================================
// Medication Record
// ============================================================================

/// A medication with its dosing, recurrence, and escalation contact.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct Medication {
    pub id: Uuid,
    pub name: String,
    pub description: String,
    pub kind: MedicationType,
    /// Remaining stock; meaningful only for countable kinds.
    pub quantity_remaining: u32,
    pub quantity_initial: u32,
    pub dose_per_time: u32,
    pub recurrence: Recurrence,
    /// Wall-clock times of day, hour+minute only.
    pub reminder_times: Vec<NaiveTime>,
    pub emergency_contact: Option<EmergencyContact>,
}

/// Result of attempting to take one dose.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DoseOutcome {
    /// Stock decremented by the per-dose amount.
    Taken { remaining: u32 },
    /// Stock insufficient for a full dose; quantity left unchanged.
    /// A warning signal, not an error.
    LowSupply { remaining: u32 },
    /// The medication kind does not track stock.
    NotCountable,
}

impl Medication {
    /// Construct a new medication with a fresh identity.
    ///
    /// Quantity tracking is initialized only for countable kinds; dosing
    /// defaults to one unit per time and a daily recurrence.
    pub fn new(
        name: impl Into<String>,
        description: impl Into<String>,
        kind: MedicationType,
        quantity: u32,
    ) -> Self {
        let (remaining, initial) = if kind.is_countable() {
            (quantity, quantity)
        } else {
            (0, 0)
        };

        Self {
            id: Uuid::new_v4(),
            name: name.into(),
            description: description.into(),
            kind,
            quantity_remaining: remaining,
            quantity_initial: initial,
            dose_per_time: 1,
            recurrence: Recurrence::Daily,
            reminder_times: Vec::new(),
            emergency_contact: None,
        }
    }

    /// Consume one dose's worth of stock.
    ///
    /// Never underflows: if the remaining quantity cannot cover a full dose
    /// the stock is left untouched and a low-supply signal is returned.
    pub fn take_dose(&mut self) -> DoseOutcome {
        if !self.kind.is_countable() {
            return DoseOutcome::NotCountable;
        }

        if self.quantity_remaining >= self.dose_per_time {
            self.quantity_remaining -= self.dose_per_time;
            tracing::debug!(
                medication = %self.name,
                remaining = self.quantity_remaining,
                "dose taken"
            );
            DoseOutcome::Taken {
                remaining: self.quantity_remaining,
            }
        } else {
            tracing::warn!(
                medication = %self.name,
                remaining = self.quantity_remaining,
                dose = self.dose_per_time,
                "supply too low for a full dose"
            );
            DoseOutcome::LowSupply {
                remaining: self.quantity_remaining,
            }
        }
    }
}

/// Partial update applied by the registry's edit operation.
///
/// `None` fields are left untouched. `quantity` resets both remaining and
/// initial stock, mirroring how a refill is entered.
#[derive(Clone, Debug, Default)]
pub struct MedicationUpdate {
    pub name: Option<String>,
    pub description: Option<String>,
    pub kind: Option<MedicationType>,
    pub quantity: Option<u32>,
    pub dose_per_time: Option<u32>,
    pub recurrence: Option<Recurrence>,
    pub reminder_times: Option<Vec<NaiveTime>>,
    /// `Some(None)` clears the contact, `Some(Some(..))` replaces it.
    pub emergency_contact: Option<Option<EmergencyContact>>,
}

// ============================================================================
// Occurrence Identity
// ============================================================================

/// Identity of one concrete, dated reminder instance.
///
/// Keyed by the wall-clock minute the occurrence was computed for, not the
/// literal delivery instant, so a postponed reminder never aliases the slot
/// it was postponed from.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct OccurrenceKey {
    pub medication_id: Uuid,
    pub slot: NaiveDateTime,
}

impl OccurrenceKey {
    /// Build a key, truncating the slot to minute precision.
    pub fn new(medication_id: Uuid, slot: NaiveDateTime) -> Self {
        let slot = slot
            .with_second(0)
            .and_then(|s| s.with_nanosecond(0))
            .unwrap_or(slot);
        Self {
            medication_id,
            slot,
        }
    }
}

impl std::fmt::Display for OccurrenceKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}@{}", self.medication_id, self.slot.format("%Y-%m-%dT%H:%M"))
    }
}

// ============================================================================
// Acknowledgment Records
// ============================================================================

/// How an armed occurrence settled.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum AckOutcome {
    Acknowledged,
    Postponed,
    Escalated,
}

/// Durable record of one settled occurrence. Write-once per key.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct AcknowledgmentRecord {
    pub key: OccurrenceKey,
    pub outcome: AckOutcome,
    pub recorded_at: NaiveDateTime,
}
