//! Scheduling driver and the notification-sink seam.
//!
//! The driver keeps the sink's set of pending wake-ups consistent with
//! registry state: it re-derives the schedule from scratch on any mutation
//! and submits one wake-up per medication for its next occurrence. Wake-up
//! identity is derived deterministically from (medication id, occurrence
//! minute) so duplicate submissions are idempotent and cancellation can
//! target exactly the right wake-up.

use crate::error::Result;
use crate::occurrence::next_for_medication;
use crate::types::{Medication, OccurrenceKey, Recurrence};
use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use uuid::Uuid;

/// Minutes in a day, the native repeat interval for daily reminders.
const DAILY_REPEAT_MINUTES: u32 = 24 * 60;

/// Deterministic wake-up identity.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct WakeupId(String);

impl WakeupId {
    /// Identity of the reminder wake-up for one occurrence.
    pub fn reminder(key: OccurrenceKey) -> Self {
        Self(format!(
            "rem-{}-{}",
            key.medication_id.simple(),
            key.slot.format("%Y%m%d%H%M")
        ))
    }

    /// Identity of the escalation watchdog wake-up for one occurrence.
    pub fn escalation(key: OccurrenceKey) -> Self {
        Self(format!(
            "esc-{}-{}",
            key.medication_id.simple(),
            key.slot.format("%Y%m%d%H%M")
        ))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for WakeupId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// What the sink delivers back to the engine when a wake-up fires.
/// Always carries enough identity to find the medication.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "snake_case", tag = "event")]
pub enum WakeupPayload {
    /// A reminder is due: show it to the user and arm the escalation path.
    Reminder {
        medication_id: Uuid,
        /// The wall-clock minute this occurrence was computed for.
        slot: NaiveDateTime,
        title: String,
        body: String,
        postponed: bool,
    },
    /// The grace window for an armed occurrence has elapsed.
    EscalationDue { key: OccurrenceKey },
}

/// One wake-up handed to the notification sink.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct ScheduledWakeup {
    pub id: WakeupId,
    pub fire_at: NaiveDateTime,
    pub payload: WakeupPayload,
    /// Native repeat interval where the platform supports it; the driver
    /// still re-submits after each fire for platforms that do not.
    pub repeat_minutes: Option<u32>,
}

/// Platform alarm/notification facility, abstracted.
///
/// Submitting an id that is already pending replaces it; cancelling an
/// unknown id is a no-op.
pub trait NotificationSink {
    fn submit(&mut self, wakeup: ScheduledWakeup) -> Result<()>;
    fn cancel(&mut self, id: &WakeupId) -> Result<()>;
    fn cancel_all(&mut self) -> Result<()>;
}

/// Bookkeeping of which wake-up ids are currently submitted, per
/// medication, so cancellation never has to enumerate the sink.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct ScheduleBook {
    submitted: HashMap<Uuid, Vec<WakeupId>>,
}

impl ScheduleBook {
    pub fn new() -> Self {
        Self::default()
    }

    fn record(&mut self, medication_id: Uuid, id: WakeupId) {
        let ids = self.submitted.entry(medication_id).or_default();
        if !ids.contains(&id) {
            ids.push(id);
        }
    }

    fn forget(&mut self, medication_id: Uuid, id: &WakeupId) {
        if let Some(ids) = self.submitted.get_mut(&medication_id) {
            ids.retain(|existing| existing != id);
            if ids.is_empty() {
                self.submitted.remove(&medication_id);
            }
        }
    }

    pub fn pending_for(&self, medication_id: Uuid) -> &[WakeupId] {
        self.submitted
            .get(&medication_id)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }
}

/// Cancel every wake-up previously submitted for one medication.
pub fn cancel_for(
    book: &mut ScheduleBook,
    sink: &mut dyn NotificationSink,
    medication_id: Uuid,
) -> Result<()> {
    if let Some(ids) = book.submitted.remove(&medication_id) {
        for id in &ids {
            sink.cancel(id)?;
        }
        tracing::debug!(%medication_id, cancelled = ids.len(), "wake-ups cancelled");
    }
    Ok(())
}

/// Re-derive and submit the next wake-up for one medication, replacing
/// whatever was previously scheduled for it. Returns the computed fire
/// instant, or `None` when the medication can never fire.
pub fn reschedule_one(
    book: &mut ScheduleBook,
    sink: &mut dyn NotificationSink,
    medication: &Medication,
    reference: NaiveDateTime,
) -> Result<Option<NaiveDateTime>> {
    cancel_for(book, sink, medication.id)?;

    let Some(fire_at) = next_for_medication(medication, reference) else {
        tracing::debug!(medication = %medication.name, "no next occurrence");
        return Ok(None);
    };

    let key = OccurrenceKey::new(medication.id, fire_at);
    let id = WakeupId::reminder(key);
    let repeat_minutes = match medication.recurrence {
        Recurrence::Daily => Some(DAILY_REPEAT_MINUTES),
        Recurrence::WeeklyOn(_) => None,
    };

    sink.submit(ScheduledWakeup {
        id: id.clone(),
        fire_at,
        payload: reminder_payload(medication, fire_at, false),
        repeat_minutes,
    })?;
    book.record(medication.id, id);

    tracing::info!(medication = %medication.name, %fire_at, "reminder scheduled");
    Ok(Some(fire_at))
}

/// Rebuild the entire pending set from scratch.
pub fn reschedule_all(
    book: &mut ScheduleBook,
    sink: &mut dyn NotificationSink,
    medications: &[Medication],
    reference: NaiveDateTime,
) -> Result<()> {
    sink.cancel_all()?;
    book.submitted.clear();
    for medication in medications {
        reschedule_one(book, sink, medication, reference)?;
    }
    Ok(())
}

/// Submit a one-shot postponed reminder for `fire_at`. The postponed
/// occurrence gets its own key, so it never aliases the slot it came from.
pub fn submit_postponed(
    book: &mut ScheduleBook,
    sink: &mut dyn NotificationSink,
    medication: &Medication,
    fire_at: NaiveDateTime,
) -> Result<OccurrenceKey> {
    let key = OccurrenceKey::new(medication.id, fire_at);
    let id = WakeupId::reminder(key);

    sink.submit(ScheduledWakeup {
        id: id.clone(),
        fire_at,
        payload: reminder_payload(medication, fire_at, true),
        repeat_minutes: None,
    })?;
    book.record(medication.id, id);

    tracing::info!(medication = %medication.name, %fire_at, "postponed reminder scheduled");
    Ok(key)
}

/// Arm the escalation watchdog for a fired occurrence.
pub fn submit_escalation(
    book: &mut ScheduleBook,
    sink: &mut dyn NotificationSink,
    key: OccurrenceKey,
    fire_at: NaiveDateTime,
) -> Result<()> {
    let id = WakeupId::escalation(key);
    sink.submit(ScheduledWakeup {
        id: id.clone(),
        fire_at,
        payload: WakeupPayload::EscalationDue { key },
        repeat_minutes: None,
    })?;
    book.record(key.medication_id, id);
    Ok(())
}

/// Cancel the escalation watchdog for one occurrence (on acknowledge,
/// postpone, or medication removal).
pub fn cancel_escalation(
    book: &mut ScheduleBook,
    sink: &mut dyn NotificationSink,
    key: OccurrenceKey,
) -> Result<()> {
    let id = WakeupId::escalation(key);
    sink.cancel(&id)?;
    book.forget(key.medication_id, &id);
    Ok(())
}

fn reminder_payload(
    medication: &Medication,
    slot: NaiveDateTime,
    postponed: bool,
) -> WakeupPayload {
    let title = if postponed {
        format!("Reminder: take {} (postponed)", medication.name)
    } else {
        format!("Reminder: take {}", medication.name)
    };
    let body = if medication.description.is_empty() {
        format!("It is time to take {}.", medication.name)
    } else {
        format!(
            "It is time to take {}. {}",
            medication.name, medication.description
        )
    };

    WakeupPayload::Reminder {
        medication_id: medication.id,
        slot,
        title,
        body,
        postponed,
    }
}


#[cfg(test)]
mod tests {
    use super::test_support::RecordingSink;
    use super::*;
    use crate::types::{Medication, MedicationType};
    use chrono::{NaiveDate, NaiveTime, Weekday};

    fn dt(d: u32, h: u32, mi: u32) -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2024, 6, d)
            .unwrap()
            .and_hms_opt(h, mi, 0)
            .unwrap()
    }

    fn daily_med(name: &str, hour: u32) -> Medication {
        let mut med = Medication::new(name, "", MedicationType::Pill, 30);
        med.reminder_times = vec![NaiveTime::from_hms_opt(hour, 0, 0).unwrap()];
        med
    }

    #[test]
    fn test_wakeup_identity_is_deterministic() {
        let med = daily_med("Aspirin", 8);
        let key = OccurrenceKey::new(med.id, dt(3, 8, 0));
        assert_eq!(WakeupId::reminder(key), WakeupId::reminder(key));
        assert_ne!(WakeupId::reminder(key), WakeupId::escalation(key));
    }

    #[test]
    fn test_reschedule_one_submits_next_occurrence() {
        let mut book = ScheduleBook::new();
        let mut sink = RecordingSink::default();
        let med = daily_med("Aspirin", 8);

        let fire_at = reschedule_one(&mut book, &mut sink, &med, dt(3, 7, 0))
            .unwrap()
            .unwrap();

        assert_eq!(fire_at, dt(3, 8, 0));
        assert_eq!(sink.pending.len(), 1);
        let wakeup = sink.pending.values().next().unwrap();
        assert_eq!(wakeup.fire_at, dt(3, 8, 0));
        assert_eq!(wakeup.repeat_minutes, Some(24 * 60));
        assert!(matches!(
            &wakeup.payload,
            WakeupPayload::Reminder { medication_id, postponed: false, .. }
                if *medication_id == med.id
        ));
    }

    #[test]
    fn test_reschedule_one_replaces_previous_wakeup() {
        let mut book = ScheduleBook::new();
        let mut sink = RecordingSink::default();
        let med = daily_med("Aspirin", 8);

        reschedule_one(&mut book, &mut sink, &med, dt(3, 7, 0)).unwrap();
        // A later reference moves the slot to the next day; the stale
        // wake-up must be gone.
        reschedule_one(&mut book, &mut sink, &med, dt(3, 9, 0)).unwrap();

        assert_eq!(sink.pending.len(), 1);
        assert_eq!(sink.pending.values().next().unwrap().fire_at, dt(4, 8, 0));
        assert_eq!(book.pending_for(med.id).len(), 1);
    }

    #[test]
    fn test_weekly_gets_no_native_repeat() {
        let mut book = ScheduleBook::new();
        let mut sink = RecordingSink::default();
        let mut med = daily_med("Vitamin", 9);
        med.recurrence = Recurrence::WeeklyOn(vec![Weekday::Mon, Weekday::Wed]);

        reschedule_one(&mut book, &mut sink, &med, dt(4, 9, 30)).unwrap();
        assert_eq!(sink.pending.values().next().unwrap().repeat_minutes, None);
    }

    #[test]
    fn test_unfireable_medication_schedules_nothing() {
        let mut book = ScheduleBook::new();
        let mut sink = RecordingSink::default();
        let mut med = daily_med("Vitamin", 9);
        med.recurrence = Recurrence::WeeklyOn(vec![]);

        let next = reschedule_one(&mut book, &mut sink, &med, dt(3, 7, 0)).unwrap();
        assert_eq!(next, None);
        assert!(sink.pending.is_empty());
    }

    #[test]
    fn test_reschedule_all_starts_from_clean_slate() {
        let mut book = ScheduleBook::new();
        let mut sink = RecordingSink::default();
        let meds = vec![daily_med("Aspirin", 8), daily_med("Ibuprofen", 20)];

        reschedule_all(&mut book, &mut sink, &meds, dt(3, 7, 0)).unwrap();
        reschedule_all(&mut book, &mut sink, &meds, dt(3, 7, 0)).unwrap();

        assert_eq!(sink.cancel_all_calls, 2);
        assert_eq!(sink.pending.len(), 2);
    }

    #[test]
    fn test_cancel_for_targets_only_that_medication() {
        let mut book = ScheduleBook::new();
        let mut sink = RecordingSink::default();
        let a = daily_med("Aspirin", 8);
        let b = daily_med("Ibuprofen", 20);

        reschedule_one(&mut book, &mut sink, &a, dt(3, 7, 0)).unwrap();
        reschedule_one(&mut book, &mut sink, &b, dt(3, 7, 0)).unwrap();
        cancel_for(&mut book, &mut sink, a.id).unwrap();

        assert_eq!(sink.pending.len(), 1);
        assert!(book.pending_for(a.id).is_empty());
        assert_eq!(book.pending_for(b.id).len(), 1);
    }

    #[test]
    fn test_escalation_wakeup_roundtrip() {
        let mut book = ScheduleBook::new();
        let mut sink = RecordingSink::default();
        let med = daily_med("Aspirin", 8);
        let key = OccurrenceKey::new(med.id, dt(3, 8, 0));

        submit_escalation(&mut book, &mut sink, key, dt(3, 8, 2)).unwrap();
        assert_eq!(sink.pending.len(), 1);
        assert_eq!(book.pending_for(med.id).len(), 1);

        cancel_escalation(&mut book, &mut sink, key).unwrap();
        assert!(sink.pending.is_empty());
        assert!(book.pending_for(med.id).is_empty());
    }

    #[test]
    fn test_postponed_key_is_distinct_from_original_slot() {
        let mut book = ScheduleBook::new();
        let mut sink = RecordingSink::default();
        let med = daily_med("Aspirin", 8);

        let original = OccurrenceKey::new(med.id, dt(3, 8, 0));
        let postponed = submit_postponed(&mut book, &mut sink, &med, dt(3, 8, 10)).unwrap();

        assert_ne!(original, postponed);
        let wakeup = sink.pending.values().next().unwrap();
        assert!(matches!(
            &wakeup.payload,
            WakeupPayload::Reminder { postponed: true, title, .. }
                if title.contains("(postponed)")
        ));
    }
}
