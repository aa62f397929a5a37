//! The reminder engine.
//!
//! An explicitly constructed instance owning the registry, ledger, and
//! armed-occurrence set behind a single mutex. Every mutating operation is
//! serialized through that lock, so the acknowledge-vs-grace-expiry race is
//! resolved by one authoritative ledger check: whichever path settles the
//! key first wins, the loser observes the entry and does nothing.
//!
//! The engine never reads the system clock; callers inject `now` on every
//! operation. Lifecycle is `init(loaded) -> operate -> shutdown()`.

use crate::config::Config;
use crate::error::{Error, Result};
use crate::escalation::{self, ArmedOccurrence, EscalationReport, EscalationState, MessageTransport};
use crate::ledger::Ledger;
use crate::occurrence::next_for_medication;
use crate::registry::Registry;
use crate::schedule::{self, NotificationSink, ScheduleBook, WakeupPayload};
use crate::store::{self, StoredMedications};
use crate::types::{
    AckOutcome, AcknowledgmentRecord, DoseOutcome, Medication, MedicationUpdate, OccurrenceKey,
};
use chrono::{Duration, NaiveDateTime};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};
use uuid::Uuid;

/// State handed to [`ReminderEngine::init`] by the persistence shell.
#[derive(Debug, Default)]
pub struct LoadedState {
    pub medications: Option<StoredMedications>,
    /// Durable acknowledgment history, seeding the ledger.
    pub history: Vec<AcknowledgmentRecord>,
    pub runtime: RuntimeState,
}

/// Runtime state that survives restarts but is not part of the medication
/// document: fired-but-unsettled occurrences and pending postponements.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct RuntimeState {
    pub armed: Vec<ArmedOccurrence>,
    pub postponed: Vec<PostponedReminder>,
}

/// A postponed reminder that has been submitted but not yet fired.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq)]
pub struct PostponedReminder {
    pub medication_id: Uuid,
    pub fire_at: NaiveDateTime,
}

/// Everything the shell must persist on shutdown.
#[derive(Debug)]
pub struct PersistedState {
    pub medications: StoredMedications,
    pub runtime: RuntimeState,
}

/// Result of an acknowledge call.
#[derive(Debug)]
pub struct AckResponse {
    /// `None` when the occurrence was already settled (idempotent no-op).
    pub record: Option<AcknowledgmentRecord>,
    /// Dose bookkeeping, present only when this call settled the key.
    pub dose: Option<DoseOutcome>,
}

/// Result of a postpone call that actually rescheduled something.
#[derive(Debug)]
pub struct PostponeResponse {
    pub record: AcknowledgmentRecord,
    pub new_key: OccurrenceKey,
    pub rescheduled_for: NaiveDateTime,
}

/// What happened when the sink delivered a wake-up to the engine.
#[derive(Debug)]
pub enum WakeupOutcome {
    /// A reminder reached the user; the escalation watchdog is armed.
    ReminderDelivered {
        key: OccurrenceKey,
        title: String,
        body: String,
    },
    /// The grace window elapsed and the emergency contact was notified.
    Escalated {
        record: AcknowledgmentRecord,
        report: EscalationReport,
    },
    /// The grace window elapsed but no deliverable contact exists; the
    /// occurrence lapses unacknowledged.
    Lapsed { key: OccurrenceKey },
    /// The occurrence was already settled; nothing to do.
    AlreadySettled { key: OccurrenceKey },
    /// The payload references a medication that no longer exists.
    UnknownMedication { medication_id: Uuid },
}

struct Inner<S, T> {
    registry: Registry,
    ledger: Ledger,
    armed: HashMap<OccurrenceKey, ArmedOccurrence>,
    postponed: HashMap<OccurrenceKey, PostponedReminder>,
    book: ScheduleBook,
    sink: S,
    transport: T,
}

/// The scheduling and escalation engine.
pub struct ReminderEngine<S, T> {
    config: Config,
    inner: Mutex<Inner<S, T>>,
}

impl<S: NotificationSink, T: MessageTransport> ReminderEngine<S, T> {
    /// Construct the engine from loaded state and re-derive the full wake-up
    /// schedule from scratch, so drift between registry and scheduled
    /// wake-ups never persists across restarts.
    pub fn init(
        config: Config,
        sink: S,
        transport: T,
        loaded: LoadedState,
        now: NaiveDateTime,
    ) -> Result<Self> {
        let medications = store::decode(loaded.medications.unwrap_or_default());
        let registry = Registry::from_records(medications);
        let ledger = Ledger::from_records(loaded.history);

        let mut inner = Inner {
            registry,
            ledger,
            armed: HashMap::new(),
            postponed: HashMap::new(),
            book: ScheduleBook::new(),
            sink,
            transport,
        };

        schedule::reschedule_all(
            &mut inner.book,
            &mut inner.sink,
            &inner.registry.snapshot(),
            now,
        )?;

        // Restore what the from-scratch schedule cannot re-derive: pending
        // postponements and the watchdogs of still-armed occurrences.
        for pending in loaded.runtime.postponed {
            let Some(medication) = inner.registry.get_by_id(pending.medication_id) else {
                continue;
            };
            if inner.ledger.is_settled(OccurrenceKey::new(pending.medication_id, pending.fire_at))
            {
                continue;
            }
            let key = schedule::submit_postponed(
                &mut inner.book,
                &mut inner.sink,
                &medication,
                pending.fire_at,
            )?;
            inner.postponed.insert(key, pending);
        }

        let grace = config.reminders.grace();
        for armed in loaded.runtime.armed {
            if armed.state != EscalationState::Armed || inner.ledger.is_settled(armed.key) {
                continue;
            }
            if inner.registry.get(armed.key.medication_id).is_none() {
                continue;
            }
            inner.armed.insert(armed.key, armed);
            arm_watchdog(&mut inner, armed.key, armed.fired_at, grace)?;
        }

        tracing::info!(
            medications = inner.registry.len(),
            armed = inner.armed.len(),
            "reminder engine initialized"
        );

        Ok(Self {
            config,
            inner: Mutex::new(inner),
        })
    }

    /// Flush: snapshot everything the shell needs to persist.
    pub fn shutdown(&self) -> Result<PersistedState> {
        let inner = self.lock()?;
        Ok(PersistedState {
            medications: store::encode(&inner.registry.snapshot()),
            runtime: RuntimeState {
                armed: inner.armed.values().copied().collect(),
                postponed: inner.postponed.values().copied().collect(),
            },
        })
    }

    // ------------------------------------------------------------------
    // Registry operations
    // ------------------------------------------------------------------

    /// Register a medication and schedule its next reminder.
    pub fn add(&self, medication: Medication, now: NaiveDateTime) -> Result<Uuid> {
        let mut guard = self.lock()?;
        let inner = &mut *guard;
        let id = inner.registry.add(medication)?;
        let record = inner
            .registry
            .get_by_id(id)
            .ok_or_else(|| Error::Other("freshly added medication missing".into()))?;
        schedule::reschedule_one(&mut inner.book, &mut inner.sink, &record, now)?;
        Ok(id)
    }

    /// Edit a medication and fully re-schedule it. `Ok(false)` when the id
    /// is unknown (a no-op, not an error).
    pub fn edit(&self, id: Uuid, update: MedicationUpdate, now: NaiveDateTime) -> Result<bool> {
        let mut guard = self.lock()?;
        let inner = &mut *guard;
        if !inner.registry.edit(id, update)? {
            return Ok(false);
        }
        let record = inner
            .registry
            .get_by_id(id)
            .ok_or_else(|| Error::Other("edited medication missing".into()))?;
        schedule::reschedule_one(&mut inner.book, &mut inner.sink, &record, now)?;
        restore_siblings(inner, &record, self.config.reminders.grace())?;
        Ok(true)
    }

    /// Remove a medication, cancelling every pending wake-up and watchdog
    /// that references it. `Ok(false)` when the id is unknown.
    pub fn remove(&self, id: Uuid) -> Result<bool> {
        let mut guard = self.lock()?;
        let inner = &mut *guard;
        if inner.registry.remove(id).is_none() {
            return Ok(false);
        }
        schedule::cancel_for(&mut inner.book, &mut inner.sink, id)?;
        inner.armed.retain(|key, _| key.medication_id != id);
        inner.postponed.retain(|key, _| key.medication_id != id);
        Ok(true)
    }

    /// Consume one dose. `None` when the id is unknown.
    pub fn take_dose(&self, id: Uuid) -> Result<Option<DoseOutcome>> {
        Ok(self.lock()?.registry.take_dose(id))
    }

    pub fn get_by_id(&self, id: Uuid) -> Result<Option<Medication>> {
        Ok(self.lock()?.registry.get_by_id(id))
    }

    /// Consistent snapshot of every medication.
    pub fn get_all(&self) -> Result<Vec<Medication>> {
        Ok(self.lock()?.registry.snapshot())
    }

    /// Next computed occurrence per medication (`None` for ones that can
    /// never fire).
    pub fn next_due(&self, now: NaiveDateTime) -> Result<Vec<(Medication, Option<NaiveDateTime>)>> {
        let inner = self.lock()?;
        Ok(inner
            .registry
            .snapshot()
            .into_iter()
            .map(|med| {
                let next = next_for_medication(&med, now);
                (med, next)
            })
            .collect())
    }

    /// Armed (fired, unsettled) occurrences for one medication.
    pub fn armed_for(&self, id: Uuid) -> Result<Vec<OccurrenceKey>> {
        let inner = self.lock()?;
        let mut keys: Vec<OccurrenceKey> = inner
            .armed
            .keys()
            .filter(|key| key.medication_id == id)
            .copied()
            .collect();
        keys.sort();
        Ok(keys)
    }

    // ------------------------------------------------------------------
    // Reminder lifecycle
    // ------------------------------------------------------------------

    /// Callback from the notification sink when a wake-up fires.
    pub fn handle_wakeup(&self, payload: WakeupPayload, now: NaiveDateTime) -> Result<WakeupOutcome> {
        match payload {
            WakeupPayload::Reminder {
                medication_id,
                slot,
                title,
                body,
                ..
            } => self.on_reminder_fired(medication_id, slot, title, body, now),
            WakeupPayload::EscalationDue { key } => {
                let mut guard = self.lock()?;
                escalate_key(&mut guard, key, &self.config, now)
            }
        }
    }

    fn on_reminder_fired(
        &self,
        medication_id: Uuid,
        slot: NaiveDateTime,
        title: String,
        body: String,
        now: NaiveDateTime,
    ) -> Result<WakeupOutcome> {
        let mut guard = self.lock()?;
        let inner = &mut *guard;

        let Some(medication) = inner.registry.get_by_id(medication_id) else {
            tracing::warn!(%medication_id, "reminder fired for unknown medication");
            return Ok(WakeupOutcome::UnknownMedication { medication_id });
        };

        let key = OccurrenceKey::new(medication_id, slot);
        inner.postponed.remove(&key);

        // Keep the reminder chain alive: re-derive the next wake-up for
        // this medication, strictly after the slot that just fired.
        let reference = now.max(slot) + Duration::minutes(1);
        schedule::reschedule_one(&mut inner.book, &mut inner.sink, &medication, reference)?;
        restore_siblings(inner, &medication, self.config.reminders.grace())?;

        if inner.ledger.is_settled(key) {
            return Ok(WakeupOutcome::AlreadySettled { key });
        }

        // At most one armed watchdog per occurrence: a redundant delivery
        // keeps the original fire time.
        let fired_at = inner
            .armed
            .entry(key)
            .or_insert_with(|| ArmedOccurrence::new(key, now))
            .fired_at;

        if medication
            .emergency_contact
            .as_ref()
            .is_some_and(|c| c.has_deliverable_channel())
        {
            arm_watchdog(inner, key, fired_at, self.config.reminders.grace())?;
        }

        tracing::info!(%key, "reminder delivered, escalation armed");
        Ok(WakeupOutcome::ReminderDelivered { key, title, body })
    }

    /// Record that the user confirmed the dose.
    ///
    /// Idempotent: a second call for the same key changes nothing and never
    /// double-decrements the quantity.
    pub fn acknowledge(&self, key: OccurrenceKey, now: NaiveDateTime) -> Result<AckResponse> {
        let mut guard = self.lock()?;
        let inner = &mut *guard;

        let Some(record) = inner.ledger.settle(key, AckOutcome::Acknowledged, now) else {
            return Ok(AckResponse {
                record: None,
                dose: None,
            });
        };

        inner.armed.remove(&key);
        schedule::cancel_escalation(&mut inner.book, &mut inner.sink, key)?;
        let dose = inner.registry.take_dose(key.medication_id);

        Ok(AckResponse {
            record: Some(record),
            dose,
        })
    }

    /// Push the reminder into the future instead of taking it now.
    ///
    /// Settles the original occurrence as Postponed and schedules a new,
    /// wholly distinct occurrence `postpone_minutes` out. `Ok(None)` when
    /// the medication is gone or the occurrence is already settled.
    pub fn postpone(&self, key: OccurrenceKey, now: NaiveDateTime) -> Result<Option<PostponeResponse>> {
        let mut guard = self.lock()?;
        let inner = &mut *guard;

        let Some(medication) = inner.registry.get_by_id(key.medication_id) else {
            return Ok(None);
        };
        let Some(record) = inner.ledger.settle(key, AckOutcome::Postponed, now) else {
            return Ok(None);
        };

        inner.armed.remove(&key);
        schedule::cancel_escalation(&mut inner.book, &mut inner.sink, key)?;

        let fire_at = now + self.config.reminders.postpone();
        let new_key =
            schedule::submit_postponed(&mut inner.book, &mut inner.sink, &medication, fire_at)?;
        inner.postponed.insert(
            new_key,
            PostponedReminder {
                medication_id: key.medication_id,
                fire_at: new_key.slot,
            },
        );

        Ok(Some(PostponeResponse {
            record,
            new_key,
            rescheduled_for: new_key.slot,
        }))
    }

    /// Fallback escalation sweep for platforms without a reliable native
    /// wake-up: settle every armed occurrence whose grace window elapsed.
    ///
    /// Safe to run concurrently with user-driven acknowledgments; the
    /// ledger check under the engine lock arbitrates.
    pub fn sweep(&self, now: NaiveDateTime) -> Result<Vec<WakeupOutcome>> {
        let mut guard = self.lock()?;
        let grace = self.config.reminders.grace();

        let due: Vec<OccurrenceKey> = guard
            .armed
            .values()
            .filter(|armed| armed.grace_elapsed(grace, now))
            .map(|armed| armed.key)
            .collect();

        let mut outcomes = Vec::with_capacity(due.len());
        for key in due {
            outcomes.push(escalate_key(&mut guard, key, &self.config, now)?);
        }
        Ok(outcomes)
    }

    fn lock(&self) -> Result<MutexGuard<'_, Inner<S, T>>> {
        self.inner
            .lock()
            .map_err(|_| Error::Other("engine state lock poisoned".into()))
    }
}

/// Re-submit this medication's wake-ups that a driver reschedule wiped:
/// pending postponed reminders and the watchdogs of its other fired,
/// still-armed occurrences. `cancel_for` inside the driver is wholesale,
/// so every non-regular wake-up must come back through here.
fn restore_siblings<S: NotificationSink, T>(
    inner: &mut Inner<S, T>,
    medication: &Medication,
    grace: Duration,
) -> Result<()> {
    let pending: Vec<PostponedReminder> = inner
        .postponed
        .values()
        .filter(|p| p.medication_id == medication.id)
        .copied()
        .collect();
    for entry in pending {
        schedule::submit_postponed(&mut inner.book, &mut inner.sink, medication, entry.fire_at)?;
    }

    if medication
        .emergency_contact
        .as_ref()
        .is_some_and(|c| c.has_deliverable_channel())
    {
        let armed: Vec<ArmedOccurrence> = inner
            .armed
            .values()
            .filter(|a| {
                a.key.medication_id == medication.id && a.state == EscalationState::Armed
            })
            .copied()
            .collect();
        for entry in armed {
            arm_watchdog(inner, entry.key, entry.fired_at, grace)?;
        }
    }
    Ok(())
}

/// Submit the escalation watchdog wake-up for an armed occurrence.
fn arm_watchdog<S: NotificationSink, T>(
    inner: &mut Inner<S, T>,
    key: OccurrenceKey,
    fired_at: NaiveDateTime,
    grace: Duration,
) -> Result<()> {
    schedule::submit_escalation(&mut inner.book, &mut inner.sink, key, fired_at + grace)
}

/// Authoritative grace-expiry resolution for one occurrence.
///
/// Runs entirely under the engine lock. If the ledger is already settled
/// the expiry loses the race and nothing further happens.
fn escalate_key<S: NotificationSink, T: MessageTransport>(
    guard: &mut MutexGuard<'_, Inner<S, T>>,
    key: OccurrenceKey,
    config: &Config,
    now: NaiveDateTime,
) -> Result<WakeupOutcome> {
    let inner = &mut **guard;

    if inner.ledger.is_settled(key) {
        return Ok(WakeupOutcome::AlreadySettled { key });
    }

    let Some(medication) = inner.registry.get_by_id(key.medication_id) else {
        inner.armed.remove(&key);
        return Ok(WakeupOutcome::UnknownMedication {
            medication_id: key.medication_id,
        });
    };

    let report = escalation::dispatch(
        &mut inner.transport,
        &medication,
        key,
        &config.user.display_name,
    );

    inner.armed.remove(&key);
    schedule::cancel_escalation(&mut inner.book, &mut inner.sink, key)?;

    match report {
        Some(report) => {
            let record = inner
                .ledger
                .settle(key, AckOutcome::Escalated, now)
                .ok_or_else(|| Error::Other("ledger settled during escalation".into()))?;
            Ok(WakeupOutcome::Escalated { record, report })
        }
        None => {
            // No deliverable contact: the occurrence lapses unacknowledged.
            tracing::info!(%key, "grace window elapsed with no contact, occurrence lapsed");
            Ok(WakeupOutcome::Lapsed { key })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::escalation::test_support::RecordingTransport;
    use crate::schedule::test_support::RecordingSink;
    use crate::types::{EmergencyContact, MedicationType, Recurrence};
    use chrono::{NaiveDate, NaiveTime};
    use std::sync::Arc;

    fn dt(d: u32, h: u32, mi: u32) -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2024, 6, d)
            .unwrap()
            .and_hms_opt(h, mi, 0)
            .unwrap()
    }

    fn aspirin(contact: Option<EmergencyContact>) -> Medication {
        let mut med = Medication::new("Aspirin", "with food", MedicationType::Pill, 30);
        med.reminder_times = vec![NaiveTime::from_hms_opt(8, 0, 0).unwrap()];
        med.emergency_contact = contact;
        med
    }

    fn email_contact() -> EmergencyContact {
        let mut contact = EmergencyContact::new("Sara");
        contact.email = Some("sara@example.com".into());
        contact
    }

    fn new_engine() -> ReminderEngine<RecordingSink, RecordingTransport> {
        ReminderEngine::init(
            Config::default(),
            RecordingSink::default(),
            RecordingTransport::default(),
            LoadedState::default(),
            dt(3, 7, 0),
        )
        .unwrap()
    }

    /// Deliver the 08:00 reminder for a medication and return its key.
    fn fire(
        engine: &ReminderEngine<RecordingSink, RecordingTransport>,
        id: Uuid,
    ) -> OccurrenceKey {
        let outcome = engine
            .handle_wakeup(
                WakeupPayload::Reminder {
                    medication_id: id,
                    slot: dt(3, 8, 0),
                    title: "Reminder: take Aspirin".into(),
                    body: "It is time to take Aspirin.".into(),
                    postponed: false,
                },
                dt(3, 8, 0),
            )
            .unwrap();
        match outcome {
            WakeupOutcome::ReminderDelivered { key, .. } => key,
            other => panic!("expected delivery, got {other:?}"),
        }
    }

    fn sink_pending(engine: &ReminderEngine<RecordingSink, RecordingTransport>) -> usize {
        engine.inner.lock().unwrap().sink.pending.len()
    }

    #[test]
    fn test_add_schedules_reminder() {
        let engine = new_engine();
        engine.add(aspirin(None), dt(3, 7, 0)).unwrap();
        assert_eq!(sink_pending(&engine), 1);
    }

    #[test]
    fn test_invalid_add_schedules_nothing() {
        let engine = new_engine();
        let mut med = aspirin(None);
        med.reminder_times.clear();

        assert!(engine.add(med, dt(3, 7, 0)).is_err());
        assert_eq!(sink_pending(&engine), 0);
        assert!(engine.get_all().unwrap().is_empty());
    }

    #[test]
    fn test_acknowledge_settles_and_decrements_once() {
        let engine = new_engine();
        let id = engine.add(aspirin(Some(email_contact())), dt(3, 7, 0)).unwrap();
        let key = fire(&engine, id);

        let first = engine.acknowledge(key, dt(3, 8, 1)).unwrap();
        assert_eq!(first.record.unwrap().outcome, AckOutcome::Acknowledged);
        assert_eq!(first.dose, Some(DoseOutcome::Taken { remaining: 29 }));

        let second = engine.acknowledge(key, dt(3, 8, 2)).unwrap();
        assert!(second.record.is_none());
        assert!(second.dose.is_none());

        assert_eq!(
            engine.get_by_id(id).unwrap().unwrap().quantity_remaining,
            29
        );
    }

    #[test]
    fn test_sweep_escalates_after_grace_email_only() {
        let engine = new_engine();
        let id = engine.add(aspirin(Some(email_contact())), dt(3, 7, 0)).unwrap();
        fire(&engine, id);

        // Before the grace window: nothing
        assert!(engine.sweep(dt(3, 8, 1)).unwrap().is_empty());

        let outcomes = engine.sweep(dt(3, 8, 2)).unwrap();
        assert_eq!(outcomes.len(), 1);
        let WakeupOutcome::Escalated { record, report } = &outcomes[0] else {
            panic!("expected escalation");
        };
        assert_eq!(record.outcome, AckOutcome::Escalated);
        assert_eq!(report.attempts.len(), 1);

        let inner = engine.inner.lock().unwrap();
        assert_eq!(inner.transport.emails.len(), 1);
        assert_eq!(inner.transport.texts.len(), 0);
        assert!(inner.armed.is_empty());
    }

    #[test]
    fn test_sweep_is_quiet_once_settled() {
        let engine = new_engine();
        let id = engine.add(aspirin(Some(email_contact())), dt(3, 7, 0)).unwrap();
        let key = fire(&engine, id);

        engine.acknowledge(key, dt(3, 8, 1)).unwrap();
        assert!(engine.sweep(dt(3, 9, 0)).unwrap().is_empty());
        assert!(engine.inner.lock().unwrap().transport.emails.is_empty());
    }

    #[test]
    fn test_escalation_wakeup_after_ack_is_noop() {
        let engine = new_engine();
        let id = engine.add(aspirin(Some(email_contact())), dt(3, 7, 0)).unwrap();
        let key = fire(&engine, id);
        engine.acknowledge(key, dt(3, 8, 1)).unwrap();

        let outcome = engine
            .handle_wakeup(WakeupPayload::EscalationDue { key }, dt(3, 8, 2))
            .unwrap();
        assert!(matches!(outcome, WakeupOutcome::AlreadySettled { .. }));
        assert!(engine.inner.lock().unwrap().transport.emails.is_empty());
    }

    #[test]
    fn test_ack_after_escalation_does_not_decrement() {
        let engine = new_engine();
        let id = engine.add(aspirin(Some(email_contact())), dt(3, 7, 0)).unwrap();
        let key = fire(&engine, id);

        engine.sweep(dt(3, 8, 5)).unwrap();
        let response = engine.acknowledge(key, dt(3, 8, 6)).unwrap();

        assert!(response.record.is_none());
        assert_eq!(
            engine.get_by_id(id).unwrap().unwrap().quantity_remaining,
            30
        );
    }

    #[test]
    fn test_no_contact_lapses_without_message() {
        let engine = new_engine();
        let id = engine.add(aspirin(None), dt(3, 7, 0)).unwrap();
        fire(&engine, id);

        let outcomes = engine.sweep(dt(3, 8, 5)).unwrap();
        assert!(matches!(outcomes[0], WakeupOutcome::Lapsed { .. }));

        let inner = engine.inner.lock().unwrap();
        assert!(inner.transport.emails.is_empty());
        assert!(inner.transport.texts.is_empty());
    }

    #[test]
    fn test_postpone_reschedules_and_kills_original_watchdog() {
        let engine = new_engine();
        let id = engine.add(aspirin(Some(email_contact())), dt(3, 7, 0)).unwrap();
        let key = fire(&engine, id);

        let response = engine.postpone(key, dt(3, 8, 0)).unwrap().unwrap();
        assert_eq!(response.rescheduled_for, dt(3, 8, 10));
        assert_ne!(response.new_key, key);

        // The original occurrence never escalates, even long after its
        // grace window would have elapsed.
        assert!(engine.sweep(dt(3, 9, 0)).unwrap().is_empty());
        assert!(engine.inner.lock().unwrap().transport.emails.is_empty());

        // Postponing again for the same (settled) key is a no-op.
        assert!(engine.postpone(key, dt(3, 8, 1)).unwrap().is_none());
    }

    #[test]
    fn test_postponed_occurrence_arms_its_own_watchdog() {
        let engine = new_engine();
        let id = engine.add(aspirin(Some(email_contact())), dt(3, 7, 0)).unwrap();
        let key = fire(&engine, id);
        let response = engine.postpone(key, dt(3, 8, 0)).unwrap().unwrap();

        // Deliver the postponed reminder, then miss it.
        let outcome = engine
            .handle_wakeup(
                WakeupPayload::Reminder {
                    medication_id: id,
                    slot: response.rescheduled_for,
                    title: String::new(),
                    body: String::new(),
                    postponed: true,
                },
                response.rescheduled_for,
            )
            .unwrap();
        assert!(matches!(outcome, WakeupOutcome::ReminderDelivered { .. }));

        let outcomes = engine.sweep(dt(3, 8, 12)).unwrap();
        assert_eq!(outcomes.len(), 1);
        assert!(matches!(outcomes[0], WakeupOutcome::Escalated { .. }));
    }

    #[test]
    fn test_fire_preserves_pending_postponed_sibling() {
        let engine = new_engine();
        let mut med = aspirin(Some(email_contact()));
        med.reminder_times = vec![
            NaiveTime::from_hms_opt(8, 0, 0).unwrap(),
            NaiveTime::from_hms_opt(9, 0, 0).unwrap(),
        ];
        let id = engine.add(med, dt(3, 7, 0)).unwrap();

        // Postpone the 08:00 occurrence shortly before the 09:00 slot
        let key = fire(&engine, id);
        let response = engine.postpone(key, dt(3, 8, 55)).unwrap().unwrap();
        assert_eq!(response.rescheduled_for, dt(3, 9, 5));

        // Delivering the regular 09:00 reminder re-derives the schedule;
        // the pending postponed wake-up must survive that.
        engine
            .handle_wakeup(
                WakeupPayload::Reminder {
                    medication_id: id,
                    slot: dt(3, 9, 0),
                    title: String::new(),
                    body: String::new(),
                    postponed: false,
                },
                dt(3, 9, 0),
            )
            .unwrap();

        {
            let inner = engine.inner.lock().unwrap();
            assert!(
                inner.sink.pending.values().any(|w| w.fire_at == dt(3, 9, 5)),
                "postponed wake-up missing from the sink after the 09:00 fire"
            );
        }

        // The postponed occurrence still runs its full lifecycle
        engine.acknowledge(OccurrenceKey::new(id, dt(3, 9, 0)), dt(3, 9, 1)).unwrap();
        engine
            .handle_wakeup(
                WakeupPayload::Reminder {
                    medication_id: id,
                    slot: response.rescheduled_for,
                    title: String::new(),
                    body: String::new(),
                    postponed: true,
                },
                response.rescheduled_for,
            )
            .unwrap();
        let outcomes = engine.sweep(dt(3, 9, 8)).unwrap();
        assert_eq!(outcomes.len(), 1);
        let WakeupOutcome::Escalated { record, .. } = &outcomes[0] else {
            panic!("expected escalation of the postponed occurrence");
        };
        assert_eq!(record.key, response.new_key);
    }

    #[test]
    fn test_fire_preserves_sibling_watchdog() {
        let engine = new_engine();
        let mut med = aspirin(Some(email_contact()));
        med.reminder_times = vec![
            NaiveTime::from_hms_opt(8, 0, 0).unwrap(),
            NaiveTime::from_hms_opt(8, 1, 0).unwrap(),
        ];
        let id = engine.add(med, dt(3, 7, 0)).unwrap();

        let first = fire(&engine, id);
        engine
            .handle_wakeup(
                WakeupPayload::Reminder {
                    medication_id: id,
                    slot: dt(3, 8, 1),
                    title: String::new(),
                    body: String::new(),
                    postponed: false,
                },
                dt(3, 8, 1),
            )
            .unwrap();

        let inner = engine.inner.lock().unwrap();
        assert!(
            inner
                .sink
                .pending
                .contains_key(&crate::schedule::WakeupId::escalation(first)),
            "first occurrence's watchdog missing after the second fire"
        );
    }

    #[test]
    fn test_edit_preserves_pending_postponed_wakeup() {
        let engine = new_engine();
        let id = engine.add(aspirin(Some(email_contact())), dt(3, 7, 0)).unwrap();
        let key = fire(&engine, id);
        engine.postpone(key, dt(3, 8, 0)).unwrap().unwrap();

        let update = MedicationUpdate {
            description: Some("after meals".into()),
            ..Default::default()
        };
        assert!(engine.edit(id, update, dt(3, 8, 5)).unwrap());

        let inner = engine.inner.lock().unwrap();
        assert!(
            inner.sink.pending.values().any(|w| w.fire_at == dt(3, 8, 10)),
            "postponed wake-up missing after edit"
        );
    }

    #[test]
    fn test_remove_cancels_everything_for_medication() {
        let engine = new_engine();
        let id = engine.add(aspirin(Some(email_contact())), dt(3, 7, 0)).unwrap();
        fire(&engine, id);

        assert!(engine.remove(id).unwrap());
        assert_eq!(sink_pending(&engine), 0);

        // No escalation after removal, and a stale callback is ignored.
        assert!(engine.sweep(dt(3, 9, 0)).unwrap().is_empty());
        let outcome = engine
            .handle_wakeup(
                WakeupPayload::Reminder {
                    medication_id: id,
                    slot: dt(4, 8, 0),
                    title: String::new(),
                    body: String::new(),
                    postponed: false,
                },
                dt(4, 8, 0),
            )
            .unwrap();
        assert!(matches!(outcome, WakeupOutcome::UnknownMedication { .. }));
    }

    #[test]
    fn test_remove_unknown_id_is_noop() {
        let engine = new_engine();
        assert!(!engine.remove(Uuid::new_v4()).unwrap());
    }

    #[test]
    fn test_fire_resubmits_next_occurrence() {
        let engine = new_engine();
        let id = engine.add(aspirin(None), dt(3, 7, 0)).unwrap();
        fire(&engine, id);

        // No contact, so no watchdog: the single pending wake-up is the
        // next day's reminder.
        let inner = engine.inner.lock().unwrap();
        assert_eq!(inner.sink.pending.len(), 1);
        assert_eq!(
            inner.sink.pending.values().next().unwrap().fire_at,
            dt(4, 8, 0)
        );
    }

    #[test]
    fn test_redundant_delivery_keeps_original_fire_time() {
        let engine = new_engine();
        let id = engine.add(aspirin(Some(email_contact())), dt(3, 7, 0)).unwrap();
        fire(&engine, id);

        // Second delivery of the same occurrence minutes later
        engine
            .handle_wakeup(
                WakeupPayload::Reminder {
                    medication_id: id,
                    slot: dt(3, 8, 0),
                    title: String::new(),
                    body: String::new(),
                    postponed: false,
                },
                dt(3, 8, 1),
            )
            .unwrap();

        let inner = engine.inner.lock().unwrap();
        let armed = inner.armed.values().next().unwrap();
        assert_eq!(armed.fired_at, dt(3, 8, 0));
    }

    #[test]
    fn test_shutdown_restart_preserves_armed_watchdog() {
        let engine = new_engine();
        let id = engine.add(aspirin(Some(email_contact())), dt(3, 7, 0)).unwrap();
        fire(&engine, id);
        engine.take_dose(id).unwrap();

        let persisted = engine.shutdown().unwrap();
        assert_eq!(persisted.runtime.armed.len(), 1);

        let restarted = ReminderEngine::init(
            Config::default(),
            RecordingSink::default(),
            RecordingTransport::default(),
            LoadedState {
                medications: Some(persisted.medications),
                history: Vec::new(),
                runtime: persisted.runtime,
            },
            dt(3, 8, 1),
        )
        .unwrap();

        assert_eq!(
            restarted.get_by_id(id).unwrap().unwrap().quantity_remaining,
            29
        );
        // The restored occurrence still escalates after its grace window.
        let outcomes = restarted.sweep(dt(3, 8, 5)).unwrap();
        assert!(matches!(outcomes[0], WakeupOutcome::Escalated { .. }));
    }

    #[test]
    fn test_ack_and_expiry_race_settles_exactly_once() {
        for _ in 0..20 {
            let engine = Arc::new(new_engine());
            let id = engine.add(aspirin(Some(email_contact())), dt(3, 7, 0)).unwrap();
            let key = fire(&engine, id);

            let ack_engine = Arc::clone(&engine);
            let sweep_engine = Arc::clone(&engine);

            let acker = std::thread::spawn(move || {
                ack_engine.acknowledge(key, dt(3, 8, 3)).unwrap();
            });
            let sweeper = std::thread::spawn(move || {
                sweep_engine.sweep(dt(3, 8, 3)).unwrap();
            });
            acker.join().unwrap();
            sweeper.join().unwrap();

            let inner = engine.inner.lock().unwrap();
            let outcome = inner.ledger.get(key).unwrap().outcome;
            let remaining = inner.registry.get(id).unwrap().quantity_remaining;
            match outcome {
                AckOutcome::Acknowledged => {
                    assert!(inner.transport.emails.is_empty());
                    assert_eq!(remaining, 29);
                }
                AckOutcome::Escalated => {
                    assert_eq!(inner.transport.emails.len(), 1);
                    assert_eq!(remaining, 30);
                }
                AckOutcome::Postponed => panic!("unexpected postpone"),
            }
        }
    }

    #[test]
    fn test_edit_reschedules_medication() {
        let engine = new_engine();
        let id = engine.add(aspirin(None), dt(3, 7, 0)).unwrap();

        let update = MedicationUpdate {
            reminder_times: Some(vec![NaiveTime::from_hms_opt(9, 30, 0).unwrap()]),
            ..Default::default()
        };
        assert!(engine.edit(id, update, dt(3, 7, 0)).unwrap());

        let inner = engine.inner.lock().unwrap();
        assert_eq!(inner.sink.pending.len(), 1);
        assert_eq!(
            inner.sink.pending.values().next().unwrap().fire_at,
            dt(3, 9, 30)
        );
    }

    #[test]
    fn test_next_due_reports_unfireable_medications() {
        let engine = new_engine();
        let mut med = aspirin(None);
        med.recurrence = Recurrence::WeeklyOn(vec![]);
        let id = engine.add(med, dt(3, 7, 0)).unwrap();

        let due = engine.next_due(dt(3, 7, 0)).unwrap();
        assert_eq!(due.len(), 1);
        assert_eq!(due[0].0.id, id);
        assert_eq!(due[0].1, None);
    }
}
