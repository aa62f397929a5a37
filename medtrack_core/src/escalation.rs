//! Escalation to the emergency contact.
//!
//! Each fired reminder gets a per-occurrence watchdog: Armed until the user
//! responds, then Acknowledged, Postponed, or (after the grace window, when
//! a deliverable contact exists) Escalated. Terminal watchdogs are never
//! reused; the next occurrence gets a fresh one.

use crate::error::Result;
use crate::types::{Medication, OccurrenceKey};
use chrono::{Duration, NaiveDateTime};
use serde::{Deserialize, Serialize};

/// Lifecycle of one fired occurrence.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum EscalationState {
    /// Fired, awaiting user response.
    Armed,
    Acknowledged,
    Postponed,
    Escalated,
}

impl EscalationState {
    pub fn is_terminal(self) -> bool {
        !matches!(self, EscalationState::Armed)
    }
}

/// Watchdog entry for a fired occurrence.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq)]
pub struct ArmedOccurrence {
    pub key: OccurrenceKey,
    pub fired_at: NaiveDateTime,
    pub state: EscalationState,
}

impl ArmedOccurrence {
    pub fn new(key: OccurrenceKey, fired_at: NaiveDateTime) -> Self {
        Self {
            key,
            fired_at,
            state: EscalationState::Armed,
        }
    }

    /// Whether the grace window has fully elapsed without a response.
    pub fn grace_elapsed(&self, grace: Duration, now: NaiveDateTime) -> bool {
        self.state == EscalationState::Armed && now - self.fired_at >= grace
    }
}

/// Outbound messaging collaborator. Each channel is independently fallible
/// and fire-and-forget from the engine's perspective.
pub trait MessageTransport {
    fn send_email(&mut self, address: &str, subject: &str, body: &str) -> Result<()>;
    fn send_sms(&mut self, phone_number: &str, body: &str) -> Result<()>;
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum Channel {
    Email,
    Sms,
}

/// One delivery attempt on one channel.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct ChannelAttempt {
    pub channel: Channel,
    pub destination: String,
    pub delivered: bool,
}

/// What happened when an occurrence escalated.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct EscalationReport {
    pub key: OccurrenceKey,
    pub contact_name: String,
    pub attempts: Vec<ChannelAttempt>,
}

const EMAIL_SUBJECT: &str = "Medication reminder alert";

/// Dispatch the emergency message on every configured channel.
///
/// Returns `None` when the medication has no contact with a deliverable
/// channel; the occurrence then simply lapses unacknowledged. A failure on
/// one channel is logged and never blocks the other.
pub fn dispatch(
    transport: &mut dyn MessageTransport,
    medication: &Medication,
    key: OccurrenceKey,
    user_name: &str,
) -> Option<EscalationReport> {
    let contact = medication.emergency_contact.as_ref()?;
    if !contact.has_deliverable_channel() {
        tracing::debug!(
            medication = %medication.name,
            contact = %contact.name,
            "contact has no deliverable channel, occurrence lapses"
        );
        return None;
    }

    let body = format!(
        "Alert: {} has not taken medication {} at the scheduled time.",
        user_name, medication.name
    );

    let mut attempts = Vec::new();

    if let Some(address) = filled(&contact.email) {
        let delivered = match transport.send_email(address, EMAIL_SUBJECT, &body) {
            Ok(()) => true,
            Err(err) => {
                tracing::warn!(%address, %err, "emergency email failed");
                false
            }
        };
        attempts.push(ChannelAttempt {
            channel: Channel::Email,
            destination: address.to_string(),
            delivered,
        });
    }

    if let Some(number) = filled(&contact.phone) {
        let delivered = match transport.send_sms(number, &body) {
            Ok(()) => true,
            Err(err) => {
                tracing::warn!(%number, %err, "emergency SMS failed");
                false
            }
        };
        attempts.push(ChannelAttempt {
            channel: Channel::Sms,
            destination: number.to_string(),
            delivered,
        });
    }

    tracing::info!(
        medication = %medication.name,
        contact = %contact.name,
        channels = attempts.len(),
        "emergency contact notified"
    );

    Some(EscalationReport {
        key,
        contact_name: contact.name.clone(),
        attempts,
    })
}

fn filled(field: &Option<String>) -> Option<&str> {
    field.as_deref().map(str::trim).filter(|value| !value.is_empty())
}
