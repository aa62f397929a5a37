//! Acknowledgment ledger.
//!
//! The single authoritative record of settled occurrences. Whichever of
//! {user action, grace-window expiry} settles a key first wins; the loser
//! observes the existing entry and performs no further action.

use crate::types::{AckOutcome, AcknowledgmentRecord, OccurrenceKey};
use chrono::NaiveDateTime;
use std::collections::HashMap;

#[derive(Debug, Default)]
pub struct Ledger {
    entries: HashMap<OccurrenceKey, AcknowledgmentRecord>,
}

impl Ledger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed from durable records (the WAL). The first record seen for a key
    /// wins, matching the write-once discipline.
    pub fn from_records(records: impl IntoIterator<Item = AcknowledgmentRecord>) -> Self {
        let mut ledger = Self::new();
        for record in records {
            ledger.entries.entry(record.key).or_insert(record);
        }
        ledger
    }

    /// Settle an occurrence. Returns the new record, or `None` if the key
    /// was already settled (idempotent; the caller must not decrement
    /// quantity or escalate again).
    pub fn settle(
        &mut self,
        key: OccurrenceKey,
        outcome: AckOutcome,
        now: NaiveDateTime,
    ) -> Option<AcknowledgmentRecord> {
        if let Some(existing) = self.entries.get(&key) {
            tracing::debug!(%key, existing = ?existing.outcome, attempted = ?outcome,
                "occurrence already settled");
            return None;
        }

        let record = AcknowledgmentRecord {
            key,
            outcome,
            recorded_at: now,
        };
        self.entries.insert(key, record.clone());
        tracing::info!(%key, ?outcome, "occurrence settled");
        Some(record)
    }

    pub fn is_settled(&self, key: OccurrenceKey) -> bool {
        self.entries.contains_key(&key)
    }

    pub fn get(&self, key: OccurrenceKey) -> Option<&AcknowledgmentRecord> {
        self.entries.get(&key)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
