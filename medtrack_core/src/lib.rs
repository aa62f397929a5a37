#![forbid(unsafe_code)]

//! Core domain model and business logic for the Medtrack reminder system.
//!
//! This crate provides:
//! - Domain types (medications, recurrence, occurrences, acknowledgments)
//! - Occurrence calculation
//! - Medication registry and acknowledgment ledger
//! - Scheduling driver and escalation
//! - Persistence (state file, WAL, CSV)

pub mod types;
pub mod error;
pub mod config;
pub mod logging;
pub mod occurrence;
pub mod registry;
pub mod ledger;
pub mod schedule;
pub mod escalation;
pub mod engine;
pub mod store;
pub mod wal;
pub mod csv_rollup;
pub mod history;

// Re-export commonly used types
pub use error::{Error, Result, ValidationError};
pub use types::*;
pub use config::Config;
pub use occurrence::{next_for_medication, next_occurrence};
pub use registry::Registry;
pub use ledger::Ledger;
pub use schedule::{NotificationSink, ScheduledWakeup, WakeupId, WakeupPayload};
pub use escalation::{EscalationReport, MessageTransport};
pub use engine::{LoadedState, ReminderEngine, RuntimeState, WakeupOutcome};
pub use store::{JsonFileStore, PersistenceStore, StoredMedications};
pub use wal::{AckSink, JsonlSink};
pub use history::load_recent_records;
