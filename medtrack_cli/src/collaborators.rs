//! File-backed collaborators for the CLI.
//!
//! The engine talks to a notification sink and a message transport; on the
//! command line those are plain files under the data directory. A desktop
//! or mobile shell would substitute the platform's alarm and messaging
//! facilities behind the same traits.

use chrono::NaiveDateTime;
use fs2::FileExt;
use medtrack_core::engine::RuntimeState;
use medtrack_core::escalation::MessageTransport;
use medtrack_core::schedule::{NotificationSink, ScheduledWakeup, WakeupId};
use medtrack_core::{Error, Result};
use serde::Serialize;
use std::collections::BTreeMap;
use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};

/// Notification sink that keeps the pending wake-up set in a JSON file.
///
/// Every mutation writes through to disk, so the set survives between CLI
/// invocations and a crash can lose at most the call in flight.
pub struct FileSink {
    path: PathBuf,
    pending: BTreeMap<WakeupId, ScheduledWakeup>,
}

impl FileSink {
    /// Load the pending set from disk. A missing or corrupted file yields
    /// an empty set with a warning.
    pub fn load(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let pending = match std::fs::read_to_string(&path) {
            Ok(contents) => match serde_json::from_str(&contents) {
                Ok(pending) => pending,
                Err(e) => {
                    tracing::warn!("Failed to parse wake-up file {:?}: {}", path, e);
                    BTreeMap::new()
                }
            },
            Err(_) => BTreeMap::new(),
        };
        Self { path, pending }
    }

    /// Remove and return every wake-up due at or before `now`, ordered by
    /// fire time.
    pub fn drain_due(&mut self, now: NaiveDateTime) -> Result<Vec<ScheduledWakeup>> {
        let due_ids: Vec<WakeupId> = self
            .pending
            .iter()
            .filter(|(_, wakeup)| wakeup.fire_at <= now)
            .map(|(id, _)| id.clone())
            .collect();

        let mut due: Vec<ScheduledWakeup> = due_ids
            .iter()
            .filter_map(|id| self.pending.remove(id))
            .collect();
        due.sort_by_key(|wakeup| wakeup.fire_at);

        if !due.is_empty() {
            self.persist()?;
        }
        Ok(due)
    }

    fn persist(&self) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let contents = serde_json::to_string_pretty(&self.pending)?;
        std::fs::write(&self.path, contents)?;
        Ok(())
    }
}

impl NotificationSink for FileSink {
    fn submit(&mut self, wakeup: ScheduledWakeup) -> Result<()> {
        self.pending.insert(wakeup.id.clone(), wakeup);
        self.persist()
    }

    fn cancel(&mut self, id: &WakeupId) -> Result<()> {
        if self.pending.remove(id).is_some() {
            self.persist()?;
        }
        Ok(())
    }

    fn cancel_all(&mut self) -> Result<()> {
        if !self.pending.is_empty() {
            self.pending.clear();
            self.persist()?;
        }
        Ok(())
    }
}

/// One recorded outbound message.
#[derive(Serialize)]
struct OutboxEntry<'a> {
    channel: &'a str,
    to: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    subject: Option<&'a str>,
    body: &'a str,
}

/// Message transport that appends every send to a JSONL outbox file, for a
/// relay process (or a human) to pick up.
pub struct OutboxTransport {
    path: PathBuf,
}

impl OutboxTransport {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    fn append(&self, entry: &OutboxEntry<'_>) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?;
        file.lock_exclusive()?;

        let mut writer = std::io::BufWriter::new(&file);
        let line = serde_json::to_string(entry)?;
        writer.write_all(line.as_bytes())?;
        writer.write_all(b"\n")?;
        writer.flush()?;

        file.unlock()?;
        Ok(())
    }
}

impl MessageTransport for OutboxTransport {
    fn send_email(&mut self, address: &str, subject: &str, body: &str) -> Result<()> {
        self.append(&OutboxEntry {
            channel: "email",
            to: address,
            subject: Some(subject),
            body,
        })
    }

    fn send_sms(&mut self, phone_number: &str, body: &str) -> Result<()> {
        self.append(&OutboxEntry {
            channel: "sms",
            to: phone_number,
            subject: None,
            body,
        })
    }
}

/// Load the runtime sidecar (armed occurrences and pending postponements).
/// Missing or corrupted files yield the empty default.
pub fn load_runtime(path: &Path) -> RuntimeState {
    match std::fs::read_to_string(path) {
        Ok(contents) => match serde_json::from_str(&contents) {
            Ok(state) => state,
            Err(e) => {
                tracing::warn!("Failed to parse runtime file {:?}: {}", path, e);
                RuntimeState::default()
            }
        },
        Err(_) => RuntimeState::default(),
    }
}

pub fn save_runtime(path: &Path, state: &RuntimeState) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let contents = serde_json::to_string_pretty(state)?;
    std::fs::write(path, contents).map_err(Error::Io)
}
