use chrono::{NaiveDateTime, NaiveTime, Weekday};
use clap::{Parser, Subcommand};
use medtrack_core::engine::{AckResponse, LoadedState, PersistedState, WakeupOutcome};
use medtrack_core::escalation::EscalationReport;
use medtrack_core::wal::AckSink;
use medtrack_core::*;
use std::path::PathBuf;
use uuid::Uuid;

mod collaborators;

use collaborators::{FileSink, OutboxTransport};

/// Days of acknowledgment history loaded to seed the ledger.
const HISTORY_DAYS: i64 = 30;

#[derive(Parser)]
#[command(name = "medtrack")]
#[command(about = "Medication reminder scheduling and escalation", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Override data directory
    #[arg(long, global = true)]
    data_dir: Option<PathBuf>,

    /// Override the current time (YYYY-MM-DDTHH:MM), for scripting and tests
    #[arg(long, global = true)]
    now: Option<String>,
}

#[derive(Subcommand)]
enum Commands {
    /// Register a medication
    Add {
        name: String,

        #[arg(long, default_value = "")]
        description: String,

        /// pill, capsule, syrup, injection, inhaler, drops, cream, other
        #[arg(long, default_value = "pill")]
        kind: String,

        /// Initial stock (countable kinds only)
        #[arg(long, default_value_t = 30)]
        quantity: u32,

        /// Units consumed per dose
        #[arg(long)]
        dose: Option<u32>,

        /// Reminder time of day (HH:MM), repeatable
        #[arg(long = "time", required = true)]
        times: Vec<String>,

        /// Restrict to weekdays, e.g. "mon,wed,fri" (default: daily)
        #[arg(long)]
        days: Option<String>,

        #[arg(long)]
        contact_name: Option<String>,

        #[arg(long)]
        contact_phone: Option<String>,

        #[arg(long)]
        contact_email: Option<String>,

        #[arg(long)]
        contact_telegram: Option<String>,

        #[arg(long)]
        contact_whatsapp: Option<String>,
    },

    /// List medications with their next reminder
    List,

    /// Show one medication in detail
    Show { medication: String },

    /// Edit a medication (unset flags are left unchanged)
    Edit {
        medication: String,

        #[arg(long)]
        name: Option<String>,

        #[arg(long)]
        description: Option<String>,

        #[arg(long)]
        kind: Option<String>,

        /// Refill: resets both remaining and initial stock
        #[arg(long)]
        quantity: Option<u32>,

        #[arg(long)]
        dose: Option<u32>,

        #[arg(long = "time")]
        times: Vec<String>,

        #[arg(long, conflicts_with = "daily")]
        days: Option<String>,

        /// Switch back to a daily recurrence
        #[arg(long)]
        daily: bool,

        #[arg(long, conflicts_with = "contact_name")]
        clear_contact: bool,

        #[arg(long)]
        contact_name: Option<String>,

        #[arg(long)]
        contact_phone: Option<String>,

        #[arg(long)]
        contact_email: Option<String>,

        #[arg(long)]
        contact_telegram: Option<String>,

        #[arg(long)]
        contact_whatsapp: Option<String>,
    },

    /// Remove a medication and cancel its pending reminders
    Remove { medication: String },

    /// Consume one dose without going through a reminder
    Take { medication: String },

    /// Show the next computed occurrence per medication
    Due,

    /// Deliver due wake-ups and run the escalation sweep
    Fire,

    /// Acknowledge a fired reminder (takes the dose)
    Ack {
        medication: String,

        /// Occurrence slot (YYYY-MM-DDTHH:MM); defaults to the earliest
        /// fired, unanswered occurrence
        #[arg(long)]
        slot: Option<String>,
    },

    /// Postpone a fired reminder
    Postpone {
        medication: String,

        #[arg(long)]
        slot: Option<String>,
    },

    /// Escalate reminders whose grace window elapsed
    Sweep,

    /// Show recent acknowledgment history
    History {
        #[arg(long, default_value_t = 7)]
        days: i64,
    },

    /// Roll up WAL acknowledgments to CSV
    Rollup {
        /// Clean up processed WAL files after rollup
        #[arg(long)]
        cleanup: bool,
    },
}

struct Paths {
    state: PathBuf,
    wal: PathBuf,
    wal_dir: PathBuf,
    csv: PathBuf,
    runtime: PathBuf,
    wakeups: PathBuf,
    outbox: PathBuf,
}

impl Paths {
    fn under(data_dir: &PathBuf) -> Self {
        let wal_dir = data_dir.join("wal");
        Self {
            state: data_dir.join("medications.json"),
            wal: wal_dir.join("acknowledgments.wal"),
            wal_dir,
            csv: data_dir.join("acknowledgments.csv"),
            runtime: data_dir.join("runtime.json"),
            wakeups: data_dir.join("wakeups.json"),
            outbox: data_dir.join("outbox.jsonl"),
        }
    }
}

type Engine = ReminderEngine<FileSink, OutboxTransport>;

fn main() -> Result<()> {
    medtrack_core::logging::init();

    let cli = Cli::parse();

    let config = Config::load()?;
    let data_dir = cli.data_dir.unwrap_or_else(|| config.data.data_dir.clone());
    std::fs::create_dir_all(&data_dir)?;
    let paths = Paths::under(&data_dir);

    let now = match cli.now {
        Some(ref raw) => parse_datetime(raw)?,
        None => chrono::Local::now().naive_local(),
    };

    match cli.command {
        Commands::Add {
            name,
            description,
            kind,
            quantity,
            dose,
            times,
            days,
            contact_name,
            contact_phone,
            contact_email,
            contact_telegram,
            contact_whatsapp,
        } => {
            let mut medication =
                Medication::new(name, description, parse_kind(&kind)?, quantity);
            if let Some(dose) = dose {
                medication.dose_per_time = dose;
            }
            medication.reminder_times = parse_times(&times)?;
            if let Some(ref days) = days {
                medication.recurrence = Recurrence::WeeklyOn(parse_days(days)?);
            }
            if let Some(contact_name) = contact_name {
                let mut contact = EmergencyContact::new(contact_name);
                contact.phone = contact_phone;
                contact.email = contact_email;
                contact.telegram_id = contact_telegram;
                contact.whatsapp = contact_whatsapp;
                medication.emergency_contact = Some(contact);
            }

            let engine = open_engine(&paths, &config, now)?;
            let id = engine.add(medication, now)?;
            persist(&engine, &paths)?;

            println!("✓ Medication registered");
            println!("  Id: {}", id);
            Ok(())
        }

        Commands::List => {
            let engine = open_engine(&paths, &config, now)?;
            let due = engine.next_due(now)?;
            if due.is_empty() {
                println!("No medications registered.");
                return Ok(());
            }
            for (medication, next) in due {
                let next = match next {
                    Some(at) => at.format("%Y-%m-%d %H:%M").to_string(),
                    None => "never (no valid schedule)".into(),
                };
                println!("{}  {}", medication.id, medication.name);
                println!("        next: {}{}", next, stock_note(&medication));
            }
            Ok(())
        }

        Commands::Show { medication } => {
            let engine = open_engine(&paths, &config, now)?;
            let medication = resolve(&engine, &medication)?;
            display_medication(&engine, &medication, now)?;
            Ok(())
        }

        Commands::Edit {
            medication,
            name,
            description,
            kind,
            quantity,
            dose,
            times,
            days,
            daily,
            clear_contact,
            contact_name,
            contact_phone,
            contact_email,
            contact_telegram,
            contact_whatsapp,
        } => {
            let engine = open_engine(&paths, &config, now)?;
            let target = resolve(&engine, &medication)?;

            let recurrence = if daily {
                Some(Recurrence::Daily)
            } else {
                days.as_deref()
                    .map(parse_days)
                    .transpose()?
                    .map(Recurrence::WeeklyOn)
            };

            let emergency_contact = if clear_contact {
                Some(None)
            } else if let Some(contact_name) = contact_name {
                let mut contact = EmergencyContact::new(contact_name);
                contact.phone = contact_phone;
                contact.email = contact_email;
                contact.telegram_id = contact_telegram;
                contact.whatsapp = contact_whatsapp;
                Some(Some(contact))
            } else {
                None
            };

            let update = MedicationUpdate {
                name,
                description,
                kind: kind.as_deref().map(parse_kind).transpose()?,
                quantity,
                dose_per_time: dose,
                recurrence,
                reminder_times: if times.is_empty() {
                    None
                } else {
                    Some(parse_times(&times)?)
                },
                emergency_contact,
            };

            engine.edit(target.id, update, now)?;
            persist(&engine, &paths)?;
            println!("✓ Medication updated");
            Ok(())
        }

        Commands::Remove { medication } => {
            let engine = open_engine(&paths, &config, now)?;
            let target = resolve(&engine, &medication)?;
            engine.remove(target.id)?;
            persist(&engine, &paths)?;
            println!("✓ Removed {}", target.name);
            Ok(())
        }

        Commands::Take { medication } => {
            let engine = open_engine(&paths, &config, now)?;
            let target = resolve(&engine, &medication)?;
            let outcome = engine
                .take_dose(target.id)?
                .ok_or_else(|| Error::Other("medication disappeared".into()))?;
            persist(&engine, &paths)?;
            print_dose(&target.name, outcome);
            Ok(())
        }

        Commands::Due => {
            let engine = open_engine(&paths, &config, now)?;
            for (medication, next) in engine.next_due(now)? {
                match next {
                    Some(at) => println!("{}  {}", at.format("%Y-%m-%d %H:%M"), medication.name),
                    None => println!("never             {}", medication.name),
                }
            }
            Ok(())
        }

        Commands::Fire => cmd_fire(&paths, &config, now),

        Commands::Ack { medication, slot } => {
            let engine = open_engine(&paths, &config, now)?;
            let target = resolve(&engine, &medication)?;
            let key = pick_key(&engine, &target, slot.as_deref())?;

            let AckResponse { record, dose } = engine.acknowledge(key, now)?;
            match record {
                Some(record) => {
                    JsonlSink::new(&paths.wal).append(&record)?;
                    println!("✓ {} acknowledged", target.name);
                    if let Some(dose) = dose {
                        print_dose(&target.name, dose);
                    }
                }
                None => println!("Already settled: {}", key),
            }
            persist(&engine, &paths)?;
            Ok(())
        }

        Commands::Postpone { medication, slot } => {
            let engine = open_engine(&paths, &config, now)?;
            let target = resolve(&engine, &medication)?;
            let key = pick_key(&engine, &target, slot.as_deref())?;

            match engine.postpone(key, now)? {
                Some(response) => {
                    JsonlSink::new(&paths.wal).append(&response.record)?;
                    println!(
                        "✓ {} postponed to {}",
                        target.name,
                        response.rescheduled_for.format("%H:%M")
                    );
                }
                None => println!("Already settled: {}", key),
            }
            persist(&engine, &paths)?;
            Ok(())
        }

        Commands::Sweep => {
            let engine = open_engine(&paths, &config, now)?;
            let outcomes = engine.sweep(now)?;
            report_outcomes(&outcomes, &paths)?;
            if outcomes.is_empty() {
                println!("Nothing to escalate.");
            }
            persist(&engine, &paths)?;
            Ok(())
        }

        Commands::History { days } => {
            let records = load_recent_records(&paths.wal, &paths.csv, days, now)?;
            if records.is_empty() {
                println!("No acknowledgments in the last {} days.", days);
                return Ok(());
            }
            for record in records {
                println!(
                    "{}  {:?}  {}",
                    record.recorded_at.format("%Y-%m-%d %H:%M"),
                    record.outcome,
                    record.key
                );
            }
            Ok(())
        }

        Commands::Rollup { cleanup } => cmd_rollup(&paths, cleanup),
    }
}

fn open_engine(paths: &Paths, config: &Config, now: NaiveDateTime) -> Result<Engine> {
    let store = JsonFileStore::new(&paths.state);
    let medications = store.load()?;
    let history = load_recent_records(&paths.wal, &paths.csv, HISTORY_DAYS, now)?;
    let runtime = collaborators::load_runtime(&paths.runtime);
    let sink = FileSink::load(&paths.wakeups);
    let transport = OutboxTransport::new(&paths.outbox);

    ReminderEngine::init(
        config.clone(),
        sink,
        transport,
        LoadedState {
            medications,
            history,
            runtime,
        },
        now,
    )
}

fn persist(engine: &Engine, paths: &Paths) -> Result<()> {
    let PersistedState {
        medications,
        runtime,
    } = engine.shutdown()?;
    JsonFileStore::new(&paths.state).save(&medications)?;
    collaborators::save_runtime(&paths.runtime, &runtime)
}

fn cmd_fire(paths: &Paths, config: &Config, now: NaiveDateTime) -> Result<()> {
    // Capture due wake-ups before the engine rebuilds the pending set
    let due = {
        let mut sink = FileSink::load(&paths.wakeups);
        sink.drain_due(now)?
    };

    let engine = open_engine(paths, config, now)?;
    let mut fired = 0;
    for wakeup in due {
        match engine.handle_wakeup(wakeup.payload, now)? {
            WakeupOutcome::ReminderDelivered { key, title, body } => {
                fired += 1;
                println!("{}", title);
                println!("  {}", body);
                println!("  (medtrack ack / medtrack postpone; occurrence {})", key);
            }
            outcome => report_outcomes(&[outcome], paths)?,
        }
    }

    // Watchdog wake-ups may have been lost; the sweep is the backstop
    let outcomes = engine.sweep(now)?;
    report_outcomes(&outcomes, paths)?;

    if fired == 0 && outcomes.is_empty() {
        println!("Nothing due.");
    }
    persist(&engine, paths)
}

fn cmd_rollup(paths: &Paths, cleanup: bool) -> Result<()> {
    if !paths.wal.exists() {
        println!("No WAL file found - nothing to roll up.");
        return Ok(());
    }

    let count = medtrack_core::csv_rollup::wal_to_csv_and_archive(&paths.wal, &paths.csv)?;

    println!("✓ Rolled up {} acknowledgments to CSV", count);
    println!("  CSV: {}", paths.csv.display());

    if cleanup {
        let cleaned = medtrack_core::csv_rollup::cleanup_processed_wals(&paths.wal_dir)?;
        if cleaned > 0 {
            println!("✓ Cleaned up {} processed WAL files", cleaned);
        }
    }

    Ok(())
}

/// Record and print non-reminder outcomes (escalations, lapses).
fn report_outcomes(outcomes: &[WakeupOutcome], paths: &Paths) -> Result<()> {
    let mut wal = JsonlSink::new(&paths.wal);
    for outcome in outcomes {
        match outcome {
            WakeupOutcome::Escalated { record, report } => {
                wal.append(record)?;
                print_escalation(report);
            }
            WakeupOutcome::Lapsed { key } => {
                println!("! Reminder lapsed without a contact to notify ({})", key);
            }
            WakeupOutcome::AlreadySettled { .. }
            | WakeupOutcome::UnknownMedication { .. }
            | WakeupOutcome::ReminderDelivered { .. } => {}
        }
    }
    Ok(())
}

fn print_escalation(report: &EscalationReport) {
    println!("! Escalated to {}", report.contact_name);
    for attempt in &report.attempts {
        let status = if attempt.delivered { "sent" } else { "FAILED" };
        println!("  {:?} to {}: {}", attempt.channel, attempt.destination, status);
    }
}

fn print_dose(name: &str, outcome: DoseOutcome) {
    match outcome {
        DoseOutcome::Taken { remaining } => {
            println!("✓ Dose taken - {} remaining: {}", name, remaining);
        }
        DoseOutcome::LowSupply { remaining } => {
            println!("! Supply low for {} - only {} left, refill needed", name, remaining);
        }
        DoseOutcome::NotCountable => println!("✓ Dose taken ({} is not stock-tracked)", name),
    }
}

fn display_medication(engine: &Engine, medication: &Medication, now: NaiveDateTime) -> Result<()> {
    println!("{}", medication.name);
    println!("  Id: {}", medication.id);
    if !medication.description.is_empty() {
        println!("  Description: {}", medication.description);
    }
    println!("  Kind: {:?}", medication.kind);
    if medication.kind.is_countable() {
        println!(
            "  Stock: {} of {} (dose {})",
            medication.quantity_remaining, medication.quantity_initial, medication.dose_per_time
        );
    }
    match &medication.recurrence {
        Recurrence::Daily => println!("  Schedule: daily"),
        Recurrence::WeeklyOn(days) => println!("  Schedule: weekly on {:?}", days),
    }
    let times: Vec<String> = medication
        .reminder_times
        .iter()
        .map(|t| t.format("%H:%M").to_string())
        .collect();
    println!("  Times: {}", times.join(", "));
    if let Some(ref contact) = medication.emergency_contact {
        println!("  Emergency contact: {}", contact.name);
    }
    match next_for_medication(medication, now) {
        Some(at) => println!("  Next: {}", at.format("%Y-%m-%d %H:%M")),
        None => println!("  Next: never (no valid schedule)"),
    }
    for key in engine.armed_for(medication.id)? {
        println!("  Awaiting response: {}", key.slot.format("%Y-%m-%d %H:%M"));
    }
    Ok(())
}

fn stock_note(medication: &Medication) -> String {
    if medication.kind.is_countable() && medication.quantity_remaining < medication.dose_per_time {
        "  [refill needed]".into()
    } else {
        String::new()
    }
}

/// Resolve a medication by id or by unique case-insensitive name.
fn resolve(engine: &Engine, selector: &str) -> Result<Medication> {
    if let Ok(id) = Uuid::parse_str(selector) {
        return engine
            .get_by_id(id)?
            .ok_or_else(|| Error::Other(format!("No medication with id {}", id)));
    }

    let mut matches: Vec<Medication> = engine
        .get_all()?
        .into_iter()
        .filter(|m| m.name.eq_ignore_ascii_case(selector))
        .collect();

    match matches.len() {
        0 => Err(Error::Other(format!("No medication named '{}'", selector))),
        1 => Ok(matches.remove(0)),
        n => Err(Error::Other(format!(
            "'{}' matches {} medications, use the id",
            selector, n
        ))),
    }
}

/// Resolve the occurrence to act on: an explicit slot, or the earliest
/// fired, still-unanswered occurrence.
fn pick_key(engine: &Engine, medication: &Medication, slot: Option<&str>) -> Result<OccurrenceKey> {
    if let Some(raw) = slot {
        return Ok(OccurrenceKey::new(medication.id, parse_datetime(raw)?));
    }

    engine
        .armed_for(medication.id)?
        .into_iter()
        .next()
        .ok_or_else(|| {
            Error::Other(format!(
                "No fired reminder awaiting a response for {} (pass --slot to target one)",
                medication.name
            ))
        })
}

fn parse_datetime(raw: &str) -> Result<NaiveDateTime> {
    NaiveDateTime::parse_from_str(raw, "%Y-%m-%dT%H:%M")
        .or_else(|_| NaiveDateTime::parse_from_str(raw, "%Y-%m-%dT%H:%M:%S"))
        .map_err(|_| Error::Other(format!("Invalid datetime '{}', expected YYYY-MM-DDTHH:MM", raw)))
}

fn parse_times(raw: &[String]) -> Result<Vec<NaiveTime>> {
    raw.iter()
        .map(|value| {
            NaiveTime::parse_from_str(value, "%H:%M")
                .map_err(|_| Error::Other(format!("Invalid time '{}', expected HH:MM", value)))
        })
        .collect()
}

fn parse_days(raw: &str) -> Result<Vec<Weekday>> {
    raw.split(',')
        .map(str::trim)
        .filter(|part| !part.is_empty())
        .map(|part| match part.to_lowercase().as_str() {
            "sun" | "sunday" => Ok(Weekday::Sun),
            "mon" | "monday" => Ok(Weekday::Mon),
            "tue" | "tuesday" => Ok(Weekday::Tue),
            "wed" | "wednesday" => Ok(Weekday::Wed),
            "thu" | "thursday" => Ok(Weekday::Thu),
            "fri" | "friday" => Ok(Weekday::Fri),
            "sat" | "saturday" => Ok(Weekday::Sat),
            other => Err(Error::Other(format!("Unknown weekday '{}'", other))),
        })
        .collect()
}

fn parse_kind(raw: &str) -> Result<MedicationType> {
    Ok(match raw.to_lowercase().as_str() {
        "pill" => MedicationType::Pill,
        "capsule" => MedicationType::Capsule,
        "syrup" => MedicationType::Syrup,
        "injection" => MedicationType::Injection,
        "inhaler" => MedicationType::Inhaler,
        "drops" => MedicationType::Drops,
        "cream" => MedicationType::Cream,
        "other" => MedicationType::Other,
        other => return Err(Error::Other(format!("Unknown medication kind '{}'", other))),
    })
}
