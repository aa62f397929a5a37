//! Configuration file support for Medtrack.
//!
//! Configuration is loaded from `$XDG_CONFIG_HOME/medtrack/config.toml`.

use crate::{Error, Result};
use chrono::Duration;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Application configuration
#[derive(Clone, Debug, Serialize, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub data: DataConfig,

    #[serde(default)]
    pub reminders: ReminderConfig,

    #[serde(default)]
    pub user: UserConfig,
}

/// Data storage configuration
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct DataConfig {
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,
}

impl Default for DataConfig {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
        }
    }
}

/// Reminder timing parameters.
///
/// There is one authoritative grace window; the background sweep and the
/// interactive path share it.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ReminderConfig {
    /// Minutes after a reminder fires before escalation.
    #[serde(default = "default_grace_minutes")]
    pub grace_minutes: u32,

    /// Minutes a postponed reminder is pushed into the future.
    #[serde(default = "default_postpone_minutes")]
    pub postpone_minutes: u32,

    /// Bounded interval for the fallback escalation sweep.
    #[serde(default = "default_sweep_interval_minutes")]
    pub sweep_interval_minutes: u32,
}

impl Default for ReminderConfig {
    fn default() -> Self {
        Self {
            grace_minutes: default_grace_minutes(),
            postpone_minutes: default_postpone_minutes(),
            sweep_interval_minutes: default_sweep_interval_minutes(),
        }
    }
}

impl ReminderConfig {
    pub fn grace(&self) -> Duration {
        Duration::minutes(i64::from(self.grace_minutes))
    }

    pub fn postpone(&self) -> Duration {
        Duration::minutes(i64::from(self.postpone_minutes))
    }
}

/// User identity used in escalation messages.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct UserConfig {
    #[serde(default = "default_display_name")]
    pub display_name: String,
}

impl Default for UserConfig {
    fn default() -> Self {
        Self {
            display_name: default_display_name(),
        }
    }
}

// Default value functions
fn default_data_dir() -> PathBuf {
    let base = dirs::data_local_dir().unwrap_or_else(|| {
        let home = std::env::var("HOME").expect("HOME environment variable not set");
        PathBuf::from(home).join(".local/share")
    });
    base.join("medtrack")
}

fn default_grace_minutes() -> u32 {
    2
}

fn default_postpone_minutes() -> u32 {
    10
}

fn default_sweep_interval_minutes() -> u32 {
    5
}

fn default_display_name() -> String {
    "the user".into()
}

impl Config {
    /// Load configuration from the standard config path
    pub fn load() -> Result<Self> {
        let config_path = Self::default_config_path();
        if config_path.exists() {
            Self::load_from(&config_path)
        } else {
            tracing::info!("No config file found at {:?}, using defaults", config_path);
            Ok(Self::default())
        }
    }

    /// Load configuration from a specific path
    pub fn load_from(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&contents)?;
        config.validate()?;
        tracing::info!("Loaded config from {:?}", path);
        Ok(config)
    }

    /// Get the default config file path
    pub fn default_config_path() -> PathBuf {
        let base = dirs::config_dir().unwrap_or_else(|| {
            let home = std::env::var("HOME").expect("HOME environment variable not set");
            PathBuf::from(home).join(".config")
        });
        base.join("medtrack").join("config.toml")
    }

    /// Save the current configuration to the default path
    pub fn save(&self) -> Result<()> {
        let config_path = Self::default_config_path();
        self.save_to(&config_path)
    }

    /// Save the current configuration to a specific path
    pub fn save_to(&self, path: &Path) -> Result<()> {
        // Ensure parent directory exists
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let contents = toml::to_string_pretty(self)
            .map_err(|e| Error::Config(format!("Failed to serialize config: {}", e)))?;
        std::fs::write(path, contents)?;
        tracing::info!("Saved config to {:?}", path);
        Ok(())
    }

    fn validate(&self) -> Result<()> {
        if self.reminders.grace_minutes == 0 {
            return Err(Error::Config("grace_minutes must be at least 1".into()));
        }
        if self.reminders.postpone_minutes == 0 {
            return Err(Error::Config("postpone_minutes must be at least 1".into()));
        }
        Ok(())
    }
}
