//! Runtime configuration.

use std::fs;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{Result, TimerError};

/// Env var overriding the task database path.
pub const DB_ENV: &str = "TASKTIMER_DB";
/// Env var overriding the config file path.
pub const CONFIG_ENV: &str = "TASKTIMER_CONFIG";

/// Settings for the engine, its collaborators and the command line.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Task database file. `None` uses the platform data directory.
    pub db_path: Option<PathBuf>,
    /// Gap the scheduler keeps between planned tasks, in seconds.
    pub pause_secs: i64,
    /// Days finished instances are kept before they are deleted.
    pub retention_days: i64,
    /// How far back missed recurring instances are materialized on load.
    pub backfill_days: u32,
    /// Shifts the second boundary ticks align to, in milliseconds.
    pub tick_offset_ms: i64,
    /// Seconds the notification surface skips per forward/back.
    pub seek_step_secs: i64,
    /// Extra attempts for a failed store write.
    pub persist_retries: u32,
    /// Color given to tasks created without one.
    pub default_color: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            db_path: None,
            pause_secs: 60,
            retention_days: 7,
            backfill_days: 7,
            tick_offset_ms: 0,
            seek_step_secs: 30,
            persist_retries: 3,
            default_color: "#3094F0".to_string(),
        }
    }
}

fn data_dir() -> PathBuf {
    let mut p = dirs::data_local_dir().unwrap_or_else(|| PathBuf::from("."));
    p.push("tasktimer");
    p
}

impl Config {
    /// Parses a TOML document; absent keys keep their defaults.
    pub fn from_toml_str(s: &str) -> Result<Config> {
        let config: Config = toml::from_str(s)?;
        config.validate()?;
        Ok(config)
    }

    /// Loads `config.toml` from `TASKTIMER_CONFIG` or the data directory.
    /// A missing file yields the defaults.
    pub fn load() -> Result<Config> {
        let path = std::env::var(CONFIG_ENV)
            .map(PathBuf::from)
            .unwrap_or_else(|_| data_dir().join("config.toml"));
        if !path.exists() {
            debug!("no config at {}, using defaults", path.display());
            return Ok(Config::default());
        }
        let s = fs::read_to_string(&path)?;
        Config::from_toml_str(&s)
    }

    /// Returns the path to the tasks database file.
    ///
    /// The path is determined in the following order:
    /// 1. `TASKTIMER_DB` environment variable.
    /// 2. `db_path` from the config file.
    /// 3. `~/.local/share/tasktimer/tasks.json` (on Linux).
    /// 4. `./tasktimer/tasks.json` (fallback when no data directory exists).
    pub fn db_path(&self) -> PathBuf {
        if let Ok(p) = std::env::var(DB_ENV) {
            return PathBuf::from(p);
        }
        if let Some(p) = &self.db_path {
            return p.clone();
        }
        data_dir().join("tasks.json")
    }

    fn validate(&self) -> Result<()> {
        if self.pause_secs < 0 {
            return Err(TimerError::Config("pause_secs must not be negative".into()));
        }
        if self.retention_days < 0 {
            return Err(TimerError::Config("retention_days must not be negative".into()));
        }
        if self.seek_step_secs <= 0 {
            return Err(TimerError::Config("seek_step_secs must be positive".into()));
        }
        Ok(())
    }
}
