use std::env;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration as StdDuration;

use chrono::Duration;
use thiserror::Error;

use crate::engine::EngineSettings;
use crate::policy::{BookingPolicy, PolicyError, WallClock};

pub const WAL_FILE_NAME: &str = "roombook.wal";

/// Daemon settings read from `ROOMBOOK_*` environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    pub data_dir: PathBuf,
    pub metrics_port: Option<u16>,
    pub sweep_interval: StdDuration,
    pub compact_threshold: u64,
    pub compact_interval: StdDuration,
    pub no_show_grace: Duration,
    pub reminder_lead: Duration,
    /// Hours of the system default policy, used by rooms with neither an own
    /// nor a category policy.
    pub default_opening: WallClock,
    pub default_closing: WallClock,
}

impl Default for Config {
    fn default() -> Self {
        let policy = BookingPolicy::default();
        Self {
            data_dir: PathBuf::from("./data"),
            metrics_port: None,
            sweep_interval: StdDuration::from_secs(60),
            compact_threshold: 1000,
            compact_interval: StdDuration::from_secs(30),
            no_show_grace: Duration::minutes(15),
            reminder_lead: Duration::hours(24),
            default_opening: policy.opening_time,
            default_closing: policy.closing_time,
        }
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("{key}: cannot parse '{value}'")]
    Malformed { key: &'static str, value: String },
    #[error("invalid default policy: {0}")]
    Policy(#[from] PolicyError),
}

fn parsed<T: FromStr>(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &'static str,
) -> Result<Option<T>, ConfigError> {
    match lookup(key) {
        None => Ok(None),
        Some(value) => value
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| ConfigError::Malformed { key, value }),
    }
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Same as `from_env` with an injectable variable source.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let d = Config::default();
        let config = Self {
            data_dir: lookup("ROOMBOOK_DATA_DIR").map_or(d.data_dir, PathBuf::from),
            metrics_port: parsed(&lookup, "ROOMBOOK_METRICS_PORT")?,
            sweep_interval: parsed(&lookup, "ROOMBOOK_SWEEP_INTERVAL_SECS")?
                .map_or(d.sweep_interval, StdDuration::from_secs),
            compact_threshold: parsed(&lookup, "ROOMBOOK_COMPACT_THRESHOLD")?.unwrap_or(d.compact_threshold),
            compact_interval: parsed(&lookup, "ROOMBOOK_COMPACT_INTERVAL_SECS")?
                .map_or(d.compact_interval, StdDuration::from_secs),
            no_show_grace: parsed(&lookup, "ROOMBOOK_NO_SHOW_GRACE_MINUTES")?
                .map_or(d.no_show_grace, |m: u32| Duration::minutes(i64::from(m))),
            reminder_lead: parsed(&lookup, "ROOMBOOK_REMINDER_LEAD_HOURS")?
                .map_or(d.reminder_lead, |h: u32| Duration::hours(i64::from(h))),
            default_opening: parsed(&lookup, "ROOMBOOK_DEFAULT_OPENING")?.unwrap_or(d.default_opening),
            default_closing: parsed(&lookup, "ROOMBOOK_DEFAULT_CLOSING")?.unwrap_or(d.default_closing),
        };
        config.engine_settings()?;
        Ok(config)
    }

    pub fn wal_path(&self) -> PathBuf {
        self.data_dir.join(WAL_FILE_NAME)
    }

    pub fn engine_settings(&self) -> Result<EngineSettings, ConfigError> {
        let system_policy = BookingPolicy {
            opening_time: self.default_opening,
            closing_time: self.default_closing,
            ..BookingPolicy::default()
        };
        system_policy.validate()?;
        Ok(EngineSettings {
            system_policy,
            no_show_grace: self.no_show_grace,
        })
    }
}
