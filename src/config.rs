//! Application configuration loaded from a JSON file.

use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, FixedOffset, Local, Utc};
use chrono_tz::Tz;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::api::COINBASE_URL;
use crate::trading::StrategyConfig;

/// Errors from loading or validating the configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("config file {path} is not valid")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("invalid config: {0}")]
    Invalid(String),
}

/// Top-level configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase", deny_unknown_fields)]
pub struct AppConfig {
    pub strategy: StrategyConfig,
    pub schedule: ScheduleConfig,
    pub exchange: ExchangeConfig,

    /// Path of the persisted position file
    pub state_file: PathBuf,

    /// Default log filter when neither `RUST_LOG` nor `--log-level` is given
    pub log_level: String,

    /// Zone used when showing timestamps to the operator
    pub time_zone: DisplayZone,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            strategy: StrategyConfig::default(),
            schedule: ScheduleConfig::default(),
            exchange: ExchangeConfig::default(),
            state_file: PathBuf::from("currentAssets.json"),
            log_level: "info".to_string(),
            time_zone: DisplayZone::Utc,
        }
    }
}

/// Timing of the two periodic jobs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase", deny_unknown_fields)]
pub struct ScheduleConfig {
    /// Period of the new-purchase candidate scan
    pub candidate_interval_secs: u64,

    /// Period of the held-position evaluation
    pub held_position_interval_secs: u64,

    /// Delay of the held-position job relative to the candidate job
    pub stagger_secs: u64,

    /// How long shutdown waits for in-flight jobs before aborting them
    pub shutdown_grace_secs: u64,
}

impl Default for ScheduleConfig {
    fn default() -> Self {
        Self {
            candidate_interval_secs: 60,
            held_position_interval_secs: 60,
            stagger_secs: 30,
            shutdown_grace_secs: 30,
        }
    }
}

impl ScheduleConfig {
    pub fn candidate_interval(&self) -> Duration {
        Duration::from_secs(self.candidate_interval_secs)
    }

    pub fn held_position_interval(&self) -> Duration {
        Duration::from_secs(self.held_position_interval_secs)
    }

    pub fn stagger(&self) -> Duration {
        Duration::from_secs(self.stagger_secs)
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_secs(self.shutdown_grace_secs)
    }
}

/// Exchange connection settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase", deny_unknown_fields)]
pub struct ExchangeConfig {
    pub base_url: String,

    /// Simulate fills instead of placing real orders
    pub dry_run: bool,

    /// Starting quote balance of the simulated account
    pub paper_cash: Decimal,
}

impl Default for ExchangeConfig {
    fn default() -> Self {
        Self {
            base_url: COINBASE_URL.to_string(),
            dry_run: true,
            paper_cash: dec!(1000),
        }
    }
}

impl AppConfig {
    /// Read, parse and validate a config file.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let config: AppConfig = serde_json::from_str(&text).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Position file for the given mode. Dry runs keep their simulated positions apart,
    /// e.g. `currentAssets.json` becomes `currentAssets.paper.json`.
    pub fn state_path(&self, dry_run: bool) -> PathBuf {
        if !dry_run {
            return self.state_file.clone();
        }
        let stem = self
            .state_file
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_default();
        let name = match self.state_file.extension() {
            Some(ext) => format!("{}.paper.{}", stem, ext.to_string_lossy()),
            None => format!("{}.paper", stem),
        };
        self.state_file.with_file_name(name)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.strategy.validate()?;

        for (name, secs) in [
            ("candidateIntervalSecs", self.schedule.candidate_interval_secs),
            ("heldPositionIntervalSecs", self.schedule.held_position_interval_secs),
        ] {
            if secs == 0 {
                return Err(ConfigError::Invalid(format!(
                    "schedule.{} must be at least 1",
                    name
                )));
            }
        }

        if self.exchange.base_url.trim().is_empty() {
            return Err(ConfigError::Invalid("exchange.baseUrl must not be empty".into()));
        }
        if self.exchange.paper_cash < Decimal::ZERO {
            return Err(ConfigError::Invalid("exchange.paperCash must be non-negative".into()));
        }
        if self.state_file.as_os_str().is_empty() {
            return Err(ConfigError::Invalid("stateFile must not be empty".into()));
        }

        Ok(())
    }
}

/// Time zone for operator-facing timestamps.
///
/// Accepts an IANA name such as `Europe/Berlin`, `UTC`, `local` for the host zone, or a
/// fixed offset such as `+01:00`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum DisplayZone {
    Utc,
    Local,
    Fixed(FixedOffset),
    Named(Tz),
}

impl DisplayZone {
    /// Format `at` in this zone with a chrono format string.
    pub fn format(&self, at: DateTime<Utc>, fmt: &str) -> String {
        match self {
            DisplayZone::Utc => at.format(fmt).to_string(),
            DisplayZone::Local => at.with_timezone(&Local).format(fmt).to_string(),
            DisplayZone::Fixed(offset) => at.with_timezone(offset).format(fmt).to_string(),
            DisplayZone::Named(tz) => at.with_timezone(tz).format(fmt).to_string(),
        }
    }
}

impl FromStr for DisplayZone {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let trimmed = s.trim();
        if trimmed.eq_ignore_ascii_case("utc") || trimmed == "Z" {
            return Ok(DisplayZone::Utc);
        }
        if trimmed.eq_ignore_ascii_case("local") {
            return Ok(DisplayZone::Local);
        }
        if let Ok(offset) = FixedOffset::from_str(trimmed) {
            return Ok(DisplayZone::Fixed(offset));
        }
        trimmed.parse::<Tz>().map(DisplayZone::Named).map_err(|_| {
            ConfigError::Invalid(format!(
                "timeZone {:?} must be a zone name like Europe/Berlin, UTC, local, or an offset like +01:00",
                s
            ))
        })
    }
}

impl TryFrom<String> for DisplayZone {
    type Error = ConfigError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<DisplayZone> for String {
    fn from(zone: DisplayZone) -> Self {
        zone.to_string()
    }
}

impl fmt::Display for DisplayZone {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DisplayZone::Utc => f.write_str("UTC"),
            DisplayZone::Local => f.write_str("local"),
            DisplayZone::Fixed(offset) => write!(f, "{}", offset),
            DisplayZone::Named(tz) => f.write_str(tz.name()),
        }
    }
}
