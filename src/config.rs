//! Configuration management for tokenmeter.
//!
//! Settings come from, in increasing priority: built-in defaults, an optional
//! YAML file, and `TOKENMETER_*` environment variables
//! (e.g. `TOKENMETER_DAILY_OUTPUT_LIMIT=20000`).

use std::path::Path;

use chrono::TimeDelta;
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::error::{Result, TokenMeterError};
use crate::ratelimit::{
    DEFAULT_DAILY_INPUT_LIMIT, DEFAULT_DAILY_OUTPUT_LIMIT, DEFAULT_HOURLY_INPUT_LIMIT,
    DEFAULT_HOURLY_OUTPUT_LIMIT, DEFAULT_MONTHLY_INPUT_LIMIT, DEFAULT_MONTHLY_OUTPUT_LIMIT,
};

/// Prefix for environment overrides.
pub const ENV_PREFIX: &str = "TOKENMETER";

/// Reservations are scoped to one calendar day.
const MAX_RESERVATION_TTL_MINUTES: u64 = 24 * 60;

/// Limits and reservation tuning.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Settings {
    #[serde(default = "default_daily_input_limit")]
    pub daily_input_limit: u64,

    #[serde(default = "default_daily_output_limit")]
    pub daily_output_limit: u64,

    #[serde(default = "default_monthly_input_limit")]
    pub monthly_input_limit: u64,

    #[serde(default = "default_monthly_output_limit")]
    pub monthly_output_limit: u64,

    #[serde(default = "default_hourly_input_limit")]
    pub hourly_input_limit: u64,

    #[serde(default = "default_hourly_output_limit")]
    pub hourly_output_limit: u64,

    /// Add the calendar-hour window to the standard policy set
    #[serde(default)]
    pub enable_hourly: bool,

    /// Share of the daily output limit held by each reservation
    #[serde(default = "default_reservation_fraction")]
    pub reservation_fraction: f64,

    /// Lifetime of a reservation nobody released
    #[serde(default = "default_reservation_ttl_minutes")]
    pub reservation_ttl_minutes: u64,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            daily_input_limit: default_daily_input_limit(),
            daily_output_limit: default_daily_output_limit(),
            monthly_input_limit: default_monthly_input_limit(),
            monthly_output_limit: default_monthly_output_limit(),
            hourly_input_limit: default_hourly_input_limit(),
            hourly_output_limit: default_hourly_output_limit(),
            enable_hourly: false,
            reservation_fraction: default_reservation_fraction(),
            reservation_ttl_minutes: default_reservation_ttl_minutes(),
        }
    }
}

fn default_daily_input_limit() -> u64 {
    DEFAULT_DAILY_INPUT_LIMIT
}

fn default_daily_output_limit() -> u64 {
    DEFAULT_DAILY_OUTPUT_LIMIT
}

fn default_monthly_input_limit() -> u64 {
    DEFAULT_MONTHLY_INPUT_LIMIT
}

fn default_monthly_output_limit() -> u64 {
    DEFAULT_MONTHLY_OUTPUT_LIMIT
}

fn default_hourly_input_limit() -> u64 {
    DEFAULT_HOURLY_INPUT_LIMIT
}

fn default_hourly_output_limit() -> u64 {
    DEFAULT_HOURLY_OUTPUT_LIMIT
}

fn default_reservation_fraction() -> f64 {
    0.5
}

fn default_reservation_ttl_minutes() -> u64 {
    10
}

impl Settings {
    /// Load settings from a YAML file.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        info!(path = %path.display(), "Loading settings file");

        let contents = std::fs::read_to_string(path)?;
        Self::from_yaml(&contents)
    }

    /// Parse settings from a YAML string.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        let settings: Settings = serde_yaml::from_str(yaml)
            .map_err(|e| TokenMeterError::Config(format!("Failed to parse settings: {}", e)))?;
        settings.validate()?;
        Ok(settings)
    }

    /// Defaults, overlaid by an optional YAML file, overlaid by the process
    /// environment.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        Self::load_with_env(path, config::Environment::with_prefix(ENV_PREFIX))
    }

    fn load_with_env(path: Option<&Path>, env: config::Environment) -> Result<Self> {
        let mut builder = config::Config::builder();
        if let Some(path) = path {
            info!(path = %path.display(), "Loading settings file");
            builder = builder.add_source(
                config::File::from(path).format(config::FileFormat::Yaml),
            );
        }

        let settings: Settings = builder
            .add_source(env.try_parsing(true))
            .build()
            .and_then(|c| c.try_deserialize())
            .map_err(|e| TokenMeterError::Config(format!("Failed to load settings: {}", e)))?;

        settings.validate()?;
        Ok(settings)
    }

    /// Reject settings no limiter can work with.
    pub fn validate(&self) -> Result<()> {
        let limits = [
            ("daily_input_limit", self.daily_input_limit),
            ("daily_output_limit", self.daily_output_limit),
            ("monthly_input_limit", self.monthly_input_limit),
            ("monthly_output_limit", self.monthly_output_limit),
            ("hourly_input_limit", self.hourly_input_limit),
            ("hourly_output_limit", self.hourly_output_limit),
        ];
        if let Some((name, _)) = limits.iter().find(|(_, limit)| *limit == 0) {
            return Err(TokenMeterError::Config(format!("{} must be greater than zero", name)));
        }

        if !(self.reservation_fraction > 0.0 && self.reservation_fraction <= 1.0) {
            return Err(TokenMeterError::Config(format!(
                "reservation_fraction must be in (0, 1], got {}",
                self.reservation_fraction
            )));
        }

        if self.reservation_ttl_minutes == 0
            || self.reservation_ttl_minutes > MAX_RESERVATION_TTL_MINUTES
        {
            return Err(TokenMeterError::Config(format!(
                "reservation_ttl_minutes must be between 1 and {}, got {}",
                MAX_RESERVATION_TTL_MINUTES, self.reservation_ttl_minutes
            )));
        }

        Ok(())
    }

    pub fn reservation_ttl(&self) -> TimeDelta {
        let minutes = self.reservation_ttl_minutes.min(MAX_RESERVATION_TTL_MINUTES);
        TimeDelta::minutes(minutes as i64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let settings = Settings::default();
        assert_eq!(settings.daily_output_limit, 20_000);
        assert_eq!(settings.monthly_output_limit, 200_000);
        assert_eq!(settings.reservation_fraction, 0.5);
        assert_eq!(settings.reservation_ttl(), TimeDelta::minutes(10));
        assert!(!settings.enable_hourly);
        assert!(settings.validate().is_ok());
    }

    #[test]
    fn test_from_yaml_partial() {
        let yaml = r#"
daily_output_limit: 2000
enable_hourly: true
reservation_ttl_minutes: 5
"#;
        let settings = Settings::from_yaml(yaml).unwrap();
        assert_eq!(settings.daily_output_limit, 2000);
        assert_eq!(settings.daily_input_limit, 10_000);
        assert!(settings.enable_hourly);
        assert_eq!(settings.reservation_ttl(), TimeDelta::minutes(5));
    }

    #[test]
    fn test_invalid_fraction_rejected() {
        assert!(Settings::from_yaml("reservation_fraction: 0.0").is_err());
        assert!(Settings::from_yaml("reservation_fraction: 1.5").is_err());
        assert!(Settings::from_yaml("reservation_fraction: 1.0").is_ok());
    }

    #[test]
    fn test_reservation_ttl_bounds() {
        assert!(Settings::from_yaml("reservation_ttl_minutes: 0").is_err());
        assert!(Settings::from_yaml("reservation_ttl_minutes: 1441").is_err());
        assert!(Settings::from_yaml("reservation_ttl_minutes: 1440").is_ok());
    }

    #[test]
    fn test_zero_limit_rejected() {
        let err = Settings::from_yaml("monthly_output_limit: 0").unwrap_err();
        assert!(err.to_string().contains("monthly_output_limit"));
    }

    #[test]
    fn test_environment_overrides() {
        let mut vars = config::Map::new();
        vars.insert("TOKENMETER_DAILY_OUTPUT_LIMIT".to_string(), "4000".to_string());
        vars.insert("TOKENMETER_RESERVATION_FRACTION".to_string(), "0.25".to_string());
        vars.insert("UNRELATED_VARIABLE".to_string(), "ignored".to_string());

        let env = config::Environment::with_prefix(ENV_PREFIX).source(Some(vars));
        let settings = Settings::load_with_env(None, env).unwrap();

        assert_eq!(settings.daily_output_limit, 4000);
        assert_eq!(settings.reservation_fraction, 0.25);
        assert_eq!(settings.monthly_output_limit, 200_000);
    }

    #[test]
    fn test_file_then_environment() {
        let path = std::env::temp_dir().join(format!("tokenmeter-{}.yaml", uuid::Uuid::new_v4()));
        std::fs::write(&path, "daily_output_limit: 3000\nmonthly_output_limit: 9000\n").unwrap();

        let mut vars = config::Map::new();
        vars.insert("TOKENMETER_MONTHLY_OUTPUT_LIMIT".to_string(), "12000".to_string());
        let env = config::Environment::with_prefix(ENV_PREFIX).source(Some(vars));

        let settings = Settings::load_with_env(Some(&path), env).unwrap();
        std::fs::remove_file(&path).unwrap();

        assert_eq!(settings.daily_output_limit, 3000);
        assert_eq!(settings.monthly_output_limit, 12_000);
    }
}
