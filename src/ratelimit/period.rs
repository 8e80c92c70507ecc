//! Rate-limit windows: bucket naming, rounding and expiry.

use chrono::{DateTime, Datelike, Months, NaiveTime, TimeDelta, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{Result, TokenMeterError};

/// Default limits for the rolling daily window.
pub const DEFAULT_DAILY_INPUT_LIMIT: u64 = 10_000;
pub const DEFAULT_DAILY_OUTPUT_LIMIT: u64 = 20_000;
/// Default limits for the calendar-month window.
pub const DEFAULT_MONTHLY_INPUT_LIMIT: u64 = 100_000;
pub const DEFAULT_MONTHLY_OUTPUT_LIMIT: u64 = 200_000;
/// Default limits for the calendar-hour window.
pub const DEFAULT_HOURLY_INPUT_LIMIT: u64 = 1_000;
pub const DEFAULT_HOURLY_OUTPUT_LIMIT: u64 = 2_000;

/// Description of the rolling daily window, which admission reserves against.
pub const DAILY_DESCRIPTION: &str = "daily";

/// Bucket granularity of a period policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Granularity {
    /// Fixed ten-minute buckets
    TenMinutes,
    /// Calendar-hour buckets
    Hour,
    /// Calendar-month buckets
    Month,
}

impl Granularity {
    /// Round a timestamp down to the start of its bucket.
    pub fn window_start(&self, t: DateTime<Utc>) -> DateTime<Utc> {
        match self {
            Granularity::TenMinutes => floor_to(t, 600),
            Granularity::Hour => floor_to(t, 3600),
            Granularity::Month => month_start(t),
        }
    }

    /// Format a timestamp as a bucket suffix.
    ///
    /// The format only carries the granularity's precision, except for
    /// ten-minute buckets which keep minute precision so that range bounds
    /// can fall between bucket boundaries.
    pub fn format(&self, t: DateTime<Utc>) -> String {
        let pattern = match self {
            Granularity::TenMinutes => "%Y-%m-%d:%H:%M",
            Granularity::Hour => "%Y-%m-%d:%H",
            Granularity::Month => "%Y-%m",
        };
        t.format(pattern).to_string()
    }

    /// When a bucket first written at `t` should expire.
    pub fn expires_at(&self, t: DateTime<Utc>) -> DateTime<Utc> {
        match self {
            Granularity::TenMinutes | Granularity::Hour => t + TimeDelta::days(1),
            Granularity::Month => month_start(t) + Months::new(1),
        }
    }

    /// Nominal length of one bucket. Months count as 31 days.
    pub fn duration(&self) -> TimeDelta {
        match self {
            Granularity::TenMinutes => TimeDelta::minutes(10),
            Granularity::Hour => TimeDelta::hours(1),
            Granularity::Month => TimeDelta::days(31),
        }
    }
}

fn floor_to(t: DateTime<Utc>, step_secs: i64) -> DateTime<Utc> {
    let secs = t.timestamp();
    let offset = TimeDelta::seconds(secs.rem_euclid(step_secs))
        + TimeDelta::nanoseconds(i64::from(t.timestamp_subsec_nanos()));
    t - offset
}

fn month_start(t: DateTime<Utc>) -> DateTime<Utc> {
    let date = t.date_naive() - chrono::Days::new(u64::from(t.day0()));
    date.and_time(NaiveTime::MIN).and_utc()
}

/// One rate-limit window and its limits.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeriodPolicy {
    name: String,
    description: String,
    granularity: Granularity,
    aggregate_window: Option<TimeDelta>,
    input_limit: u64,
    output_limit: u64,
    key_prefix: String,
}

impl PeriodPolicy {
    pub fn builder() -> PeriodPolicyBuilder {
        PeriodPolicyBuilder::default()
    }

    /// Ten-minute buckets summed over the trailing 24 hours.
    pub fn rolling_daily(input_limit: u64, output_limit: u64) -> Self {
        Self {
            name: "10min".to_string(),
            description: DAILY_DESCRIPTION.to_string(),
            granularity: Granularity::TenMinutes,
            aggregate_window: Some(TimeDelta::days(1)),
            input_limit,
            output_limit,
            key_prefix: "10min:".to_string(),
        }
    }

    /// One bucket per calendar month.
    pub fn monthly(input_limit: u64, output_limit: u64) -> Self {
        Self {
            name: "monthly".to_string(),
            description: "monthly".to_string(),
            granularity: Granularity::Month,
            aggregate_window: None,
            input_limit,
            output_limit,
            key_prefix: "monthly:".to_string(),
        }
    }

    /// One bucket per calendar hour.
    pub fn hourly(input_limit: u64, output_limit: u64) -> Self {
        Self {
            name: "hourly".to_string(),
            description: "hourly".to_string(),
            granularity: Granularity::Hour,
            aggregate_window: None,
            input_limit,
            output_limit,
            key_prefix: "hourly:".to_string(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn description(&self) -> &str {
        &self.description
    }

    pub fn granularity(&self) -> Granularity {
        self.granularity
    }

    pub fn aggregate_window(&self) -> Option<TimeDelta> {
        self.aggregate_window
    }

    pub fn input_limit(&self) -> u64 {
        self.input_limit
    }

    pub fn output_limit(&self) -> u64 {
        self.output_limit
    }

    pub fn key_prefix(&self) -> &str {
        &self.key_prefix
    }

    /// Sort key of the bucket containing `t`.
    pub fn period_key(&self, t: DateTime<Utc>) -> String {
        self.key_at(self.window_start(t))
    }

    /// Sort key for an arbitrary instant, used as a range-query bound.
    pub fn key_at(&self, t: DateTime<Utc>) -> String {
        format!("{}{}", self.key_prefix, self.granularity.format(t))
    }

    pub fn window_start(&self, t: DateTime<Utc>) -> DateTime<Utc> {
        self.granularity.window_start(t)
    }

    /// Expiry for a bucket first written at `t`.
    pub fn ttl(&self, t: DateTime<Utc>) -> DateTime<Utc> {
        self.granularity.expires_at(t)
    }

    /// The stretch of time this policy's limits cover.
    pub fn span(&self) -> TimeDelta {
        self.aggregate_window.unwrap_or_else(|| self.granularity.duration())
    }

    /// Whether this is an aggregated window described as "daily".
    pub fn is_rolling_daily(&self) -> bool {
        self.aggregate_window.is_some() && self.description == DAILY_DESCRIPTION
    }
}

/// Builder for custom [`PeriodPolicy`] values.
#[derive(Debug, Clone, Default)]
pub struct PeriodPolicyBuilder {
    name: Option<String>,
    description: Option<String>,
    granularity: Option<Granularity>,
    aggregate_window: Option<TimeDelta>,
    input_limit: Option<u64>,
    output_limit: Option<u64>,
    key_prefix: Option<String>,
}

impl PeriodPolicyBuilder {
    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    pub fn granularity(mut self, granularity: Granularity) -> Self {
        self.granularity = Some(granularity);
        self
    }

    pub fn aggregate_window(mut self, window: TimeDelta) -> Self {
        self.aggregate_window = Some(window);
        self
    }

    pub fn input_limit(mut self, limit: u64) -> Self {
        self.input_limit = Some(limit);
        self
    }

    pub fn output_limit(mut self, limit: u64) -> Self {
        self.output_limit = Some(limit);
        self
    }

    pub fn key_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.key_prefix = Some(prefix.into());
        self
    }

    pub fn build(self) -> Result<PeriodPolicy> {
        let name = required(self.name, "name")?;
        let granularity = required(self.granularity, "granularity")?;
        let input_limit = required(self.input_limit, "input_limit")?;
        let output_limit = required(self.output_limit, "output_limit")?;
        let key_prefix = required(self.key_prefix, "key_prefix")?;

        if name.is_empty() || key_prefix.is_empty() {
            return Err(TokenMeterError::Config(
                "period policy name and key_prefix must not be empty".to_string(),
            ));
        }
        if key_prefix.starts_with("reservation:") {
            return Err(TokenMeterError::Config(format!(
                "key_prefix '{}' collides with the reservation namespace",
                key_prefix
            )));
        }
        if matches!(self.aggregate_window, Some(w) if w <= TimeDelta::zero()) {
            return Err(TokenMeterError::Config(
                "aggregate_window must be positive".to_string(),
            ));
        }

        Ok(PeriodPolicy {
            description: self.description.unwrap_or_else(|| name.clone()),
            name,
            granularity,
            aggregate_window: self.aggregate_window,
            input_limit,
            output_limit,
            key_prefix,
        })
    }
}

fn required<T>(value: Option<T>, field: &str) -> Result<T> {
    value.ok_or_else(|| {
        TokenMeterError::Config(format!("missing required field '{}' in period policy", field))
    })
}
