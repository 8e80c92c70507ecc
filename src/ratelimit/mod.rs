//! Token rate limiting over overlapping time windows.

mod limiter;
mod meter;
mod period;
mod usage;

pub use limiter::{LimitCheck, PolicyLimits, RateLimiter};
pub use meter::{MeterCheck, UsageMeter};
pub use period::{
    Granularity, PeriodPolicy, PeriodPolicyBuilder, DEFAULT_DAILY_INPUT_LIMIT,
    DEFAULT_DAILY_OUTPUT_LIMIT, DEFAULT_HOURLY_INPUT_LIMIT, DEFAULT_HOURLY_OUTPUT_LIMIT,
    DEFAULT_MONTHLY_INPUT_LIMIT, DEFAULT_MONTHLY_OUTPUT_LIMIT,
};
pub use usage::{ConsolidatedUsage, TokenKind, Usage};
