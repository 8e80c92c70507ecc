//! Multi-window rate limiter.

use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use super::meter::UsageMeter;
use super::period::PeriodPolicy;
use super::usage::{ConsolidatedUsage, TokenKind};
use crate::clock::Clock;
use crate::config::Settings;
use crate::error::{Result, TokenMeterError};
use crate::store::UsageStore;

/// Input and output ceilings of one policy, as reported to clients.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PolicyLimits {
    pub input_limit: u64,
    pub output_limit: u64,
}

/// Outcome of checking every window for a principal.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LimitCheck {
    pub exceeded: bool,
    pub kind: Option<TokenKind>,
    /// Description of the exceeded policy, e.g. "daily"
    pub period: Option<String>,
    pub usage: ConsolidatedUsage,
}

/// Enforces several overlapping windows for the same principals.
///
/// Meters are evaluated in the order they were given; the first exceeded
/// meter ends the check.
#[derive(Debug)]
pub struct RateLimiter {
    meters: Vec<UsageMeter>,
    /// Index of the meter reservations are sized and checked against
    reference: usize,
}

impl RateLimiter {
    /// Create a limiter over the given meters.
    pub fn new(meters: Vec<UsageMeter>) -> Result<Self> {
        if meters.is_empty() {
            return Err(TokenMeterError::Config(
                "a rate limiter needs at least one period policy".to_string(),
            ));
        }

        let mut prefixes = HashSet::new();
        let mut descriptions = HashSet::new();
        for meter in &meters {
            let policy = meter.policy();
            if !prefixes.insert(policy.key_prefix()) {
                return Err(TokenMeterError::Config(format!(
                    "duplicate key_prefix '{}' across period policies",
                    policy.key_prefix()
                )));
            }
            if !descriptions.insert(policy.description()) {
                return Err(TokenMeterError::Config(format!(
                    "duplicate description '{}' across period policies",
                    policy.description()
                )));
            }
        }

        // The rolling daily window when present, else the shortest span.
        let reference = meters
            .iter()
            .position(|m| m.policy().is_rolling_daily())
            .or_else(|| {
                meters
                    .iter()
                    .enumerate()
                    .min_by_key(|(_, m)| m.policy().span())
                    .map(|(i, _)| i)
            })
            .unwrap_or(0);

        Ok(Self { meters, reference })
    }

    /// Build the standard policy set from settings.
    ///
    /// The rolling daily window comes first, then the hourly window when
    /// enabled, then the monthly window.
    pub fn standard(
        settings: &Settings,
        store: Arc<dyn UsageStore>,
        clock: Arc<dyn Clock>,
    ) -> Result<Self> {
        let mut policies = vec![PeriodPolicy::rolling_daily(
            settings.daily_input_limit,
            settings.daily_output_limit,
        )];
        if settings.enable_hourly {
            policies.push(PeriodPolicy::hourly(
                settings.hourly_input_limit,
                settings.hourly_output_limit,
            ));
        }
        policies.push(PeriodPolicy::monthly(
            settings.monthly_input_limit,
            settings.monthly_output_limit,
        ));

        Self::new(
            policies
                .into_iter()
                .map(|p| UsageMeter::new(p, store.clone(), clock.clone()))
                .collect(),
        )
    }

    pub fn meters(&self) -> &[UsageMeter] {
        &self.meters
    }

    /// The policy reservations are sized and checked against.
    ///
    /// This is the rolling daily window whenever the limiter has one, so
    /// adding shorter windows never replaces the daily reservation check.
    pub fn reference_policy(&self) -> &PeriodPolicy {
        self.meters[self.reference].policy()
    }

    /// Check every window in order, stopping at the first exceeded one.
    pub async fn is_exceeded(&self, principal: &str) -> LimitCheck {
        let mut usage = ConsolidatedUsage::default();

        for meter in &self.meters {
            let check = meter.is_exceeded(principal).await;
            usage.merge(meter.policy().description(), check.usage);

            if check.exceeded {
                return LimitCheck {
                    exceeded: true,
                    kind: check.kind,
                    period: Some(meter.policy().description().to_string()),
                    usage,
                };
            }
        }

        LimitCheck {
            exceeded: false,
            kind: None,
            period: None,
            usage,
        }
    }

    /// Record usage on every meter. Returns `true` only if all writes succeeded.
    ///
    /// Meters that succeeded keep their update when another meter fails.
    pub async fn record(&self, principal: &str, input_tokens: u64, output_tokens: u64) -> bool {
        let mut ok = true;
        for meter in &self.meters {
            if !meter.record(principal, input_tokens, output_tokens).await {
                ok = false;
            }
        }

        if ok {
            debug!(
                principal = %principal,
                input_tokens = input_tokens,
                output_tokens = output_tokens,
                "Recorded usage on all windows"
            );
        } else {
            warn!(principal = %principal, "Usage was not recorded on every window");
        }
        ok
    }

    /// Limits per policy name.
    pub fn limits(&self) -> BTreeMap<String, PolicyLimits> {
        self.meters
            .iter()
            .map(|m| {
                let policy = m.policy();
                (
                    policy.name().to_string(),
                    PolicyLimits {
                        input_limit: policy.input_limit(),
                        output_limit: policy.output_limit(),
                    },
                )
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::ratelimit::period::Granularity;
    use crate::ratelimit::usage::Usage;
    use crate::store::MemoryStore;
    use chrono::{TimeZone, Utc};

    fn create_test_limiter(policies: Vec<PeriodPolicy>) -> (Arc<MemoryStore>, RateLimiter) {
        let clock: Arc<dyn Clock> = Arc::new(ManualClock::new(
            Utc.with_ymd_and_hms(2025, 1, 8, 12, 5, 0).unwrap(),
        ));
        let store = Arc::new(MemoryStore::new(clock.clone()));
        let meters = policies
            .into_iter()
            .map(|p| UsageMeter::new(p, store.clone(), clock.clone()))
            .collect();
        (store, RateLimiter::new(meters).unwrap())
    }

    #[test]
    fn test_empty_limiter_rejected() {
        assert!(RateLimiter::new(Vec::new()).is_err());
    }

    #[test]
    fn test_duplicate_prefix_rejected() {
        let clock: Arc<dyn Clock> = Arc::new(ManualClock::new(Utc::now()));
        let store: Arc<dyn UsageStore> = Arc::new(MemoryStore::new(clock.clone()));
        let meters = vec![
            UsageMeter::new(PeriodPolicy::monthly(1, 1), store.clone(), clock.clone()),
            UsageMeter::new(PeriodPolicy::monthly(2, 2), store, clock),
        ];
        assert!(RateLimiter::new(meters).is_err());
    }

    #[tokio::test]
    async fn test_not_exceeded_reports_all_periods() {
        let (_, limiter) = create_test_limiter(vec![
            PeriodPolicy::rolling_daily(1000, 2000),
            PeriodPolicy::monthly(10_000, 20_000),
        ]);

        assert!(limiter.record("user", 10, 20).await);

        let check = limiter.is_exceeded("user").await;
        assert!(!check.exceeded);
        assert_eq!(check.kind, None);
        assert_eq!(check.period, None);
        assert_eq!(check.usage.period("daily"), Usage::new(10, 20));
        assert_eq!(check.usage.period("monthly"), Usage::new(10, 20));
        assert_eq!(check.usage.output_tokens, 20);
    }

    #[tokio::test]
    async fn test_short_circuits_on_first_exceeded() {
        let (_, limiter) = create_test_limiter(vec![
            PeriodPolicy::rolling_daily(1000, 20),
            PeriodPolicy::monthly(10, 20_000),
        ]);

        assert!(limiter.record("user", 10, 20).await);

        let check = limiter.is_exceeded("user").await;
        assert!(check.exceeded);
        assert_eq!(check.kind, Some(TokenKind::Output));
        assert_eq!(check.period.as_deref(), Some("daily"));
        // Monthly was never evaluated
        assert!(!check.usage.periods.contains_key("monthly"));
    }

    #[tokio::test]
    async fn test_later_window_exceeded() {
        let (_, limiter) = create_test_limiter(vec![
            PeriodPolicy::rolling_daily(1000, 2000),
            PeriodPolicy::monthly(10, 20_000),
        ]);

        assert!(limiter.record("user", 10, 20).await);

        let check = limiter.is_exceeded("user").await;
        assert!(check.exceeded);
        assert_eq!(check.kind, Some(TokenKind::Input));
        assert_eq!(check.period.as_deref(), Some("monthly"));
        assert!(check.usage.periods.contains_key("daily"));
    }

    #[tokio::test]
    async fn test_principals_are_isolated() {
        let (_, limiter) = create_test_limiter(vec![PeriodPolicy::monthly(10, 10)]);

        assert!(limiter.record("alice", 10, 0).await);

        assert!(limiter.is_exceeded("alice").await.exceeded);
        assert!(!limiter.is_exceeded("bob").await.exceeded);
    }

    #[test]
    fn test_duplicate_description_rejected() {
        let clock: Arc<dyn Clock> = Arc::new(ManualClock::new(Utc::now()));
        let store: Arc<dyn UsageStore> = Arc::new(MemoryStore::new(clock.clone()));
        let shadow = PeriodPolicy::builder()
            .name("shadow")
            .description("daily")
            .granularity(Granularity::Hour)
            .input_limit(1)
            .output_limit(1)
            .key_prefix("shadow:")
            .build()
            .unwrap();
        let meters = vec![
            UsageMeter::new(PeriodPolicy::rolling_daily(1, 1), store.clone(), clock.clone()),
            UsageMeter::new(shadow, store, clock),
        ];

        let err = RateLimiter::new(meters).unwrap_err();
        assert!(err.to_string().contains("duplicate description 'daily'"));
    }

    #[test]
    fn test_limits_and_reference_policy() {
        let (_, limiter) = create_test_limiter(vec![
            PeriodPolicy::rolling_daily(1, 2),
            PeriodPolicy::hourly(3, 4),
            PeriodPolicy::monthly(5, 6),
        ]);

        let limits = limiter.limits();
        assert_eq!(limits.len(), 3);
        assert_eq!(limits["10min"], PolicyLimits { input_limit: 1, output_limit: 2 });
        assert_eq!(limits["monthly"].output_limit, 6);
        // The hourly span is shorter, but the daily window stays the reference
        assert_eq!(limiter.reference_policy().name(), "10min");
    }

    #[test]
    fn test_reference_falls_back_to_shortest_span() {
        let (_, limiter) = create_test_limiter(vec![
            PeriodPolicy::monthly(5, 6),
            PeriodPolicy::hourly(3, 4),
        ]);
        assert_eq!(limiter.reference_policy().name(), "hourly");
    }

    #[test]
    fn test_standard_policy_set() {
        let clock: Arc<dyn Clock> = Arc::new(ManualClock::new(Utc::now()));
        let store: Arc<dyn UsageStore> = Arc::new(MemoryStore::new(clock.clone()));

        let limiter =
            RateLimiter::standard(&Settings::default(), store.clone(), clock.clone()).unwrap();
        let names: Vec<_> = limiter.meters().iter().map(|m| m.policy().name()).collect();
        assert_eq!(names, vec!["10min", "monthly"]);
        assert_eq!(limiter.reference_policy().description(), "daily");

        let settings = Settings {
            enable_hourly: true,
            ..Settings::default()
        };
        let limiter = RateLimiter::standard(&settings, store, clock).unwrap();
        let names: Vec<_> = limiter.meters().iter().map(|m| m.policy().name()).collect();
        assert_eq!(names, vec!["10min", "hourly", "monthly"]);
        assert_eq!(limiter.reference_policy().description(), "daily");
    }
}
