//! Per-policy usage meter backed by the shared usage store.

use std::sync::Arc;

use tracing::{debug, error, trace, warn};

use super::period::PeriodPolicy;
use super::usage::{TokenKind, Usage};
use crate::clock::Clock;
use crate::store::{SetOnce, StoreError, TokenDelta, UsageStore};

/// Result of checking one meter against its limits.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MeterCheck {
    pub exceeded: bool,
    pub kind: Option<TokenKind>,
    pub usage: Usage,
}

/// Tracks token usage for a single [`PeriodPolicy`].
///
/// Reads fail open: if the store cannot be reached, usage is reported as
/// zero. Writes report failure to the caller and are never retried.
pub struct UsageMeter {
    policy: PeriodPolicy,
    store: Arc<dyn UsageStore>,
    clock: Arc<dyn Clock>,
}

impl std::fmt::Debug for UsageMeter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UsageMeter")
            .field("policy", &self.policy)
            .field("clock", &self.clock)
            .finish()
    }
}

impl UsageMeter {
    pub fn new(policy: PeriodPolicy, store: Arc<dyn UsageStore>, clock: Arc<dyn Clock>) -> Self {
        Self {
            policy,
            store,
            clock,
        }
    }

    pub fn policy(&self) -> &PeriodPolicy {
        &self.policy
    }

    /// Current usage for `principal`, or zero if the store is unavailable.
    pub async fn usage(&self, principal: &str) -> Usage {
        match self.try_usage(principal).await {
            Ok(usage) => usage,
            Err(e) => {
                warn!(
                    principal = %principal,
                    period = %self.policy.name(),
                    error = %e,
                    "Usage lookup failed, assuming zero usage"
                );
                Usage::default()
            }
        }
    }

    /// Current usage for `principal`, surfacing store failures.
    pub async fn try_usage(&self, principal: &str) -> Result<Usage, StoreError> {
        let now = self.clock.now();

        match self.policy.aggregate_window() {
            Some(window) => {
                let lower = self.policy.key_at(now - window);
                let upper = self.policy.key_at(now);
                let records = self
                    .store
                    .query_range(principal, self.policy.key_prefix(), Some(&lower), Some(&upper))
                    .await?;

                trace!(
                    principal = %principal,
                    period = %self.policy.name(),
                    lower = %lower,
                    upper = %upper,
                    buckets = records.len(),
                    "Aggregating usage buckets"
                );

                Ok(records
                    .iter()
                    .map(|r| Usage::new(r.input_tokens, r.output_tokens))
                    .sum())
            }
            None => {
                let key = self.policy.period_key(now);
                let usage = self
                    .store
                    .get(principal, &key)
                    .await?
                    .map(|r| Usage::new(r.input_tokens, r.output_tokens))
                    .unwrap_or_default();
                Ok(usage)
            }
        }
    }

    /// Check usage against this policy's limits. Input is checked first.
    pub async fn is_exceeded(&self, principal: &str) -> MeterCheck {
        let usage = self.usage(principal).await;

        let kind = if usage.input_tokens >= self.policy.input_limit() {
            Some(TokenKind::Input)
        } else if usage.output_tokens >= self.policy.output_limit() {
            Some(TokenKind::Output)
        } else {
            None
        };

        if let Some(kind) = kind {
            debug!(
                principal = %principal,
                period = %self.policy.name(),
                kind = %kind,
                input_tokens = usage.input_tokens,
                output_tokens = usage.output_tokens,
                "Token limit exceeded"
            );
        }

        MeterCheck {
            exceeded: kind.is_some(),
            kind,
            usage,
        }
    }

    /// Add usage to the current bucket. Returns `false` if the write failed.
    pub async fn record(&self, principal: &str, input_tokens: u64, output_tokens: u64) -> bool {
        let now = self.clock.now();
        let key = self.policy.period_key(now);
        let set_once = SetOnce {
            created_at: now.timestamp(),
            ttl: self.policy.ttl(now).timestamp(),
        };
        let delta = TokenDelta {
            input_tokens,
            output_tokens,
        };

        match self.store.atomic_add(principal, &key, delta, set_once).await {
            Ok(()) => {
                trace!(
                    principal = %principal,
                    sort_key = %key,
                    input_tokens = input_tokens,
                    output_tokens = output_tokens,
                    "Recorded token usage"
                );
                true
            }
            Err(e) => {
                error!(
                    principal = %principal,
                    sort_key = %key,
                    input_tokens = input_tokens,
                    output_tokens = output_tokens,
                    error = %e,
                    "Failed to record token usage"
                );
                false
            }
        }
    }
}
