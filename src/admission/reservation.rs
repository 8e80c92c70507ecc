//! Short-lived reservations of output-token capacity.
//!
//! A reservation is a record in the principal's partition under the
//! `reservation:daily:<date>:<uuid>` sort key. Its `output_tokens` attribute
//! holds the reserved amount. Reservations are removed when the caller commits
//! or aborts, and otherwise expire through the store's TTL.

use std::sync::Arc;

use chrono::{DateTime, TimeDelta, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::clock::Clock;
use crate::ratelimit::PeriodPolicy;
use crate::store::{StoreError, UsageRecord, UsageStore};

/// Namespace shared by every reservation record.
pub const RESERVATION_PREFIX: &str = "reservation:";

/// Identifier of a reservation record.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ReservationId(String);

impl ReservationId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    fn generate(now: DateTime<Utc>) -> Self {
        Self(format!("{}{}", daily_prefix(now), Uuid::new_v4()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for ReservationId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

fn daily_prefix(now: DateTime<Utc>) -> String {
    format!("{}daily:{}:", RESERVATION_PREFIX, now.format("%Y-%m-%d"))
}

/// A live reservation as read back from the store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReservationRecord {
    pub id: ReservationId,
    pub output_tokens: u64,
    pub created_at: Option<i64>,
    pub ttl: Option<i64>,
}

impl From<UsageRecord> for ReservationRecord {
    fn from(record: UsageRecord) -> Self {
        Self {
            id: ReservationId(record.sort_key),
            output_tokens: record.output_tokens,
            created_at: record.created_at,
            ttl: record.ttl,
        }
    }
}

/// Creates, lists and releases reservations.
///
/// Every reservation holds the same fixed amount: a fraction of the output
/// limit of the limiter's reference policy.
pub struct ReservationManager {
    store: Arc<dyn UsageStore>,
    clock: Arc<dyn Clock>,
    size: u64,
    ttl: TimeDelta,
}

impl std::fmt::Debug for ReservationManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReservationManager")
            .field("size", &self.size)
            .field("ttl", &self.ttl)
            .finish()
    }
}

impl ReservationManager {
    /// Create a manager whose reservations hold `fraction` of `output_limit`.
    pub fn new(
        store: Arc<dyn UsageStore>,
        clock: Arc<dyn Clock>,
        output_limit: u64,
        fraction: f64,
        ttl: TimeDelta,
    ) -> Self {
        let size = (output_limit as f64 * fraction).floor() as u64;
        Self {
            store,
            clock,
            size,
            ttl,
        }
    }

    /// Create a manager sized against `policy`'s output limit.
    pub fn for_policy(
        policy: &PeriodPolicy,
        store: Arc<dyn UsageStore>,
        clock: Arc<dyn Clock>,
        fraction: f64,
        ttl: TimeDelta,
    ) -> Self {
        Self::new(store, clock, policy.output_limit(), fraction, ttl)
    }

    /// Output tokens held by each reservation.
    pub fn reservation_size(&self) -> u64 {
        self.size
    }

    pub fn ttl(&self) -> TimeDelta {
        self.ttl
    }

    /// Write a new reservation. Returns `None` if the store rejected it.
    pub async fn create(&self, principal: &str) -> Option<ReservationId> {
        let now = self.clock.now();
        let id = ReservationId::generate(now);
        let record = UsageRecord {
            sort_key: id.as_str().to_string(),
            input_tokens: 0,
            output_tokens: self.size,
            created_at: Some(now.timestamp()),
            ttl: Some((now + self.ttl).timestamp()),
        };

        match self.store.put(principal, record).await {
            Ok(()) => {
                info!(
                    principal = %principal,
                    reservation_id = %id,
                    reservation_amount = self.size,
                    ttl_minutes = self.ttl.num_minutes(),
                    "Created token reservation"
                );
                Some(id)
            }
            Err(e) => {
                error!(
                    principal = %principal,
                    error = %e,
                    "Error creating token reservation"
                );
                None
            }
        }
    }

    /// Delete a reservation. Removing one that no longer exists succeeds.
    pub async fn remove(&self, principal: &str, id: &ReservationId) -> bool {
        if !id.as_str().starts_with(RESERVATION_PREFIX) {
            warn!(
                principal = %principal,
                reservation_id = %id,
                "Refusing to remove a record outside the reservation namespace"
            );
            return false;
        }

        match self.store.delete(principal, id.as_str()).await {
            Ok(()) => {
                info!(principal = %principal, reservation_id = %id, "Removed token reservation");
                true
            }
            Err(e) => {
                error!(
                    principal = %principal,
                    reservation_id = %id,
                    error = %e,
                    "Error removing token reservation"
                );
                false
            }
        }
    }

    /// Today's reservations whose TTL has not elapsed.
    pub async fn try_active_reservations(
        &self,
        principal: &str,
    ) -> Result<Vec<ReservationRecord>, StoreError> {
        let now = self.clock.now();
        let prefix = daily_prefix(now);
        let records = self.store.query_range(principal, &prefix, None, None).await?;

        let now_secs = now.timestamp();
        Ok(records
            .into_iter()
            .filter(|r| !r.is_expired(now_secs))
            .map(ReservationRecord::from)
            .collect())
    }

    /// Today's live reservations, or none if the store is unavailable.
    pub async fn active_reservations(&self, principal: &str) -> Vec<ReservationRecord> {
        match self.try_active_reservations(principal).await {
            Ok(reservations) => reservations,
            Err(e) => {
                warn!(
                    principal = %principal,
                    error = %e,
                    "Error getting active reservations, assuming none"
                );
                Vec::new()
            }
        }
    }

    /// Output tokens held by live reservations.
    pub async fn total_reserved(&self, principal: &str) -> u64 {
        self.active_reservations(principal)
            .await
            .iter()
            .map(|r| r.output_tokens)
            .sum()
    }

    /// Delete every reservation, from any day, whose TTL has elapsed.
    ///
    /// Covers for lag in the store's own expiry. Returns how many were removed.
    pub async fn sweep_expired(&self, principal: &str) -> usize {
        let now_secs = self.clock.now().timestamp();

        let records = match self
            .store
            .query_range(principal, RESERVATION_PREFIX, None, None)
            .await
        {
            Ok(records) => records,
            Err(e) => {
                error!(
                    principal = %principal,
                    error = %e,
                    "Error cleaning up expired reservations"
                );
                return 0;
            }
        };

        let mut cleaned = 0;
        for record in records.into_iter().filter(|r| r.is_expired(now_secs)) {
            if self.remove(principal, &ReservationId(record.sort_key)).await {
                cleaned += 1;
            }
        }

        if cleaned > 0 {
            info!(
                principal = %principal,
                cleaned_count = cleaned,
                "Cleaned up expired reservations"
            );
        } else {
            debug!(principal = %principal, "No expired reservations to clean up");
        }
        cleaned
    }
}
