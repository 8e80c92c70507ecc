//! Admit / commit / abort protocol over the rate limiter and reservations.

use std::collections::BTreeMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{debug, info, instrument, warn};

use super::reservation::{ReservationId, ReservationManager};
use crate::clock::Clock;
use crate::config::Settings;
use crate::error::Result;
use crate::ratelimit::{ConsolidatedUsage, PolicyLimits, RateLimiter, TokenKind};
use crate::store::UsageStore;

/// Stage of one admission cycle.
///
/// `Checking` moves to `Rejected` or `Reserved`; a reserved cycle ends in
/// `Committed` or `Aborted`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AdmissionState {
    Checking,
    Rejected,
    Reserved,
    Committed,
    Aborted,
}

impl AdmissionState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            AdmissionState::Rejected | AdmissionState::Committed | AdmissionState::Aborted
        )
    }
}

/// Why an admission was denied.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DenialKind {
    Input,
    Output,
    /// The reservation could not be written
    ReservationFailed,
}

impl DenialKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            DenialKind::Input => "input",
            DenialKind::Output => "output",
            DenialKind::ReservationFailed => "reservation_failed",
        }
    }
}

impl std::fmt::Display for DenialKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl From<TokenKind> for DenialKind {
    fn from(kind: TokenKind) -> Self {
        match kind {
            TokenKind::Input => DenialKind::Input,
            TokenKind::Output => DenialKind::Output,
        }
    }
}

/// Outcome of [`AdmissionController::admit`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AdmissionResult {
    pub admitted: bool,
    pub state: AdmissionState,
    pub reservation_id: Option<ReservationId>,
    pub denial_kind: Option<DenialKind>,
    /// Description of the policy that caused the denial
    pub denial_period: Option<String>,
    pub usage: ConsolidatedUsage,
}

impl AdmissionResult {
    fn rejected(kind: DenialKind, period: Option<String>, usage: ConsolidatedUsage) -> Self {
        Self {
            admitted: false,
            state: AdmissionState::Rejected,
            reservation_id: None,
            denial_kind: Some(kind),
            denial_period: period,
            usage,
        }
    }

    fn reserved(id: ReservationId, usage: ConsolidatedUsage) -> Self {
        Self {
            admitted: true,
            state: AdmissionState::Reserved,
            reservation_id: Some(id),
            denial_kind: None,
            denial_period: None,
            usage,
        }
    }
}

/// Admission control for token-metered work.
///
/// After a successful [`admit`](Self::admit) the caller must call exactly one
/// of [`commit`](Self::commit) or [`abort`](Self::abort), once. A reservation
/// that is never released holds its capacity until its TTL expires.
///
/// Admission reads usage and reservations, decides, then writes a
/// reservation, without any lock around the three steps. Concurrent admits can
/// therefore both pass; the overshoot is bounded by one reservation per
/// concurrent admit and lasts at most one reservation TTL.
#[derive(Debug)]
pub struct AdmissionController {
    limiter: RateLimiter,
    reservations: ReservationManager,
}

impl AdmissionController {
    pub fn new(limiter: RateLimiter, reservations: ReservationManager) -> Self {
        Self {
            limiter,
            reservations,
        }
    }

    /// Wire the standard policies and a reservation manager sized against the
    /// rolling daily window.
    pub fn from_settings(
        settings: &Settings,
        store: Arc<dyn UsageStore>,
        clock: Arc<dyn Clock>,
    ) -> Result<Self> {
        settings.validate()?;
        let limiter = RateLimiter::standard(settings, store.clone(), clock.clone())?;
        let reservations = ReservationManager::for_policy(
            limiter.reference_policy(),
            store,
            clock,
            settings.reservation_fraction,
            settings.reservation_ttl(),
        );
        Ok(Self::new(limiter, reservations))
    }

    pub fn limiter(&self) -> &RateLimiter {
        &self.limiter
    }

    pub fn reservations(&self) -> &ReservationManager {
        &self.reservations
    }

    /// Decide whether `principal` may start new work, reserving capacity if so.
    #[instrument(skip(self), fields(principal = %principal))]
    pub async fn admit(&self, principal: &str) -> AdmissionResult {
        let check = self.limiter.is_exceeded(principal).await;
        let mut usage = check.usage;

        if check.exceeded {
            let kind = check.kind.map(DenialKind::from).unwrap_or(DenialKind::Output);
            warn!(
                kind = %kind,
                period = ?check.period,
                "Admission denied, token limit exceeded"
            );
            return AdmissionResult::rejected(kind, check.period, usage);
        }

        let reference = self.limiter.reference_policy();
        let current_output = usage.period(reference.description()).output_tokens;
        let reserved = self.reservations.total_reserved(principal).await;
        let new_reservation = self.reservations.reservation_size();
        let total_with_reservation = current_output
            .saturating_add(reserved)
            .saturating_add(new_reservation);

        usage.total_reserved_tokens = Some(reserved);
        usage.new_reservation_amount = Some(new_reservation);
        usage.total_with_reservation = Some(total_with_reservation);

        if total_with_reservation > reference.output_limit() {
            warn!(
                period = %reference.description(),
                current_output = current_output,
                total_reserved = reserved,
                new_reservation = new_reservation,
                total_with_reservation = total_with_reservation,
                output_limit = reference.output_limit(),
                "Admission denied, reservation would exceed output limit"
            );
            return AdmissionResult::rejected(
                DenialKind::Output,
                Some(reference.description().to_string()),
                usage,
            );
        }

        match self.reservations.create(principal).await {
            Some(id) => {
                debug!(reservation_id = %id, "Admission granted");
                AdmissionResult::reserved(id, usage)
            }
            None => {
                warn!("Admission denied, reservation could not be written");
                AdmissionResult::rejected(DenialKind::ReservationFailed, None, usage)
            }
        }
    }

    /// Record the work's actual usage and release its reservation.
    ///
    /// The reservation is released even when recording fails. Returns `true`
    /// only if both steps succeeded.
    #[instrument(
        skip(self, reservation_id),
        fields(principal = %principal, reservation_id = %reservation_id)
    )]
    pub async fn commit(
        &self,
        principal: &str,
        reservation_id: &ReservationId,
        input_tokens: u64,
        output_tokens: u64,
    ) -> bool {
        let recorded = self
            .limiter
            .record(principal, input_tokens, output_tokens)
            .await;
        let released = self.reservations.remove(principal, reservation_id).await;

        info!(
            input_tokens = input_tokens,
            output_tokens = output_tokens,
            recorded = recorded,
            released = released,
            state = ?AdmissionState::Committed,
            "Admission committed"
        );
        recorded && released
    }

    /// Release a reservation without recording usage.
    #[instrument(
        skip(self, reservation_id),
        fields(principal = %principal, reservation_id = %reservation_id)
    )]
    pub async fn abort(&self, principal: &str, reservation_id: &ReservationId) -> bool {
        let released = self.reservations.remove(principal, reservation_id).await;
        info!(released = released, state = ?AdmissionState::Aborted, "Admission aborted");
        released
    }

    /// Limits per policy name, for reporting quotas to clients.
    pub fn limits(&self) -> BTreeMap<String, PolicyLimits> {
        self.limiter.limits()
    }
}
