//! Reservation-based admission control.

mod controller;
mod reservation;

pub use controller::{AdmissionController, AdmissionResult, AdmissionState, DenialKind};
pub use reservation::{ReservationId, ReservationManager, ReservationRecord, RESERVATION_PREFIX};
