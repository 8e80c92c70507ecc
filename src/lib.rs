//! Tokenmeter - token usage metering and admission control
//!
//! This crate meters token consumption (input and output tokens) per principal
//! across overlapping time windows, and gates new work through short-lived
//! reservations of output-token capacity. Usage and reservations live in a
//! shared key-value store behind the [`store::UsageStore`] trait.

pub mod admission;
pub mod clock;
pub mod config;
pub mod error;
pub mod ratelimit;
pub mod store;

pub use admission::{AdmissionController, AdmissionResult, DenialKind, ReservationId};
pub use error::{Result, TokenMeterError};
