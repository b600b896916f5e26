//! Reconciliation primitives for the bkscale autoscaler.
//!
//! This library holds the I/O-free parts of the control loop:
//!
//! - **Decision policy**: compares queue demand against live capacity and
//!   picks exactly one action per tick.
//! - **Backoff**: exponential, capped, jittered delays with a finite budget,
//!   used while polling remote operations.
//! - **Naming**: maps queue worker names onto compute instance names.
//!
//! # Invariants
//!
//! - Decisions are deterministic given the same inputs
//! - No state is carried from one tick to the next
//! - Every backoff schedule terminates

mod backoff;
mod decision;
mod naming;

pub use backoff::{Backoff, BackoffPolicy};
pub use decision::{decide, DemandSnapshot, ScaleDecision};
pub use naming::NameMapping;

/// Default separator between an instance name and the worker suffix.
pub const DEFAULT_NAME_SEPARATOR: char = '-';
