//! bkscale autoscaler library
//!
//! Keeps the number of instances in a GCE instance group matched to the
//! backlog of a Buildkite queue. Each tick reads queue demand and the live
//! instance count, then either launches the missing instances one at a time
//! or reclaims agents that have been idle past a timeout.
//!
//! ## Architecture
//!
//! ```text
//! Reconciler
//! ├── DemandSource      (Buildkite: metrics, idle agents, stop)
//! ├── ComputeCapacity   (GCE: count, launch, destroy, operation status)
//! ├── OperationWaiter   (polls operations with backoff)
//! └── Teardown          (concurrent destroys, aggregated failures)
//! ```
//!
//! ## Modules
//!
//! - `ports`: the two traits the reconciler depends on
//! - `reconciler`: the control loop
//! - `waiter`: operation polling
//! - `teardown`: concurrent instance destruction
//! - `buildkite`, `gce`: production port implementations

pub mod buildkite;
pub mod config;
pub mod error;
pub mod gce;
pub mod ports;
pub mod reconciler;
pub mod teardown;
pub mod waiter;

// Re-export commonly used types
pub use error::{ActionError, ApiError, ScalerError};
pub use ports::{ComputeCapacity, DemandSource, OperationHandle, OperationStatus};
pub use reconciler::{ReconcileConfig, Reconciler, TickReport};
