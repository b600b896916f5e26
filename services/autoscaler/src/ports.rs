//! Interfaces to the job queue and the compute provider.
//!
//! The reconciler only talks to the outside world through these two traits.
//! Production implementations live in [`crate::buildkite`] and [`crate::gce`];
//! tests substitute in-memory doubles.

use std::fmt;

use async_trait::async_trait;
use bkscale_reconcile::DemandSnapshot;

use crate::error::ApiError;

/// Reference to an in-flight remote create or destroy operation.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct OperationHandle(String);

impl OperationHandle {
    /// Wrap a provider-assigned operation name.
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    /// The provider-assigned operation name.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for OperationHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// One structured error reported by a remote operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OperationFault {
    pub code: String,
    pub message: String,
}

impl fmt::Display for OperationFault {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.code, self.message)
    }
}

/// Status of a remote operation as last observed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OperationStatus {
    /// Still running; carries the provider's status string.
    Pending { state: String },

    /// Finished successfully.
    Done,

    /// The provider reported one or more errors for the operation.
    Failed { faults: Vec<OperationFault> },
}

/// Job queue demand and worker pool.
#[async_trait]
pub trait DemandSource: Send + Sync {
    /// Scheduled and running job counts for a queue.
    async fn get_metrics(&self, queue: &str) -> Result<DemandSnapshot, ApiError>;

    /// Names of workers on the configured queue that have been idle past the
    /// configured timeout.
    async fn get_idle_agents(&self) -> Result<Vec<String>, ApiError>;

    /// Stop the named workers. Fails with the first stop error.
    async fn stop_agents(&self, names: &[String]) -> Result<(), ApiError>;
}

/// Compute inventory for a zonal instance group.
#[async_trait]
pub trait ComputeCapacity: Send + Sync {
    /// Instances in the group that are provisioning or running.
    async fn live_instance_count(
        &self,
        project: &str,
        zone: &str,
        group: &str,
    ) -> Result<u64, ApiError>;

    /// Create an instance from `template` and add it to `group`.
    async fn launch_instance_for_group(
        &self,
        project: &str,
        zone: &str,
        group: &str,
        template: &str,
    ) -> Result<OperationHandle, ApiError>;

    /// Delete the named instance.
    async fn destroy_instance(
        &self,
        project: &str,
        zone: &str,
        name: &str,
    ) -> Result<OperationHandle, ApiError>;

    /// Fetch the current status of an operation.
    async fn operation_status(
        &self,
        project: &str,
        zone: &str,
        operation: &OperationHandle,
    ) -> Result<OperationStatus, ApiError>;
}
