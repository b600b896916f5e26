//! Waiting for remote operations to finish.
//!
//! Each poll of an operation lands in one of three outcomes:
//!
//! - the status fetch itself failed: fatal, the operation's fate is unknown
//! - the fetched status carries errors: fatal, the operation failed remotely
//! - the status is not terminal yet: retry after a backoff delay
//!
//! A terminal status without errors is success. Retries stop once the
//! backoff budget is spent.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bkscale_reconcile::BackoffPolicy;
use thiserror::Error;
use tracing::debug;

use crate::error::ApiError;
use crate::ports::{ComputeCapacity, OperationFault, OperationHandle, OperationStatus};

/// Sleep primitive, injectable so tests never wait on the wall clock.
#[async_trait]
pub trait Sleeper: Send + Sync {
    async fn sleep(&self, duration: Duration);
}

/// [`Sleeper`] backed by the tokio timer.
#[derive(Debug, Clone, Copy, Default)]
pub struct TokioSleeper;

#[async_trait]
impl Sleeper for TokioSleeper {
    async fn sleep(&self, duration: Duration) {
        tokio::time::sleep(duration).await;
    }
}

/// Why an operation did not complete successfully.
#[derive(Debug, Error)]
pub enum OperationError {
    #[error("failed to fetch status of operation {operation}: {source}")]
    Fetch {
        operation: String,
        #[source]
        source: ApiError,
    },

    #[error("operation {operation} failed: {}", join_faults(.faults))]
    Failed {
        operation: String,
        faults: Vec<OperationFault>,
    },

    #[error("operation {operation} still {state} after {retries} retries")]
    Exhausted {
        operation: String,
        state: String,
        retries: u32,
    },
}

fn join_faults(faults: &[OperationFault]) -> String {
    if faults.is_empty() {
        return "unspecified error".to_string();
    }
    faults
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

/// Result of a single poll.
#[derive(Debug)]
pub enum PollOutcome {
    /// The operation finished successfully.
    Done,

    /// The operation can never succeed; stop polling.
    Fatal(OperationError),

    /// The operation is still running.
    Retry { state: String },
}

/// Classify one status fetch.
pub fn classify(
    operation: &OperationHandle,
    fetched: Result<OperationStatus, ApiError>,
) -> PollOutcome {
    match fetched {
        Err(source) => PollOutcome::Fatal(OperationError::Fetch {
            operation: operation.to_string(),
            source,
        }),
        Ok(OperationStatus::Failed { faults }) => PollOutcome::Fatal(OperationError::Failed {
            operation: operation.to_string(),
            faults,
        }),
        Ok(OperationStatus::Done) => PollOutcome::Done,
        Ok(OperationStatus::Pending { state }) => PollOutcome::Retry { state },
    }
}

/// Polls operations until they finish, fail, or exhaust the backoff budget.
#[derive(Clone)]
pub struct OperationWaiter {
    policy: BackoffPolicy,
    sleeper: Arc<dyn Sleeper>,
}

impl OperationWaiter {
    /// Create a waiter with an explicit sleep primitive.
    pub fn new(policy: BackoffPolicy, sleeper: Arc<dyn Sleeper>) -> Self {
        Self { policy, sleeper }
    }

    /// Backoff policy used between polls.
    pub fn policy(&self) -> &BackoffPolicy {
        &self.policy
    }

    /// Wait for `operation` to reach a terminal state.
    pub async fn wait(
        &self,
        compute: &dyn ComputeCapacity,
        project: &str,
        zone: &str,
        operation: &OperationHandle,
    ) -> Result<(), OperationError> {
        let mut backoff = self.policy.start();

        loop {
            let fetched = compute.operation_status(project, zone, operation).await;

            match classify(operation, fetched) {
                PollOutcome::Done => {
                    debug!(
                        operation = %operation,
                        retries = backoff.attempts(),
                        "Operation complete"
                    );
                    return Ok(());
                }
                PollOutcome::Fatal(err) => return Err(err),
                PollOutcome::Retry { state } => {
                    let Some(delay) = backoff.next_delay() else {
                        return Err(OperationError::Exhausted {
                            operation: operation.to_string(),
                            state,
                            retries: backoff.attempts(),
                        });
                    };

                    debug!(
                        operation = %operation,
                        status = %state,
                        delay_ms = delay.as_millis() as u64,
                        "Operation in progress"
                    );
                    self.sleeper.sleep(delay).await;
                }
            }
        }
    }
}

impl Default for OperationWaiter {
    fn default() -> Self {
        Self::new(BackoffPolicy::default(), Arc::new(TokioSleeper))
    }
}

impl std::fmt::Debug for OperationWaiter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OperationWaiter")
            .field("policy", &self.policy)
            .finish_non_exhaustive()
    }
}
