//! Concurrent teardown of reclaimed instances.
//!
//! Every target gets its own task that issues the destroy request and waits
//! for the operation. Tasks report back over a channel; a single collector
//! drains it once every sender is gone, so no result list is shared between
//! tasks. One failed destroy never stops its siblings.

use std::fmt;
use std::sync::Arc;

use thiserror::Error;
use tokio::sync::{mpsc, Semaphore};
use tokio::task::JoinSet;
use tracing::{debug, error, info};

use crate::error::ActionError;
use crate::ports::ComputeCapacity;
use crate::waiter::OperationWaiter;

/// Outcome of destroying one instance.
#[derive(Debug)]
pub struct TeardownResult {
    pub instance: String,
    pub error: Option<TeardownFailure>,
}

/// Why a single instance was not destroyed.
#[derive(Debug, Error)]
pub enum TeardownFailure {
    #[error(transparent)]
    Action(#[from] ActionError),

    #[error("destroy task ended without reporting a result")]
    Lost,
}

/// Aggregate error for a teardown batch with at least one failure.
#[derive(Debug, Error)]
pub struct TeardownError {
    /// Instances that were destroyed successfully.
    pub destroyed: Vec<String>,

    /// Instances that failed, with their cause, in request order.
    pub failures: Vec<(String, TeardownFailure)>,
}

impl fmt::Display for TeardownError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "failed to destroy {} of {} instances: ",
            self.failures.len(),
            self.failures.len() + self.destroyed.len()
        )?;
        for (i, (instance, cause)) in self.failures.iter().enumerate() {
            if i > 0 {
                f.write_str("; ")?;
            }
            write!(f, "{instance}: {cause}")?;
        }
        Ok(())
    }
}

impl TeardownError {
    /// Names of the instances that failed.
    pub fn failed_instances(&self) -> Vec<&str> {
        self.failures.iter().map(|(name, _)| name.as_str()).collect()
    }
}

/// Destroys batches of instances in one zone.
pub struct Teardown {
    compute: Arc<dyn ComputeCapacity>,
    waiter: Arc<OperationWaiter>,
    project: String,
    zone: String,
    limit: Option<usize>,
}

impl Teardown {
    /// Create a teardown for instances in `project`/`zone`.
    pub fn new(
        compute: Arc<dyn ComputeCapacity>,
        waiter: Arc<OperationWaiter>,
        project: impl Into<String>,
        zone: impl Into<String>,
    ) -> Self {
        Self {
            compute,
            waiter,
            project: project.into(),
            zone: zone.into(),
            limit: None,
        }
    }

    /// Cap the number of destroys in flight at once. `None` means unbounded.
    pub fn with_limit(mut self, limit: Option<usize>) -> Self {
        self.limit = limit.map(|n| n.max(1));
        self
    }

    /// Destroy every named instance.
    ///
    /// Returns the destroyed instances when all succeeded, otherwise one
    /// aggregate error listing each failure.
    pub async fn destroy_all(&self, instances: Vec<String>) -> Result<Vec<String>, TeardownError> {
        if instances.is_empty() {
            return Ok(Vec::new());
        }

        let (tx, mut rx) = mpsc::unbounded_channel::<(usize, TeardownResult)>();
        let limiter = self.limit.map(|n| Arc::new(Semaphore::new(n)));
        let mut tasks = JoinSet::new();

        for (index, instance) in instances.iter().cloned().enumerate() {
            debug!(instance = %instance, "Preparing to destroy instance");

            let tx = tx.clone();
            let compute = Arc::clone(&self.compute);
            let waiter = Arc::clone(&self.waiter);
            let limiter = limiter.clone();
            let project = self.project.clone();
            let zone = self.zone.clone();

            tasks.spawn(async move {
                let _permit = match limiter {
                    Some(limiter) => limiter.acquire_owned().await.ok(),
                    None => None,
                };

                let error = destroy_one(compute.as_ref(), &waiter, &project, &zone, &instance)
                    .await
                    .err()
                    .map(TeardownFailure::from);

                let _ = tx.send((index, TeardownResult { instance, error }));
            });
        }
        drop(tx);

        let mut results: Vec<Option<TeardownResult>> = instances.iter().map(|_| None).collect();
        while let Some((index, result)) = rx.recv().await {
            results[index] = Some(result);
        }

        while let Some(joined) = tasks.join_next().await {
            if let Err(e) = joined {
                error!(error = %e, "Destroy task failed");
            }
        }

        let mut destroyed = Vec::new();
        let mut failures = Vec::new();
        for (instance, result) in instances.into_iter().zip(results) {
            match result {
                Some(TeardownResult { error: None, .. }) => {
                    info!(instance = %instance, "Destroyed instance");
                    destroyed.push(instance);
                }
                Some(TeardownResult {
                    error: Some(cause), ..
                }) => {
                    error!(instance = %instance, error = %cause, "Failed to destroy instance");
                    failures.push((instance, cause));
                }
                None => failures.push((instance, TeardownFailure::Lost)),
            }
        }

        if failures.is_empty() {
            Ok(destroyed)
        } else {
            Err(TeardownError {
                destroyed,
                failures,
            })
        }
    }
}

async fn destroy_one(
    compute: &dyn ComputeCapacity,
    waiter: &OperationWaiter,
    project: &str,
    zone: &str,
    instance: &str,
) -> Result<(), ActionError> {
    let operation = compute.destroy_instance(project, zone, instance).await?;
    waiter.wait(compute, project, zone, &operation).await?;
    Ok(())
}
