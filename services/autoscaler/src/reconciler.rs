//! Reconciliation loop for matching instance capacity to queue demand.
//!
//! The reconciler:
//! - Reads queue demand and the live instance count once per tick
//! - Launches the missing instances one at a time, each awaited to completion
//! - Or, when capacity covers demand, stops idle workers and destroys their
//!   instances concurrently
//!
//! Ticks never overlap and carry no state from one to the next.

use std::sync::Arc;
use std::time::Duration;

use bkscale_reconcile::{decide, BackoffPolicy, DemandSnapshot, NameMapping, ScaleDecision};
use tokio::sync::watch;
use tracing::{debug, error, info, instrument};

use crate::error::{ActionError, ScalerError};
use crate::ports::{ComputeCapacity, DemandSource};
use crate::teardown::Teardown;
use crate::waiter::{OperationWaiter, Sleeper, TokioSleeper};

/// Immutable parameters for a reconciler run.
#[derive(Debug, Clone, PartialEq)]
pub struct ReconcileConfig {
    /// Compute project.
    pub project: String,

    /// Compute zone.
    pub zone: String,

    /// Instance group that holds the workers.
    pub group: String,

    /// Instance template used for launches.
    pub template: String,

    /// Job queue whose backlog drives the group size.
    pub queue: String,

    /// Idle time after which a worker is reclaimed. `None` disables reclaim.
    pub idle_timeout: Option<Duration>,

    /// Interval between ticks. `None` runs a single tick.
    pub poll_interval: Option<Duration>,

    /// How worker names map onto instance names.
    pub name_mapping: NameMapping,

    /// Cap on concurrent destroys. `None` destroys every target at once.
    pub max_concurrent_destroys: Option<usize>,
}

/// What a completed tick did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TickReport {
    pub demand: DemandSnapshot,
    pub live: u64,
    pub decision: ScaleDecision,
    /// Instances launched this tick.
    pub launched: u64,
    /// Instances destroyed this tick.
    pub reclaimed: Vec<String>,
}

/// Reconciler for matching instance capacity to queue demand.
pub struct Reconciler {
    config: Arc<ReconcileConfig>,
    demand: Arc<dyn DemandSource>,
    compute: Arc<dyn ComputeCapacity>,
    waiter: Arc<OperationWaiter>,
    sleeper: Arc<dyn Sleeper>,
}

impl Reconciler {
    /// Create a reconciler using the tokio timer and the default backoff.
    pub fn new(
        config: ReconcileConfig,
        demand: Arc<dyn DemandSource>,
        compute: Arc<dyn ComputeCapacity>,
    ) -> Self {
        let sleeper: Arc<dyn Sleeper> = Arc::new(TokioSleeper);
        Self {
            config: Arc::new(config),
            demand,
            compute,
            waiter: Arc::new(OperationWaiter::new(
                BackoffPolicy::default(),
                Arc::clone(&sleeper),
            )),
            sleeper,
        }
    }

    /// Replace the backoff used while waiting on operations.
    pub fn with_backoff(mut self, policy: BackoffPolicy) -> Self {
        self.waiter = Arc::new(OperationWaiter::new(policy, Arc::clone(&self.sleeper)));
        self
    }

    /// Replace the sleep primitive used between ticks and between polls.
    pub fn with_sleeper(mut self, sleeper: Arc<dyn Sleeper>) -> Self {
        self.waiter = Arc::new(OperationWaiter::new(
            self.waiter.policy().clone(),
            Arc::clone(&sleeper),
        ));
        self.sleeper = sleeper;
        self
    }

    /// Run ticks until shutdown, or a single tick when no poll interval is set.
    ///
    /// The first tick starts immediately. A failed tick is logged and the
    /// next one runs on schedule. Returns [`ScalerError::Cancelled`] on
    /// shutdown; in run-once mode returns the outcome of the single tick.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) -> Result<(), ScalerError> {
        info!(
            queue = %self.config.queue,
            group = %self.config.group,
            poll_interval_secs = self.config.poll_interval.map(|d| d.as_secs()),
            idle_timeout_secs = self.config.idle_timeout.map(|d| d.as_secs()),
            "Starting reconciliation loop"
        );

        loop {
            if *shutdown.borrow() {
                info!("Reconciler shutting down");
                return Err(ScalerError::Cancelled);
            }

            let outcome = tokio::select! {
                outcome = self.tick() => outcome,
                _ = cancelled(&mut shutdown) => {
                    info!("Reconciler cancelled mid-tick");
                    return Err(ScalerError::Cancelled);
                }
            };

            match &outcome {
                Ok(report) => info!(
                    scheduled = report.demand.scheduled_jobs,
                    running = report.demand.running_jobs,
                    live = report.live,
                    launched = report.launched,
                    reclaimed = report.reclaimed.len(),
                    "Reconciliation pass complete"
                ),
                Err(e) => error!(error = %e, "Autoscaling failed"),
            }

            let Some(interval) = self.config.poll_interval else {
                return outcome.map(|_| ());
            };

            tokio::select! {
                _ = self.sleeper.sleep(interval) => {}
                _ = cancelled(&mut shutdown) => {
                    info!("Reconciler shutting down");
                    return Err(ScalerError::Cancelled);
                }
            }
        }
    }

    /// Perform a single reconciliation pass.
    #[instrument(skip(self), fields(queue = %self.config.queue, group = %self.config.group))]
    pub async fn tick(&self) -> Result<TickReport, ScalerError> {
        let config = &self.config;

        let demand = self
            .demand
            .get_metrics(&config.queue)
            .await
            .map_err(ScalerError::Demand)?;

        let live = self
            .compute
            .live_instance_count(&config.project, &config.zone, &config.group)
            .await
            .map_err(ScalerError::Capacity)?;

        let decision = decide(&demand, live, config.idle_timeout.is_some());
        debug!(
            scheduled = demand.scheduled_jobs,
            running = demand.running_jobs,
            live,
            ?decision,
            "Scale decision"
        );

        let mut report = TickReport {
            demand,
            live,
            decision,
            launched: 0,
            reclaimed: Vec::new(),
        };

        match decision {
            ScaleDecision::ScaleUp { required } => {
                report.launched = self.scale_up(required).await?;
            }
            ScaleDecision::ReclaimIdle => {
                report.reclaimed = self.reclaim_idle().await?;
            }
            ScaleDecision::Hold => {
                debug!("Capacity covers demand and idle reclaim is disabled");
            }
        }

        Ok(report)
    }

    /// Launch `required` instances strictly one after another.
    async fn scale_up(&self, required: u64) -> Result<u64, ScalerError> {
        let config = &self.config;
        info!(required, template = %config.template, "Scaling up");

        for attempt in 1..=required {
            self.launch_one()
                .await
                .map_err(|source| ScalerError::Launch {
                    attempt,
                    required,
                    source,
                })?;
            debug!(attempt, required, "Instance launched");
        }

        Ok(required)
    }

    async fn launch_one(&self) -> Result<(), ActionError> {
        let config = &self.config;
        let operation = self
            .compute
            .launch_instance_for_group(
                &config.project,
                &config.zone,
                &config.group,
                &config.template,
            )
            .await?;

        self.waiter
            .wait(
                self.compute.as_ref(),
                &config.project,
                &config.zone,
                &operation,
            )
            .await?;
        Ok(())
    }

    /// Stop idle workers and destroy the instances hosting them.
    async fn reclaim_idle(&self) -> Result<Vec<String>, ScalerError> {
        let config = &self.config;

        let idle = self
            .demand
            .get_idle_agents()
            .await
            .map_err(ScalerError::IdleAgents)?;

        if idle.is_empty() {
            debug!("No idle agents to reclaim");
            return Ok(Vec::new());
        }

        info!(agents = ?idle, "Stopping idle agents");
        self.demand
            .stop_agents(&idle)
            .await
            .map_err(ScalerError::StopAgents)?;

        let mut instances = Vec::with_capacity(idle.len());
        for name in config.name_mapping.instance_names(&idle) {
            if !instances.contains(&name) {
                instances.push(name);
            }
        }

        let teardown = Teardown::new(
            Arc::clone(&self.compute),
            Arc::clone(&self.waiter),
            &config.project,
            &config.zone,
        )
        .with_limit(config.max_concurrent_destroys);

        Ok(teardown.destroy_all(instances).await?)
    }
}

/// Resolves once shutdown is requested. Never resolves if the sender is gone.
async fn cancelled(shutdown: &mut watch::Receiver<bool>) {
    let sender_dropped = shutdown.wait_for(|stop| *stop).await.is_err();
    if sender_dropped {
        std::future::pending::<()>().await;
    }
}
