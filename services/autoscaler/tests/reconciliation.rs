//! Integration tests for the reconciliation flow.
//!
//! These tests drive the reconciler against in-memory queue and compute
//! doubles:
//! 1. Demand and live count are read once per tick
//! 2. Scale-up launches run one at a time, each awaited
//! 3. Scale-down stops idle agents and destroys their instances concurrently
//!
//! Uses an instant sleeper so no test waits on the wall clock.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use bkscale_autoscaler::error::ActionError;
use bkscale_autoscaler::ports::OperationFault;
use bkscale_autoscaler::teardown::TeardownFailure;
use bkscale_autoscaler::waiter::{OperationError, Sleeper};
use bkscale_autoscaler::{
    ApiError, ComputeCapacity, DemandSource, OperationHandle, OperationStatus, ReconcileConfig,
    Reconciler, ScalerError,
};
use bkscale_reconcile::{BackoffPolicy, DemandSnapshot, NameMapping, ScaleDecision};
use tokio::sync::{watch, Barrier};

// =============================================================================
// Doubles
// =============================================================================

#[derive(Default)]
struct InstantSleeper {
    slept: Mutex<Vec<Duration>>,
}

#[async_trait]
impl Sleeper for InstantSleeper {
    async fn sleep(&self, duration: Duration) {
        self.slept.lock().unwrap().push(duration);
        tokio::task::yield_now().await;
    }
}

#[derive(Default)]
struct FakeQueue {
    demand: DemandSnapshot,
    fail_metrics: bool,
    idle: Vec<String>,
    fail_stop: bool,
    metrics_calls: Mutex<u32>,
    idle_calls: Mutex<u32>,
    stopped: Mutex<Vec<String>>,
    /// Request shutdown once this many metric reads have happened.
    shutdown_after: Option<(u32, watch::Sender<bool>)>,
}

impl FakeQueue {
    fn with_demand(scheduled: u64, running: u64) -> Self {
        Self {
            demand: DemandSnapshot::new(scheduled, running),
            ..Self::default()
        }
    }

    fn idle(mut self, names: &[&str]) -> Self {
        self.idle = names.iter().map(|n| n.to_string()).collect();
        self
    }

    fn metrics_calls(&self) -> u32 {
        *self.metrics_calls.lock().unwrap()
    }
}

#[async_trait]
impl DemandSource for FakeQueue {
    async fn get_metrics(&self, _queue: &str) -> Result<DemandSnapshot, ApiError> {
        let calls = {
            let mut calls = self.metrics_calls.lock().unwrap();
            *calls += 1;
            *calls
        };

        if let Some((after, tx)) = &self.shutdown_after {
            if calls >= *after {
                let _ = tx.send(true);
            }
        }

        if self.fail_metrics {
            return Err(ApiError::Status {
                status: 401,
                body: "invalid token".to_string(),
            });
        }
        Ok(self.demand)
    }

    async fn get_idle_agents(&self) -> Result<Vec<String>, ApiError> {
        *self.idle_calls.lock().unwrap() += 1;
        Ok(self.idle.clone())
    }

    async fn stop_agents(&self, names: &[String]) -> Result<(), ApiError> {
        if self.fail_stop {
            return Err(ApiError::Backend("stop rejected".to_string()));
        }
        self.stopped.lock().unwrap().extend(names.iter().cloned());
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Event {
    Count,
    Launch { group: String, template: String },
    Destroy(String),
    Poll(String),
}

#[derive(Default)]
struct FakeCompute {
    live: u64,
    fail_count: bool,
    /// Launch number (1-based) whose request is rejected.
    reject_launch: Option<u32>,
    /// Instances whose destroy operation ends with an error.
    failing_destroys: HashSet<String>,
    /// Instances whose destroy request is rejected outright.
    rejected_destroys: HashSet<String>,
    /// Pending polls before an operation reports done.
    pending_polls: u32,
    /// Every destroy waits here, so destroys must run concurrently to pass.
    destroy_barrier: Option<Arc<Barrier>>,
    /// Time each destroy request stays in flight.
    destroy_delay: Option<Duration>,
    /// Launch requests never complete.
    hang_launches: bool,
    in_flight: Mutex<u32>,
    peak_in_flight: Mutex<u32>,
    events: Mutex<Vec<Event>>,
    launches: Mutex<u32>,
    polls: Mutex<HashMap<String, u32>>,
}

impl FakeCompute {
    fn with_live(live: u64) -> Self {
        Self {
            live,
            ..Self::default()
        }
    }

    fn events(&self) -> Vec<Event> {
        self.events.lock().unwrap().clone()
    }

    fn launch_count(&self) -> usize {
        self.events()
            .iter()
            .filter(|e| matches!(e, Event::Launch { .. }))
            .count()
    }

    fn destroyed(&self) -> HashSet<String> {
        self.events()
            .into_iter()
            .filter_map(|e| match e {
                Event::Destroy(name) => Some(name),
                _ => None,
            })
            .collect()
    }

    fn record(&self, event: Event) {
        self.events.lock().unwrap().push(event);
    }
}

#[async_trait]
impl ComputeCapacity for FakeCompute {
    async fn live_instance_count(&self, _: &str, _: &str, _: &str) -> Result<u64, ApiError> {
        self.record(Event::Count);
        if self.fail_count {
            return Err(ApiError::Backend("compute unavailable".to_string()));
        }
        Ok(self.live)
    }

    async fn launch_instance_for_group(
        &self,
        _project: &str,
        _zone: &str,
        group: &str,
        template: &str,
    ) -> Result<OperationHandle, ApiError> {
        let n = {
            let mut launches = self.launches.lock().unwrap();
            *launches += 1;
            *launches
        };
        self.record(Event::Launch {
            group: group.to_string(),
            template: template.to_string(),
        });

        if self.hang_launches {
            std::future::pending::<()>().await;
        }

        if self.reject_launch == Some(n) {
            return Err(ApiError::Status {
                status: 403,
                body: "quota exceeded".to_string(),
            });
        }
        Ok(OperationHandle::new(format!("launch-{n}")))
    }

    async fn destroy_instance(
        &self,
        _project: &str,
        _zone: &str,
        name: &str,
    ) -> Result<OperationHandle, ApiError> {
        self.record(Event::Destroy(name.to_string()));

        if let Some(barrier) = &self.destroy_barrier {
            barrier.wait().await;
        }

        if let Some(delay) = self.destroy_delay {
            {
                let mut in_flight = self.in_flight.lock().unwrap();
                *in_flight += 1;
                let mut peak = self.peak_in_flight.lock().unwrap();
                *peak = (*peak).max(*in_flight);
            }
            tokio::time::sleep(delay).await;
            *self.in_flight.lock().unwrap() -= 1;
        }

        if self.rejected_destroys.contains(name) {
            return Err(ApiError::Status {
                status: 404,
                body: format!("instance {name} not found"),
            });
        }
        Ok(OperationHandle::new(format!("destroy-{name}")))
    }

    async fn operation_status(
        &self,
        _: &str,
        _: &str,
        operation: &OperationHandle,
    ) -> Result<OperationStatus, ApiError> {
        self.record(Event::Poll(operation.to_string()));

        let polls = {
            let mut polls = self.polls.lock().unwrap();
            let count = polls.entry(operation.to_string()).or_insert(0);
            *count += 1;
            *count
        };

        if polls <= self.pending_polls {
            return Ok(OperationStatus::Pending {
                state: "RUNNING".to_string(),
            });
        }

        let failing = operation
            .as_str()
            .strip_prefix("destroy-")
            .is_some_and(|name| self.failing_destroys.contains(name));
        if failing {
            return Ok(OperationStatus::Failed {
                faults: vec![OperationFault {
                    code: "RESOURCE_IN_USE".to_string(),
                    message: "instance is in use".to_string(),
                }],
            });
        }
        Ok(OperationStatus::Done)
    }
}

// =============================================================================
// Helpers
// =============================================================================

fn test_config() -> ReconcileConfig {
    ReconcileConfig {
        project: "ci-project".to_string(),
        zone: "us-central1-a".to_string(),
        group: "ci-agents".to_string(),
        template: "ci-agent".to_string(),
        queue: "default".to_string(),
        idle_timeout: Some(Duration::from_secs(600)),
        poll_interval: None,
        name_mapping: NameMapping::default(),
        max_concurrent_destroys: None,
    }
}

fn reconciler(
    config: ReconcileConfig,
    queue: Arc<FakeQueue>,
    compute: Arc<FakeCompute>,
) -> (Reconciler, Arc<InstantSleeper>) {
    let sleeper = Arc::new(InstantSleeper::default());
    let reconciler = Reconciler::new(config, queue, compute)
        .with_sleeper(sleeper.clone())
        .with_backoff(BackoffPolicy::default().without_jitter());
    (reconciler, sleeper)
}

// =============================================================================
// Scale up
// =============================================================================

#[tokio::test]
async fn test_scale_up_issues_sequential_launches() {
    let queue = Arc::new(FakeQueue::with_demand(3, 2));
    let compute = Arc::new(FakeCompute {
        pending_polls: 1,
        ..FakeCompute::with_live(1)
    });
    let (reconciler, _) = reconciler(test_config(), queue.clone(), compute.clone());

    let report = reconciler.tick().await.unwrap();

    assert_eq!(report.decision, ScaleDecision::ScaleUp { required: 4 });
    assert_eq!(report.launched, 4);
    assert_eq!(compute.launch_count(), 4);

    // Each launch is polled to completion before the next one starts.
    let events = compute.events();
    let mut expected = vec![Event::Count];
    for n in 1..=4 {
        expected.push(Event::Launch {
            group: "ci-agents".to_string(),
            template: "ci-agent".to_string(),
        });
        expected.push(Event::Poll(format!("launch-{n}")));
        expected.push(Event::Poll(format!("launch-{n}")));
    }
    assert_eq!(events, expected);
    assert_eq!(*queue.idle_calls.lock().unwrap(), 0);
}

#[tokio::test]
async fn test_first_launch_failure_aborts_remaining() {
    let queue = Arc::new(FakeQueue::with_demand(5, 0));
    let compute = Arc::new(FakeCompute {
        reject_launch: Some(2),
        ..FakeCompute::with_live(0)
    });
    let (reconciler, _) = reconciler(test_config(), queue, compute.clone());

    let err = reconciler.tick().await.unwrap_err();

    match err {
        ScalerError::Launch {
            attempt,
            required,
            source: ActionError::Request(ApiError::Status { status: 403, .. }),
        } => {
            assert_eq!(attempt, 2);
            assert_eq!(required, 5);
        }
        other => panic!("unexpected error: {other:?}"),
    }
    assert_eq!(compute.launch_count(), 2);
}

// =============================================================================
// Scale down
// =============================================================================

#[tokio::test]
async fn test_capacity_covering_demand_launches_nothing() {
    let queue = Arc::new(FakeQueue::with_demand(1, 1).idle(&[
        "ci-agent-aa11bb-1",
        "ci-agent-cc22dd-1",
        "ci-agent-ee33ff-1",
    ]));
    let compute = Arc::new(FakeCompute::with_live(4));
    let (reconciler, _) = reconciler(test_config(), queue.clone(), compute.clone());

    let report = reconciler.tick().await.unwrap();

    assert_eq!(report.decision, ScaleDecision::ReclaimIdle);
    assert_eq!(compute.launch_count(), 0);
    assert_eq!(
        *queue.stopped.lock().unwrap(),
        vec!["ci-agent-aa11bb-1", "ci-agent-cc22dd-1", "ci-agent-ee33ff-1"]
    );
    assert_eq!(
        report.reclaimed,
        vec!["ci-agent-aa11bb", "ci-agent-cc22dd", "ci-agent-ee33ff"]
    );
}

#[tokio::test]
async fn test_hold_without_idle_timeout() {
    let queue = Arc::new(FakeQueue::with_demand(0, 2).idle(&["ci-agent-aa11bb-1"]));
    let compute = Arc::new(FakeCompute::with_live(3));
    let config = ReconcileConfig {
        idle_timeout: None,
        ..test_config()
    };
    let (reconciler, _) = reconciler(config, queue.clone(), compute.clone());

    let report = reconciler.tick().await.unwrap();

    assert_eq!(report.decision, ScaleDecision::Hold);
    assert_eq!(*queue.idle_calls.lock().unwrap(), 0);
    assert!(queue.stopped.lock().unwrap().is_empty());
    assert_eq!(compute.events(), vec![Event::Count]);
}

#[tokio::test]
async fn test_teardown_aggregates_partial_failure() {
    let queue = Arc::new(FakeQueue::with_demand(0, 0).idle(&["A-1", "B-1", "C-1"]));
    let compute = Arc::new(FakeCompute {
        failing_destroys: HashSet::from(["B".to_string()]),
        pending_polls: 1,
        ..FakeCompute::with_live(3)
    });
    let (reconciler, _) = reconciler(test_config(), queue, compute.clone());

    let err = reconciler.tick().await.unwrap_err();

    let ScalerError::Teardown(teardown) = err else {
        panic!("expected teardown error, got {err:?}");
    };
    assert_eq!(teardown.failed_instances(), vec!["B"]);
    assert!(matches!(
        teardown.failures[0].1,
        TeardownFailure::Action(ActionError::Operation(OperationError::Failed { .. }))
    ));
    assert_eq!(teardown.destroyed, vec!["A", "C"]);
    assert_eq!(
        compute.destroyed(),
        HashSet::from(["A".to_string(), "B".to_string(), "C".to_string()])
    );
    assert!(teardown.to_string().contains("B: operation destroy-B failed"));
}

#[tokio::test]
async fn test_rejected_destroy_does_not_skip_siblings() {
    let queue = Arc::new(FakeQueue::with_demand(0, 0).idle(&["A-1", "B-1", "C-1"]));
    let compute = Arc::new(FakeCompute {
        rejected_destroys: HashSet::from(["A".to_string()]),
        ..FakeCompute::with_live(3)
    });
    let (reconciler, _) = reconciler(test_config(), queue, compute.clone());

    let err = reconciler.tick().await.unwrap_err();

    let ScalerError::Teardown(teardown) = err else {
        panic!("expected teardown error, got {err:?}");
    };
    assert_eq!(teardown.failed_instances(), vec!["A"]);
    assert_eq!(teardown.destroyed, vec!["B", "C"]);
}

#[tokio::test]
async fn test_destroys_run_concurrently() {
    let queue = Arc::new(FakeQueue::with_demand(0, 0).idle(&["A-1", "B-1", "C-1"]));
    let compute = Arc::new(FakeCompute {
        destroy_barrier: Some(Arc::new(Barrier::new(3))),
        ..FakeCompute::with_live(3)
    });
    let (reconciler, _) = reconciler(test_config(), queue, compute.clone());

    // Serial destroys would block forever on the barrier.
    let report = tokio::time::timeout(Duration::from_secs(5), reconciler.tick())
        .await
        .expect("destroys did not run concurrently")
        .unwrap();

    assert_eq!(report.reclaimed, vec!["A", "B", "C"]);
}

#[tokio::test]
async fn test_destroy_cap_limits_in_flight_destroys() {
    let names: Vec<String> = (1..=8).map(|i| format!("ci-agent-{i:06x}-1")).collect();
    let queue = Arc::new(FakeQueue {
        idle: names,
        ..FakeQueue::with_demand(0, 0)
    });
    let compute = Arc::new(FakeCompute {
        destroy_delay: Some(Duration::from_millis(20)),
        ..FakeCompute::with_live(8)
    });
    let config = ReconcileConfig {
        max_concurrent_destroys: Some(2),
        ..test_config()
    };
    let (reconciler, _) = reconciler(config, queue, compute.clone());

    let report = reconciler.tick().await.unwrap();

    assert_eq!(report.reclaimed.len(), 8);
    assert_eq!(compute.destroyed().len(), 8);
    assert_eq!(*compute.peak_in_flight.lock().unwrap(), 2);
}

#[tokio::test]
async fn test_agents_on_the_same_instance_destroy_it_once() {
    let queue = Arc::new(FakeQueue::with_demand(0, 0).idle(&["web-1", "web-2", "api-1"]));
    let compute = Arc::new(FakeCompute::with_live(2));
    let (reconciler, _) = reconciler(test_config(), queue, compute.clone());

    let report = reconciler.tick().await.unwrap();

    assert_eq!(report.reclaimed, vec!["web", "api"]);
    let destroys = compute
        .events()
        .into_iter()
        .filter(|e| matches!(e, Event::Destroy(_)))
        .count();
    assert_eq!(destroys, 2);
}

#[tokio::test]
async fn test_stop_failure_skips_teardown() {
    let queue = Arc::new(FakeQueue {
        fail_stop: true,
        ..FakeQueue::with_demand(0, 0).idle(&["A-1"])
    });
    let compute = Arc::new(FakeCompute::with_live(1));
    let (reconciler, _) = reconciler(test_config(), queue, compute.clone());

    let err = reconciler.tick().await.unwrap_err();

    assert!(matches!(err, ScalerError::StopAgents(_)));
    assert!(compute.destroyed().is_empty());
}

#[tokio::test]
async fn test_verbatim_naming() {
    let queue = Arc::new(FakeQueue::with_demand(0, 0).idle(&["ci-agent-aa11bb"]));
    let compute = Arc::new(FakeCompute::with_live(1));
    let config = ReconcileConfig {
        name_mapping: NameMapping::Verbatim,
        ..test_config()
    };
    let (reconciler, _) = reconciler(config, queue, compute.clone());

    let report = reconciler.tick().await.unwrap();

    assert_eq!(report.reclaimed, vec!["ci-agent-aa11bb"]);
}

// =============================================================================
// Tick behavior
// =============================================================================

#[tokio::test]
async fn test_demand_failure_aborts_tick() {
    let queue = Arc::new(FakeQueue {
        fail_metrics: true,
        ..FakeQueue::default()
    });
    let compute = Arc::new(FakeCompute::with_live(0));
    let (reconciler, _) = reconciler(test_config(), queue, compute.clone());

    let err = reconciler.tick().await.unwrap_err();

    assert!(matches!(err, ScalerError::Demand(ref e) if e.is_auth()));
    assert!(compute.events().is_empty());
}

#[tokio::test]
async fn test_capacity_failure_aborts_tick() {
    let queue = Arc::new(FakeQueue::with_demand(4, 0));
    let compute = Arc::new(FakeCompute {
        fail_count: true,
        ..FakeCompute::default()
    });
    let (reconciler, _) = reconciler(test_config(), queue, compute.clone());

    let err = reconciler.tick().await.unwrap_err();

    assert!(matches!(err, ScalerError::Capacity(_)));
    assert_eq!(compute.launch_count(), 0);
}

#[tokio::test]
async fn test_ticks_are_idempotent() {
    let queue = Arc::new(FakeQueue::with_demand(2, 1));
    let compute = Arc::new(FakeCompute::with_live(3));
    let config = ReconcileConfig {
        idle_timeout: None,
        ..test_config()
    };
    let (reconciler, _) = reconciler(config, queue, compute);

    let first = reconciler.tick().await.unwrap();
    let second = reconciler.tick().await.unwrap();

    assert_eq!(first, second);
}

// =============================================================================
// Loop
// =============================================================================

#[tokio::test]
async fn test_run_once_returns_after_single_pass() {
    let queue = Arc::new(FakeQueue::with_demand(1, 0));
    let compute = Arc::new(FakeCompute::with_live(0));
    let (reconciler, sleeper) = reconciler(test_config(), queue.clone(), compute.clone());
    let (_shutdown_tx, shutdown_rx) = watch::channel(false);

    reconciler.run(shutdown_rx).await.unwrap();

    assert_eq!(queue.metrics_calls(), 1);
    assert_eq!(compute.launch_count(), 1);
    assert!(sleeper.slept.lock().unwrap().is_empty());
}

#[tokio::test]
async fn test_run_once_reports_failed_pass() {
    let queue = Arc::new(FakeQueue {
        fail_metrics: true,
        ..FakeQueue::default()
    });
    let compute = Arc::new(FakeCompute::default());
    let (reconciler, _) = reconciler(test_config(), queue, compute);
    let (_shutdown_tx, shutdown_rx) = watch::channel(false);

    let err = reconciler.run(shutdown_rx).await.unwrap_err();
    assert!(matches!(err, ScalerError::Demand(_)));
}

#[tokio::test]
async fn test_loop_survives_failed_ticks_until_shutdown() {
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let queue = Arc::new(FakeQueue {
        fail_metrics: true,
        shutdown_after: Some((3, shutdown_tx)),
        ..FakeQueue::default()
    });
    let compute = Arc::new(FakeCompute::default());
    let config = ReconcileConfig {
        poll_interval: Some(Duration::from_secs(30)),
        ..test_config()
    };
    let (reconciler, sleeper) = reconciler(config, queue.clone(), compute);

    let err = reconciler.run(shutdown_rx).await.unwrap_err();

    assert!(matches!(err, ScalerError::Cancelled));
    assert_eq!(queue.metrics_calls(), 3);
    let slept = sleeper.slept.lock().unwrap();
    assert!(slept.len() >= 2);
    assert!(slept.iter().all(|d| *d == Duration::from_secs(30)));
}

#[tokio::test]
async fn test_shutdown_interrupts_in_flight_tick() {
    let queue = Arc::new(FakeQueue::with_demand(3, 0));
    let compute = Arc::new(FakeCompute {
        hang_launches: true,
        ..FakeCompute::with_live(0)
    });
    let config = ReconcileConfig {
        poll_interval: Some(Duration::from_secs(30)),
        ..test_config()
    };
    let (reconciler, _) = reconciler(config, queue, compute.clone());
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let (result, _) = tokio::time::timeout(Duration::from_secs(5), async {
        tokio::join!(reconciler.run(shutdown_rx), async {
            tokio::time::sleep(Duration::from_millis(100)).await;
            shutdown_tx.send(true).unwrap();
        })
    })
    .await
    .expect("shutdown did not interrupt the tick");

    assert!(matches!(result, Err(ScalerError::Cancelled)));
    assert_eq!(compute.launch_count(), 1);
}

#[tokio::test]
async fn test_run_stops_before_first_tick_when_already_cancelled() {
    let queue = Arc::new(FakeQueue::with_demand(1, 0));
    let compute = Arc::new(FakeCompute::default());
    let config = ReconcileConfig {
        poll_interval: Some(Duration::from_secs(30)),
        ..test_config()
    };
    let (reconciler, _) = reconciler(config, queue.clone(), compute);
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    shutdown_tx.send(true).unwrap();

    let err = reconciler.run(shutdown_rx).await.unwrap_err();

    assert!(matches!(err, ScalerError::Cancelled));
    assert_eq!(queue.metrics_calls(), 0);
}
