//! Demand versus capacity decision policy.

/// Queue demand observed at the start of a tick.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DemandSnapshot {
    /// Jobs waiting for an agent.
    pub scheduled_jobs: u64,

    /// Jobs currently assigned to an agent.
    pub running_jobs: u64,
}

impl DemandSnapshot {
    /// Create a snapshot from scheduled and running job counts.
    pub fn new(scheduled_jobs: u64, running_jobs: u64) -> Self {
        Self {
            scheduled_jobs,
            running_jobs,
        }
    }

    /// Number of workers needed to serve every scheduled and running job.
    pub fn total_required(&self) -> u64 {
        self.scheduled_jobs.saturating_add(self.running_jobs)
    }
}

/// The single action a tick takes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScaleDecision {
    /// Launch this many instances, one after another.
    ScaleUp { required: u64 },

    /// Capacity covers demand; reclaim workers idle past the timeout.
    ReclaimIdle,

    /// Capacity covers demand and reclaim is disabled.
    Hold,
}

impl ScaleDecision {
    /// Number of launches this decision issues.
    pub fn launches(&self) -> u64 {
        match self {
            Self::ScaleUp { required } => *required,
            Self::ReclaimIdle | Self::Hold => 0,
        }
    }
}

/// Decide what a tick should do.
///
/// `live` is the number of instances provisioning or running in the target
/// group. Both inputs are read once per tick and must not be re-read while
/// acting on the decision.
pub fn decide(demand: &DemandSnapshot, live: u64, reclaim_enabled: bool) -> ScaleDecision {
    let total = demand.total_required();

    if live >= total {
        return if reclaim_enabled {
            ScaleDecision::ReclaimIdle
        } else {
            ScaleDecision::Hold
        };
    }

    ScaleDecision::ScaleUp {
        required: total - live,
    }
}
