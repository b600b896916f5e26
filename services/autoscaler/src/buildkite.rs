//! Buildkite API client: queue metrics and agent pool.
//!
//! Two APIs are involved:
//! - the agent metrics API (agent token) for scheduled and running job counts
//! - the REST API (API token) for listing and stopping agents

use std::time::Duration;

use async_trait::async_trait;
use bkscale_reconcile::DemandSnapshot;
use chrono::{DateTime, Utc};
use reqwest::header::{HeaderValue, AUTHORIZATION};
use serde::{Deserialize, Serialize};
use tracing::{debug, error};

use crate::error::ApiError;
use crate::ports::DemandSource;

/// Default agent metrics API endpoint.
pub const DEFAULT_AGENT_ENDPOINT: &str = "https://agent.buildkite.com/v3";

/// Default REST API endpoint.
pub const DEFAULT_API_ENDPOINT: &str = "https://api.buildkite.com/v2";

const AGENTS_PAGE_SIZE: usize = 100;

/// Buildkite client configuration.
#[derive(Debug, Clone)]
pub struct BuildkiteConfig {
    /// Agent metrics API base URL.
    pub agent_endpoint: String,

    /// REST API base URL.
    pub api_endpoint: String,

    /// Agent registration token, used for queue metrics.
    pub agent_token: String,

    /// REST API access token, used for agents.
    pub api_token: String,

    /// Organization slug.
    pub org: String,

    /// Queue the agent pool is filtered by.
    pub queue: String,

    /// Idle time after which an agent counts as idle. `None` means never.
    pub idle_timeout: Option<Duration>,

    /// Per-request timeout.
    pub timeout: Duration,
}

/// Buildkite API client.
pub struct BuildkiteClient {
    client: reqwest::Client,
    config: BuildkiteConfig,
}

impl BuildkiteClient {
    /// Create a new Buildkite client.
    pub fn new(config: BuildkiteConfig) -> Result<Self, ApiError> {
        let client = reqwest::Client::builder()
            .timeout(config.timeout)
            .build()
            .map_err(ApiError::Client)?;

        Ok(Self { client, config })
    }

    /// Fetch job metrics for a queue.
    pub async fn agent_metrics(&self, queue: &str) -> Result<AgentMetrics, ApiError> {
        let url = format!(
            "{}/metrics/queue",
            self.config.agent_endpoint.trim_end_matches('/')
        );
        debug!(url = %url, queue, "Fetching queue metrics");

        let response = self
            .client
            .get(&url)
            .query(&[("name", queue)])
            .header(
                AUTHORIZATION,
                header_value(&format!("Token {}", self.config.agent_token))?,
            )
            .send()
            .await?;

        let response = check_status(response, "fetch queue metrics").await?;
        let metrics: AgentMetrics = response
            .json()
            .await
            .map_err(|e| ApiError::Decode(e.to_string()))?;

        debug!(
            scheduled = metrics.jobs.scheduled,
            running = metrics.jobs.running,
            "Fetched queue metrics"
        );
        Ok(metrics)
    }

    /// List every agent in the organization.
    pub async fn list_agents(&self) -> Result<Vec<Agent>, ApiError> {
        let url = format!(
            "{}/organizations/{}/agents",
            self.config.api_endpoint.trim_end_matches('/'),
            self.config.org
        );

        let mut agents = Vec::new();
        for page in 1.. {
            let response = self
                .client
                .get(&url)
                .query(&[("page", page), ("per_page", AGENTS_PAGE_SIZE)])
                .header(AUTHORIZATION, self.bearer()?)
                .send()
                .await?;

            let response = check_status(response, "list agents").await?;
            let batch: Vec<Agent> = response
                .json()
                .await
                .map_err(|e| ApiError::Decode(e.to_string()))?;

            let last_page = batch.len() < AGENTS_PAGE_SIZE;
            agents.extend(batch);
            if last_page {
                break;
            }
        }

        debug!(count = agents.len(), "Listed agents");
        Ok(agents)
    }

    /// Stop an agent, abandoning any job it is running.
    pub async fn stop_agent(&self, agent_id: &str) -> Result<(), ApiError> {
        let url = format!(
            "{}/organizations/{}/agents/{}/stop",
            self.config.api_endpoint.trim_end_matches('/'),
            self.config.org,
            agent_id
        );

        let response = self
            .client
            .put(&url)
            .header(AUTHORIZATION, self.bearer()?)
            .json(&StopAgentRequest { force: true })
            .send()
            .await?;

        check_status(response, "stop agent").await?;
        Ok(())
    }

    fn bearer(&self) -> Result<HeaderValue, ApiError> {
        header_value(&format!("Bearer {}", self.config.api_token))
    }
}

#[async_trait]
impl DemandSource for BuildkiteClient {
    async fn get_metrics(&self, queue: &str) -> Result<DemandSnapshot, ApiError> {
        let metrics = self.agent_metrics(queue).await?;
        Ok(DemandSnapshot::new(metrics.jobs.scheduled, metrics.jobs.running))
    }

    async fn get_idle_agents(&self) -> Result<Vec<String>, ApiError> {
        let Some(idle_timeout) = self.config.idle_timeout else {
            return Ok(Vec::new());
        };

        let agents = self.list_agents().await?;
        Ok(idle_agents(
            &agents,
            &self.config.queue,
            idle_timeout,
            Utc::now(),
        ))
    }

    async fn stop_agents(&self, names: &[String]) -> Result<(), ApiError> {
        let agents = self.list_agents().await?;

        for agent in agents.iter().filter(|a| names.contains(&a.name)) {
            debug!(agent = %agent.name, id = %agent.id, "Stopping agent");
            if let Err(e) = self.stop_agent(&agent.id).await {
                error!(agent = %agent.name, error = %e, "Failed to stop agent");
                return Err(e);
            }
        }

        Ok(())
    }
}

/// Names of agents on `queue` that have no job and finished their last job
/// more than `idle_timeout` before `now`.
///
/// Agents that never ran a job are left alone.
pub fn idle_agents(
    agents: &[Agent],
    queue: &str,
    idle_timeout: Duration,
    now: DateTime<Utc>,
) -> Vec<String> {
    agents
        .iter()
        .filter(|agent| agent.serves_queue(queue))
        .filter(|agent| agent.job.is_none())
        .filter(|agent| match agent.last_job_finished_at {
            Some(finished) => matches!(
                now.signed_duration_since(finished).to_std(),
                Ok(idle) if idle > idle_timeout
            ),
            None => false,
        })
        .map(|agent| {
            debug!(
                agent = %agent.name,
                idle_timeout_secs = idle_timeout.as_secs(),
                "Agent idle past timeout"
            );
            agent.name.clone()
        })
        .collect()
}

async fn check_status(
    response: reqwest::Response,
    action: &str,
) -> Result<reqwest::Response, ApiError> {
    if response.status().is_success() {
        return Ok(response);
    }

    let status = response.status();
    let body = response.text().await.unwrap_or_default();
    error!(status = %status, body = %body, "Failed to {action}");
    Err(ApiError::Status {
        status: status.as_u16(),
        body,
    })
}

fn header_value(value: &str) -> Result<HeaderValue, ApiError> {
    HeaderValue::from_str(value)
        .map_err(|_| ApiError::Auth("token is not a valid header value".to_string()))
}

/// Response of the queue metrics endpoint.
#[derive(Debug, Clone, Deserialize)]
pub struct AgentMetrics {
    pub jobs: JobMetrics,
}

/// Job counts for a queue.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct JobMetrics {
    #[serde(default)]
    pub scheduled: u64,
    #[serde(default)]
    pub running: u64,
}

/// An agent as returned by the REST API.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Agent {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub meta_data: Vec<String>,
    #[serde(default)]
    pub job: Option<serde_json::Value>,
    #[serde(default)]
    pub last_job_finished_at: Option<DateTime<Utc>>,
}

impl Agent {
    /// Returns true if the agent's tags place it on `queue`.
    ///
    /// The tag must equal `queue=<queue>` exactly; a substring match would put
    /// agents of `ci-large` on `ci`.
    pub fn serves_queue(&self, queue: &str) -> bool {
        let tag = format!("queue={queue}");
        self.meta_data.iter().any(|t| *t == tag)
    }
}

#[derive(Debug, Serialize)]
struct StopAgentRequest {
    force: bool,
}
