//! Configuration for the autoscaler.
//!
//! Every option can be given as a flag or through the environment.

use std::time::Duration;

use bkscale_reconcile::NameMapping;
use clap::{Parser, ValueEnum};

use crate::buildkite::{BuildkiteConfig, DEFAULT_AGENT_ENDPOINT, DEFAULT_API_ENDPOINT};
use crate::error::ConfigError;
use crate::gce::auth::{TokenSource, DEFAULT_METADATA_TOKEN_URL};
use crate::gce::{GceConfig, DEFAULT_COMPUTE_ENDPOINT};
use crate::reconciler::ReconcileConfig;

/// Log output format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum LogFormat {
    Json,
    Text,
}

/// bkscale - size a GCE instance group to a Buildkite queue.
#[derive(Debug, Clone, Parser)]
#[command(name = "bkscale", author, version, about, long_about = None)]
pub struct Cli {
    /// GCP project that owns the instance group.
    #[arg(long, env = "GCP_PROJECT")]
    pub gcp_project: String,

    /// Zone of the instance group.
    #[arg(long, env = "GCP_ZONE")]
    pub gcp_zone: String,

    /// Unmanaged instance group holding the agents.
    #[arg(long, env = "INSTANCE_GROUP_NAME")]
    pub instance_group: String,

    /// Instance template new agents are created from.
    #[arg(long, env = "INSTANCE_GROUP_TEMPLATE")]
    pub instance_template: String,

    /// Buildkite queue to watch.
    #[arg(long, env = "BUILDKITE_QUEUE", default_value = "default")]
    pub buildkite_queue: String,

    /// Buildkite agent token (queue metrics).
    #[arg(long, env = "BUILDKITE_AGENT_TOKEN", hide_env_values = true)]
    pub buildkite_agent_token: String,

    /// Buildkite API token (listing and stopping agents).
    #[arg(long, env = "BUILDKITE_API_TOKEN", hide_env_values = true)]
    pub buildkite_api_token: String,

    /// Buildkite organization slug.
    #[arg(long, env = "BUILDKITE_ORG")]
    pub buildkite_org: String,

    /// Reclaim agents idle for longer than this (e.g. "10m"). Unset disables reclaim.
    #[arg(long, env = "IDLE_TIMEOUT", value_parser = humantime::parse_duration)]
    pub idle_timeout: Option<Duration>,

    /// Reconcile every interval (e.g. "30s"). Unset runs a single pass.
    #[arg(long, env = "POLL_INTERVAL", value_parser = humantime::parse_duration)]
    pub poll_interval: Option<Duration>,

    /// Separator between the instance name and the agent suffix.
    #[arg(long, env = "WORKER_NAME_SEPARATOR", default_value_t = bkscale_reconcile::DEFAULT_NAME_SEPARATOR)]
    pub worker_name_separator: char,

    /// Use agent names verbatim as instance names.
    #[arg(long)]
    pub no_strip_worker_suffix: bool,

    /// Maximum destroys in flight at once. Unset destroys all at once.
    #[arg(long, env = "MAX_CONCURRENT_DESTROYS")]
    pub max_concurrent_destroys: Option<usize>,

    /// Per-request timeout for API calls.
    #[arg(long, env = "HTTP_TIMEOUT", value_parser = humantime::parse_duration, default_value = "30s")]
    pub http_timeout: Duration,

    /// Static GCE access token. Unset uses the metadata server.
    #[arg(long, env = "GCE_ACCESS_TOKEN", hide_env_values = true)]
    pub gce_access_token: Option<String>,

    /// Metadata server token endpoint.
    #[arg(long, env = "GCE_METADATA_TOKEN_URL", default_value = DEFAULT_METADATA_TOKEN_URL)]
    pub gce_metadata_token_url: String,

    /// Compute Engine API endpoint.
    #[arg(long, env = "GCE_ENDPOINT", default_value = DEFAULT_COMPUTE_ENDPOINT)]
    pub gce_endpoint: String,

    /// Buildkite agent metrics API endpoint.
    #[arg(long, env = "BUILDKITE_AGENT_ENDPOINT", default_value = DEFAULT_AGENT_ENDPOINT)]
    pub buildkite_agent_endpoint: String,

    /// Buildkite REST API endpoint.
    #[arg(long, env = "BUILDKITE_API_ENDPOINT", default_value = DEFAULT_API_ENDPOINT)]
    pub buildkite_api_endpoint: String,

    /// Log filter used when RUST_LOG is unset.
    #[arg(long, env = "LOG_LEVEL", default_value = "info")]
    pub log_level: String,

    /// Log output format.
    #[arg(long, env = "LOG_FORMAT", value_enum, default_value_t = LogFormat::Json)]
    pub log_format: LogFormat,
}

/// Logging settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogConfig {
    pub level: String,
    pub format: LogFormat,
}

/// Validated settings for every component.
#[derive(Debug, Clone)]
pub struct Settings {
    pub reconcile: ReconcileConfig,
    pub buildkite: BuildkiteConfig,
    pub gce: GceConfig,
    pub log: LogConfig,
}

impl Cli {
    /// Validate the parsed options and split them per component.
    pub fn into_settings(self) -> Result<Settings, ConfigError> {
        non_empty("gcp-project", &self.gcp_project)?;
        non_empty("gcp-zone", &self.gcp_zone)?;
        non_empty("instance-group", &self.instance_group)?;
        non_empty("instance-template", &self.instance_template)?;
        non_empty("buildkite-queue", &self.buildkite_queue)?;
        non_empty("buildkite-agent-token", &self.buildkite_agent_token)?;
        non_empty("buildkite-api-token", &self.buildkite_api_token)?;
        non_empty("buildkite-org", &self.buildkite_org)?;
        non_zero("idle-timeout", self.idle_timeout)?;
        non_zero("poll-interval", self.poll_interval)?;
        non_zero("http-timeout", Some(self.http_timeout))?;
        if self.max_concurrent_destroys == Some(0) {
            return Err(ConfigError::Zero("max-concurrent-destroys"));
        }

        let name_mapping = if self.no_strip_worker_suffix {
            NameMapping::Verbatim
        } else {
            NameMapping::StripSuffix {
                separator: self.worker_name_separator,
            }
        };

        let token_source = match self.gce_access_token.filter(|t| !t.is_empty()) {
            Some(token) => TokenSource::Static(token),
            None => TokenSource::Metadata {
                url: self.gce_metadata_token_url,
            },
        };

        Ok(Settings {
            reconcile: ReconcileConfig {
                project: self.gcp_project,
                zone: self.gcp_zone,
                group: self.instance_group,
                template: self.instance_template,
                queue: self.buildkite_queue.clone(),
                idle_timeout: self.idle_timeout,
                poll_interval: self.poll_interval,
                name_mapping,
                max_concurrent_destroys: self.max_concurrent_destroys,
            },
            buildkite: BuildkiteConfig {
                agent_endpoint: self.buildkite_agent_endpoint,
                api_endpoint: self.buildkite_api_endpoint,
                agent_token: self.buildkite_agent_token,
                api_token: self.buildkite_api_token,
                org: self.buildkite_org,
                queue: self.buildkite_queue,
                idle_timeout: self.idle_timeout,
                timeout: self.http_timeout,
            },
            gce: GceConfig {
                endpoint: self.gce_endpoint,
                token_source,
                timeout: self.http_timeout,
            },
            log: LogConfig {
                level: self.log_level,
                format: self.log_format,
            },
        })
    }
}

fn non_empty(name: &'static str, value: &str) -> Result<(), ConfigError> {
    if value.trim().is_empty() {
        return Err(ConfigError::Empty(name));
    }
    Ok(())
}

fn non_zero(name: &'static str, value: Option<Duration>) -> Result<(), ConfigError> {
    match value {
        Some(d) if d.is_zero() => Err(ConfigError::Zero(name)),
        _ => Ok(()),
    }
}
