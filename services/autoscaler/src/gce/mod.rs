//! Compute Engine client for an unmanaged zonal instance group.
//!
//! - `api`: REST wire types
//! - `auth`: access tokens (static or metadata server)

pub mod api;
pub mod auth;

use std::time::Duration;

use async_trait::async_trait;
use rand::Rng;
use tracing::{debug, info};

use crate::error::ApiError;
use crate::ports::{ComputeCapacity, OperationHandle, OperationStatus};

use self::api::{
    AddInstancesRequest, InsertInstanceRequest, InstanceGroupsListInstances, InstanceReference,
    ListInstancesRequest, Operation,
};
use self::auth::{authorize, TokenProvider, TokenSource};

/// Default Compute Engine v1 endpoint.
pub const DEFAULT_COMPUTE_ENDPOINT: &str = "https://compute.googleapis.com/compute/v1";

/// Compute client configuration.
#[derive(Debug, Clone)]
pub struct GceConfig {
    /// API base URL.
    pub endpoint: String,

    /// Where access tokens come from.
    pub token_source: TokenSource,

    /// Per-request timeout.
    pub timeout: Duration,
}

impl Default for GceConfig {
    fn default() -> Self {
        Self {
            endpoint: DEFAULT_COMPUTE_ENDPOINT.to_string(),
            token_source: TokenSource::default(),
            timeout: Duration::from_secs(30),
        }
    }
}

/// Compute Engine API client.
pub struct GceClient {
    client: reqwest::Client,
    endpoint: String,
    tokens: TokenProvider,
}

impl GceClient {
    /// Build the client and obtain an initial access token.
    ///
    /// Fails if the HTTP client cannot be built or no token can be obtained;
    /// there is nothing useful to do without the compute API.
    pub async fn connect(config: GceConfig) -> Result<Self, ApiError> {
        let client = reqwest::Client::builder()
            .timeout(config.timeout)
            .build()
            .map_err(ApiError::Client)?;

        let tokens = TokenProvider::new(config.token_source, client.clone());
        tokens.authorization().await?;

        Ok(Self {
            client,
            endpoint: config.endpoint.trim_end_matches('/').to_string(),
            tokens,
        })
    }

    fn zone_url(&self, project: &str, zone: &str, path: &str) -> String {
        format!(
            "{}/projects/{}/zones/{}/{}",
            self.endpoint, project, zone, path
        )
    }

    async fn send(&self, request: reqwest::RequestBuilder) -> Result<reqwest::Response, ApiError> {
        let response = authorize(request, &self.tokens).await?.send().await?;

        if response.status().is_success() {
            return Ok(response);
        }

        let status = response.status().as_u16();
        let body = response.text().await.unwrap_or_default();
        Err(ApiError::Status { status, body })
    }

    async fn send_operation(&self, request: reqwest::RequestBuilder) -> Result<Operation, ApiError> {
        self.send(request)
            .await?
            .json()
            .await
            .map_err(|e| ApiError::Decode(e.to_string()))
    }
}

#[async_trait]
impl ComputeCapacity for GceClient {
    async fn live_instance_count(
        &self,
        project: &str,
        zone: &str,
        group: &str,
    ) -> Result<u64, ApiError> {
        let url = self.zone_url(project, zone, &format!("instanceGroups/{group}/listInstances"));
        let body = ListInstancesRequest {
            instance_state: "ALL",
        };

        let mut live = 0u64;
        let mut page_token: Option<String> = None;
        loop {
            let mut request = self.client.post(&url).json(&body);
            if let Some(token) = &page_token {
                request = request.query(&[("pageToken", token)]);
            }

            let page: InstanceGroupsListInstances = self
                .send(request)
                .await?
                .json()
                .await
                .map_err(|e| ApiError::Decode(e.to_string()))?;

            live += page.items.iter().filter(|i| i.is_live()).count() as u64;

            match page.next_page_token.filter(|t| !t.is_empty()) {
                Some(token) => page_token = Some(token),
                None => break,
            }
        }

        debug!(group, live, "Counted live instances");
        Ok(live)
    }

    async fn launch_instance_for_group(
        &self,
        project: &str,
        zone: &str,
        group: &str,
        template: &str,
    ) -> Result<OperationHandle, ApiError> {
        let name = instance_name(template);
        info!(name = %name, template, "Creating instance");

        let source_template = format!("projects/{project}/global/instanceTemplates/{template}");
        let insert = self
            .client
            .post(self.zone_url(project, zone, "instances"))
            .query(&[("sourceInstanceTemplate", source_template.as_str())])
            .json(&InsertInstanceRequest { name: name.clone() });
        let created = self.send_operation(insert).await?;

        let target_link = created.target_link.ok_or_else(|| {
            ApiError::Decode(format!("insert operation {} has no targetLink", created.name))
        })?;

        let add = self
            .client
            .post(self.zone_url(project, zone, &format!("instanceGroups/{group}/addInstances")))
            .json(&AddInstancesRequest {
                instances: vec![InstanceReference {
                    instance: target_link,
                }],
            });
        let added = self.send_operation(add).await?;

        debug!(name = %name, operation = %added.name, "Instance added to group");
        Ok(OperationHandle::new(added.name))
    }

    async fn destroy_instance(
        &self,
        project: &str,
        zone: &str,
        name: &str,
    ) -> Result<OperationHandle, ApiError> {
        info!(name, "Destroying instance");

        let request = self
            .client
            .delete(self.zone_url(project, zone, &format!("instances/{name}")));
        let deleted = self.send_operation(request).await?;
        Ok(OperationHandle::new(deleted.name))
    }

    async fn operation_status(
        &self,
        project: &str,
        zone: &str,
        operation: &OperationHandle,
    ) -> Result<OperationStatus, ApiError> {
        let request = self
            .client
            .get(self.zone_url(project, zone, &format!("operations/{operation}")));
        let op = self.send_operation(request).await?;
        debug!(operation = %op.name, status = %op.status, "Operation status");
        Ok(op.into())
    }
}

/// Name for a new instance: the template name plus a random 3-byte hex suffix.
pub fn instance_name(template: &str) -> String {
    let mut suffix = [0u8; 3];
    rand::rng().fill(&mut suffix);
    format!("{}-{}", template, hex::encode(suffix))
}
