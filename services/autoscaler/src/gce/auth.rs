//! Access tokens for the Compute Engine API.

use std::time::{Duration, Instant};

use reqwest::header::{HeaderValue, AUTHORIZATION};
use serde::Deserialize;
use tokio::sync::Mutex;
use tracing::debug;

use crate::error::ApiError;

/// Default metadata server token endpoint for the instance's service account.
pub const DEFAULT_METADATA_TOKEN_URL: &str =
    "http://metadata.google.internal/computeMetadata/v1/instance/service-accounts/default/token";

/// Refresh tokens this long before they expire.
const REFRESH_MARGIN: Duration = Duration::from_secs(60);

/// Where access tokens come from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TokenSource {
    /// A fixed token supplied by the operator.
    Static(String),

    /// The GCE metadata server.
    Metadata { url: String },
}

impl Default for TokenSource {
    fn default() -> Self {
        Self::Metadata {
            url: DEFAULT_METADATA_TOKEN_URL.to_string(),
        }
    }
}

#[derive(Debug, Deserialize)]
struct MetadataToken {
    access_token: String,
    #[serde(default)]
    expires_in: u64,
}

#[derive(Debug, Clone)]
struct CachedToken {
    header: HeaderValue,
    refresh_at: Option<Instant>,
}

/// Hands out `Authorization` headers, refreshing metadata tokens on expiry.
#[derive(Debug)]
pub struct TokenProvider {
    source: TokenSource,
    client: reqwest::Client,
    cached: Mutex<Option<CachedToken>>,
}

impl TokenProvider {
    pub fn new(source: TokenSource, client: reqwest::Client) -> Self {
        Self {
            source,
            client,
            cached: Mutex::new(None),
        }
    }

    /// Current `Authorization` header value.
    pub async fn authorization(&self) -> Result<HeaderValue, ApiError> {
        let mut cached = self.cached.lock().await;

        if let Some(token) = cached.as_ref() {
            let fresh = token.refresh_at.map_or(true, |at| Instant::now() < at);
            if fresh {
                return Ok(token.header.clone());
            }
        }

        let token = self.fetch().await?;
        let header = token.header.clone();
        *cached = Some(token);
        Ok(header)
    }

    async fn fetch(&self) -> Result<CachedToken, ApiError> {
        match &self.source {
            TokenSource::Static(token) => Ok(CachedToken {
                header: bearer(token)?,
                refresh_at: None,
            }),
            TokenSource::Metadata { url } => {
                debug!(url = %url, "Fetching access token from metadata server");
                let response = self
                    .client
                    .get(url)
                    .header("Metadata-Flavor", "Google")
                    .send()
                    .await
                    .map_err(|e| ApiError::Auth(format!("metadata server unreachable: {e}")))?;

                if !response.status().is_success() {
                    return Err(ApiError::Auth(format!(
                        "metadata server returned {}",
                        response.status()
                    )));
                }

                let token: MetadataToken = response
                    .json()
                    .await
                    .map_err(|e| ApiError::Auth(format!("invalid token response: {e}")))?;

                let lifetime = Duration::from_secs(token.expires_in);
                Ok(CachedToken {
                    header: bearer(&token.access_token)?,
                    refresh_at: Some(Instant::now() + lifetime.saturating_sub(REFRESH_MARGIN)),
                })
            }
        }
    }
}

/// Attach the current token to a request.
pub async fn authorize(
    request: reqwest::RequestBuilder,
    tokens: &TokenProvider,
) -> Result<reqwest::RequestBuilder, ApiError> {
    Ok(request.header(AUTHORIZATION, tokens.authorization().await?))
}

fn bearer(token: &str) -> Result<HeaderValue, ApiError> {
    HeaderValue::from_str(&format!("Bearer {token}"))
        .map_err(|_| ApiError::Auth("access token is not a valid header value".to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_static_token() {
        let provider = TokenProvider::new(
            TokenSource::Static("ya29.static".to_string()),
            reqwest::Client::new(),
        );
        let header = provider.authorization().await.unwrap();
        assert_eq!(header.to_str().unwrap(), "Bearer ya29.static");
    }

    #[tokio::test]
    async fn test_invalid_static_token() {
        let provider = TokenProvider::new(
            TokenSource::Static("bad\ntoken".to_string()),
            reqwest::Client::new(),
        );
        assert!(provider.authorization().await.unwrap_err().is_auth());
    }
}
