//! Error types for the autoscaler.

use thiserror::Error;

use crate::teardown::TeardownError;
use crate::waiter::OperationError;

/// Errors returned by the queue and compute API clients.
#[derive(Debug, Error)]
pub enum ApiError {
    /// The HTTP client could not be built.
    #[error("failed to build HTTP client: {0}")]
    Client(#[source] reqwest::Error),

    /// The request never produced a response.
    #[error("network error: {0}")]
    Network(#[from] reqwest::Error),

    /// The API answered with a non-success status.
    #[error("API returned {status}: {body}")]
    Status { status: u16, body: String },

    /// Credentials are missing, invalid or could not be obtained.
    #[error("authentication failed: {0}")]
    Auth(String),

    /// The response body did not match the expected shape.
    #[error("unexpected response: {0}")]
    Decode(String),

    /// Any other backend failure.
    #[error("{0}")]
    Backend(String),
}

impl ApiError {
    /// Returns true if the API rejected our credentials.
    pub fn is_auth(&self) -> bool {
        match self {
            Self::Auth(_) => true,
            Self::Status { status, .. } => *status == 401 || *status == 403,
            _ => false,
        }
    }
}

/// A single launch or destroy that did not complete.
#[derive(Debug, Error)]
pub enum ActionError {
    /// The launch or destroy request itself was rejected.
    #[error("request failed: {0}")]
    Request(#[from] ApiError),

    /// The request was accepted but the remote operation did not succeed.
    #[error(transparent)]
    Operation(#[from] OperationError),
}

/// Why a reconciliation tick (or the loop) stopped.
#[derive(Debug, Error)]
pub enum ScalerError {
    #[error("failed to read queue demand: {0}")]
    Demand(#[source] ApiError),

    #[error("failed to count live instances: {0}")]
    Capacity(#[source] ApiError),

    #[error("failed to list idle agents: {0}")]
    IdleAgents(#[source] ApiError),

    #[error("failed to stop idle agents: {0}")]
    StopAgents(#[source] ApiError),

    #[error("launch {attempt} of {required} failed: {source}")]
    Launch {
        attempt: u64,
        required: u64,
        #[source]
        source: ActionError,
    },

    #[error(transparent)]
    Teardown(#[from] TeardownError),

    #[error("reconciliation cancelled")]
    Cancelled,
}

/// Invalid or incomplete configuration.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("{0} must not be empty")]
    Empty(&'static str),

    #[error("{0} must be greater than zero")]
    Zero(&'static str),
}
