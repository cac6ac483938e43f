//! Client for the workforce REST API.

pub mod auth;
pub mod client;
pub mod query;
pub mod rate_limit;
pub mod retry;
pub mod transport;

pub use auth::{Credentials, TokenCache};
pub use client::{ApiClient, Page};
pub use query::{date_windows, DateWindow, QueryParams};
pub use rate_limit::RateLimiter;
pub use retry::RetryPolicy;
pub use transport::{HttpRequest, HttpResponse, HttpTransport, ReqwestTransport, TransportError};

use crate::transform::Record;

pub const REGIONS: &str = "regions";
pub const EMPLOYEES: &str = "employees";
pub const CLIENTS: &str = "clients";
pub const POSITIONS: &str = "positions";
pub const SHIFTS: &str = "shifts";

#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("authentication failed: {reason}")]
    Authentication { reason: String },
    #[error("{endpoint} returned status {status}")]
    Status {
        endpoint: String,
        status: u16,
        body: String,
    },
    #[error("{endpoint} still failing after {attempts} attempts: {last}")]
    RetriesExhausted {
        endpoint: String,
        attempts: u32,
        #[source]
        last: Box<ApiError>,
    },
    #[error("transport failure calling {endpoint}: {source}")]
    Transport {
        endpoint: String,
        #[source]
        source: TransportError,
    },
    #[error("unexpected response from {endpoint}: {source}")]
    Decode {
        endpoint: String,
        #[source]
        source: serde_json::Error,
    },
    #[error("pagination of {endpoint} stalled: {reason}")]
    Pagination { endpoint: String, reason: String },
}

impl ApiError {
    pub fn is_authentication(&self) -> bool {
        matches!(self, ApiError::Authentication { .. })
    }

    pub fn status(&self) -> Option<u16> {
        match self {
            ApiError::Status { status, .. } => Some(*status),
            ApiError::RetriesExhausted { last, .. } => last.status(),
            _ => None,
        }
    }
}

/// Anything the orchestrator can pull raw records from.
pub trait RecordSource {
    fn authenticate(&self) -> Result<(), ApiError>;
    fn fetch_all(&self, endpoint: &str, params: &QueryParams) -> Result<Vec<Record>, ApiError>;
}
