//! Request outcome records

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;

/// HTTP status returned by an admission-controlled target
pub const STATUS_TOO_MANY_REQUESTS: u16 = 429;

/// Result of a single request, immutable once recorded
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestOutcome {
    /// Path the request was issued against
    pub endpoint: Arc<str>,
    /// HTTP status, `None` for a transport failure
    pub status: Option<u16>,
    /// Send to full response (or failure)
    pub latency: Duration,
    /// Response body size
    pub bytes: u64,
    /// Offset from run start at which the request was sent
    pub sent_at: Duration,
}

/// Classification used for error accounting
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutcomeClass {
    /// 2xx response
    Success,
    /// 429 response
    RateLimited,
    /// Any other HTTP status
    HttpError,
    /// Timeout, refused connection, DNS failure
    TransportError,
}

impl OutcomeClass {
    pub fn from_status(status: Option<u16>) -> Self {
        match status {
            None => OutcomeClass::TransportError,
            Some(code) if (200..300).contains(&code) => OutcomeClass::Success,
            Some(STATUS_TOO_MANY_REQUESTS) => OutcomeClass::RateLimited,
            Some(_) => OutcomeClass::HttpError,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            OutcomeClass::Success => "success",
            OutcomeClass::RateLimited => "rate_limited",
            OutcomeClass::HttpError => "http_error",
            OutcomeClass::TransportError => "transport_error",
        }
    }

    /// Everything except a 2xx counts toward the error rate
    pub fn is_failure(&self) -> bool {
        !matches!(self, OutcomeClass::Success)
    }
}

impl RequestOutcome {
    pub fn class(&self) -> OutcomeClass {
        OutcomeClass::from_status(self.status)
    }

    /// Offset from run start at which the response completed
    pub fn completed_at(&self) -> Duration {
        self.sent_at + self.latency
    }
}
