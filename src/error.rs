//! Engine error types and error codes.

use thiserror::Error;

// ── Error codes (stable, exposed to host applications) ──────────────────────

pub const SUCCESS: i32 = 0;
pub const ERROR_INVALID_PARAM: i32 = -1;
pub const ERROR_ALREADY_CONNECTED: i32 = -3;
pub const ERROR_INTERNAL: i32 = -5;
pub const ERROR_CONFIG: i32 = -8;
pub const ERROR_VPN: i32 = -10;
pub const ERROR_NO_CONNECTIVITY: i32 = -11;
pub const ERROR_NO_SERVERS: i32 = -12;
pub const ERROR_EXHAUSTED: i32 = -13;
pub const ERROR_CANCELLED: i32 = -14;

// ── SdkError enum ───────────────────────────────────────────────────────────

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum SdkError {
    /// The candidate feed could not be fetched or contained no usable rows.
    #[error("No servers available: {0}")]
    FeedFetch(String),

    #[error("No internet connection")]
    NoConnectivity,

    /// The tunnel subsystem reported an error for the current attempt.
    #[error("{0}")]
    Tunnel(String),

    #[error("Connection to {0} timed out")]
    TunnelTimeout(String),

    /// Terminal: retry budget spent or no candidate left to try.
    #[error("Connection failed: {last_error}")]
    AllCandidatesExhausted { last_error: String },

    #[error("Connection cancelled")]
    Cancelled,

    #[error("Already connected")]
    AlreadyConnected,

    #[error("Connection in progress")]
    ConnectionInProgress,

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Configuration error: {0}")]
    Config(String),

    /// A collaborator refused the request itself (bad credentials format,
    /// unsupported host). Never retried on another server.
    #[error("Invalid parameter: {0}")]
    InvalidParam(String),
}

impl SdkError {
    /// Map this error to its integer error code.
    pub fn code(&self) -> i32 {
        match self {
            SdkError::FeedFetch(_) => ERROR_NO_SERVERS,
            SdkError::NoConnectivity => ERROR_NO_CONNECTIVITY,
            SdkError::Tunnel(_) | SdkError::TunnelTimeout(_) => ERROR_VPN,
            SdkError::AllCandidatesExhausted { .. } => ERROR_EXHAUSTED,
            SdkError::Cancelled => ERROR_CANCELLED,
            SdkError::AlreadyConnected | SdkError::ConnectionInProgress => ERROR_ALREADY_CONNECTED,
            SdkError::Storage(_) => ERROR_INTERNAL,
            SdkError::Config(_) => ERROR_CONFIG,
            SdkError::InvalidParam(_) => ERROR_INVALID_PARAM,
        }
    }

    /// Failures of a single tunnel attempt, which failover may retry.
    pub fn is_retryable(&self) -> bool {
        matches!(self, SdkError::Tunnel(_) | SdkError::TunnelTimeout(_))
    }
}

impl From<serde_json::Error> for SdkError {
    fn from(e: serde_json::Error) -> Self {
        SdkError::Storage(format!("JSON error: {}", e))
    }
}

impl From<std::io::Error> for SdkError {
    fn from(e: std::io::Error) -> Self {
        SdkError::Storage(e.to_string())
    }
}
