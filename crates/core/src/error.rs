use serde::{Deserialize, Serialize};
use thiserror::Error;

pub type MediationResult<T> = Result<T, MediationError>;

/// Error taxonomy shared by every component. Anything raised below a
/// component boundary (transport failures, adapter panics, malformed JSON)
/// is mapped into exactly one of these variants before it crosses it.
#[derive(Error, Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "detail", rename_all = "snake_case")]
pub enum MediationError {
    #[error("no fill: {0}")]
    NoFill(String),

    #[error("timed out")]
    Timeout,

    #[error("network error: {0}")]
    NetworkError(String),

    #[error("rate limited (retry after {retry_after_secs:?}s)")]
    RateLimited { retry_after_secs: Option<u64> },

    #[error("client error: HTTP {0}")]
    ClientError(u16),

    #[error("server error: HTTP {0}")]
    ServerError(u16),

    #[error("circuit open ({remaining_cooldown_secs}s remaining)")]
    CircuitOpen { remaining_cooldown_secs: u64 },

    #[error("invalid configuration: {0}")]
    InvalidConfiguration(String),

    #[error("internal error: {0}")]
    InternalError(String),
}

impl MediationError {
    /// Classes retried locally under the backoff policy.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            MediationError::Timeout | MediationError::NetworkError(_) | MediationError::ServerError(_)
        )
    }

    pub fn is_no_fill(&self) -> bool {
        matches!(self, MediationError::NoFill(_))
    }

    /// Stable label for metrics and logs.
    pub fn class(&self) -> &'static str {
        match self {
            MediationError::NoFill(_) => "no_fill",
            MediationError::Timeout => "timeout",
            MediationError::NetworkError(_) => "network_error",
            MediationError::RateLimited { .. } => "rate_limited",
            MediationError::ClientError(_) => "client_error",
            MediationError::ServerError(_) => "server_error",
            MediationError::CircuitOpen { .. } => "circuit_open",
            MediationError::InvalidConfiguration(_) => "invalid_configuration",
            MediationError::InternalError(_) => "internal_error",
        }
    }

    pub fn cancelled() -> Self {
        MediationError::NetworkError(NAVIGATION_CANCELLED.to_string())
    }
}

/// Detail carried by redirects and caller-initiated cancellation.
pub const NAVIGATION_CANCELLED: &str = "navigation_cancelled";

impl From<serde_json::Error> for MediationError {
    fn from(err: serde_json::Error) -> Self {
        MediationError::InternalError(format!("json: {err}"))
    }
}

impl From<config::ConfigError> for MediationError {
    fn from(err: config::ConfigError) -> Self {
        MediationError::InvalidConfiguration(err.to_string())
    }
}
