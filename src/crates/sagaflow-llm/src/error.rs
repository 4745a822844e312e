//! Error types for chat-client operations

use thiserror::Error;

pub type Result<T> = std::result::Result<T, LlmError>;

/// Failures surfaced by chat clients
///
/// Step implementations map these onto workflow error kinds so the retry
/// policy can classify them: rate limits and transport failures are
/// transient, configuration problems are not.
#[derive(Debug, Error)]
pub enum LlmError {
    #[error("request failed: {0}")]
    Request(String),

    #[error("rate limited: {0}")]
    RateLimited(String),

    #[error("provider returned status {status}: {body}")]
    Status { status: u16, body: String },

    #[error("malformed provider response: {0}")]
    MalformedResponse(String),

    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("request cancelled")]
    Cancelled,
}

impl From<reqwest::Error> for LlmError {
    fn from(err: reqwest::Error) -> Self {
        LlmError::Request(err.to_string())
    }
}

impl LlmError {
    /// Whether a retry with backoff is worthwhile
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            LlmError::Request(_) | LlmError::RateLimited(_) | LlmError::Status { status: 502..=504 | 429, .. }
        )
    }
}
