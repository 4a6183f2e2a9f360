//! Error types for rate limiting.

use std::time::Duration;

/// Errors that can occur during rate limiting.
#[derive(Debug, thiserror::Error)]
pub enum RateLimitError {
    /// The credential's bucket is empty.
    #[error("Rate limit exceeded for credential {credential}")]
    CredentialLimitExceeded {
        /// Id of the credential that exceeded its limit.
        credential: String,
        /// Time to wait before retrying.
        retry_after: Duration,
    },
}

impl RateLimitError {
    /// Get the retry-after duration.
    pub fn retry_after(&self) -> Duration {
        match self {
            Self::CredentialLimitExceeded { retry_after, .. } => *retry_after,
        }
    }
}
