use std::{fmt, time::Duration};

use axum::{
    Json,
    http::{HeaderValue, StatusCode, header::RETRY_AFTER},
    response::{IntoResponse, Response},
};
use serde::Serialize;
use serde_json::{Value, json};
use thiserror::Error;

use crate::protocol::WireFormat;

/// Failure categories surfaced to logs and metrics.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCategory {
    /// Upstream answered with a 4xx status.
    #[serde(rename = "provider_4xx")]
    Provider4xx,
    /// Upstream answered with a 5xx status.
    #[serde(rename = "provider_5xx")]
    Provider5xx,
    /// Overall or time-to-first-token timeout.
    Timeout,
    /// The connection failed after being established.
    NetworkError,
    /// The connection could not be established.
    ConnectError,
    /// The upstream stream broke or sent an error event.
    StreamError,
    /// Gateway-side failure, transform and script errors included.
    InternalError,
}

impl ErrorCategory {
    pub fn as_str(self) -> &'static str {
        match self {
            ErrorCategory::Provider4xx => "provider_4xx",
            ErrorCategory::Provider5xx => "provider_5xx",
            ErrorCategory::Timeout => "timeout",
            ErrorCategory::NetworkError => "network_error",
            ErrorCategory::ConnectError => "connect_error",
            ErrorCategory::StreamError => "stream_error",
            ErrorCategory::InternalError => "internal_error",
        }
    }

    /// Whether an outcome of this category counts against the provider's breaker.
    ///
    /// Client errors say something about the request, not the provider.
    pub fn trips_breaker(self) -> bool {
        matches!(
            self,
            ErrorCategory::Provider5xx
                | ErrorCategory::Timeout
                | ErrorCategory::NetworkError
                | ErrorCategory::ConnectError
                | ErrorCategory::StreamError
        )
    }
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Which deadline fired.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimeoutKind {
    Overall,
    FirstToken,
}

impl fmt::Display for TimeoutKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TimeoutKind::Overall => f.write_str("request timeout"),
            TimeoutKind::FirstToken => f.write_str("time-to-first-token timeout"),
        }
    }
}

/// LLM pipeline errors with appropriate HTTP status codes.
#[derive(Debug, Error)]
pub enum LlmError {
    /// The client payload could not be understood.
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    /// The API key is missing or unknown.
    #[error("Invalid or missing API key")]
    Unauthorized,

    /// The credential's rate limit is exhausted.
    #[error("Rate limit exceeded, retry in {retry_after:?}")]
    RateLimited { retry_after: Duration },

    /// The credential may not use the requested model.
    #[error("Model '{0}' is not allowed for this API key")]
    ModelNotAllowed(String),

    /// No provider passed the enablement, breaker and model filters.
    #[error("No eligible provider for model '{0}'")]
    NoEligibleProvider(String),

    /// Upstream answered with a non-success status.
    #[error("Provider API error ({status}): {message}")]
    Upstream { status: u16, message: String },

    /// A deadline elapsed before the upstream finished.
    #[error("Upstream {0} exceeded")]
    Timeout(TimeoutKind),

    /// The upstream could not be reached.
    #[error("Connection error: {0}")]
    Connect(String),

    /// The connection broke while sending or reading the body.
    #[error("Network error: {0}")]
    Network(String),

    /// The upstream stream failed after it started.
    #[error("Stream error: {0}")]
    Stream(String),

    /// A converter or transform script failed for this request.
    #[error("Transform failed: {0}")]
    Transform(String),

    /// Internal server error.
    /// If Some(message), it came from a provider and can be shown.
    #[error("Internal server error")]
    Internal(Option<String>),
}

impl LlmError {
    /// The failure category, for upstream and gateway failures.
    pub fn category(&self) -> Option<ErrorCategory> {
        match self {
            Self::InvalidRequest(_)
            | Self::Unauthorized
            | Self::RateLimited { .. }
            | Self::ModelNotAllowed(_)
            | Self::NoEligibleProvider(_) => None,
            Self::Upstream { status, .. } => Some(match status {
                400..=499 => ErrorCategory::Provider4xx,
                500..=599 => ErrorCategory::Provider5xx,
                // Redirects and informational statuses point at a misconfigured endpoint.
                _ => ErrorCategory::InternalError,
            }),
            Self::Timeout(_) => Some(ErrorCategory::Timeout),
            Self::Connect(_) => Some(ErrorCategory::ConnectError),
            Self::Network(_) => Some(ErrorCategory::NetworkError),
            Self::Stream(_) => Some(ErrorCategory::StreamError),
            Self::Transform(_) | Self::Internal(_) => Some(ErrorCategory::InternalError),
        }
    }

    /// Get the appropriate HTTP status code for this error.
    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::InvalidRequest(_) => StatusCode::BAD_REQUEST,
            Self::Unauthorized => StatusCode::UNAUTHORIZED,
            Self::RateLimited { .. } => StatusCode::TOO_MANY_REQUESTS,
            Self::ModelNotAllowed(_) => StatusCode::FORBIDDEN,
            Self::NoEligibleProvider(_) => StatusCode::SERVICE_UNAVAILABLE,
            Self::Upstream { status, .. } => match StatusCode::from_u16(*status) {
                Ok(status) if status.is_client_error() || status.is_server_error() => status,
                _ => StatusCode::BAD_GATEWAY,
            },
            Self::Timeout(_) => StatusCode::GATEWAY_TIMEOUT,
            Self::Connect(_) | Self::Network(_) | Self::Stream(_) => StatusCode::BAD_GATEWAY,
            Self::Transform(_) | Self::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Get the error type string for the response.
    pub fn error_type(&self) -> &'static str {
        match self {
            Self::InvalidRequest(_) => "invalid_request_error",
            Self::Unauthorized => "authentication_error",
            Self::RateLimited { .. } => "rate_limit_error",
            Self::ModelNotAllowed(_) => "permission_error",
            Self::NoEligibleProvider(_) => "no_eligible_provider",
            Self::Upstream { status, .. } => match status {
                401 => "authentication_error",
                403 => "permission_error",
                404 => "not_found_error",
                429 => "rate_limit_error",
                400..=499 => "invalid_request_error",
                _ => "api_error",
            },
            Self::Timeout(_) => "timeout_error",
            Self::Connect(_) | Self::Network(_) | Self::Stream(_) => "api_error",
            Self::Transform(_) | Self::Internal(_) => "internal_error",
        }
    }

    /// The OpenAI `code` field: the status, or a stable string where one exists.
    fn error_code(&self) -> Value {
        match self {
            Self::NoEligibleProvider(_) => Value::from("no_eligible_provider"),
            _ => Value::from(self.status_code().as_u16()),
        }
    }

    fn client_message(&self) -> String {
        match self {
            Self::Internal(Some(provider_msg)) => provider_msg.clone(),
            _ => self.to_string(),
        }
    }

    /// The error body in the client's wire format.
    pub fn to_body(&self, format: WireFormat) -> Value {
        match format {
            WireFormat::Anthropic => json!({
                "type": "error",
                "error": {
                    "type": self.error_type(),
                    "message": self.client_message(),
                }
            }),
            WireFormat::Gemini => json!({
                "error": {
                    "code": self.status_code().as_u16(),
                    "message": self.client_message(),
                    "status": self.error_type(),
                }
            }),
            WireFormat::OpenAiChat | WireFormat::OpenAiCompletions | WireFormat::Responses => json!({
                "error": {
                    "message": self.client_message(),
                    "type": self.error_type(),
                    "code": self.error_code(),
                }
            }),
        }
    }

    /// Renders the error for a client speaking `format`.
    pub fn into_client_response(self, format: WireFormat) -> Response {
        let status = self.status_code();

        if status.is_server_error() {
            match &self {
                Self::Transform(message) => log::error!("Request failed in transform: {message}"),
                Self::Internal(None) => log::error!("Internal server error occurred"),
                _ => log::warn!("Server error ({}): {}", status.as_u16(), self),
            }
        }

        let retry_after = match &self {
            Self::RateLimited { retry_after } => Some(retry_after_secs(*retry_after)),
            _ => None,
        };

        let mut response = (status, Json(self.to_body(format))).into_response();

        if let Some(seconds) = retry_after {
            response.headers_mut().insert(RETRY_AFTER, HeaderValue::from(seconds));
        }

        response
    }
}

/// Whole seconds for `Retry-After`, never zero.
fn retry_after_secs(retry_after: Duration) -> u64 {
    retry_after.as_secs_f64().ceil().max(1.0) as u64
}

impl IntoResponse for LlmError {
    fn into_response(self) -> Response {
        self.into_client_response(WireFormat::OpenAiChat)
    }
}

/// An error bound to the wire format of the client that caused it.
pub(crate) struct ClientError {
    pub error: LlmError,
    pub format: WireFormat,
}

impl IntoResponse for ClientError {
    fn into_response(self) -> Response {
        self.error.into_client_response(self.format)
    }
}
