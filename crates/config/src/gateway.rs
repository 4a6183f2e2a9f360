//! Request pipeline settings.

use std::time::Duration;

use duration_str::deserialize_duration;
use serde::Deserialize;

/// Knobs consumed by the request pipeline on every request.
#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct GatewayConfig {
    /// Upper bound for a whole upstream call, streaming included.
    #[serde(deserialize_with = "deserialize_duration")]
    pub request_timeout: Duration,
    /// Upper bound from request start to the first streamed content delta.
    #[serde(deserialize_with = "deserialize_duration")]
    pub ttft_timeout: Duration,
    /// TCP connect timeout for upstream providers.
    #[serde(deserialize_with = "deserialize_duration")]
    pub connect_timeout: Duration,
    /// Prefix stripped from requested model names before mapping, e.g. `conduit/`.
    pub model_prefix: Option<String>,
    /// Whether upstream TLS certificates are verified.
    pub verify_tls: bool,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            request_timeout: Duration::from_secs(300),
            ttft_timeout: Duration::from_secs(60),
            connect_timeout: Duration::from_secs(10),
            model_prefix: None,
            verify_tls: true,
        }
    }
}
