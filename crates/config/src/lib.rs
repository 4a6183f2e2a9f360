//! Conduit configuration structures to map the conduit.toml configuration.

#![deny(missing_docs)]

mod breaker;
mod credential;
mod gateway;
mod loader;
mod provider;
mod server;
mod telemetry;

use std::{collections::BTreeMap, path::Path};

pub use breaker::BreakerConfig;
pub use credential::{CredentialConfig, RateLimitConfig};
pub use gateway::GatewayConfig;
pub use provider::{MatchKind, ModelRule, ProviderConfig, ProviderKind, VertexConfig, VertexPublisher};
use serde::Deserialize;
pub use server::{DEFAULT_LISTEN_ADDRESS, HealthConfig, ServerConfig, TlsServerConfig};
pub use telemetry::{ExportersConfig, OtlpExporterConfig, OtlpProtocol, TelemetryConfig};

/// Main configuration structure for the Conduit gateway.
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(deny_unknown_fields)]
pub struct Config {
    /// HTTP server configuration settings.
    #[serde(default)]
    pub server: ServerConfig,
    /// Request pipeline knobs: timeouts, model prefix, upstream TLS.
    #[serde(default)]
    pub gateway: GatewayConfig,
    /// Circuit breaker thresholds shared by all providers.
    #[serde(default)]
    pub breaker: BreakerConfig,
    /// Upstream providers, keyed by provider id.
    #[serde(default)]
    pub providers: BTreeMap<String, ProviderConfig>,
    /// Client credentials, keyed by credential id.
    #[serde(default)]
    pub credentials: BTreeMap<String, CredentialConfig>,
    /// Telemetry configuration.
    #[serde(default)]
    pub telemetry: Option<TelemetryConfig>,
}

impl Config {
    /// Load configuration from a file path.
    pub fn load<P: AsRef<Path>>(path: P) -> anyhow::Result<Config> {
        loader::load(path)
    }

    /// Parse configuration from TOML text, expanding `{{ env.NAME }}` values and validating the result.
    pub fn parse(content: &str) -> anyhow::Result<Config> {
        loader::parse(content)
    }

    /// Validates provider, credential and breaker settings.
    pub fn validate(&self) -> anyhow::Result<()> {
        loader::validate(self)
    }
}
