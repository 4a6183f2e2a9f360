//! Telemetry configuration.

use std::{collections::BTreeMap, time::Duration};

use duration_str::deserialize_duration;
use serde::Deserialize;
use url::Url;

/// Telemetry configuration for metrics export.
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default, deny_unknown_fields)]
pub struct TelemetryConfig {
    /// Service name for telemetry identification.
    service_name: Option<String>,
    /// Custom resource attributes attached to all telemetry.
    resource_attributes: BTreeMap<String, String>,
    /// Exporters configuration.
    exporters: ExportersConfig,
}

impl TelemetryConfig {
    /// Get the service name.
    pub fn service_name(&self) -> Option<&str> {
        self.service_name.as_deref()
    }

    /// Get the resource attributes.
    pub fn resource_attributes(&self) -> &BTreeMap<String, String> {
        &self.resource_attributes
    }

    /// Get the exporters configuration.
    pub fn exporters(&self) -> &ExportersConfig {
        &self.exporters
    }
}

/// Exporters configuration for telemetry.
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default, deny_unknown_fields)]
pub struct ExportersConfig {
    /// OTLP exporter configuration.
    pub otlp: OtlpExporterConfig,
}

/// OTLP exporter configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct OtlpExporterConfig {
    /// Whether this exporter is enabled.
    pub enabled: bool,
    /// OTLP endpoint URL.
    pub endpoint: Url,
    /// Protocol to use (grpc or http).
    pub protocol: OtlpProtocol,
    /// Request timeout.
    #[serde(deserialize_with = "deserialize_duration")]
    pub timeout: Duration,
    /// Interval between metric exports.
    #[serde(deserialize_with = "deserialize_duration")]
    pub interval: Duration,
}

impl Default for OtlpExporterConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            endpoint: default_endpoint(),
            protocol: OtlpProtocol::default(),
            timeout: Duration::from_secs(60),
            interval: Duration::from_secs(30),
        }
    }
}

#[allow(clippy::expect_used)]
fn default_endpoint() -> Url {
    Url::parse("http://localhost:4317").expect("default URL should be valid")
}

/// OTLP protocol selection.
#[derive(Debug, Clone, Copy, Deserialize, Default, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum OtlpProtocol {
    /// gRPC protocol (default).
    #[default]
    Grpc,
    /// HTTP/protobuf protocol.
    Http,
}

#[cfg(test)]
mod tests {
    use indoc::indoc;

    use crate::{Config, OtlpProtocol};

    #[test]
    fn otlp_exporter() {
        let config = indoc! {r#"
            [telemetry]
            service_name = "conduit-eu"

            [telemetry.exporters.otlp]
            enabled = true
            endpoint = "http://collector:4318"
            protocol = "http"
            interval = "5s"
        "#};

        let config: Config = toml::from_str(config).unwrap();
        let telemetry = config.telemetry.unwrap();
        let otlp = &telemetry.exporters().otlp;

        assert_eq!(telemetry.service_name(), Some("conduit-eu"));
        assert!(otlp.enabled);
        assert_eq!(otlp.protocol, OtlpProtocol::Http);
        assert_eq!(otlp.endpoint.as_str(), "http://collector:4318/");
        assert_eq!(otlp.interval.as_secs(), 5);
    }
}
