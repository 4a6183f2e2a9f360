//! Telemetry library for Conduit
//!
//! Provides OpenTelemetry metrics with optional OTLP export.

pub mod metrics;

use config::TelemetryConfig;
use opentelemetry_sdk::metrics::SdkMeterProvider;

/// Guard that flushes and shuts down the meter provider when dropped.
pub struct TelemetryGuard {
    meter_provider: SdkMeterProvider,
}

impl Drop for TelemetryGuard {
    fn drop(&mut self) {
        // Shutdown flushes the last export interval.
        if let Err(e) = self.meter_provider.shutdown() {
            log::error!("Failed to shutdown meter provider: {e}");
        }
    }
}

/// Initialize telemetry with the given configuration.
///
/// Keep the returned guard alive for the lifetime of the process.
pub async fn init(config: &TelemetryConfig) -> anyhow::Result<TelemetryGuard> {
    let meter_provider = metrics::init_metrics(config).await?;

    Ok(TelemetryGuard { meter_provider })
}
