//! Metrics initialization and management

mod names;
mod recorder;

pub use names::*;
pub use recorder::Recorder;

use anyhow::Context;
use config::{OtlpProtocol, TelemetryConfig};
use opentelemetry::{KeyValue, metrics::Meter};
use opentelemetry_otlp::{MetricExporter, WithExportConfig};
use opentelemetry_sdk::{
    Resource,
    metrics::{PeriodicReader, SdkMeterProvider},
};

const METER_NAME: &str = "conduit";

/// Get the global meter for recording metrics.
///
/// Before [`crate::init`] runs this is the OpenTelemetry no-op meter.
pub fn meter() -> Meter {
    opentelemetry::global::meter(METER_NAME)
}

pub(crate) async fn init_metrics(config: &TelemetryConfig) -> anyhow::Result<SdkMeterProvider> {
    let meter_provider = create_meter_provider(config)?;

    opentelemetry::global::set_meter_provider(meter_provider.clone());

    log::info!(
        "Telemetry metrics initialized for service '{}'",
        config.service_name().unwrap_or("conduit")
    );

    Ok(meter_provider)
}

fn create_meter_provider(config: &TelemetryConfig) -> anyhow::Result<SdkMeterProvider> {
    let exporter_config = &config.exporters().otlp;

    if !exporter_config.enabled {
        log::debug!("OTLP exporter disabled, metrics will be recorded but not exported");
        return Ok(SdkMeterProvider::builder().build());
    }

    let mut builder = Resource::builder();

    if let Some(service_name) = config.service_name() {
        builder = builder.with_service_name(service_name.to_string());
    }

    for (key, value) in config.resource_attributes() {
        builder = builder.with_attribute(KeyValue::new(key.clone(), value.clone()));
    }

    let exporter = match exporter_config.protocol {
        OtlpProtocol::Grpc => MetricExporter::builder()
            .with_tonic()
            .with_endpoint(exporter_config.endpoint.as_str())
            .with_timeout(exporter_config.timeout)
            .build()
            .context("Failed to create gRPC OTLP metric exporter")?,
        OtlpProtocol::Http => MetricExporter::builder()
            .with_http()
            .with_endpoint(exporter_config.endpoint.as_str())
            .with_timeout(exporter_config.timeout)
            .build()
            .context("Failed to create HTTP OTLP metric exporter")?,
    };

    let reader = PeriodicReader::builder(exporter)
        .with_interval(exporter_config.interval)
        .build();

    let provider = SdkMeterProvider::builder()
        .with_resource(builder.build())
        .with_reader(reader)
        .build();

    log::info!(
        "OTLP metrics exporter initialized to {} via {:?}",
        exporter_config.endpoint,
        exporter_config.protocol
    );

    Ok(provider)
}
