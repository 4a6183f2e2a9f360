//! Pipeline metrics.

use std::{
    sync::{
        Arc,
        atomic::{AtomicI64, Ordering},
    },
    time::Duration,
};

use opentelemetry::{
    Key, KeyValue, Value,
    metrics::{Counter, Histogram, UpDownCounter},
};
use telemetry::metrics::{
    CONDUIT_ACTIVE_REQUESTS, CONDUIT_TOKENS_PER_SECOND, CONDUIT_UPSTREAM_ERRORS, GEN_AI_CLIENT_OPERATION_DURATION,
    GEN_AI_CLIENT_TOKEN_USAGE, GEN_AI_SERVER_TIME_TO_FIRST_TOKEN, Recorder,
};

use crate::{error::ErrorCategory, uif::Usage};

/// Instruments shared by every request.
#[derive(Clone)]
pub(crate) struct PipelineMetrics {
    token_usage: Histogram<u64>,
    time_to_first_token: Histogram<f64>,
    tokens_per_second: Histogram<f64>,
    active_requests: UpDownCounter<i64>,
    upstream_errors: Counter<u64>,
    /// Local mirror of the active-requests gauge, reported by the health endpoint.
    active: Arc<AtomicI64>,
}

impl Default for PipelineMetrics {
    fn default() -> Self {
        let meter = telemetry::metrics::meter();

        Self {
            token_usage: meter.u64_histogram(GEN_AI_CLIENT_TOKEN_USAGE).with_unit("{token}").build(),
            time_to_first_token: meter.f64_histogram(GEN_AI_SERVER_TIME_TO_FIRST_TOKEN).with_unit("ms").build(),
            tokens_per_second: meter.f64_histogram(CONDUIT_TOKENS_PER_SECOND).build(),
            active_requests: meter.i64_up_down_counter(CONDUIT_ACTIVE_REQUESTS).build(),
            upstream_errors: meter.u64_counter(CONDUIT_UPSTREAM_ERRORS).build(),
            active: Arc::new(AtomicI64::new(0)),
        }
    }
}

impl PipelineMetrics {
    pub fn active_requests(&self) -> i64 {
        self.active.load(Ordering::Relaxed)
    }

    pub fn operation_recorder(&self, labels: &RequestLabels, started: std::time::Instant) -> Recorder {
        let mut recorder = Recorder::starting_at(GEN_AI_CLIENT_OPERATION_DURATION, started);

        for attribute in labels.attributes() {
            recorder.push_attribute(attribute.key, attribute.value);
        }

        recorder
    }

    pub fn record_usage(&self, labels: &RequestLabels, usage: &Usage) {
        let mut attributes = labels.attributes();

        attributes.push(KeyValue::new("gen_ai.token.type", "input"));
        self.token_usage.record(u64::from(usage.input_tokens), &attributes);

        if let Some(last) = attributes.last_mut() {
            *last = KeyValue::new("gen_ai.token.type", "output");
        }

        self.token_usage.record(u64::from(usage.output_tokens), &attributes);
    }

    pub fn record_time_to_first_token(&self, labels: &RequestLabels, elapsed: Duration) {
        self.time_to_first_token
            .record(elapsed.as_secs_f64() * 1000.0, &labels.attributes());
    }

    /// Output tokens over the time since the first token. Nothing is recorded for an instant
    /// stream.
    pub fn record_tokens_per_second(&self, labels: &RequestLabels, output_tokens: u32, since_first_token: Duration) {
        let seconds = since_first_token.as_secs_f64();

        if seconds > 0.0 && output_tokens > 0 {
            self.tokens_per_second
                .record(f64::from(output_tokens) / seconds, &labels.attributes());
        }
    }

    pub fn record_upstream_error(&self, labels: &RequestLabels, category: ErrorCategory) {
        let mut attributes = labels.attributes();
        attributes.push(KeyValue::new("error.type", category.as_str()));

        self.upstream_errors.add(1, &attributes);
    }
}

/// Attributes identifying a request in metrics.
#[derive(Debug, Clone)]
pub(crate) struct RequestLabels {
    pub operation: &'static str,
    pub provider: String,
    /// The model name the client asked for.
    pub model: String,
    pub credential: String,
}

impl RequestLabels {
    fn attributes(&self) -> Vec<KeyValue> {
        vec![
            KeyValue::new(Key::from("gen_ai.system"), Value::from("conduit")),
            KeyValue::new(Key::from("gen_ai.operation.name"), Value::from(self.operation)),
            KeyValue::new(Key::from("gen_ai.request.model"), Value::from(self.model.clone())),
            KeyValue::new(Key::from("conduit.provider"), Value::from(self.provider.clone())),
            KeyValue::new(Key::from("client.id"), Value::from(self.credential.clone())),
        ]
    }
}

/// Counts a request as active for as long as it lives.
///
/// The gauge is decremented exactly once, in `Drop`. A guard dropped before
/// [`ActiveRequestGuard::complete`] belongs to a request cut short, typically by a client
/// disconnect, and records whatever usage was seen so far.
pub(crate) struct ActiveRequestGuard {
    metrics: PipelineMetrics,
    labels: RequestLabels,
    usage: Usage,
    completed: bool,
}

impl ActiveRequestGuard {
    pub fn new(metrics: PipelineMetrics, labels: RequestLabels) -> Self {
        metrics.active_requests.add(1, &labels.attributes());
        metrics.active.fetch_add(1, Ordering::Relaxed);

        Self {
            metrics,
            labels,
            usage: Usage::default(),
            completed: false,
        }
    }

    pub fn labels(&self) -> &RequestLabels {
        &self.labels
    }

    pub fn metrics(&self) -> &PipelineMetrics {
        &self.metrics
    }

    /// Usage seen so far.
    pub fn observe_usage(&mut self, usage: Usage) {
        self.usage = usage;
    }

    /// Marks the request finished and records its final usage.
    pub fn complete(&mut self, usage: Usage) {
        if self.completed {
            return;
        }

        self.completed = true;
        self.usage = usage;
        self.metrics.record_usage(&self.labels, &usage);
    }
}

impl Drop for ActiveRequestGuard {
    fn drop(&mut self) {
        self.metrics.active_requests.add(-1, &self.labels.attributes());
        self.metrics.active.fetch_sub(1, Ordering::Relaxed);

        if !self.completed {
            log::debug!(
                "Request to provider '{}' ended before completion, recording partial usage",
                self.labels.provider
            );

            self.metrics.record_usage(&self.labels, &self.usage);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn labels() -> RequestLabels {
        RequestLabels {
            operation: "chat",
            provider: "openai".into(),
            model: "gpt-4o".into(),
            credential: "anonymous".into(),
        }
    }

    #[test]
    fn guard_decrements_once() {
        let metrics = PipelineMetrics::default();

        let mut guard = ActiveRequestGuard::new(metrics.clone(), labels());
        let second = ActiveRequestGuard::new(metrics.clone(), labels());
        assert_eq!(metrics.active_requests(), 2);

        guard.complete(Usage::default());
        guard.complete(Usage::default());
        drop(guard);
        assert_eq!(metrics.active_requests(), 1);

        drop(second);
        assert_eq!(metrics.active_requests(), 0);
    }
}
