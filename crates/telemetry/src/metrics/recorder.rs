use std::time::Instant;

use opentelemetry::{Key, KeyValue, Value, metrics::Histogram};

/// A timer recording elapsed milliseconds into a histogram.
///
/// ```rust,ignore
/// let mut recorder = Recorder::new(GEN_AI_CLIENT_OPERATION_DURATION);
/// recorder.push_attribute("gen_ai.system", "anthropic");
/// call_upstream().await;
/// recorder.record();
/// ```
pub struct Recorder {
    start: Instant,
    histogram: Histogram<f64>,
    attributes: Vec<KeyValue>,
}

impl Recorder {
    /// Starts timing now.
    pub fn new(name: &'static str) -> Self {
        Self::starting_at(name, Instant::now())
    }

    /// Times from an earlier instant, e.g. the moment the request arrived.
    pub fn starting_at(name: &'static str, start: Instant) -> Self {
        Self {
            start,
            histogram: super::meter().f64_histogram(name).with_unit("ms").build(),
            attributes: Vec::new(),
        }
    }

    /// Adds an attribute recorded with the measurement.
    pub fn push_attribute<K, V>(&mut self, key: K, value: V)
    where
        K: Into<Key>,
        V: Into<Value>,
    {
        self.attributes.push(KeyValue::new(key, value));
    }

    /// Records the elapsed time to the histogram.
    pub fn record(self) {
        let duration = self.start.elapsed().as_secs_f64() * 1000.0;
        self.histogram.record(duration, &self.attributes);
    }
}
