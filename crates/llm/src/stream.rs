//! The streaming response engine.
//!
//! Upstream SSE events flow through the provider decoder into UIF events, and from there
//! through the client encoder into client SSE events, one upstream event at a time. The
//! engine owns the breaker permit and the active-request guard, so dropping the client
//! stream cancels the upstream read and releases both exactly once.

use std::{fmt, pin::Pin, time::Duration};

use futures::{Stream, StreamExt, stream};
use telemetry::metrics::Recorder;
use tokio::time::Instant;

use crate::{
    breaker::BreakerPermit,
    error::{ErrorCategory, LlmError, TimeoutKind},
    metrics::ActiveRequestGuard,
    protocol::ClientEvent,
    sse::parser::SseEventStream,
    token_counter,
    transform::StreamTransform,
    uif::{StopReason, StreamEvent, Usage},
};

pub(crate) type ClientEventStream = Pin<Box<dyn Stream<Item = ClientEvent> + Send>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum StreamState {
    Streaming,
    Completed,
    UpstreamError,
    ClientDisconnected,
}

impl fmt::Display for StreamState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StreamState::Streaming => f.write_str("streaming"),
            StreamState::Completed => f.write_str("completed"),
            StreamState::UpstreamError => f.write_str("upstream error"),
            StreamState::ClientDisconnected => f.write_str("client disconnected"),
        }
    }
}

/// Everything a stream needs once the upstream answered with a success status.
pub(crate) struct StreamSetup {
    pub events: SseEventStream,
    pub transform: StreamTransform,
    /// Model name reported to the client.
    pub client_model: String,
    pub started: Instant,
    pub request_timeout: Duration,
    pub ttft_timeout: Duration,
    pub permit: BreakerPermit,
    pub guard: ActiveRequestGuard,
    pub recorder: Recorder,
}

struct StreamEngine {
    events: SseEventStream,
    transform: StreamTransform,
    client_model: String,
    started: Instant,
    request_deadline: Instant,
    ttft_deadline: Instant,
    first_token_at: Option<Instant>,
    permit: Option<BreakerPermit>,
    guard: ActiveRequestGuard,
    recorder: Option<Recorder>,
    usage: Option<Usage>,
    generated: String,
    stop_reason: Option<StopReason>,
    state: StreamState,
}

/// Turns an upstream event stream into the client's event stream.
pub(crate) fn client_stream(setup: StreamSetup) -> ClientEventStream {
    let batches = stream::unfold(StreamEngine::new(setup), |mut engine| async move {
        let batch = engine.next_batch().await?;
        Some((stream::iter(batch), engine))
    });

    Box::pin(batches.flatten())
}

impl StreamEngine {
    fn new(setup: StreamSetup) -> Self {
        Self {
            events: setup.events,
            transform: setup.transform,
            client_model: setup.client_model,
            started: setup.started,
            request_deadline: setup.started + setup.request_timeout,
            ttft_deadline: setup.started + setup.ttft_timeout,
            first_token_at: None,
            permit: Some(setup.permit),
            guard: setup.guard,
            recorder: Some(setup.recorder),
            usage: None,
            generated: String::new(),
            stop_reason: None,
            state: StreamState::Streaming,
        }
    }

    /// The next group of client events, or `None` once the stream is over.
    async fn next_batch(&mut self) -> Option<Vec<ClientEvent>> {
        if self.state != StreamState::Streaming {
            return None;
        }

        let (deadline, kind) = if self.first_token_at.is_none() && self.ttft_deadline < self.request_deadline {
            (self.ttft_deadline, TimeoutKind::FirstToken)
        } else {
            (self.request_deadline, TimeoutKind::Overall)
        };

        let batch = match tokio::time::timeout_at(deadline, self.events.next()).await {
            Err(_) => self.fail(LlmError::Timeout(kind)),
            Ok(Some(Err(error))) => self.fail(error),
            Ok(Some(Ok(event))) => match self.transform.decode(&event) {
                Ok(events) => self.emit(events),
                Err(error) => self.fail(error),
            },
            Ok(None) => match self.transform.finish_decode() {
                Ok(events) => {
                    let mut batch = self.emit(events);

                    if self.state == StreamState::Streaming {
                        batch.extend(self.complete());
                    }

                    batch
                }
                Err(error) => self.fail(error),
            },
        };

        Some(batch)
    }

    fn emit(&mut self, events: Vec<StreamEvent>) -> Vec<ClientEvent> {
        let mut out = Vec::new();

        for mut event in events {
            match &mut event {
                StreamEvent::MessageStart { model, .. } => *model = self.client_model.clone(),
                StreamEvent::TextDelta { text } => self.generated.push_str(text),
                StreamEvent::ThinkingDelta { thinking } => self.generated.push_str(thinking),
                StreamEvent::Usage(usage) => {
                    self.usage = Some(*usage);
                    self.guard.observe_usage(*usage);
                }
                StreamEvent::MessageStop { stop_reason } => self.stop_reason = Some(*stop_reason),
                StreamEvent::Error { message, .. } => {
                    out.extend(self.fail(LlmError::Stream(message.clone())));
                    return out;
                }
                StreamEvent::ThinkingSignature { .. } | StreamEvent::ToolUseStart { .. } | StreamEvent::ToolUseDelta { .. } => {}
            }

            if event.is_content() && self.first_token_at.is_none() {
                let now = Instant::now();
                self.first_token_at = Some(now);

                let guard = &self.guard;
                guard
                    .metrics()
                    .record_time_to_first_token(guard.labels(), now.duration_since(self.started));
            }

            match self.transform.encode(&event) {
                Ok(events) => out.extend(events),
                Err(error) => {
                    out.extend(self.fail(error));
                    return out;
                }
            }
        }

        out
    }

    fn complete(&mut self) -> Vec<ClientEvent> {
        self.state = StreamState::Completed;

        let usage = match self.usage {
            Some(usage) => usage,
            None => Usage {
                output_tokens: u32::try_from(token_counter::count_text(&self.generated)).unwrap_or(u32::MAX),
                ..Usage::default()
            },
        };

        if let Some(first_token_at) = self.first_token_at {
            self.guard.metrics().record_tokens_per_second(
                self.guard.labels(),
                usage.output_tokens,
                first_token_at.elapsed(),
            );
        }

        self.guard.complete(usage);

        if let Some(permit) = self.permit.take() {
            permit.success();
        }

        if let Some(mut recorder) = self.recorder.take() {
            let stop_reason = self.stop_reason.unwrap_or_default();
            recorder.push_attribute("gen_ai.response.finish_reason", stop_reason.as_str());
            recorder.record();
        }

        log::debug!(
            "Stream to '{}' completed with {} output tokens",
            self.guard.labels().provider,
            usage.output_tokens
        );

        self.transform.finish_encode()
    }

    /// Ends the stream with a single terminal error event.
    fn fail(&mut self, error: LlmError) -> Vec<ClientEvent> {
        if self.state != StreamState::Streaming {
            return Vec::new();
        }

        self.state = StreamState::UpstreamError;

        let category = error.category().unwrap_or(ErrorCategory::InternalError);
        let labels = self.guard.labels();

        match &error {
            LlmError::Transform(message) => log::error!("Stream failed in transform: {message}"),
            _ => log::warn!("Stream from provider '{}' failed ({category}): {error}", labels.provider),
        }

        if category != ErrorCategory::InternalError {
            self.guard.metrics().record_upstream_error(labels, category);
        }

        if let Some(permit) = self.permit.take() {
            permit.failure(category);
        }

        if let Some(mut recorder) = self.recorder.take() {
            recorder.push_attribute("error.type", category.as_str());
            recorder.record();
        }

        let event = StreamEvent::Error {
            category,
            message: error.to_string(),
        };

        self.transform.encode(&event).unwrap_or_else(|e| {
            log::error!("Failed to encode stream error event: {e}");
            Vec::new()
        })
    }
}

    /// The client went away mid-stream. The permit is released without an outcome.
    fn disconnect(&mut self) {
        if self.state != StreamState::Streaming {
            return;
        }

        self.state = StreamState::ClientDisconnected;

        log::debug!(
            "Stream to provider '{}' ended: {}",
            self.guard.labels().provider,
            self.state
        );

        if let Some(mut recorder) = self.recorder.take() {
            recorder.push_attribute("error.type", "client_disconnected");
            recorder.record();
        }
    }
}

impl Drop for StreamEngine {
    fn drop(&mut self) {
        self.disconnect();
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use config::BreakerConfig;
    use futures::StreamExt;

    use super::*;
    use crate::{
        breaker::{BreakerStatus, CircuitBreakers},
        metrics::{PipelineMetrics, RequestLabels},
        protocol::WireFormat,
        sse::parser::SseEvent,
        transform::Transformer,
    };

    struct Harness {
        breakers: Arc<CircuitBreakers>,
        metrics: PipelineMetrics,
    }

    fn breaker_config() -> BreakerConfig {
        BreakerConfig {
            min_requests: 1,
            ..BreakerConfig::default()
        }
    }

    impl Harness {
        fn new() -> Self {
            Self {
                breakers: Arc::new(CircuitBreakers::new()),
                metrics: PipelineMetrics::default(),
            }
        }

        fn stream(&self, events: SseEventStream, client: WireFormat) -> ClientEventStream {
            client_stream(self.setup(events, client))
        }

        fn setup(&self, events: SseEventStream, client: WireFormat) -> StreamSetup {
            let labels = RequestLabels {
                operation: "chat",
                provider: "openai".into(),
                model: "my-model".into(),
                credential: "anonymous".into(),
            };

            let transformer = Transformer::new(client, WireFormat::OpenAiChat, None, "openai", "gpt-4o", true);

            StreamSetup {
                events,
                transform: transformer.stream(),
                client_model: "my-model".into(),
                started: Instant::now(),
                request_timeout: Duration::from_secs(300),
                ttft_timeout: Duration::from_secs(60),
                permit: self
                    .breakers
                    .try_acquire("openai", &breaker_config(), Instant::now())
                    .unwrap(),
                guard: ActiveRequestGuard::new(self.metrics.clone(), labels),
                recorder: Recorder::new(telemetry::metrics::GEN_AI_CLIENT_OPERATION_DURATION),
            }
        }
    }

    fn upstream(events: Vec<crate::Result<SseEvent>>) -> SseEventStream {
        Box::pin(stream::iter(events))
    }

    fn chunk(body: &str) -> crate::Result<SseEvent> {
        Ok(SseEvent::data(body))
    }

    #[tokio::test(start_paused = true)]
    async fn completed_stream_reports_client_model_and_done() {
        let harness = Harness::new();

        let events = harness.stream(
            upstream(vec![
                chunk(r#"{"id":"c1","model":"gpt-4o","choices":[{"index":0,"delta":{"role":"assistant","content":"Hi"},"finish_reason":null}]}"#),
                chunk(r#"{"id":"c1","model":"gpt-4o","choices":[{"index":0,"delta":{},"finish_reason":"stop"}],"usage":{"prompt_tokens":3,"completion_tokens":1,"total_tokens":4}}"#),
                chunk("[DONE]"),
            ]),
            WireFormat::OpenAiChat,
        );

        let out: Vec<ClientEvent> = events.collect().await;

        assert_eq!(out.last().map(|event| event.data.as_str()), Some("[DONE]"));
        assert!(out.iter().all(|event| !event.data.contains("gpt-4o")));
        assert!(out[0].data.contains(r#""model":"my-model""#));
        assert_eq!(harness.metrics.active_requests(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn read_error_emits_one_terminal_error() {
        let harness = Harness::new();

        let events = harness.stream(
            upstream(vec![
                chunk(r#"{"id":"c1","model":"gpt-4o","choices":[{"index":0,"delta":{"content":"Hi"},"finish_reason":null}]}"#),
                Err(LlmError::Network("connection reset".into())),
            ]),
            WireFormat::Anthropic,
        );

        let out: Vec<ClientEvent> = events.collect().await;
        let errors: Vec<_> = out
            .iter()
            .filter(|event| event.event.as_deref() == Some("error"))
            .collect();

        assert_eq!(errors.len(), 1);
        assert_eq!(out.last(), errors.last().copied());
        assert!(errors[0].data.contains("connection reset"));
        assert_eq!(harness.breakers.status("openai"), BreakerStatus::Open);
        assert_eq!(harness.metrics.active_requests(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn truncated_stream_is_an_error_without_done() {
        let harness = Harness::new();

        let events = harness.stream(
            upstream(vec![chunk(
                r#"{"id":"c1","model":"gpt-4o","choices":[{"index":0,"delta":{"content":"Hi"},"finish_reason":null}]}"#,
            )]),
            WireFormat::OpenAiChat,
        );

        let out: Vec<ClientEvent> = events.collect().await;
        let last = out.last().unwrap();

        assert!(last.data.contains("stream_error"));
        assert!(out.iter().all(|event| event.data != "[DONE]"));
    }

    #[tokio::test(start_paused = true)]
    async fn first_token_timeout() {
        let harness = Harness::new();

        let events = harness.stream(Box::pin(stream::pending()), WireFormat::OpenAiChat);
        let out: Vec<ClientEvent> = events.collect().await;

        assert_eq!(out.len(), 1);
        assert_eq!(
            out[0].data,
            r#"{"error":{"message":"Upstream time-to-first-token timeout exceeded","type":"timeout"}}"#
        );
    }

    #[tokio::test(start_paused = true)]
    async fn client_disconnect_releases_everything_once() {
        let harness = Harness::new();

        let mut events = harness.stream(
            Box::pin(
                stream::iter(vec![chunk(
                    r#"{"id":"c1","model":"gpt-4o","choices":[{"index":0,"delta":{"content":"Hi"},"finish_reason":null}]}"#,
                )])
                .chain(stream::pending()),
            ),
            WireFormat::OpenAiChat,
        );

        assert!(events.next().await.is_some());
        assert_eq!(harness.metrics.active_requests(), 1);

        drop(events);

        assert_eq!(harness.metrics.active_requests(), 0);
        assert_eq!(harness.breakers.status("openai"), BreakerStatus::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn only_an_unfinished_stream_counts_as_disconnected() {
        let harness = Harness::new();

        let pending: SseEventStream = Box::pin(stream::pending::<crate::Result<SseEvent>>());

        let mut engine = StreamEngine::new(harness.setup(pending, WireFormat::OpenAiChat));
        engine.disconnect();

        assert_eq!(engine.state, StreamState::ClientDisconnected);
        assert!(engine.recorder.is_none());
        assert!(engine.next_batch().await.is_none());

        let mut engine = StreamEngine::new(harness.setup(
            upstream(vec![
                chunk(r#"{"id":"c1","model":"gpt-4o","choices":[{"index":0,"delta":{"role":"assistant","content":"Hi"},"finish_reason":null}]}"#),
                chunk(r#"{"id":"c1","model":"gpt-4o","choices":[{"index":0,"delta":{},"finish_reason":"stop"}]}"#),
                chunk("[DONE]"),
            ]),
            WireFormat::OpenAiChat,
        ));

        while engine.next_batch().await.is_some() {}
        engine.disconnect();

        assert_eq!(engine.state, StreamState::Completed);
    }
}
