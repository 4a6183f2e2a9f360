//! Mock upstream providers.

mod anthropic;
mod google;
mod openai;

use std::{net::SocketAddr, sync::Arc, time::Duration};

use axum::{
    Json, Router,
    body::Body,
    http::{HeaderMap, StatusCode, header::CONTENT_TYPE},
    response::{IntoResponse, Response},
};
use futures::stream;
use indoc::formatdoc;
use parking_lot::Mutex;
use serde_json::{Value, json};
use tokio::net::TcpListener;

#[derive(Clone, Debug, Copy, PartialEq, Eq)]
pub enum ProviderType {
    OpenAI,
    Anthropic,
    Google,
}

/// How a mock misbehaves.
#[derive(Clone, Debug)]
pub enum Failure {
    /// Answer every request with this status and an OpenAI-style error body.
    Status(u16, String),
    /// Start streaming, then drop the connection after the first content event.
    AbortStream,
}

/// A request as the mock received it.
#[derive(Debug, Clone)]
pub struct RecordedRequest {
    pub path: String,
    pub headers: HeaderMap,
    pub body: Value,
}

/// Requests received by a mock, shared with the test.
#[derive(Clone, Default)]
pub struct Recorded(Arc<Mutex<Vec<RecordedRequest>>>);

impl Recorded {
    pub fn count(&self) -> usize {
        self.0.lock().len()
    }

    pub fn last(&self) -> RecordedRequest {
        self.0.lock().last().cloned().expect("the mock received no request")
    }

    fn push(&self, path: &str, headers: &HeaderMap, body: &Value) {
        self.0.lock().push(RecordedRequest {
            path: path.to_string(),
            headers: headers.clone(),
            body: body.clone(),
        });
    }
}

pub(crate) struct MockState {
    recorded: Recorded,
    failure: Option<Failure>,
    delay: Option<Duration>,
}

impl MockState {
    /// Records the request, waits out the configured delay and returns the configured error.
    async fn receive(&self, path: &str, headers: &HeaderMap, body: &Value) -> Option<Response> {
        self.recorded.push(path, headers, body);

        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }

        match &self.failure {
            Some(Failure::Status(status, message)) => {
                let status = StatusCode::from_u16(*status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
                let body = json!({"error": {"message": message, "type": "mock_error"}});

                Some((status, Json(body)).into_response())
            }
            Some(Failure::AbortStream) | None => None,
        }
    }

    fn aborts(&self) -> bool {
        matches!(self.failure, Some(Failure::AbortStream))
    }
}

/// A `text/event-stream` body. With `abort_after`, the connection breaks after that many frames.
fn sse_body(frames: Vec<String>, abort_after: Option<usize>) -> Response {
    let mut items: Vec<Result<String, std::io::Error>> = frames.into_iter().map(Ok).collect();

    if let Some(count) = abort_after {
        items.truncate(count);
        items.push(Err(std::io::Error::other("mock upstream dropped the stream")));
    }

    let body = Body::from_stream(stream::iter(items));

    ([(CONTENT_TYPE, "text/event-stream")], body).into_response()
}

/// A mock upstream provider, configured before it is spawned.
pub struct LlmMock {
    name: String,
    kind: ProviderType,
    extra_config: Vec<String>,
    recorded: Recorded,
    failure: Option<Failure>,
    delay: Option<Duration>,
}

impl LlmMock {
    fn new(name: &str, kind: ProviderType) -> Self {
        Self {
            name: name.to_string(),
            kind,
            extra_config: Vec::new(),
            recorded: Recorded::default(),
            failure: None,
            delay: None,
        }
    }

    pub fn openai(name: &str) -> Self {
        Self::new(name, ProviderType::OpenAI)
    }

    pub fn anthropic(name: &str) -> Self {
        Self::new(name, ProviderType::Anthropic)
    }

    pub fn google(name: &str) -> Self {
        Self::new(name, ProviderType::Google)
    }

    /// Adds a line to the provider's configuration table, e.g. `weight = 2`.
    pub fn with_config(mut self, line: &str) -> Self {
        self.extra_config.push(line.to_string());
        self
    }

    pub fn with_failure(mut self, failure: Failure) -> Self {
        self.failure = Some(failure);
        self
    }

    /// Delays every answer, headers included.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn recorded(&self) -> Recorded {
        self.recorded.clone()
    }

    pub(crate) async fn spawn(self) -> anyhow::Result<SpawnedMock> {
        let state = Arc::new(MockState {
            recorded: self.recorded,
            failure: self.failure,
            delay: self.delay,
        });

        let app: Router = match self.kind {
            ProviderType::OpenAI => openai::router(state),
            ProviderType::Anthropic => anthropic::router(state),
            ProviderType::Google => google::router(state),
        };

        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let address = listener.local_addr()?;

        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        Ok(SpawnedMock {
            name: self.name,
            kind: self.kind,
            address,
            extra_config: self.extra_config,
        })
    }
}

/// A running mock.
pub struct SpawnedMock {
    name: String,
    kind: ProviderType,
    address: SocketAddr,
    extra_config: Vec<String>,
}

/// The `[providers.<name>]` table pointing at a running mock.
pub fn provider_config(mock: &SpawnedMock) -> String {
    let (kind, base_path) = match mock.kind {
        ProviderType::OpenAI => ("openai", "/v1"),
        ProviderType::Anthropic => ("anthropic", "/v1"),
        ProviderType::Google => ("gemini", "/v1beta"),
    };

    formatdoc! {r#"

        [providers.{name}]
        type = "{kind}"
        api_key = "test-key"
        api_base = "http://{address}{base_path}"
        {extra}
    "#,
        name = mock.name,
        kind = kind,
        address = mock.address,
        base_path = base_path,
        extra = mock.extra_config.join("\n"),
    }
}

/// Joined text of a message content that is either a string or a list of text parts.
fn content_text(content: &Value) -> String {
    match content {
        Value::String(text) => text.clone(),
        Value::Array(parts) => parts
            .iter()
            .filter_map(|part| part.get("text").and_then(Value::as_str))
            .collect(),
        _ => String::new(),
    }
}
