//! HTTP calls to upstream providers: endpoint, authentication and error classification.

use config::{ProviderKind, VertexPublisher};
use futures::StreamExt;
use http::{
    HeaderMap, HeaderValue,
    header::{AUTHORIZATION, CONTENT_TYPE},
};
use secrecy::ExposeSecret;
use serde_json::Value;

use crate::{
    error::LlmError,
    snapshot::ProviderEntry,
    sse::parser::{SseEventStream, parse_sse_stream},
};

const ANTHROPIC_VERSION: &str = "2023-06-01";
const VERTEX_ANTHROPIC_VERSION: &str = "vertex-2023-10-16";
const DEFAULT_CUSTOM_PATH: &str = "/chat/completions";

/// The full URL of the provider call.
pub(crate) fn endpoint(provider: &ProviderEntry, model: &str, stream: bool) -> String {
    let base = provider.base_url.trim_end_matches('/');

    match provider.kind {
        ProviderKind::Openai => format!("{base}/chat/completions"),
        ProviderKind::Responses => format!("{base}/responses"),
        ProviderKind::Anthropic => format!("{base}/messages"),
        ProviderKind::Custom => {
            let path = provider.path.as_deref().unwrap_or(DEFAULT_CUSTOM_PATH);
            format!("{base}/{}", path.trim_start_matches('/'))
        }
        ProviderKind::Gemini => gemini_method(format!("{base}/models/{model}"), stream),
        ProviderKind::Vertex => {
            let Some(vertex) = &provider.vertex else {
                return gemini_method(format!("{base}/models/{model}"), stream);
            };

            let prefix = format!("{base}/projects/{}/locations/{}/publishers", vertex.project, vertex.location);

            match vertex.publisher {
                VertexPublisher::Google => gemini_method(format!("{prefix}/google/models/{model}"), stream),
                VertexPublisher::Anthropic if stream => format!("{prefix}/anthropic/models/{model}:streamRawPredict"),
                VertexPublisher::Anthropic => format!("{prefix}/anthropic/models/{model}:rawPredict"),
            }
        }
    }
}

fn gemini_method(prefix: String, stream: bool) -> String {
    if stream {
        format!("{prefix}:streamGenerateContent?alt=sse")
    } else {
        format!("{prefix}:generateContent")
    }
}

/// Authentication and protocol headers, followed by the provider's configured headers.
pub(crate) fn headers(provider: &ProviderEntry) -> crate::Result<HeaderMap> {
    let mut headers = HeaderMap::new();
    headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));

    let secret = |value: String| {
        let mut value = HeaderValue::from_str(&value)
            .map_err(|_| LlmError::Internal(Some(format!("provider '{}' has an invalid API key", provider.id))))?;

        value.set_sensitive(true);

        Ok::<_, LlmError>(value)
    };

    if let Some(key) = &provider.api_key {
        let key = key.expose_secret();

        match provider.kind {
            ProviderKind::Anthropic => {
                headers.insert("x-api-key", secret(key.to_string())?);
            }
            ProviderKind::Gemini => {
                headers.insert("x-goog-api-key", secret(key.to_string())?);
            }
            ProviderKind::Openai | ProviderKind::Responses | ProviderKind::Custom | ProviderKind::Vertex => {
                headers.insert(AUTHORIZATION, secret(format!("Bearer {key}"))?);
            }
        }
    }

    if provider.kind == ProviderKind::Anthropic {
        headers.insert("anthropic-version", HeaderValue::from_static(ANTHROPIC_VERSION));
    }

    for (name, value) in &provider.headers {
        headers.insert(name.clone(), value.clone());
    }

    Ok(headers)
}

/// Adjusts an encoded request body for the provider's endpoint.
pub(crate) fn prepare_body(provider: &ProviderEntry, mut body: Value) -> Value {
    let vertex_anthropic = provider
        .vertex
        .as_ref()
        .is_some_and(|vertex| provider.kind == ProviderKind::Vertex && vertex.publisher == VertexPublisher::Anthropic);

    // Vertex takes the model from the URL and wants its own version field.
    if vertex_anthropic && let Value::Object(map) = &mut body {
        map.remove("model");
        map.insert("anthropic_version".into(), Value::from(VERTEX_ANTHROPIC_VERSION));
    }

    body
}

/// Classifies a transport error.
pub(crate) fn transport_error(provider: &str, error: reqwest::Error) -> LlmError {
    if error.is_connect() {
        LlmError::Connect(format!("failed to connect to provider '{provider}': {error}"))
    } else {
        LlmError::Network(format!("request to provider '{provider}' failed: {error}"))
    }
}

/// Sends the request and checks the status. Non-success answers become [`LlmError::Upstream`]
/// with the provider's status and message.
pub(crate) async fn send(
    http: &reqwest::Client,
    provider: &ProviderEntry,
    model: &str,
    stream: bool,
    body: Value,
) -> crate::Result<reqwest::Response> {
    let url = endpoint(provider, model, stream);

    log::debug!("Sending request to provider '{}' at {url}", provider.id);

    let body = serde_json::to_vec(&prepare_body(provider, body)).map_err(|e| LlmError::Transform(e.to_string()))?;

    let response = http
        .post(&url)
        .headers(headers(provider)?)
        .body(body)
        .send()
        .await
        .map_err(|e| transport_error(&provider.id, e))?;

    let status = response.status();

    if status.is_success() {
        return Ok(response);
    }

    let error_text = response.text().await.unwrap_or_else(|_| "Unknown error".to_string());
    log::warn!("Provider '{}' API error ({status}): {error_text}", provider.id);

    Err(LlmError::Upstream {
        status: status.as_u16(),
        message: upstream_message(&error_text),
    })
}

/// Pulls the human readable message out of a provider error body.
fn upstream_message(body: &str) -> String {
    let Ok(value) = sonic_rs::from_str::<Value>(body) else {
        return body.to_string();
    };

    let message = match &value {
        Value::Array(items) => items.first().and_then(|item| item.pointer("/error/message")),
        _ => value.pointer("/error/message").or_else(|| value.get("message")),
    };

    match message.and_then(Value::as_str) {
        Some(message) => message.to_string(),
        None => body.to_string(),
    }
}

/// Reads a complete JSON response body.
pub(crate) async fn read_json(provider: &str, response: reqwest::Response) -> crate::Result<Value> {
    let bytes = response.bytes().await.map_err(|e| transport_error(provider, e))?;

    sonic_rs::from_slice(&bytes).map_err(|e| {
        log::error!("Failed to parse response from provider '{provider}': {e}");
        log::debug!("Raw response that failed to parse: {}", String::from_utf8_lossy(&bytes));

        LlmError::Transform(format!("provider '{provider}' returned invalid JSON: {e}"))
    })
}

/// The response body as SSE events.
pub(crate) fn event_stream(provider: &str, response: reqwest::Response) -> SseEventStream {
    let provider = provider.to_string();

    let bytes = response
        .bytes_stream()
        .map(move |chunk| chunk.map_err(|e| transport_error(&provider, e)));

    parse_sse_stream(Box::pin(bytes))
}
