//! The Conduit request pipeline.
//!
//! Clients speak OpenAI chat, OpenAI completions, Anthropic Messages or OpenAI Responses.
//! Every request is normalized into a common intermediate format, routed to a weighted,
//! healthy provider, and translated to that provider's wire protocol and back.

use std::sync::Arc;

use axum::{
    Router,
    body::Bytes,
    extract::{Extension, State},
    response::{IntoResponse, Json, Response},
    routing::{get, post},
};
use serde_json::Value;

mod breaker;
mod error;
mod mapping;
mod metrics;
mod protocol;
mod request;
mod script;
mod selector;
mod server;
mod snapshot;
mod sse;
mod stream;
mod token_counter;
mod transform;
mod uif;
mod upstream;

pub use breaker::BreakerStatus;
pub use error::{ErrorCategory, LlmError, TimeoutKind};
pub use protocol::WireFormat;
pub use request::{RequestContext, extract_api_key};
pub use server::Gateway;
pub use snapshot::{ConfigSource, Credential, FileSource, Snapshot, SnapshotError, hash_key};

use error::ClientError;

pub(crate) type Result<T> = std::result::Result<T, LlmError>;

/// Path of the token counting endpoint, which is exempt from rate limiting.
pub const COUNT_TOKENS_PATH: &str = "/v1/messages/count_tokens";

/// The wire format errors for a request path are rendered in.
pub fn client_format(path: &str) -> WireFormat {
    if path.starts_with("/v1/messages") {
        WireFormat::Anthropic
    } else if path.starts_with("/v1/responses") {
        WireFormat::Responses
    } else if path.starts_with("/v1/completions") {
        WireFormat::OpenAiCompletions
    } else {
        WireFormat::OpenAiChat
    }
}

/// Creates an axum router for the LLM endpoints.
///
/// Handlers expect a [`RequestContext`] extension, inserted by the authentication layer in
/// front of this router.
pub fn router(gateway: Arc<Gateway>) -> Router {
    Router::new()
        .route("/v1/chat/completions", post(chat_completions))
        .route("/v1/completions", post(completions))
        .route("/v1/messages", post(messages))
        .route(COUNT_TOKENS_PATH, post(count_tokens))
        .route("/v1/responses", post(responses))
        .route("/v1/models", get(list_models))
        .with_state(gateway)
}

/// Parses a client body. Rejections are rendered in the client's format, unlike axum's `Json`.
fn parse_body(body: &[u8], format: WireFormat) -> std::result::Result<Value, ClientError> {
    sonic_rs::from_slice(body).map_err(|e| ClientError {
        error: LlmError::InvalidRequest(format!("body is not valid JSON: {e}")),
        format,
    })
}

async fn generate(gateway: &Gateway, context: RequestContext, format: WireFormat, body: Bytes) -> Response {
    let body = match parse_body(&body, format) {
        Ok(body) => body,
        Err(error) => return error.into_response(),
    };

    match gateway.handle(context, format, body).await {
        Ok(response) => response,
        Err(error) => ClientError { error, format }.into_response(),
    }
}

/// Handle OpenAI chat completion requests, streaming when `stream: true` is set.
async fn chat_completions(
    State(gateway): State<Arc<Gateway>>,
    Extension(context): Extension<RequestContext>,
    body: Bytes,
) -> Response {
    generate(&gateway, context, WireFormat::OpenAiChat, body).await
}

/// Handle legacy OpenAI completion requests.
async fn completions(
    State(gateway): State<Arc<Gateway>>,
    Extension(context): Extension<RequestContext>,
    body: Bytes,
) -> Response {
    generate(&gateway, context, WireFormat::OpenAiCompletions, body).await
}

/// Handle Anthropic Messages requests.
async fn messages(
    State(gateway): State<Arc<Gateway>>,
    Extension(context): Extension<RequestContext>,
    body: Bytes,
) -> Response {
    generate(&gateway, context, WireFormat::Anthropic, body).await
}

/// Handle OpenAI Responses requests.
async fn responses(
    State(gateway): State<Arc<Gateway>>,
    Extension(context): Extension<RequestContext>,
    body: Bytes,
) -> Response {
    generate(&gateway, context, WireFormat::Responses, body).await
}

async fn count_tokens(State(gateway): State<Arc<Gateway>>, body: Bytes) -> Response {
    let format = WireFormat::Anthropic;

    let counted = parse_body(&body, format).and_then(|body| {
        gateway
            .count_tokens(body)
            .map_err(|error| ClientError { error, format })
    });

    match counted {
        Ok(counted) => Json(counted).into_response(),
        Err(error) => error.into_response(),
    }
}

/// Handle list models requests.
async fn list_models(
    State(gateway): State<Arc<Gateway>>,
    Extension(context): Extension<RequestContext>,
) -> Json<Value> {
    Json(gateway.list_models(&context))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_format_follows_the_path() {
        assert_eq!(client_format("/v1/messages"), WireFormat::Anthropic);
        assert_eq!(client_format(COUNT_TOKENS_PATH), WireFormat::Anthropic);
        assert_eq!(client_format("/v1/responses"), WireFormat::Responses);
        assert_eq!(client_format("/v1/completions"), WireFormat::OpenAiCompletions);
        assert_eq!(client_format("/v1/chat/completions"), WireFormat::OpenAiChat);
        assert_eq!(client_format("/v1/models"), WireFormat::OpenAiChat);
    }
}
