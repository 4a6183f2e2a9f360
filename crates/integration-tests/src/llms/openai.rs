use std::sync::Arc;

use axum::{
    Json, Router,
    extract::State,
    http::HeaderMap,
    response::{IntoResponse, Response},
    routing::post,
};
use serde_json::{Value, json};

use super::{MockState, content_text, sse_body};

pub(super) fn router(state: Arc<MockState>) -> Router {
    Router::new()
        .route("/v1/chat/completions", post(chat_completions))
        .with_state(state)
}

fn last_user_text(body: &Value) -> String {
    body["messages"]
        .as_array()
        .and_then(|messages| messages.iter().rev().find(|message| message["role"] == "user"))
        .map(|message| content_text(&message["content"]))
        .unwrap_or_default()
}

async fn chat_completions(State(state): State<Arc<MockState>>, headers: HeaderMap, Json(body): Json<Value>) -> Response {
    if let Some(response) = state.receive("/v1/chat/completions", &headers, &body).await {
        return response;
    }

    let model = body["model"].as_str().unwrap_or_default().to_string();

    if body["stream"].as_bool() == Some(true) {
        return stream(&state, &model);
    }

    Json(json!({
        "id": "chatcmpl-mock",
        "object": "chat.completion",
        "created": 1677651200,
        "model": model,
        "choices": [{
            "index": 0,
            "message": {
                "role": "assistant",
                "content": format!("Test response to: {}", last_user_text(&body)),
            },
            "finish_reason": "stop"
        }],
        "usage": {
            "prompt_tokens": 10,
            "completion_tokens": 15,
            "total_tokens": 25
        }
    }))
    .into_response()
}

fn stream(state: &MockState, model: &str) -> Response {
    let chunk = |delta: Value, finish_reason: Value| {
        format!(
            "data: {}\n\n",
            json!({
                "id": "chatcmpl-mock",
                "object": "chat.completion.chunk",
                "created": 1677651200,
                "model": model,
                "choices": [{"index": 0, "delta": delta, "finish_reason": finish_reason}]
            })
        )
    };

    let usage = json!({
        "id": "chatcmpl-mock",
        "object": "chat.completion.chunk",
        "created": 1677651200,
        "model": model,
        "choices": [],
        "usage": {"prompt_tokens": 10, "completion_tokens": 2, "total_tokens": 12}
    });

    let frames = vec![
        chunk(json!({"role": "assistant", "content": ""}), Value::Null),
        chunk(json!({"content": "Hello"}), Value::Null),
        chunk(json!({"content": " world"}), Value::Null),
        chunk(json!({}), json!("stop")),
        format!("data: {usage}\n\n"),
        "data: [DONE]\n\n".to_string(),
    ];

    sse_body(frames, state.aborts().then_some(2))
}
