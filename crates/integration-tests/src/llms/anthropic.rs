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
    Router::new().route("/v1/messages", post(create_message)).with_state(state)
}

async fn create_message(State(state): State<Arc<MockState>>, headers: HeaderMap, Json(body): Json<Value>) -> Response {
    if let Some(response) = state.receive("/v1/messages", &headers, &body).await {
        return response;
    }

    let model = body["model"].as_str().unwrap_or_default().to_string();

    if body["stream"].as_bool() == Some(true) {
        return stream(&state, &model);
    }

    let prompt = body["messages"]
        .as_array()
        .and_then(|messages| messages.last())
        .map(|message| content_text(&message["content"]))
        .unwrap_or_default();

    Json(json!({
        "id": "msg_mock",
        "type": "message",
        "role": "assistant",
        "model": model,
        "content": [{"type": "text", "text": format!("Test response to: {prompt}")}],
        "stop_reason": "end_turn",
        "stop_sequence": null,
        "usage": {"input_tokens": 10, "output_tokens": 15}
    }))
    .into_response()
}

fn stream(state: &MockState, model: &str) -> Response {
    let event = |name: &str, data: Value| format!("event: {name}\ndata: {data}\n\n");

    let frames = vec![
        event(
            "message_start",
            json!({
                "type": "message_start",
                "message": {
                    "id": "msg_mock",
                    "type": "message",
                    "role": "assistant",
                    "model": model,
                    "content": [],
                    "stop_reason": null,
                    "usage": {"input_tokens": 10, "output_tokens": 1}
                }
            }),
        ),
        event(
            "content_block_start",
            json!({"type": "content_block_start", "index": 0, "content_block": {"type": "text", "text": ""}}),
        ),
        event(
            "content_block_delta",
            json!({"type": "content_block_delta", "index": 0, "delta": {"type": "text_delta", "text": "Hello"}}),
        ),
        event(
            "content_block_delta",
            json!({"type": "content_block_delta", "index": 0, "delta": {"type": "text_delta", "text": " world"}}),
        ),
        event("content_block_stop", json!({"type": "content_block_stop", "index": 0})),
        event(
            "message_delta",
            json!({"type": "message_delta", "delta": {"stop_reason": "end_turn"}, "usage": {"output_tokens": 2}}),
        ),
        event("message_stop", json!({"type": "message_stop"})),
    ];

    sse_body(frames, state.aborts().then_some(3))
}
