use std::sync::Arc;

use axum::{
    Json, Router,
    extract::{Path, State},
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::post,
};
use serde_json::{Value, json};

use super::{MockState, sse_body};

pub(super) fn router(state: Arc<MockState>) -> Router {
    Router::new()
        .route("/v1beta/models/{model_action}", post(generate_content))
        .with_state(state)
}

async fn generate_content(
    State(state): State<Arc<MockState>>,
    Path(model_action): Path<String>,
    headers: HeaderMap,
    Json(body): Json<Value>,
) -> Response {
    let path = format!("/v1beta/models/{model_action}");

    if let Some(response) = state.receive(&path, &headers, &body).await {
        return response;
    }

    let Some((model, action)) = model_action.split_once(':') else {
        return (StatusCode::NOT_FOUND, "unknown method").into_response();
    };

    if action == "streamGenerateContent" {
        return stream(&state, model);
    }

    let prompt: String = body["contents"]
        .as_array()
        .and_then(|contents| contents.last())
        .and_then(|content| content["parts"].as_array())
        .map(|parts| parts.iter().filter_map(|part| part["text"].as_str()).collect())
        .unwrap_or_default();

    Json(json!({
        "candidates": [{
            "content": {"role": "model", "parts": [{"text": format!("Test response to: {prompt}")}]},
            "finishReason": "STOP",
            "index": 0
        }],
        "usageMetadata": {"promptTokenCount": 10, "candidatesTokenCount": 15, "totalTokenCount": 25},
        "modelVersion": model
    }))
    .into_response()
}

fn stream(state: &MockState, model: &str) -> Response {
    let chunk = |text: &str, finish_reason: Option<&str>| {
        let mut candidate = json!({
            "content": {"role": "model", "parts": [{"text": text}]},
            "index": 0
        });

        let mut chunk = json!({"modelVersion": model});

        if let Some(reason) = finish_reason {
            candidate["finishReason"] = json!(reason);
            chunk["usageMetadata"] = json!({"promptTokenCount": 10, "candidatesTokenCount": 2, "totalTokenCount": 12});
        }

        chunk["candidates"] = json!([candidate]);

        format!("data: {chunk}\n\n")
    };

    let frames = vec![chunk("Hello", None), chunk(" world", Some("STOP"))];

    sse_body(frames, state.aborts().then_some(1))
}
