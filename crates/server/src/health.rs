use std::sync::Arc;

use axum::{Json, extract::State};
use http::StatusCode;
use llm::Gateway;
use serde::Serialize;

#[derive(Debug, Serialize)]
#[serde(rename_all = "lowercase")]
enum HealthStatus {
    Healthy,
}

#[derive(Debug, Serialize)]
pub(crate) struct HealthState {
    status: HealthStatus,
    /// Version of the configuration snapshot serving new requests.
    config_version: u64,
    active_requests: i64,
}

/// Handles health check requests and returns the current health status of the server.
pub(crate) async fn health(State(gateway): State<Arc<Gateway>>) -> (StatusCode, Json<HealthState>) {
    let state = HealthState {
        status: HealthStatus::Healthy,
        config_version: gateway.version(),
        active_requests: gateway.active_requests(),
    };

    (StatusCode::OK, Json(state))
}
