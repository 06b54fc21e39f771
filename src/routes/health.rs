use std::sync::Arc;
use std::time::Instant;

use axum::extract::State;
use axum::http::StatusCode;
use axum::Json;
use lapin::Connection;
use serde::Serialize;

/// State backing the health probe.
#[derive(Clone)]
pub struct HealthState {
    pub worker_id: String,
    pub started_at: Instant,
    pub connection: Arc<Connection>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthResponse {
    pub status: String,
    /// Seconds since the worker booted.
    pub uptime: u64,
    pub worker_id: String,
}

/// GET /health — liveness plus bus connectivity.
pub async fn health_check(State(state): State<HealthState>) -> (StatusCode, Json<HealthResponse>) {
    let connected = state.connection.status().connected();

    let (status_code, status) = if connected {
        (StatusCode::OK, "ok")
    } else {
        (StatusCode::SERVICE_UNAVAILABLE, "degraded")
    };

    let response = HealthResponse {
        status: status.to_string(),
        uptime: state.started_at.elapsed().as_secs(),
        worker_id: state.worker_id.clone(),
    };

    (status_code, Json(response))
}
