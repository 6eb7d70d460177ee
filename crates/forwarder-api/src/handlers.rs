//! HTTP handlers: readiness for the orchestrator, counters for humans.

use axum::extract::State;
use axum::http::StatusCode;
use axum::Json;
use serde::{Deserialize, Serialize};

use forwarder_core::{ForwardStats, HealthState};

#[derive(Clone)]
pub struct ApiState {
    pub health: HealthState,
    pub stats: ForwardStats,
}

// ── /healthz ─────────────────────────────────────────────────────────────────

pub async fn handle_healthz(State(state): State<ApiState>) -> (StatusCode, &'static str) {
    if state.health.is_ready() {
        (StatusCode::OK, "OK")
    } else {
        (StatusCode::SERVICE_UNAVAILABLE, "FAIL")
    }
}

// ── /status ──────────────────────────────────────────────────────────────────

#[derive(Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct StatusResponse {
    pub ready: bool,
    pub forwarded_total: u64,
}

pub async fn handle_status(State(state): State<ApiState>) -> Json<StatusResponse> {
    Json(StatusResponse {
        ready: state.health.is_ready(),
        forwarded_total: state.stats.total(),
    })
}
