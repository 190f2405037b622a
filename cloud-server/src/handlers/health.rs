//! Health check handler

use axum::{extract::State, http::StatusCode, Json};
use serde::Serialize;
use shield_core::HealthState;

use crate::AppState;

#[derive(Serialize)]
pub struct HealthResponse {
    status: &'static str,
    version: &'static str,
    rule_set_version: u64,
    timestamp: i64,
}

/// 503 once the ledger is degraded
pub async fn check(State(state): State<AppState>) -> (StatusCode, Json<HealthResponse>) {
    let health = state.core.health();
    let code = match health {
        HealthState::Healthy => StatusCode::OK,
        HealthState::Degraded => StatusCode::SERVICE_UNAVAILABLE,
    };
    (
        code,
        Json(HealthResponse {
            status: health.as_str(),
            version: env!("CARGO_PKG_VERSION"),
            rule_set_version: state.core.store().ledger().head().version,
            timestamp: chrono::Utc::now().timestamp(),
        }),
    )
}
