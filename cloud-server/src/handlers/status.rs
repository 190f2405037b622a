//! Status and history handlers

use axum::{
    extract::{Query, State},
    Json,
};
use serde::Deserialize;
use shield_core::{AdmissionRecord, CoreStatus, LedgerEntry};

use crate::AppState;

pub async fn get(State(state): State<AppState>) -> Json<CoreStatus> {
    Json(state.core.status())
}

pub async fn ledger(State(state): State<AppState>) -> Json<Vec<LedgerEntry>> {
    Json(state.core.store().ledger().history())
}

#[derive(Deserialize)]
pub struct AuditQuery {
    limit: Option<usize>,
}

/// Most recent admission outcomes, newest last
pub async fn audit(
    State(state): State<AppState>,
    Query(query): Query<AuditQuery>,
) -> Json<Vec<AdmissionRecord>> {
    Json(state.core.audit().recent(query.limit.unwrap_or(100).min(1000)))
}
