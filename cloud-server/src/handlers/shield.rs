//! Patch ingress
//!
//! The body is handed to the core unmodified. Admission runs on the
//! blocking pool and is bounded by the configured timeout; a request that
//! times out fails without touching the active rules.

use std::sync::Arc;

use axum::{body::Bytes, extract::State, http::StatusCode};

use crate::{AppError, AppResult, AppState};

pub async fn submit(State(state): State<AppState>, body: Bytes) -> AppResult<StatusCode> {
    let core = Arc::clone(&state.core);
    let timeout = state.config.pipeline.admission_timeout;

    let task = tokio::task::spawn_blocking(move || core.admission().submit_bytes(&body));
    let set = match tokio::time::timeout(timeout, task).await {
        Err(_) => {
            tracing::warn!("Patch admission exceeded {:?}", timeout);
            return Err(AppError::Timeout);
        }
        Ok(Err(e)) => return Err(AppError::InternalError(e.to_string())),
        Ok(Ok(result)) => result?,
    };

    tracing::debug!("Patch committed as v{}", set.version());
    Ok(StatusCode::NO_CONTENT)
}
