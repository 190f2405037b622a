//! Telemetry ingress

use axum::{body::Bytes, extract::State, http::StatusCode, Json};
use serde::Deserialize;
use shield_core::{BatchOutcome, RawEvent};

use crate::{AppError, AppResult, AppState};

/// Agents send either one record or an array of them
#[derive(Deserialize)]
#[serde(untagged)]
enum TelemetryBody {
    Batch(Vec<RawEvent>),
    Single(RawEvent),
}

pub async fn ingest(
    State(state): State<AppState>,
    body: Bytes,
) -> AppResult<(StatusCode, Json<BatchOutcome>)> {
    let batch = match serde_json::from_slice::<TelemetryBody>(&body) {
        Ok(TelemetryBody::Batch(events)) => events,
        Ok(TelemetryBody::Single(event)) => vec![event],
        Err(e) => return Err(AppError::BadRequest(format!("invalid telemetry payload: {}", e))),
    };

    let outcome = state.core.pipeline().ingest_batch(batch).await?;
    if outcome.malformed > 0 {
        tracing::debug!("Dropped {} malformed events", outcome.malformed);
    }
    Ok((StatusCode::ACCEPTED, Json(outcome)))
}
