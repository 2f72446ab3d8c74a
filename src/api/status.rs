use axum::{extract::State, Json};
use serde::Serialize;

use crate::api::error::ApiError;
use crate::state::AppState;
use crate::status::{SharedStatus, StatusPatch};

#[derive(Debug, Serialize)]
pub struct StatusResponse {
    #[serde(flatten)]
    pub status: SharedStatus,
    pub uptime: i64,
}

/// `GET /status` — current Shared Status plus process uptime.
pub async fn get_status(State(state): State<AppState>) -> Json<StatusResponse> {
    Json(StatusResponse {
        status: state.status.snapshot(),
        uptime: state.uptime_seconds(),
    })
}

/// `POST /update_status` — merges the given fields into Shared Status;
/// a present `null` clears the corresponding field.
pub async fn update_status(
    State(state): State<AppState>,
    Json(patch): Json<StatusPatch>,
) -> Result<Json<SharedStatus>, ApiError> {
    state.status.merge(patch);
    Ok(Json(state.status.snapshot()))
}
