use axum::{
    extract::{Path, State},
    Json,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::api::error::ApiError;
use crate::domain::schedule::Schedule;
use crate::state::AppState;

#[derive(Debug, Deserialize)]
pub struct PutScheduleRequest {
    pub start_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
    pub target_soc: Option<i32>,
}

#[derive(Debug, Serialize)]
pub struct PutScheduleResponse {
    pub inserted: bool,
}

/// `POST /putSchedule` — validates `start < end`, inserts a manual
/// override (idempotent on `(start_time, end_time)`), pulses the wake
/// signal so the executor re-evaluates immediately.
pub async fn put_schedule(
    State(state): State<AppState>,
    Json(req): Json<PutScheduleRequest>,
) -> Result<Json<PutScheduleResponse>, ApiError> {
    if req.start_time >= req.end_time {
        return Err(ApiError::BadRequest("start_time must be before end_time".to_string()));
    }

    let target_soc = req.target_soc.unwrap_or(state.config.battery_reserve_start);
    let inserted = state
        .store
        .add_manual_override(req.start_time, req.end_time, target_soc)
        .await?;

    state.wake.set();
    Ok(Json(PutScheduleResponse { inserted }))
}

/// `DELETE /delSchedule/{id}` — if the row is currently active, force a
/// safe stop first; the row is removed either way.
pub async fn delete_schedule(
    State(state): State<AppState>,
    Path(id): Path<i64>,
) -> Result<Json<PutScheduleResponse>, ApiError> {
    state.executor.stop_active_for_delete(id).await?;
    state.store.remove(id).await?;
    state.wake.set();
    Ok(Json(PutScheduleResponse { inserted: true }))
}

/// `GET /getPendingSchedules` — pending rows with timestamps rendered in
/// local time.
pub async fn get_pending_schedules(State(state): State<AppState>) -> Result<Json<Vec<LocalSchedule>>, ApiError> {
    let tz = state.config.tz().map_err(|e| ApiError::Internal(e.to_string()))?;
    let pending = state.store.fetch_pending().await?;
    Ok(Json(pending.iter().map(|s| LocalSchedule::from_schedule(s, tz)).collect()))
}

#[derive(Debug, Serialize)]
pub struct LocalSchedule {
    pub id: i64,
    pub start_time: String,
    pub end_time: String,
    pub mode: String,
    pub manual_override: bool,
    pub target_soc: Option<i32>,
    pub price_p_per_kwh: Option<f64>,
}

impl LocalSchedule {
    fn from_schedule(s: &Schedule, tz: chrono_tz::Tz) -> Self {
        Self {
            id: s.id,
            start_time: s.start_time.with_timezone(&tz).to_rfc3339(),
            end_time: s.end_time.with_timezone(&tz).to_rfc3339(),
            mode: s.mode.to_string(),
            manual_override: s.manual_override,
            target_soc: s.target_soc,
            price_p_per_kwh: s.price_p_per_kwh,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::schedule::ScheduleMode;

    #[test]
    fn local_schedule_renders_rfc3339_in_requested_timezone() {
        let now = Utc::now();
        let schedule = Schedule {
            id: 1,
            start_time: now,
            end_time: now + chrono::Duration::minutes(30),
            mode: ScheduleMode::Manual,
            source: "manual".to_string(),
            manual_override: true,
            target_soc: Some(90),
            price_p_per_kwh: None,
            executed: false,
            expired: false,
            decision: None,
            decision_at: None,
            retry_count: 0,
            last_retry_utc: None,
            created_at: now,
        };

        let local = LocalSchedule::from_schedule(&schedule, chrono_tz::Europe::London);
        assert!(DateTime::parse_from_rfc3339(&local.start_time).is_ok());
    }
}
