pub mod error;
pub mod health;
pub mod schedule;
pub mod status;

use axum::routing::{delete, get, post};
use axum::Router;
use tower_http::{cors::CorsLayer, trace::TraceLayer};

use crate::state::AppState;

/// Operator HTTP surface. Flat routes, no versioning prefix — this is a
/// single-tenant edge daemon's control surface, not a public API.
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/putSchedule", post(schedule::put_schedule))
        .route("/delSchedule/:id", delete(schedule::delete_schedule))
        .route("/getPendingSchedules", get(schedule::get_pending_schedules))
        .route("/status", get(status::get_status))
        .route("/update_status", post(status::update_status))
        .route("/health", get(health::health_check))
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
