#![allow(dead_code)]
use crate::config::AppConfig;
use crate::executor::Executor;
use crate::status::StatusHandle;
use crate::store::ScheduleStore;
use crate::wake::WakeSignal;
use chrono::{DateTime, Utc};
use std::sync::Arc;

/// Shared handle passed into every axum handler. Cheap to clone — every
/// field is an `Arc` or already `Clone`-cheap.
#[derive(Clone)]
pub struct AppState {
    pub store: Arc<ScheduleStore>,
    pub executor: Arc<Executor>,
    pub status: StatusHandle,
    pub wake: WakeSignal,
    pub config: Arc<AppConfig>,
    pub started_at: DateTime<Utc>,
}

impl AppState {
    pub fn uptime_seconds(&self) -> i64 {
        (Utc::now() - self.started_at).num_seconds().max(0)
    }
}
