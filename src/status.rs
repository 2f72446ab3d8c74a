#![allow(dead_code)]
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// In-memory snapshot of executor state, published for the control
/// surface's `/status` endpoint. Best-effort: not transactional with the
/// schedule store.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SharedStatus {
    pub active_schedule_id: Option<i64>,
    pub current_price: Option<f64>,
    pub soc: Option<f64>,
    pub solar_power: Option<f64>,
    pub island: Option<String>,
    pub message: Option<String>,
    pub next_schedule_time: Option<DateTime<Utc>>,
    pub last_scheduler_run: Option<DateTime<Utc>>,
}

/// Shared handle; cheap to clone, read by the control surface without
/// ever blocking the executor's own critical section.
#[derive(Clone)]
pub struct StatusHandle(Arc<Mutex<SharedStatus>>);

impl StatusHandle {
    pub fn new() -> Self {
        Self(Arc::new(Mutex::new(SharedStatus::default())))
    }

    pub fn snapshot(&self) -> SharedStatus {
        self.0.lock().clone()
    }

    pub fn update(&self, f: impl FnOnce(&mut SharedStatus)) {
        f(&mut self.0.lock());
    }

    /// Merge caller-supplied fields (used by `POST /update_status`).
    pub fn merge(&self, patch: StatusPatch) {
        let mut status = self.0.lock();
        if let Some(v) = patch.active_schedule_id {
            status.active_schedule_id = v;
        }
        if let Some(v) = patch.current_price {
            status.current_price = v;
        }
        if let Some(v) = patch.soc {
            status.soc = v;
        }
        if let Some(v) = patch.solar_power {
            status.solar_power = v;
        }
        if let Some(v) = patch.island {
            status.island = v;
        }
        if let Some(v) = patch.message {
            status.message = v;
        }
        if let Some(v) = patch.next_schedule_time {
            status.next_schedule_time = v;
        }
        if let Some(v) = patch.last_scheduler_run {
            status.last_scheduler_run = v;
        }
    }
}

impl Default for StatusHandle {
    fn default() -> Self {
        Self::new()
    }
}

/// Partial update accepted by `POST /update_status`; every field is
/// doubly-optional so a present `null` can clear a value.
#[derive(Debug, Default, Deserialize)]
pub struct StatusPatch {
    #[serde(default, deserialize_with = "double_option")]
    pub active_schedule_id: Option<Option<i64>>,
    #[serde(default, deserialize_with = "double_option")]
    pub current_price: Option<Option<f64>>,
    #[serde(default, deserialize_with = "double_option")]
    pub soc: Option<Option<f64>>,
    #[serde(default, deserialize_with = "double_option")]
    pub solar_power: Option<Option<f64>>,
    #[serde(default, deserialize_with = "double_option")]
    pub island: Option<Option<String>>,
    #[serde(default, deserialize_with = "double_option")]
    pub message: Option<Option<String>>,
    #[serde(default, deserialize_with = "double_option")]
    pub next_schedule_time: Option<Option<DateTime<Utc>>>,
    #[serde(default, deserialize_with = "double_option")]
    pub last_scheduler_run: Option<Option<DateTime<Utc>>>,
}

fn double_option<'de, T, D>(deserializer: D) -> Result<Option<Option<T>>, D::Error>
where
    T: Deserialize<'de>,
    D: serde::Deserializer<'de>,
{
    Ok(Some(Option::deserialize(deserializer)?))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn merge_only_touches_present_fields() {
        let handle = StatusHandle::new();
        handle.update(|s| {
            s.soc = Some(50.0);
            s.message = Some("idle".to_string());
        });

        handle.merge(StatusPatch {
            soc: Some(Some(60.0)),
            ..Default::default()
        });

        let snapshot = handle.snapshot();
        assert_eq!(snapshot.soc, Some(60.0));
        assert_eq!(snapshot.message, Some("idle".to_string()));
    }

    #[test]
    fn merge_can_clear_a_field_with_explicit_null() {
        let handle = StatusHandle::new();
        handle.update(|s| s.message = Some("active".to_string()));

        let patch: StatusPatch = serde_json::from_value(serde_json::json!({ "message": null })).unwrap();
        handle.merge(patch);

        assert_eq!(handle.snapshot().message, None);
    }
}
