#![allow(dead_code)]
use serde::{Deserialize, Serialize};

/// Live battery status as reported by the control API's `live_status`
/// object plus the two top-level fields the planner/executor need.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatteryStatus {
    pub percentage_charged: f64,
    pub grid_charging: bool,
    pub grid_status: String,
    pub island_status: String,
    pub battery_power: f64,
    pub solar_power: f64,
    pub load_power: f64,
    pub timestamp: String,
}

impl BatteryStatus {
    /// True when the site has dropped off the grid — the first gate
    /// the executor checks before acting on any schedule.
    pub fn is_off_grid(&self) -> bool {
        self.island_status.starts_with("off_grid")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample(island_status: &str) -> BatteryStatus {
        BatteryStatus {
            percentage_charged: 40.0,
            grid_charging: false,
            grid_status: "on".to_string(),
            island_status: island_status.to_string(),
            battery_power: 0.0,
            solar_power: 0.0,
            load_power: 500.0,
            timestamp: "2026-01-01T00:00:00Z".to_string(),
        }
    }

    #[test]
    fn off_grid_prefix_is_detected() {
        assert!(sample("off_grid").is_off_grid());
        assert!(sample("off_grid_backup").is_off_grid());
    }

    #[test]
    fn on_grid_status_is_not_off_grid() {
        assert!(!sample("on_grid").is_off_grid());
    }
}
