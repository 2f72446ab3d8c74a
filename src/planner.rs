#![allow(dead_code)]
use crate::clients::{BatteryClient, TariffClient};
use crate::config::AppConfig;
use crate::store::{NewAutonomousSlot, ScheduleStore};
use chrono::{DateTime, Utc};
use tracing::{info, warn};

/// Selects the cheapest upcoming tariff slots needed to reach
/// `target_soc` and persists them. Never mutates existing rows; only
/// inserts (duplicates on `(start,end)` are dropped by the store).
pub struct Planner {
    store: std::sync::Arc<ScheduleStore>,
    battery: std::sync::Arc<BatteryClient>,
    tariff: std::sync::Arc<TariffClient>,
    config: AppConfig,
}

impl Planner {
    pub fn new(
        store: std::sync::Arc<ScheduleStore>,
        battery: std::sync::Arc<BatteryClient>,
        tariff: std::sync::Arc<TariffClient>,
        config: AppConfig,
    ) -> Self {
        Self {
            store,
            battery,
            tariff,
            config,
        }
    }

    pub async fn run(&self) -> anyhow::Result<usize> {
        info!("scheduler running — selecting cheapest agile slots");

        let slots_needed = match self.battery.status().await {
            Some(status) => {
                let kwh_needed = compute_required_kwh(
                    status.percentage_charged,
                    self.config.target_soc as f64,
                    self.config.battery_kwh,
                );
                let hours_needed = compute_required_hours(kwh_needed, self.config.charge_rate_kw);
                compute_required_slots(hours_needed, self.config.slot_hours)
            }
            None => {
                warn!("failed to read battery status, falling back to recommended slot count");
                self.config.recommended_slots.max(1) as usize
            }
        };

        let rates = self.tariff.fetch_rates().await;
        if rates.is_empty() {
            warn!("no agile rates returned, nothing to plan");
            return Ok(0);
        }

        let chosen = select_cheapest_upcoming_slots(&rates, slots_needed, Utc::now());
        if chosen.is_empty() {
            warn!("no upcoming slots found after filtering");
            return Ok(0);
        }

        let new_slots: Vec<NewAutonomousSlot> = chosen
            .iter()
            .map(|r| NewAutonomousSlot {
                start: r.valid_from,
                end: r.valid_to,
                target_soc: self.config.battery_reserve_start,
                price_p_per_kwh: Some(r.rate_p_per_kwh),
            })
            .collect();

        let inserted = self.store.add_batch(&new_slots).await?;
        info!(inserted, "scheduler complete");
        Ok(inserted as usize)
    }
}

/// kWh needed to go from `current_soc` to `target_soc`.
pub fn compute_required_kwh(current_soc: f64, target_soc: f64, battery_kwh: f64) -> f64 {
    let delta_soc = (target_soc - current_soc).max(0.0);
    (delta_soc / 100.0) * battery_kwh
}

/// Convert kWh needed into hours at `charge_rate_kw`.
pub fn compute_required_hours(kwh_needed: f64, charge_rate_kw: f64) -> f64 {
    if charge_rate_kw <= 0.0 {
        return 0.0;
    }
    kwh_needed / charge_rate_kw
}

/// Round `hours_needed / slot_hours` up, floor 1.
pub fn compute_required_slots(hours_needed: f64, slot_hours: f64) -> usize {
    if slot_hours <= 0.0 {
        return 1;
    }
    ((hours_needed / slot_hours).ceil() as i64).max(1) as usize
}

/// Drop rows already ended, then pick the `count` with the lowest rate
/// (ties broken by earlier start), returned sorted by start ascending.
pub fn select_cheapest_upcoming_slots(
    rates: &[crate::clients::tariff::RateWindow],
    count: usize,
    now: DateTime<Utc>,
) -> Vec<crate::clients::tariff::RateWindow> {
    let mut future: Vec<_> = rates.iter().filter(|r| r.valid_to > now).cloned().collect();
    future.sort_by(|a, b| {
        a.rate_p_per_kwh
            .partial_cmp(&b.rate_p_per_kwh)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then(a.valid_from.cmp(&b.valid_from))
    });
    future.truncate(count);
    future.sort_by_key(|r| r.valid_from);
    future
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clients::tariff::RateWindow;

    fn rate(start_min: i64, rate_p_per_kwh: f64) -> RateWindow {
        let base = Utc::now() + chrono::Duration::hours(1);
        RateWindow {
            valid_from: base + chrono::Duration::minutes(start_min),
            valid_to: base + chrono::Duration::minutes(start_min + 30),
            rate_p_per_kwh,
        }
    }

    #[test]
    fn required_kwh_is_clamped_at_zero_when_already_above_target() {
        assert_eq!(compute_required_kwh(95.0, 90.0, 13.5), 0.0);
    }

    #[test]
    fn required_slots_is_at_least_one_when_charging_is_required() {
        assert_eq!(compute_required_slots(0.1, 0.5), 1);
    }

    #[test]
    fn required_slots_rounds_up() {
        assert_eq!(compute_required_slots(1.1, 0.5), 3);
    }

    #[test]
    fn picks_two_cheapest_slots_sorted_by_start() {
        let rates = vec![rate(0, 8.0), rate(30, 30.0), rate(60, 6.0), rate(90, 7.0)];
        let chosen = select_cheapest_upcoming_slots(&rates, 2, Utc::now());
        assert_eq!(chosen.len(), 2);
        assert_eq!(chosen[0].rate_p_per_kwh, 6.0);
        assert_eq!(chosen[1].rate_p_per_kwh, 7.0);
        assert!(chosen[0].valid_from < chosen[1].valid_from);
    }

    #[test]
    fn drops_slots_that_have_already_ended() {
        let now = Utc::now() + chrono::Duration::hours(2);
        let rates = vec![rate(0, 5.0), rate(200, 9.0)];
        let chosen = select_cheapest_upcoming_slots(&rates, 2, now);
        assert_eq!(chosen.len(), 1);
        assert_eq!(chosen[0].rate_p_per_kwh, 9.0);
    }
}
