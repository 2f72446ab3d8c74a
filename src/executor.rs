#![allow(dead_code)]
use crate::clients::{saving_sessions, BatteryClient, SavingSessionClient, SolarClient, TariffClient};
use crate::config::AppConfig;
use crate::domain::schedule::{DecisionAction, Schedule};
use crate::planner::Planner;
use crate::status::StatusHandle;
use crate::store::ScheduleStore;
use crate::wake::WakeSignal;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{error, info};

const HEARTBEAT: Duration = Duration::from_secs(60);

/// The control loop that drives schedules through their lifecycle and
/// issues battery commands. Single instance; never runs concurrently
/// with itself, so it is the sole writer of outbound battery commands.
pub struct Executor {
    store: Arc<ScheduleStore>,
    battery: Arc<BatteryClient>,
    tariff: Arc<TariffClient>,
    solar: Arc<SolarClient>,
    saving_sessions: Arc<SavingSessionClient>,
    planner: Arc<Planner>,
    wake: WakeSignal,
    status: StatusHandle,
    active_schedule_id: Arc<Mutex<Option<i64>>>,
    last_planner_run: Mutex<Option<DateTime<Utc>>>,
    config: AppConfig,
}

impl Executor {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        store: Arc<ScheduleStore>,
        battery: Arc<BatteryClient>,
        tariff: Arc<TariffClient>,
        solar: Arc<SolarClient>,
        saving_sessions: Arc<SavingSessionClient>,
        planner: Arc<Planner>,
        wake: WakeSignal,
        status: StatusHandle,
        config: AppConfig,
    ) -> Self {
        Self {
            store,
            battery,
            tariff,
            solar,
            saving_sessions,
            planner,
            wake,
            status,
            active_schedule_id: Arc::new(Mutex::new(None)),
            last_planner_run: Mutex::new(None),
            config,
        }
    }

    pub fn active_schedule_id(&self) -> Option<i64> {
        *self.active_schedule_id.lock()
    }

    pub fn wake_signal(&self) -> WakeSignal {
        self.wake.clone()
    }

    /// Operator-triggered safe stop for the currently active schedule:
    /// issues the reserve-end command, appends a `stopped` decision, marks
    /// the schedule terminal `cancelled` (an operator delete is not a
    /// completed charge), clears the active id.
    pub async fn stop_active_for_delete(&self, schedule_id: i64) -> anyhow::Result<()> {
        if self.active_schedule_id() != Some(schedule_id) {
            return Ok(());
        }
        self.force_safe_stop(schedule_id, "operator_delete", DecisionAction::Cancelled).await
    }

    /// Issues the reserve-end command, appends a `stopped` audit decision,
    /// and marks the schedule terminal with `terminal_action` — callers
    /// pick the terminal label since a delete and a process shutdown mean
    /// different things for the same stop mechanics.
    async fn force_safe_stop(&self, schedule_id: i64, reason: &str, terminal_action: DecisionAction) -> anyhow::Result<()> {
        self.battery
            .set_charge(self.config.battery_reserve_end, false, None)
            .await;

        if let Some(schedule) = self.store.get(schedule_id).await? {
            self.store
                .add_decision(
                    schedule_id,
                    schedule.start_time,
                    schedule.end_time,
                    DecisionAction::Stopped,
                    reason,
                    None,
                    None,
                    None,
                    schedule.price_p_per_kwh,
                )
                .await?;
            self.store.mark_terminal(schedule_id, terminal_action).await?;
        }
        *self.active_schedule_id.lock() = None;
        Ok(())
    }

    /// The loop of the design: sweep expirations, maybe run the planner,
    /// refresh the solar cache, pick the next schedule to act on, sleep
    /// or process it. Runs until `shutdown_rx` reports a shutdown.
    pub async fn run(&self, mut shutdown_rx: watch::Receiver<bool>) {
        loop {
            if *shutdown_rx.borrow() {
                info!("shutdown requested, exiting control loop");
                return;
            }

            let now = Utc::now();

            if let Err(e) = self.store.mark_all_expired(now).await {
                error!(error = %e, "failed to sweep expired schedules");
            }

            self.maybe_run_planner().await;

            let pending = match self.store.fetch_pending().await {
                Ok(rows) => rows,
                Err(e) => {
                    error!(error = %e, "failed to fetch pending schedules");
                    self.sleep_wakeable(Duration::from_secs(self.config.executor_poll_interval as u64), &mut shutdown_rx)
                        .await;
                    continue;
                }
            };

            if pending.is_empty() {
                self.status.update(|s| s.message = Some("idle, no pending schedules".to_string()));
                self.sleep_wakeable(Duration::from_secs(self.config.executor_idle_sleep_sec as u64), &mut shutdown_rx)
                    .await;
                continue;
            }

            let sleep_ahead = chrono::Duration::seconds(self.config.executor_sleep_ahead_sec);
            let mut candidate: Option<&Schedule> = None;
            let mut earliest_future: Option<DateTime<Utc>> = None;

            for row in &pending {
                let due_soon = row.start_time - sleep_ahead <= now;
                let active = row.start_time <= now && now < row.end_time;
                if active || due_soon {
                    candidate = Some(row);
                    break;
                }
                if earliest_future.map_or(true, |t| row.start_time < t) {
                    earliest_future = Some(row.start_time);
                }
            }

            match candidate {
                Some(row) => {
                    let row = row.clone();
                    if let Err(e) = self.process_row(row, &mut shutdown_rx).await {
                        error!(error = %e, "process_row failed");
                    }
                }
                None => {
                    let wait_for = earliest_future
                        .map(|t| (t - sleep_ahead - now).to_std().unwrap_or(Duration::ZERO))
                        .unwrap_or(Duration::from_secs(self.config.executor_idle_sleep_sec as u64))
                        .max(Duration::from_secs(self.config.executor_poll_interval as u64));
                    self.sleep_wakeable(wait_for, &mut shutdown_rx).await;
                }
            }
        }
    }

    async fn maybe_run_planner(&self) {
        let should_run = {
            let last = *self.last_planner_run.lock();
            match last {
                None => true,
                Some(last) => {
                    let interval_hours = 24.0 / self.config.scheduler_runs_per_day.max(1) as f64;
                    Utc::now() - last >= chrono::Duration::milliseconds((interval_hours * 3_600_000.0) as i64)
                }
            }
        };

        if !should_run {
            return;
        }

        match self.planner.run().await {
            Ok(count) => {
                *self.last_planner_run.lock() = Some(Utc::now());
                self.status.update(|s| s.last_scheduler_run = Some(Utc::now()));
                info!(count, "planner run complete");
            }
            Err(e) => error!(error = %e, "planner run failed"),
        }
    }

    /// Evaluate gates and drive one pending schedule through to a
    /// terminal decision (except the "not due yet" and "battery status
    /// unavailable" paths, which return without terminalising).
    async fn process_row(&self, schedule: Schedule, shutdown_rx: &mut watch::Receiver<bool>) -> anyhow::Result<()> {
        let id = schedule.id;

        if schedule.start_time >= schedule.end_time {
            self.terminalise(&schedule, DecisionAction::Error, "bad_datetime", None, None, None)
                .await?;
            return Ok(());
        }

        let Some(status) = self.battery.status().await else {
            return Ok(());
        };

        if status.is_off_grid() {
            self.terminalise(
                &schedule,
                DecisionAction::Cancelled,
                "Powerwall off-grid",
                Some(status.percentage_charged),
                Some(status.solar_power),
                Some(true),
            )
            .await?;
            return Ok(());
        }

        let sessions = self.saving_sessions.get_active_sessions().await;
        if saving_sessions::overlaps(schedule.start_time, schedule.end_time, &sessions) {
            self.terminalise(
                &schedule,
                DecisionAction::Cancelled,
                "Saving sessions",
                Some(status.percentage_charged),
                Some(status.solar_power),
                Some(false),
            )
            .await?;
            return Ok(());
        }

        let now = Utc::now();
        if now < schedule.start_time {
            self.status.update(|s| {
                s.message = Some(format!("waiting for schedule {id}"));
                s.next_schedule_time = Some(schedule.start_time);
            });
            let delta = (schedule.start_time - now).to_std().unwrap_or(Duration::ZERO).min(Duration::from_secs(60));
            self.sleep_wakeable(delta, shutdown_rx).await;
            return Ok(());
        }

        let _active_guard = ActiveScheduleGuard::new(self.active_schedule_id.clone(), id);

        let current_price = match self.tariff.fetch_rate_for(schedule.start_time, schedule.end_time).await {
            Some(price) => price,
            None => self.store.get_stored_price(id).await.unwrap_or(20.0),
        };

        if !schedule.manual_override {
            if self.in_peak_window(schedule.start_time) || self.in_peak_window(schedule.end_time) {
                self.terminalise(
                    &schedule,
                    DecisionAction::Cancelled,
                    "peak_window",
                    Some(status.percentage_charged),
                    Some(status.solar_power),
                    Some(false),
                )
                .await?;
                return Ok(());
            }

            if status.percentage_charged >= self.config.soc_skip_threshold as f64 {
                let reason = format!("soc_high_{}", status.percentage_charged.round() as i64);
                self.terminalise(
                    &schedule,
                    DecisionAction::Cancelled,
                    &reason,
                    Some(status.percentage_charged),
                    Some(status.solar_power),
                    Some(false),
                )
                .await?;
                return Ok(());
            }

            if current_price > self.config.max_agile_price_ppk {
                let reason = format!(
                    "price_high_{:.1}p>limit_{:.0}p",
                    current_price, self.config.max_agile_price_ppk
                );
                self.terminalise(
                    &schedule,
                    DecisionAction::Cancelled,
                    &reason,
                    Some(status.percentage_charged),
                    Some(status.solar_power),
                    Some(false),
                )
                .await?;
                return Ok(());
            }

            if self
                .solar
                .has_enough_solar(schedule.start_time, schedule.end_time, self.config.charge_rate_kw)
                .await
            {
                self.battery
                    .set_charge(self.config.battery_reserve_end, false, None)
                    .await;
                self.terminalise(
                    &schedule,
                    DecisionAction::Cancelled,
                    "Forecasted enough Solar",
                    Some(status.percentage_charged),
                    Some(status.solar_power),
                    Some(false),
                )
                .await?;
                return Ok(());
            }
        }

        let target_soc = schedule.target_soc.unwrap_or(self.config.battery_reserve_start);
        let reserve_value = if schedule.manual_override {
            target_soc
        } else if status.percentage_charged < self.config.battery_reserve_start as f64 {
            self.config.battery_reserve_start
        } else {
            self.config.soc_skip_threshold
        };

        let charge_started = self
            .battery
            .set_charge(reserve_value, true, Some("autonomous"))
            .await;
        if !charge_started {
            self.abort(&schedule, "System_Error").await?;
            return Ok(());
        }

        self.status.update(|s| {
            s.active_schedule_id = Some(id);
            s.current_price = Some(current_price);
            s.message = Some(format!("charging schedule {id}"));
        });

        match self.heartbeat_until_done(&schedule, target_soc, shutdown_rx).await {
            HeartbeatOutcome::Shutdown => {
                self.force_safe_stop(id, "manual_interrupt", DecisionAction::Stopped).await?;
                return Ok(());
            }
            HeartbeatOutcome::Cleared => {
                // Active id was reassigned out from under us — a control-surface
                // delete already issued the safe-stop, audit decision, and
                // terminal mark for this schedule. Writing anything here would
                // be a second terminal decision for the same row.
                return Ok(());
            }
            HeartbeatOutcome::Done => {}
        }

        // The charge loop above can only observe shutdown/clearing between
        // heartbeat ticks; re-check right before the terminal write to close
        // the race where a delete lands in the gap between the last tick and
        // here.
        if self.active_schedule_id() != Some(id) {
            return Ok(());
        }

        let chained = self
            .store
            .next_after(schedule.end_time, chrono::Duration::minutes(30))
            .await?;

        if chained.is_none() {
            self.battery
                .set_charge(self.config.battery_reserve_end, false, None)
                .await;
        }

        self.terminalise(
            &schedule,
            DecisionAction::Completed,
            "charge_complete",
            Some(status.percentage_charged),
            Some(status.solar_power),
            Some(false),
        )
        .await?;
        Ok(())
    }

    async fn heartbeat_until_done(
        &self,
        schedule: &Schedule,
        target_soc: i32,
        shutdown_rx: &mut watch::Receiver<bool>,
    ) -> HeartbeatOutcome {
        loop {
            if *shutdown_rx.borrow() {
                return HeartbeatOutcome::Shutdown;
            }

            // A control-surface delete runs concurrently with this loop and
            // reassigns active_schedule_id as part of its own safe-stop; if
            // that happened, the delete has already written this row's
            // terminal decision and we must not write another one.
            if self.active_schedule_id() != Some(schedule.id) {
                return HeartbeatOutcome::Cleared;
            }

            let now = Utc::now();
            if now >= schedule.end_time {
                return HeartbeatOutcome::Done;
            }

            if schedule.manual_override {
                if let Some(status) = self.battery.status().await {
                    if status.percentage_charged >= target_soc as f64 {
                        return HeartbeatOutcome::Done;
                    }
                    self.status.update(|s| s.soc = Some(status.percentage_charged));
                }
            } else if let Some(status) = self.battery.status().await {
                self.status.update(|s| {
                    s.soc = Some(status.percentage_charged);
                    s.solar_power = Some(status.solar_power);
                });
            }

            let remaining = (schedule.end_time - now).to_std().unwrap_or(Duration::ZERO);
            let chunk = remaining.min(HEARTBEAT);

            tokio::select! {
                _ = self.wake.wait(chunk) => {}
                changed = shutdown_rx.changed() => {
                    if changed.is_ok() && *shutdown_rx.borrow() {
                        return HeartbeatOutcome::Shutdown;
                    }
                }
            }
        }
    }

    async fn abort(&self, schedule: &Schedule, reason: &str) -> anyhow::Result<()> {
        self.battery
            .set_charge(self.config.battery_reserve_end, false, None)
            .await;
        self.terminalise(schedule, DecisionAction::Aborted, reason, None, None, None)
            .await?;
        Ok(())
    }

    #[allow(clippy::too_many_arguments)]
    async fn terminalise(
        &self,
        schedule: &Schedule,
        action: DecisionAction,
        reason: &str,
        soc: Option<f64>,
        solar_power: Option<f64>,
        island_status: Option<bool>,
    ) -> anyhow::Result<()> {
        self.store
            .add_decision(
                schedule.id,
                schedule.start_time,
                schedule.end_time,
                action,
                reason,
                soc,
                solar_power,
                island_status,
                schedule.price_p_per_kwh,
            )
            .await?;
        self.store.mark_terminal(schedule.id, action).await?;
        self.status.update(|s| s.message = Some(format!("{action}: {reason}")));
        Ok(())
    }

    fn in_peak_window(&self, instant: DateTime<Utc>) -> bool {
        let tz = self.config.tz().unwrap_or(chrono_tz::UTC);
        let hour = instant.with_timezone(&tz).format("%H").to_string().parse::<u32>().unwrap_or(0);
        let (start, end) = (self.config.peak_start_hour, self.config.peak_end_hour);
        if start <= end {
            hour >= start && hour < end
        } else {
            hour >= start || hour < end
        }
    }

    async fn sleep_wakeable(&self, duration: Duration, shutdown_rx: &mut watch::Receiver<bool>) {
        tokio::select! {
            _ = self.wake.wait(duration) => {}
            _ = shutdown_rx.changed() => {}
        }
    }
}

enum HeartbeatOutcome {
    Done,
    Shutdown,
    Cleared,
}

/// Sets `active_schedule_id` on construction, clears it on drop — covers
/// every early return and `?`-propagated error in `process_row` alike.
struct ActiveScheduleGuard {
    active: Arc<Mutex<Option<i64>>>,
}

impl ActiveScheduleGuard {
    fn new(active: Arc<Mutex<Option<i64>>>, id: i64) -> Self {
        *active.lock() = Some(id);
        Self { active }
    }
}

impl Drop for ActiveScheduleGuard {
    fn drop(&mut self) {
        *self.active.lock() = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn peak_window_is_half_open_at_the_end() {
        let cfg = test_config();
        let executor = test_executor(cfg);
        let tz = executor.config.tz().unwrap();

        let start_of_peak = tz
            .with_ymd_and_hms(2026, 1, 1, 16, 0, 0)
            .unwrap()
            .with_timezone(&Utc);
        let end_of_peak = tz
            .with_ymd_and_hms(2026, 1, 1, 19, 0, 0)
            .unwrap()
            .with_timezone(&Utc);

        assert!(executor.in_peak_window(start_of_peak));
        assert!(!executor.in_peak_window(end_of_peak));
    }

    fn test_config() -> AppConfig {
        // minimal construction mirrors config::tests::minimal
        let json = serde_json::json!({
            "host": "0.0.0.0", "port": 8080, "timezone": "Europe/London",
            "db_path": "data/schedules.db", "agile_url": "https://agile.example/rates",
            "netzero_api_key": "key", "site_id": "site-1",
            "netzero_url_template": "https://netzero.example/{SITE_ID}",
            "simulation_mode": true, "battery_reserve_start": 50, "battery_reserve_end": 20,
            "battery_kwh": 13.5, "charge_rate_kw": 3.5, "soc_skip_threshold": 80,
            "peak_start_hour": 16, "peak_end_hour": 19, "max_agile_price_ppk": 15.0,
            "executor_sleep_ahead_sec": 120, "executor_idle_sleep_sec": 300,
            "executor_poll_interval": 60, "grace_retry_interval": 300,
            "scheduler_runs_per_day": 1, "target_soc": 90, "slot_hours": 0.5,
            "recommended_slots": 5, "latitude": 51.5, "longitude": -0.1,
            "weather_api_baseurl": "https://weather.example", "weather_cache_path": "data/solar.json",
            "weather_cache_ttl_secs": 3600, "pv_num_panels": 12, "pv_nominal_wattage": 400.0,
            "pv_stc_wattage": 440.0, "pv_nominal_irradiance": 1000.0, "pv_derating_factor": 0.85,
            "pv_tilt_angle": 30.0, "pv_azimuth_angle": 180.0,
            "octopus_graphql_url": "https://octopus.example/graphql",
            "octopus_api_key": null, "octopus_account_number": null
        });
        serde_json::from_value(json).unwrap()
    }

    fn test_executor(config: AppConfig) -> Executor {
        use crate::clients::solar::PanelArray;
        let store = Arc::new(futures_blocking_store());
        let battery = Arc::new(BatteryClient::new(
            config.netzero_url(),
            config.netzero_api_key.clone(),
            true,
        ));
        let tariff = Arc::new(TariffClient::new(config.agile_url.clone()));
        let solar = Arc::new(SolarClient::new(
            config.weather_api_baseurl.clone(),
            config.weather_cache_path.clone().into(),
            config.weather_cache_ttl_secs,
            config.latitude,
            config.longitude,
            PanelArray {
                num_panels: config.pv_num_panels,
                nominal_wattage: config.pv_nominal_wattage,
                stc_wattage: config.pv_stc_wattage,
                nominal_irradiance: config.pv_nominal_irradiance,
                derating_factor: config.pv_derating_factor,
                tilt_angle: config.pv_tilt_angle,
                azimuth_angle: config.pv_azimuth_angle,
            },
        ));
        let saving = Arc::new(SavingSessionClient::new(
            config.octopus_graphql_url.clone(),
            config.octopus_api_key.clone(),
            config.octopus_account_number.clone(),
        ));
        let planner = Arc::new(Planner::new(store.clone(), battery.clone(), tariff.clone(), config.clone()));

        Executor::new(
            store,
            battery,
            tariff,
            solar,
            saving,
            planner,
            WakeSignal::new(),
            StatusHandle::new(),
            config,
        )
    }

    fn futures_blocking_store() -> ScheduleStore {
        // tests only exercise synchronous helpers (in_peak_window); the
        // store is never queried, so a lazily-initialised value would do,
        // but ScheduleStore::init is async. Block on it here, since the
        // surrounding test itself is synchronous.
        tokio::runtime::Runtime::new()
            .unwrap()
            .block_on(ScheduleStore::init("sqlite::memory:"))
            .unwrap()
    }
}
