#![allow(dead_code)]
use anyhow::{Context, Result};
use figment::{
    providers::{Env, Format, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use validator::Validate;

/// Top-level application configuration, loaded once in `main` and cloned
/// into every long-lived task. Field names match the environment
/// variables read by the control surface and schedulers directly — this
/// is a single-tenant edge daemon, so a flat env surface (rather than a
/// `SECTION__FIELD` namespace) is the right shape.
#[derive(Debug, Clone, Deserialize, Serialize, Validate)]
pub struct AppConfig {
    // --- control surface ---
    #[serde(default = "default_host")]
    pub host: String,
    #[validate(range(min = 1, max = 65535))]
    #[serde(default = "default_port")]
    pub port: u16,

    // --- clock ---
    #[serde(default = "default_timezone")]
    pub timezone: String,

    // --- schedule store ---
    #[serde(default = "default_db_path")]
    pub db_path: String,

    // --- tariff client ---
    pub agile_url: String,

    // --- battery control client ---
    pub netzero_api_key: String,
    pub site_id: String,
    #[serde(default = "default_netzero_url_template")]
    pub netzero_url_template: String,
    #[serde(default)]
    pub simulation_mode: bool,

    #[validate(range(min = 0, max = 100))]
    pub battery_reserve_start: i32,
    #[validate(range(min = 0, max = 100))]
    pub battery_reserve_end: i32,
    #[validate(range(min = 0.1, max = 1000.0))]
    pub battery_kwh: f64,
    #[validate(range(min = 0.1, max = 100.0))]
    pub charge_rate_kw: f64,

    // --- executor gates ---
    #[validate(range(min = 0, max = 100))]
    #[serde(default = "default_soc_skip_threshold")]
    pub soc_skip_threshold: i32,
    #[validate(range(min = 0, max = 23))]
    #[serde(default = "default_peak_start_hour")]
    pub peak_start_hour: u32,
    #[validate(range(min = 0, max = 23))]
    #[serde(default = "default_peak_end_hour")]
    pub peak_end_hour: u32,
    #[serde(default = "default_max_agile_price_ppk")]
    pub max_agile_price_ppk: f64,

    #[serde(default = "default_sleep_ahead_sec")]
    pub executor_sleep_ahead_sec: i64,
    #[serde(default = "default_idle_sleep_sec")]
    pub executor_idle_sleep_sec: i64,
    #[serde(default = "default_poll_interval")]
    pub executor_poll_interval: i64,
    #[serde(default = "default_grace_retry_interval")]
    pub grace_retry_interval: i64,

    // --- planner ---
    #[validate(range(min = 1, max = 48))]
    #[serde(default = "default_scheduler_runs_per_day")]
    pub scheduler_runs_per_day: u32,
    #[validate(range(min = 0, max = 100))]
    #[serde(default = "default_target_soc")]
    pub target_soc: i32,
    #[validate(range(min = 0.05, max = 24.0))]
    #[serde(default = "default_slot_hours")]
    pub slot_hours: f64,
    #[serde(default = "default_recommended_slots")]
    pub recommended_slots: u32,

    // --- solar forecast client ---
    #[validate(range(min = -90.0, max = 90.0))]
    #[serde(default = "default_latitude")]
    pub latitude: f64,
    #[validate(range(min = -180.0, max = 180.0))]
    #[serde(default = "default_longitude")]
    pub longitude: f64,
    #[serde(default = "default_weather_api_baseurl")]
    pub weather_api_baseurl: String,
    #[serde(default = "default_weather_cache_path")]
    pub weather_cache_path: String,
    #[serde(default = "default_weather_cache_ttl")]
    pub weather_cache_ttl_secs: i64,
    #[serde(default = "default_pv_num_panels")]
    pub pv_num_panels: u32,
    #[serde(default = "default_pv_nominal_wattage")]
    pub pv_nominal_wattage: f64,
    #[serde(default = "default_pv_stc_wattage")]
    pub pv_stc_wattage: f64,
    #[serde(default = "default_pv_nominal_irradiance")]
    pub pv_nominal_irradiance: f64,
    #[serde(default = "default_pv_derating_factor")]
    pub pv_derating_factor: f64,
    #[serde(default = "default_pv_tilt_angle")]
    pub pv_tilt_angle: f64,
    #[serde(default = "default_pv_azimuth_angle")]
    pub pv_azimuth_angle: f64,

    // --- saving-session client ---
    #[serde(default = "default_octopus_graphql_url")]
    pub octopus_graphql_url: String,
    #[serde(default)]
    pub octopus_api_key: Option<String>,
    #[serde(default)]
    pub octopus_account_number: Option<String>,
}

impl AppConfig {
    pub fn socket_addr(&self) -> Result<SocketAddr> {
        format!("{}:{}", self.host, self.port)
            .parse()
            .context("failed to parse control-surface socket address")
    }

    pub fn netzero_url(&self) -> String {
        self.netzero_url_template.replace("{SITE_ID}", &self.site_id)
    }

    pub fn tz(&self) -> Result<chrono_tz::Tz> {
        self.timezone
            .parse()
            .map_err(|e| anyhow::anyhow!("invalid TIMEZONE {:?}: {}", self.timezone, e))
    }

    /// Load from `.env`, an optional `config.toml`, then environment
    /// variables (highest precedence).
    pub fn load() -> Result<Self> {
        let _ = dotenvy::dotenv();

        let config: AppConfig = Figment::new()
            .merge(Toml::file("config.toml").nested())
            .merge(Env::raw())
            .extract()
            .context("failed to parse configuration")?;

        config.validate().context("configuration validation failed")?;
        Ok(config)
    }
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}
fn default_port() -> u16 {
    8080
}
fn default_timezone() -> String {
    "Europe/London".to_string()
}
fn default_db_path() -> String {
    "data/schedules.db".to_string()
}
fn default_netzero_url_template() -> String {
    "https://api.netzero.example/v1/sites/{SITE_ID}/config".to_string()
}
fn default_soc_skip_threshold() -> i32 {
    80
}
fn default_peak_start_hour() -> u32 {
    16
}
fn default_peak_end_hour() -> u32 {
    19
}
fn default_max_agile_price_ppk() -> f64 {
    15.0
}
fn default_sleep_ahead_sec() -> i64 {
    120
}
fn default_idle_sleep_sec() -> i64 {
    300
}
fn default_poll_interval() -> i64 {
    60
}
fn default_grace_retry_interval() -> i64 {
    300
}
fn default_scheduler_runs_per_day() -> u32 {
    1
}
fn default_target_soc() -> i32 {
    90
}
fn default_slot_hours() -> f64 {
    0.5
}
fn default_recommended_slots() -> u32 {
    5
}
fn default_latitude() -> f64 {
    51.5074
}
fn default_longitude() -> f64 {
    -0.1278
}
fn default_weather_api_baseurl() -> String {
    "https://api.open-meteo.com/v1/forecast".to_string()
}
fn default_weather_cache_path() -> String {
    "data/solar_cache.json".to_string()
}
fn default_weather_cache_ttl() -> i64 {
    3600
}
fn default_pv_num_panels() -> u32 {
    12
}
fn default_pv_nominal_wattage() -> f64 {
    400.0
}
fn default_pv_stc_wattage() -> f64 {
    440.0
}
fn default_pv_nominal_irradiance() -> f64 {
    1000.0
}
fn default_pv_derating_factor() -> f64 {
    0.85
}
fn default_pv_tilt_angle() -> f64 {
    30.0
}
fn default_pv_azimuth_angle() -> f64 {
    180.0
}
fn default_octopus_graphql_url() -> String {
    "https://api.octopus.energy/v1/graphql/".to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn minimal() -> AppConfig {
        AppConfig {
            host: default_host(),
            port: default_port(),
            timezone: default_timezone(),
            db_path: default_db_path(),
            agile_url: "https://agile.example/rates".to_string(),
            netzero_api_key: "key".to_string(),
            site_id: "site-1".to_string(),
            netzero_url_template: default_netzero_url_template(),
            simulation_mode: true,
            battery_reserve_start: 50,
            battery_reserve_end: 20,
            battery_kwh: 13.5,
            charge_rate_kw: 3.5,
            soc_skip_threshold: default_soc_skip_threshold(),
            peak_start_hour: default_peak_start_hour(),
            peak_end_hour: default_peak_end_hour(),
            max_agile_price_ppk: default_max_agile_price_ppk(),
            executor_sleep_ahead_sec: default_sleep_ahead_sec(),
            executor_idle_sleep_sec: default_idle_sleep_sec(),
            executor_poll_interval: default_poll_interval(),
            grace_retry_interval: default_grace_retry_interval(),
            scheduler_runs_per_day: default_scheduler_runs_per_day(),
            target_soc: default_target_soc(),
            slot_hours: default_slot_hours(),
            recommended_slots: default_recommended_slots(),
            latitude: default_latitude(),
            longitude: default_longitude(),
            weather_api_baseurl: default_weather_api_baseurl(),
            weather_cache_path: default_weather_cache_path(),
            weather_cache_ttl_secs: default_weather_cache_ttl(),
            pv_num_panels: default_pv_num_panels(),
            pv_nominal_wattage: default_pv_nominal_wattage(),
            pv_stc_wattage: default_pv_stc_wattage(),
            pv_nominal_irradiance: default_pv_nominal_irradiance(),
            pv_derating_factor: default_pv_derating_factor(),
            pv_tilt_angle: default_pv_tilt_angle(),
            pv_azimuth_angle: default_pv_azimuth_angle(),
            octopus_graphql_url: default_octopus_graphql_url(),
            octopus_api_key: None,
            octopus_account_number: None,
        }
    }

    #[test]
    fn validates_a_sane_config() {
        assert!(minimal().validate().is_ok());
    }

    #[test]
    fn rejects_soc_skip_threshold_out_of_range() {
        let mut cfg = minimal();
        cfg.soc_skip_threshold = 150;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn netzero_url_substitutes_site_id() {
        let cfg = minimal();
        assert!(cfg.netzero_url().contains("site-1"));
    }

    #[test]
    fn socket_addr_parses_host_and_port() {
        let cfg = minimal();
        let addr = cfg.socket_addr().unwrap();
        assert_eq!(addr.port(), 8080);
    }
}
