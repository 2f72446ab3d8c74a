mod api;
mod clients;
mod config;
mod domain;
mod executor;
mod planner;
mod state;
mod status;
mod store;
mod telemetry;
mod wake;

use std::sync::Arc;

use anyhow::Result;
use clients::{BatteryClient, PanelArray, SavingSessionClient, SolarClient, TariffClient};
use config::AppConfig;
use executor::Executor;
use planner::Planner;
use state::AppState;
use status::StatusHandle;
use store::ScheduleStore;
use tokio::sync::watch;
use tracing::{info, warn};
use wake::WakeSignal;

#[tokio::main]
async fn main() -> Result<()> {
    telemetry::init_tracing();

    let config = AppConfig::load()?;
    let store = Arc::new(ScheduleStore::init(&config.db_path).await?);

    let battery = Arc::new(BatteryClient::new(
        config.netzero_url(),
        config.netzero_api_key.clone(),
        config.simulation_mode,
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
    let saving_sessions = Arc::new(SavingSessionClient::new(
        config.octopus_graphql_url.clone(),
        config.octopus_api_key.clone(),
        config.octopus_account_number.clone(),
    ));

    let planner = Arc::new(Planner::new(
        store.clone(),
        battery.clone(),
        tariff.clone(),
        config.clone(),
    ));
    let wake = WakeSignal::new();
    let status = StatusHandle::new();

    let executor = Arc::new(Executor::new(
        store.clone(),
        battery.clone(),
        tariff.clone(),
        solar.clone(),
        saving_sessions.clone(),
        planner.clone(),
        wake.clone(),
        status.clone(),
        config.clone(),
    ));

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let executor_task = {
        let executor = executor.clone();
        tokio::spawn(async move { executor.run(shutdown_rx).await })
    };

    let state = AppState {
        store: store.clone(),
        executor: executor.clone(),
        status: status.clone(),
        wake: wake.clone(),
        config: Arc::new(config.clone()),
        started_at: chrono::Utc::now(),
    };

    let addr = config.socket_addr()?;
    info!(%addr, "starting battery charge scheduler");

    let app = api::router(state);
    let listener = tokio::net::TcpListener::bind(addr).await?;

    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            telemetry::shutdown_signal().await;
            let _ = shutdown_tx.send(true);
        })
        .await?;

    if let Err(e) = executor_task.await {
        warn!(error = %e, "executor task did not shut down cleanly");
    }

    warn!("shutdown complete");
    Ok(())
}
