use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;
use tokio::sync::RwLock;
use tracing::{error, info, warn};

#[derive(Debug, Clone, Serialize, Deserialize)]
struct IrradianceSample {
    timestamp: DateTime<Utc>,
    global_irradiance: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct WeatherCache {
    cached_timestamp_utc: DateTime<Utc>,
    data: Vec<IrradianceSample>,
}

/// Panel/derating constants used to convert irradiance to PV power.
#[derive(Debug, Clone, Copy)]
pub struct PanelArray {
    pub num_panels: u32,
    pub nominal_wattage: f64,
    pub stc_wattage: f64,
    pub nominal_irradiance: f64,
    pub derating_factor: f64,
    pub tilt_angle: f64,
    pub azimuth_angle: f64,
}

/// Solar forecast client backed by an on-disk JSON cache with a TTL.
/// `has_enough_solar` never returns `true` on error — any failure biases
/// the executor back toward grid charging.
pub struct SolarClient {
    http: reqwest::Client,
    api_url: String,
    cache_path: PathBuf,
    cache_ttl: chrono::Duration,
    latitude: f64,
    longitude: f64,
    panels: PanelArray,
    cache: RwLock<Option<WeatherCache>>,
}

impl SolarClient {
    pub fn new(
        api_url: String,
        cache_path: PathBuf,
        cache_ttl_secs: i64,
        latitude: f64,
        longitude: f64,
        panels: PanelArray,
    ) -> Self {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .expect("reqwest client");
        Self {
            http,
            api_url,
            cache_path,
            cache_ttl: chrono::Duration::seconds(cache_ttl_secs),
            latitude,
            longitude,
            panels,
            cache: RwLock::new(None),
        }
    }

    pub async fn has_enough_solar(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        target_kwh: f64,
    ) -> bool {
        match self.forecast_energy_kwh(start, end).await {
            Ok(energy) => energy >= target_kwh,
            Err(e) => {
                warn!(error = %e, "solar forecast unavailable, assuming insufficient solar");
                false
            }
        }
    }

    async fn forecast_energy_kwh(&self, start: DateTime<Utc>, end: DateTime<Utc>) -> anyhow::Result<f64> {
        self.refresh_if_stale().await?;
        let guard = self.cache.read().await;
        let cache = guard.as_ref().ok_or_else(|| anyhow::anyhow!("no cached forecast"))?;

        let samples: Vec<&IrradianceSample> = cache
            .data
            .iter()
            .filter(|s| s.timestamp >= start && s.timestamp < end)
            .collect();

        if samples.is_empty() {
            anyhow::bail!("no forecast samples in window {start}..{end}");
        }

        let p_nom = self.panels.num_panels as f64 * self.panels.nominal_wattage;
        let p_max = self.panels.num_panels as f64 * self.panels.stc_wattage;

        let avg_power_kw = samples
            .iter()
            .map(|s| {
                let raw = p_nom * (s.global_irradiance as f64 / self.panels.nominal_irradiance)
                    * self.panels.derating_factor;
                raw.min(p_max) / 1000.0
            })
            .sum::<f64>()
            / samples.len() as f64;

        let duration_h = (end - start).num_seconds() as f64 / 3600.0;
        Ok(avg_power_kw * duration_h)
    }

    async fn refresh_if_stale(&self) -> anyhow::Result<()> {
        {
            let guard = self.cache.read().await;
            if let Some(cache) = guard.as_ref() {
                if Utc::now() - cache.cached_timestamp_utc < self.cache_ttl {
                    return Ok(());
                }
            }
        }

        if let Some(loaded) = self.load_from_disk() {
            if Utc::now() - loaded.cached_timestamp_utc < self.cache_ttl {
                *self.cache.write().await = Some(loaded);
                return Ok(());
            }
        }

        self.fetch_and_cache().await
    }

    fn load_from_disk(&self) -> Option<WeatherCache> {
        let raw = std::fs::read_to_string(&self.cache_path).ok()?;
        serde_json::from_str(&raw).ok()
    }

    async fn fetch_and_cache(&self) -> anyhow::Result<()> {
        info!("fetching fresh solar forecast");
        let resp = self
            .http
            .get(&self.api_url)
            .query(&[
                ("latitude", self.latitude.to_string()),
                ("longitude", self.longitude.to_string()),
                ("tilt", self.panels.tilt_angle.to_string()),
                ("azimuth", self.panels.azimuth_angle.to_string()),
                ("minutely_15", "global_tilted_irradiance_instant".to_string()),
                ("forecast_days", "1".to_string()),
            ])
            .send()
            .await?
            .error_for_status()?;
        let body: serde_json::Value = resp.json().await?;
        let samples = parse_irradiance(&body);
        if samples.is_empty() {
            anyhow::bail!("weather API returned no irradiance samples");
        }

        let cache = WeatherCache {
            cached_timestamp_utc: Utc::now(),
            data: samples,
        };
        self.save_to_disk(&cache)?;
        *self.cache.write().await = Some(cache);
        Ok(())
    }

    fn save_to_disk(&self, cache: &WeatherCache) -> anyhow::Result<()> {
        if let Some(parent) = self.cache_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let tmp_path = self.cache_path.with_extension("tmp");
        std::fs::write(&tmp_path, serde_json::to_string_pretty(cache)?)?;
        std::fs::rename(&tmp_path, &self.cache_path)?;
        Ok(())
    }
}

fn parse_irradiance(body: &serde_json::Value) -> Vec<IrradianceSample> {
    let Some(minutely) = body.get("minutely_15") else {
        error!("weather response missing minutely_15");
        return Vec::new();
    };
    let Some(times) = minutely.get("time").and_then(|v| v.as_array()) else {
        return Vec::new();
    };
    let Some(values) = minutely
        .get("global_tilted_irradiance_instant")
        .and_then(|v| v.as_array())
    else {
        return Vec::new();
    };

    times
        .iter()
        .zip(values.iter())
        .filter_map(|(t, g)| {
            let ts = DateTime::parse_from_rfc3339(t.as_str()?).ok()?.with_timezone(&Utc);
            let irradiance = g.as_f64()?.round() as i64;
            Some(IrradianceSample {
                timestamp: ts,
                global_irradiance: irradiance,
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn panels() -> PanelArray {
        PanelArray {
            num_panels: 12,
            nominal_wattage: 400.0,
            stc_wattage: 440.0,
            nominal_irradiance: 1000.0,
            derating_factor: 0.85,
            tilt_angle: 30.0,
            azimuth_angle: 180.0,
        }
    }

    fn client(cache_path: PathBuf) -> SolarClient {
        SolarClient::new(
            "https://weather.example/forecast".to_string(),
            cache_path,
            3600,
            51.5,
            -0.1,
            panels(),
        )
    }

    #[tokio::test]
    async fn empty_cache_file_yields_no_solar() {
        let dir = tempdir();
        let cache_path = dir.join("missing_cache.json");
        let client = client(cache_path);
        assert!(!client.has_enough_solar(Utc::now(), Utc::now() + chrono::Duration::minutes(30), 1.0).await);
    }

    #[tokio::test]
    async fn cached_samples_produce_expected_energy() {
        let dir = tempdir();
        let cache_path = dir.join("cache.json");
        let start = Utc::now();
        let cache = WeatherCache {
            cached_timestamp_utc: Utc::now(),
            data: vec![
                IrradianceSample { timestamp: start, global_irradiance: 1000 },
                IrradianceSample { timestamp: start + chrono::Duration::minutes(15), global_irradiance: 1000 },
            ],
        };
        std::fs::write(&cache_path, serde_json::to_string(&cache).unwrap()).unwrap();

        let client = client(cache_path);
        // Full-power 1000 W/m^2 over two samples -> P_nom (12*400=4800W) * derating 0.85 = 4.08kW,
        // capped at P_max (12*440=5280W); over 30 minutes -> 2.04 kWh.
        let enough = client
            .has_enough_solar(start, start + chrono::Duration::minutes(30), 2.0)
            .await;
        assert!(enough);
    }

    fn tempdir() -> PathBuf {
        let mut dir = std::env::temp_dir();
        dir.push(format!("solar-client-test-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        dir
    }
}
