use chrono::{DateTime, Utc};
use std::time::Duration;
use tracing::error;

/// A single half-hour unit-rate window as published by the tariff API.
#[derive(Debug, Clone, PartialEq)]
pub struct RateWindow {
    pub valid_from: DateTime<Utc>,
    pub valid_to: DateTime<Utc>,
    pub rate_p_per_kwh: f64,
}

pub struct TariffClient {
    http: reqwest::Client,
    url: String,
}

impl TariffClient {
    pub fn new(url: String) -> Self {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .expect("reqwest client");
        Self { http, url }
    }

    /// Upcoming half-hour rates. Empty on any transport/parse error.
    pub async fn fetch_rates(&self) -> Vec<RateWindow> {
        let result = async {
            let resp = self
                .http
                .get(&self.url)
                .send()
                .await?
                .error_for_status()?;
            let body: serde_json::Value = resp.json().await?;
            Ok::<_, anyhow::Error>(parse_rates(&body))
        }
        .await;

        match result {
            Ok(rates) => rates,
            Err(e) => {
                error!(error = %e, "failed to fetch agile rates");
                Vec::new()
            }
        }
    }

    /// Rate covering `window_start`, queried over a +-1h bound around
    /// `[window_start, window_end)`; `None` if no exact half-open match
    /// or on any transport error.
    pub async fn fetch_rate_for(
        &self,
        window_start: DateTime<Utc>,
        window_end: DateTime<Utc>,
    ) -> Option<f64> {
        let period_from = window_start - chrono::Duration::hours(1);
        let period_to = window_end + chrono::Duration::hours(1);

        let result = async {
            let resp = self
                .http
                .get(&self.url)
                .query(&[
                    ("period_from", period_from.to_rfc3339()),
                    ("period_to", period_to.to_rfc3339()),
                ])
                .send()
                .await?
                .error_for_status()?;
            let body: serde_json::Value = resp.json().await?;
            Ok::<_, anyhow::Error>(parse_rates(&body))
        }
        .await;

        let rates = match result {
            Ok(rates) => rates,
            Err(e) => {
                error!(error = %e, "failed to fetch bounded agile rates");
                return None;
            }
        };

        rates
            .into_iter()
            .find(|r| window_start >= r.valid_from && window_start < r.valid_to)
            .map(|r| r.rate_p_per_kwh)
    }
}

fn parse_rates(body: &serde_json::Value) -> Vec<RateWindow> {
    let Some(results) = body.get("results").and_then(|v| v.as_array()) else {
        return Vec::new();
    };

    let mut rates: Vec<RateWindow> = results
        .iter()
        .filter_map(|row| {
            let valid_from = row.get("valid_from")?.as_str()?;
            let valid_to = row.get("valid_to")?.as_str()?;
            let rate = row.get("value_inc_vat")?.as_f64()?;
            Some(RateWindow {
                valid_from: DateTime::parse_from_rfc3339(valid_from).ok()?.with_timezone(&Utc),
                valid_to: DateTime::parse_from_rfc3339(valid_to).ok()?.with_timezone(&Utc),
                rate_p_per_kwh: rate,
            })
        })
        .collect();

    rates.sort_by_key(|r| r.valid_from);
    rates
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_results_array_sorted_by_start() {
        let body = serde_json::json!({
            "results": [
                {"valid_from": "2026-01-01T11:00:00Z", "valid_to": "2026-01-01T11:30:00Z", "value_inc_vat": 7.0},
                {"valid_from": "2026-01-01T10:00:00Z", "valid_to": "2026-01-01T10:30:00Z", "value_inc_vat": 8.0},
            ]
        });
        let rates = parse_rates(&body);
        assert_eq!(rates.len(), 2);
        assert!(rates[0].valid_from < rates[1].valid_from);
    }

    #[test]
    fn missing_results_key_yields_empty_vec() {
        let body = serde_json::json!({});
        assert!(parse_rates(&body).is_empty());
    }

    #[test]
    fn malformed_row_is_skipped_not_fatal() {
        let body = serde_json::json!({
            "results": [
                {"valid_from": "not-a-date", "valid_to": "2026-01-01T10:30:00Z", "value_inc_vat": 8.0},
                {"valid_from": "2026-01-01T11:00:00Z", "valid_to": "2026-01-01T11:30:00Z", "value_inc_vat": 7.0},
            ]
        });
        assert_eq!(parse_rates(&body).len(), 1);
    }
}
