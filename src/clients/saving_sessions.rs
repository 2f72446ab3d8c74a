use chrono::{DateTime, Utc};
use std::time::Duration;
use tracing::error;

#[derive(Debug, Clone, PartialEq)]
pub struct SavingSession {
    pub start_utc: DateTime<Utc>,
    pub end_utc: DateTime<Utc>,
}

/// Octopus/Kraken GraphQL client: obtains a short-lived JWT via
/// `obtainKrakenToken`, then queries `savingSessions.events` for the
/// account, keeping only `status == ONGOING`.
pub struct SavingSessionClient {
    http: reqwest::Client,
    graphql_url: String,
    api_key: Option<String>,
    account_number: Option<String>,
}

impl SavingSessionClient {
    pub fn new(graphql_url: String, api_key: Option<String>, account_number: Option<String>) -> Self {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .expect("reqwest client");
        Self {
            http,
            graphql_url,
            api_key,
            account_number,
        }
    }

    /// Currently ONGOING saving-session windows. Empty on any error or
    /// when no API key is configured.
    pub async fn get_active_sessions(&self) -> Vec<SavingSession> {
        let Some(api_key) = self.api_key.as_ref() else {
            return Vec::new();
        };

        match self.fetch_active_sessions(api_key).await {
            Ok(sessions) => sessions,
            Err(e) => {
                error!(error = %e, "failed to fetch saving sessions");
                Vec::new()
            }
        }
    }

    async fn fetch_active_sessions(&self, api_key: &str) -> anyhow::Result<Vec<SavingSession>> {
        let token = self.obtain_kraken_token(api_key).await?;

        let query = r#"
            query SavingSessions($accountNumber: String) {
              savingSessions(accountNumber: $accountNumber) {
                events { id code startAt endAt status }
              }
            }
        "#;
        let body = serde_json::json!({
            "query": query,
            "variables": { "accountNumber": self.account_number },
        });

        let resp = self
            .http
            .post(&self.graphql_url)
            .header("Authorization", format!("JWT {token}"))
            .json(&body)
            .send()
            .await?
            .error_for_status()?;
        let data: serde_json::Value = resp.json().await?;

        let events = data
            .pointer("/data/savingSessions/events")
            .and_then(|v| v.as_array())
            .cloned()
            .unwrap_or_default();

        Ok(events
            .iter()
            .filter(|e| e.get("status").and_then(|s| s.as_str()) == Some("ONGOING"))
            .filter_map(|e| {
                let start = e.get("startAt")?.as_str()?;
                let end = e.get("endAt")?.as_str()?;
                Some(SavingSession {
                    start_utc: DateTime::parse_from_rfc3339(start).ok()?.with_timezone(&Utc),
                    end_utc: DateTime::parse_from_rfc3339(end).ok()?.with_timezone(&Utc),
                })
            })
            .collect())
    }

    async fn obtain_kraken_token(&self, api_key: &str) -> anyhow::Result<String> {
        let query = r#"
            mutation obtainKrakenToken($input: ObtainJSONWebTokenInput!) {
              obtainKrakenToken(input: $input) { token }
            }
        "#;
        let body = serde_json::json!({
            "query": query,
            "variables": { "input": { "APIKey": api_key } },
        });

        let resp = self
            .http
            .post(&self.graphql_url)
            .json(&body)
            .send()
            .await?
            .error_for_status()?;
        let data: serde_json::Value = resp.json().await?;

        data.pointer("/data/obtainKrakenToken/token")
            .and_then(|v| v.as_str())
            .map(str::to_string)
            .ok_or_else(|| anyhow::anyhow!("Kraken token response missing token field"))
    }
}

/// True iff any session interval intersects `[window_start, window_end)`.
pub fn overlaps(window_start: DateTime<Utc>, window_end: DateTime<Utc>, sessions: &[SavingSession]) -> bool {
    sessions
        .iter()
        .any(|s| window_start < s.end_utc && window_end > s.start_utc)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn session(start: DateTime<Utc>, end: DateTime<Utc>) -> SavingSession {
        SavingSession { start_utc: start, end_utc: end }
    }

    #[test]
    fn detects_overlap_with_ongoing_session() {
        let now = Utc::now();
        let sessions = vec![session(now, now + chrono::Duration::hours(1))];
        assert!(overlaps(
            now + chrono::Duration::minutes(10),
            now + chrono::Duration::minutes(40),
            &sessions
        ));
    }

    #[test]
    fn no_overlap_when_schedule_ends_before_session_starts() {
        let now = Utc::now();
        let sessions = vec![session(now + chrono::Duration::hours(1), now + chrono::Duration::hours(2))];
        assert!(!overlaps(now, now + chrono::Duration::minutes(30), &sessions));
    }

    #[test]
    fn touching_boundary_is_not_an_overlap() {
        let now = Utc::now();
        let sessions = vec![session(now + chrono::Duration::hours(1), now + chrono::Duration::hours(2))];
        assert!(!overlaps(now, now + chrono::Duration::hours(1), &sessions));
    }
}
