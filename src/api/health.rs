use axum::Json;
use chrono::Utc;
use serde::Serialize;

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    status: &'static str,
    time: String,
}

/// `GET /health` — liveness only; this daemon has no dependent services
/// worth a readiness probe beyond "the process is answering HTTP".
pub async fn health_check() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        time: Utc::now().to_rfc3339(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn health_check_reports_ok() {
        let Json(resp) = health_check().await;
        assert_eq!(resp.status, "ok");
        assert!(chrono::DateTime::parse_from_rfc3339(&resp.time).is_ok());
    }
}
