#![allow(dead_code)]
//! Durable schedule/decision store backed by a single SQLite file.
//!
//! Every write goes through `write_lock` and is retried with linear
//! backoff on `SQLITE_BUSY`; reads go straight to the pool and may race
//! with in-flight writes (callers must re-fetch before acting).

use crate::domain::schedule::{Decision, DecisionAction, Schedule, ScheduleMode};
use chrono::{DateTime, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::{Row, SqlitePool};
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

const MAX_WRITE_ATTEMPTS: u32 = 5;
const FALLBACK_PRICE_P_PER_KWH: f64 = 20.0;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Db(#[from] sqlx::Error),
    #[error("write lock contention exhausted after {0} attempts")]
    Busy(u32),
}

pub type StoreResult<T> = Result<T, StoreError>;

/// A planner-generated slot awaiting insertion.
#[derive(Debug, Clone)]
pub struct NewAutonomousSlot {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
    pub target_soc: i32,
    pub price_p_per_kwh: Option<f64>,
}

pub struct ScheduleStore {
    pool: SqlitePool,
    write_lock: Mutex<()>,
}

impl ScheduleStore {
    /// Open (creating if missing) the SQLite file at `db_path`, enable WAL
    /// mode, and ensure the schema (idempotent).
    pub async fn init(db_path: &str) -> StoreResult<Self> {
        if let Some(parent) = std::path::Path::new(db_path).parent() {
            if !parent.as_os_str().is_empty() {
                let _ = std::fs::create_dir_all(parent);
            }
        }

        let options = SqliteConnectOptions::from_str(&format!("sqlite://{db_path}"))?
            .create_if_missing(true)
            .journal_mode(sqlx::sqlite::SqliteJournalMode::Wal)
            .busy_timeout(Duration::from_secs(5));

        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await?;

        let store = Self {
            pool,
            write_lock: Mutex::new(()),
        };
        store.ensure_schema().await?;
        info!(db_path, "schedule store initialised");
        Ok(store)
    }

    async fn ensure_schema(&self) -> StoreResult<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS schedules (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                start_time TEXT NOT NULL,
                end_time TEXT NOT NULL,
                mode TEXT NOT NULL,
                source TEXT NOT NULL DEFAULT 'scheduler',
                manual_override INTEGER NOT NULL DEFAULT 0,
                target_soc INTEGER,
                price_p_per_kwh REAL,
                executed INTEGER NOT NULL DEFAULT 0,
                expired INTEGER NOT NULL DEFAULT 0,
                decision TEXT,
                decision_at TEXT,
                retry_count INTEGER NOT NULL DEFAULT 0,
                last_retry_utc TEXT,
                created_at TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            "CREATE UNIQUE INDEX IF NOT EXISTS idx_schedules_start_end ON schedules (start_time, end_time)",
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS decisions (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                timestamp TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP,
                schedule_id INTEGER NOT NULL,
                start_time TEXT NOT NULL,
                end_time TEXT NOT NULL,
                action TEXT NOT NULL,
                reason TEXT NOT NULL,
                soc REAL,
                solar_power REAL,
                island_status INTEGER,
                price_p_per_kwh REAL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Run `op` against `self.pool`, holding `write_lock`, retrying on
    /// `SQLITE_BUSY` with linear backoff (100ms * attempt).
    async fn with_write_retry<F, Fut, T>(&self, op: F) -> StoreResult<T>
    where
        F: Fn(SqlitePool) -> Fut,
        Fut: std::future::Future<Output = Result<T, sqlx::Error>>,
    {
        let _guard = self.write_lock.lock().await;
        let mut attempt = 0;
        loop {
            attempt += 1;
            match op(self.pool.clone()).await {
                Ok(v) => return Ok(v),
                Err(sqlx::Error::Database(db_err)) if is_busy(&db_err) => {
                    if attempt >= MAX_WRITE_ATTEMPTS {
                        return Err(StoreError::Busy(attempt));
                    }
                    warn!(attempt, "schedule store busy, retrying");
                    tokio::time::sleep(Duration::from_millis(100 * attempt as u64)).await;
                }
                Err(e) => return Err(StoreError::Db(e)),
            }
        }
    }

    pub async fn add_schedule(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        mode: ScheduleMode,
        price: Option<f64>,
    ) -> StoreResult<bool> {
        let mode_s = mode.to_string();
        self.with_write_retry(move |pool| {
            let mode_s = mode_s.clone();
            async move {
                let result = sqlx::query(
                    "INSERT OR IGNORE INTO schedules (start_time, end_time, mode, price_p_per_kwh) VALUES (?, ?, ?, ?)",
                )
                .bind(start.to_rfc3339())
                .bind(end.to_rfc3339())
                .bind(mode_s)
                .bind(price)
                .execute(&pool)
                .await?;
                Ok(result.rows_affected() > 0)
            }
        })
        .await
    }

    pub async fn add_batch(&self, slots: &[NewAutonomousSlot]) -> StoreResult<u64> {
        let slots = slots.to_vec();
        self.with_write_retry(move |pool| {
            let slots = slots.clone();
            async move {
                let mut tx = pool.begin().await?;
                let mut inserted = 0u64;
                for slot in &slots {
                    let result = sqlx::query(
                        "INSERT OR IGNORE INTO schedules (start_time, end_time, mode, source, target_soc, price_p_per_kwh) \
                         VALUES (?, ?, 'autonomous', 'scheduler', ?, ?)",
                    )
                    .bind(slot.start.to_rfc3339())
                    .bind(slot.end.to_rfc3339())
                    .bind(slot.target_soc)
                    .bind(slot.price_p_per_kwh)
                    .execute(&mut *tx)
                    .await?;
                    inserted += result.rows_affected();
                }
                tx.commit().await?;
                Ok(inserted)
            }
        })
        .await
    }

    pub async fn add_manual_override(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        target_soc: i32,
    ) -> StoreResult<bool> {
        self.with_write_retry(move |pool| async move {
            let result = sqlx::query(
                "INSERT OR IGNORE INTO schedules (start_time, end_time, mode, source, manual_override, target_soc) VALUES (?, ?, 'manual', 'manual', 1, ?)",
            )
            .bind(start.to_rfc3339())
            .bind(end.to_rfc3339())
            .bind(target_soc)
            .execute(&pool)
            .await?;
            Ok(result.rows_affected() > 0)
        })
        .await
    }

    pub async fn fetch_pending(&self) -> StoreResult<Vec<Schedule>> {
        let rows = sqlx::query(
            "SELECT * FROM schedules WHERE executed = 0 AND expired = 0 ORDER BY start_time ASC",
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.iter().map(row_to_schedule).collect())
    }

    pub async fn get(&self, id: i64) -> StoreResult<Option<Schedule>> {
        let row = sqlx::query("SELECT * FROM schedules WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.as_ref().map(row_to_schedule))
    }

    /// The earliest pending row starting within `lookahead` after `after`.
    pub async fn next_after(
        &self,
        after: DateTime<Utc>,
        lookahead: chrono::Duration,
    ) -> StoreResult<Option<Schedule>> {
        let until = after + lookahead;
        let row = sqlx::query(
            "SELECT * FROM schedules WHERE executed = 0 AND expired = 0 AND start_time >= ? AND start_time < ? ORDER BY start_time ASC LIMIT 1",
        )
        .bind(after.to_rfc3339())
        .bind(until.to_rfc3339())
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.as_ref().map(row_to_schedule))
    }

    /// Set `executed`/`expired` per `action`, stamp `decision`/`decision_at`.
    /// Re-applying the same terminal action is a no-op.
    pub async fn mark_terminal(&self, id: i64, action: DecisionAction) -> StoreResult<()> {
        let action_s = action.to_string();
        self.with_write_retry(move |pool| {
            let action_s = action_s.clone();
            async move {
                let executed = if matches!(action_s.as_str(), "expired") { 0 } else { 1 };
                let expired = if action_s == "expired" { 1 } else { 0 };
                sqlx::query(
                    "UPDATE schedules SET executed = ?, expired = ?, decision = ?, decision_at = ? \
                     WHERE id = ? AND NOT (executed = ? AND expired = ? AND decision = ?)",
                )
                .bind(executed)
                .bind(expired)
                .bind(&action_s)
                .bind(Utc::now().to_rfc3339())
                .bind(id)
                .bind(executed)
                .bind(expired)
                .bind(&action_s)
                .execute(&pool)
                .await?;
                Ok(())
            }
        })
        .await
    }

    /// Delete the row and append a `deleted` decision.
    pub async fn remove(&self, id: i64) -> StoreResult<()> {
        let schedule = self.get(id).await?;
        self.with_write_retry(move |pool| async move {
            sqlx::query("DELETE FROM schedules WHERE id = ?")
                .bind(id)
                .execute(&pool)
                .await?;
            Ok(())
        })
        .await?;

        if let Some(schedule) = schedule {
            self.add_decision(
                id,
                schedule.start_time,
                schedule.end_time,
                DecisionAction::Deleted,
                "operator_delete",
                None,
                None,
                None,
                schedule.price_p_per_kwh,
            )
            .await?;
        }
        Ok(())
    }

    /// For every pending row with `end_time < now`: mark expired and write
    /// one `expired` decision iff none exists yet for that schedule.
    pub async fn mark_all_expired(&self, now: DateTime<Utc>) -> StoreResult<u64> {
        let expired_rows: Vec<Schedule> = {
            let rows = sqlx::query(
                "SELECT * FROM schedules WHERE executed = 0 AND expired = 0 AND end_time < ?",
            )
            .bind(now.to_rfc3339())
            .fetch_all(&self.pool)
            .await?;
            rows.iter().map(row_to_schedule).collect()
        };

        if expired_rows.is_empty() {
            return Ok(0);
        }

        let ids: Vec<i64> = expired_rows.iter().map(|s| s.id).collect();
        self.with_write_retry(move |pool| {
            let ids = ids.clone();
            async move {
                let mut tx = pool.begin().await?;
                for id in &ids {
                    sqlx::query(
                        "UPDATE schedules SET expired = 1, decision = 'expired', decision_at = ? WHERE id = ?",
                    )
                    .bind(now.to_rfc3339())
                    .bind(id)
                    .execute(&mut *tx)
                    .await?;
                }
                tx.commit().await?;
                Ok(())
            }
        })
        .await?;

        for schedule in &expired_rows {
            let already_logged: i64 = sqlx::query(
                "SELECT COUNT(1) FROM decisions WHERE schedule_id = ? AND LOWER(action) = 'expired'",
            )
            .bind(schedule.id)
            .fetch_one(&self.pool)
            .await?
            .get(0);

            if already_logged == 0 {
                self.add_decision(
                    schedule.id,
                    schedule.start_time,
                    schedule.end_time,
                    DecisionAction::Expired,
                    "schedule_missed",
                    None,
                    None,
                    None,
                    schedule.price_p_per_kwh,
                )
                .await?;
            }
        }

        debug!(count = expired_rows.len(), "swept expired schedules");
        Ok(expired_rows.len() as u64)
    }

    #[allow(clippy::too_many_arguments)]
    pub async fn add_decision(
        &self,
        schedule_id: i64,
        start_time: DateTime<Utc>,
        end_time: DateTime<Utc>,
        action: DecisionAction,
        reason: &str,
        soc: Option<f64>,
        solar_power: Option<f64>,
        island_status: Option<bool>,
        price_p_per_kwh: Option<f64>,
    ) -> StoreResult<()> {
        let action_s = action.to_string();
        let reason = reason.to_string();
        self.with_write_retry(move |pool| {
            let action_s = action_s.clone();
            let reason = reason.clone();
            async move {
                sqlx::query(
                    "INSERT INTO decisions (schedule_id, start_time, end_time, action, reason, soc, solar_power, island_status, price_p_per_kwh) \
                     VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)",
                )
                .bind(schedule_id)
                .bind(start_time.to_rfc3339())
                .bind(end_time.to_rfc3339())
                .bind(action_s)
                .bind(reason)
                .bind(soc)
                .bind(solar_power)
                .bind(island_status)
                .bind(price_p_per_kwh)
                .execute(&pool)
                .await?;
                Ok(())
            }
        })
        .await
    }

    pub async fn fetch_recent_decisions(&self, limit: i64) -> StoreResult<Vec<Decision>> {
        let rows = sqlx::query(
            "SELECT * FROM decisions ORDER BY timestamp DESC LIMIT ?",
        )
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.iter().map(row_to_decision).collect())
    }

    /// Stored price for `schedule_id`, or the fallback constant if missing.
    pub async fn get_stored_price(&self, schedule_id: i64) -> StoreResult<f64> {
        let price: Option<f64> = sqlx::query("SELECT price_p_per_kwh FROM schedules WHERE id = ?")
            .bind(schedule_id)
            .fetch_optional(&self.pool)
            .await?
            .and_then(|row| row.get(0));
        Ok(price.unwrap_or(FALLBACK_PRICE_P_PER_KWH))
    }

    pub async fn get_last_retry(&self, schedule_id: i64) -> StoreResult<Option<DateTime<Utc>>> {
        let raw: Option<String> = sqlx::query("SELECT last_retry_utc FROM schedules WHERE id = ?")
            .bind(schedule_id)
            .fetch_optional(&self.pool)
            .await?
            .and_then(|row| row.get(0));
        Ok(raw.and_then(|s| DateTime::parse_from_rfc3339(&s).ok())
            .map(|dt| dt.with_timezone(&Utc)))
    }

    pub async fn update_last_retry(&self, schedule_id: i64) -> StoreResult<()> {
        self.with_write_retry(move |pool| async move {
            sqlx::query(
                "UPDATE schedules SET last_retry_utc = ?, retry_count = retry_count + 1 WHERE id = ?",
            )
            .bind(Utc::now().to_rfc3339())
            .bind(schedule_id)
            .execute(&pool)
            .await?;
            Ok(())
        })
        .await
    }

    pub async fn reset_retry(&self, schedule_id: i64) -> StoreResult<()> {
        self.with_write_retry(move |pool| async move {
            sqlx::query("UPDATE schedules SET last_retry_utc = NULL, retry_count = 0 WHERE id = ?")
                .bind(schedule_id)
                .execute(&pool)
                .await?;
            Ok(())
        })
        .await
    }

    pub async fn get_retry_count(&self, schedule_id: i64) -> StoreResult<i64> {
        let count: Option<i64> = sqlx::query("SELECT retry_count FROM schedules WHERE id = ?")
            .bind(schedule_id)
            .fetch_optional(&self.pool)
            .await?
            .and_then(|row| row.get(0));
        Ok(count.unwrap_or(0))
    }
}

fn is_busy(db_err: &(dyn sqlx::error::DatabaseError + 'static)) -> bool {
    db_err.code().map(|c| c == "5" || c == "6").unwrap_or(false)
}

fn row_to_schedule(row: &sqlx::sqlite::SqliteRow) -> Schedule {
    let decision_raw: Option<String> = row.get("decision");
    let decision_at_raw: Option<String> = row.get("decision_at");
    let last_retry_raw: Option<String> = row.get("last_retry_utc");
    let mode_raw: String = row.get("mode");
    let start_raw: String = row.get("start_time");
    let end_raw: String = row.get("end_time");
    let created_raw: String = row.get("created_at");

    Schedule {
        id: row.get("id"),
        start_time: parse_utc(&start_raw),
        end_time: parse_utc(&end_raw),
        mode: ScheduleMode::from_str(&mode_raw).unwrap_or(ScheduleMode::Autonomous),
        source: row.get("source"),
        manual_override: row.get::<i64, _>("manual_override") != 0,
        target_soc: row.get("target_soc"),
        price_p_per_kwh: row.get("price_p_per_kwh"),
        executed: row.get::<i64, _>("executed") != 0,
        expired: row.get::<i64, _>("expired") != 0,
        decision: decision_raw.and_then(|s| DecisionAction::from_str(&s).ok()),
        decision_at: decision_at_raw.map(|s| parse_utc(&s)),
        retry_count: row.get("retry_count"),
        last_retry_utc: last_retry_raw.map(|s| parse_utc(&s)),
        created_at: parse_utc_or_now(&created_raw),
    }
}

fn row_to_decision(row: &sqlx::sqlite::SqliteRow) -> Decision {
    let action_raw: String = row.get("action");
    Decision {
        id: row.get("id"),
        timestamp: parse_utc_or_now(&row.get::<String, _>("timestamp")),
        schedule_id: row.get("schedule_id"),
        start_time: parse_utc(&row.get::<String, _>("start_time")),
        end_time: parse_utc(&row.get::<String, _>("end_time")),
        action: DecisionAction::from_str(&action_raw).unwrap_or(DecisionAction::Error),
        reason: row.get("reason"),
        soc: row.get("soc"),
        solar_power: row.get("solar_power"),
        island_status: row.get::<Option<i64>, _>("island_status").map(|v| v != 0),
        price_p_per_kwh: row.get("price_p_per_kwh"),
    }
}

fn parse_utc(raw: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or_else(|_| Utc::now())
}

fn parse_utc_or_now(raw: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or_else(|_| Utc::now())
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn memory_store() -> ScheduleStore {
        let options = SqliteConnectOptions::from_str("sqlite::memory:")
            .unwrap()
            .create_if_missing(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options)
            .await
            .unwrap();
        let store = ScheduleStore {
            pool,
            write_lock: Mutex::new(()),
        };
        store.ensure_schema().await.unwrap();
        store
    }

    #[tokio::test]
    async fn add_schedule_is_idempotent_on_start_end() {
        let store = memory_store().await;
        let start = Utc::now();
        let end = start + chrono::Duration::minutes(30);

        let first = store
            .add_schedule(start, end, ScheduleMode::Autonomous, Some(10.0))
            .await
            .unwrap();
        let second = store
            .add_schedule(start, end, ScheduleMode::Autonomous, Some(10.0))
            .await
            .unwrap();

        assert!(first);
        assert!(!second);
        assert_eq!(store.fetch_pending().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn mark_terminal_is_idempotent() {
        let store = memory_store().await;
        let start = Utc::now();
        let end = start + chrono::Duration::minutes(30);
        store
            .add_schedule(start, end, ScheduleMode::Autonomous, None)
            .await
            .unwrap();
        let pending = store.fetch_pending().await.unwrap();
        let id = pending[0].id;

        store.mark_terminal(id, DecisionAction::Completed).await.unwrap();
        store.mark_terminal(id, DecisionAction::Completed).await.unwrap();

        let row = store.get(id).await.unwrap().unwrap();
        assert!(row.executed);
        assert_eq!(row.decision, Some(DecisionAction::Completed));
        assert!(store.fetch_pending().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn mark_all_expired_writes_one_decision_per_schedule() {
        let store = memory_store().await;
        let start = Utc::now() - chrono::Duration::hours(2);
        let end = start + chrono::Duration::minutes(30);
        store
            .add_schedule(start, end, ScheduleMode::Autonomous, None)
            .await
            .unwrap();

        let count_first = store.mark_all_expired(Utc::now()).await.unwrap();
        let count_second = store.mark_all_expired(Utc::now()).await.unwrap();

        assert_eq!(count_first, 1);
        assert_eq!(count_second, 0);

        let decisions = store.fetch_recent_decisions(10).await.unwrap();
        let expired_decisions = decisions.iter().filter(|d| d.action.is_expiry()).count();
        assert_eq!(expired_decisions, 1);
    }

    #[tokio::test]
    async fn get_stored_price_falls_back_when_missing() {
        let store = memory_store().await;
        let start = Utc::now();
        let end = start + chrono::Duration::minutes(30);
        store
            .add_schedule(start, end, ScheduleMode::Autonomous, None)
            .await
            .unwrap();
        let id = store.fetch_pending().await.unwrap()[0].id;

        let price = store.get_stored_price(id).await.unwrap();
        assert_eq!(price, FALLBACK_PRICE_P_PER_KWH);
    }

    #[tokio::test]
    async fn retry_bookkeeping_round_trips() {
        let store = memory_store().await;
        let start = Utc::now();
        let end = start + chrono::Duration::minutes(30);
        store
            .add_schedule(start, end, ScheduleMode::Autonomous, None)
            .await
            .unwrap();
        let id = store.fetch_pending().await.unwrap()[0].id;

        store.update_last_retry(id).await.unwrap();
        store.update_last_retry(id).await.unwrap();
        assert_eq!(store.get_retry_count(id).await.unwrap(), 2);

        store.reset_retry(id).await.unwrap();
        assert_eq!(store.get_retry_count(id).await.unwrap(), 0);
        assert!(store.get_last_retry(id).await.unwrap().is_none());
    }
}
