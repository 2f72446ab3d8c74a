#![allow(dead_code)]
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// `mode` column: who created the schedule row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ScheduleMode {
    Autonomous,
    Manual,
}

impl fmt::Display for ScheduleMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ScheduleMode::Autonomous => write!(f, "autonomous"),
            ScheduleMode::Manual => write!(f, "manual"),
        }
    }
}

impl std::str::FromStr for ScheduleMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "autonomous" => Ok(ScheduleMode::Autonomous),
            "manual" => Ok(ScheduleMode::Manual),
            other => Err(format!("unknown schedule mode {other:?}")),
        }
    }
}

/// `decision`/`action` column: the terminal (or audit) label a schedule
/// is stamped with. `Display` produces the lowercase wire string stored
/// in SQLite and returned over the control surface.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DecisionAction {
    Completed,
    Cancelled,
    Expired,
    Aborted,
    Stopped,
    Deleted,
    Error,
}

impl fmt::Display for DecisionAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            DecisionAction::Completed => "completed",
            DecisionAction::Cancelled => "cancelled",
            DecisionAction::Expired => "expired",
            DecisionAction::Aborted => "aborted",
            DecisionAction::Stopped => "stopped",
            DecisionAction::Deleted => "deleted",
            DecisionAction::Error => "error",
        };
        write!(f, "{s}")
    }
}

impl std::str::FromStr for DecisionAction {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "completed" => Ok(DecisionAction::Completed),
            "cancelled" => Ok(DecisionAction::Cancelled),
            "expired" => Ok(DecisionAction::Expired),
            "aborted" => Ok(DecisionAction::Aborted),
            "stopped" => Ok(DecisionAction::Stopped),
            "deleted" => Ok(DecisionAction::Deleted),
            "error" => Ok(DecisionAction::Error),
            other => Err(format!("unknown decision action {other:?}")),
        }
    }
}

impl DecisionAction {
    /// True for the single decision a schedule's expiry sweep is allowed
    /// to write at most once per `schedule_id` (spec invariant on `Decision`).
    pub fn is_expiry(&self) -> bool {
        matches!(self, DecisionAction::Expired)
    }
}

/// A single intended charging window, mirroring the `schedules` table
/// column for column.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Schedule {
    pub id: i64,
    pub start_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
    pub mode: ScheduleMode,
    pub source: String,
    pub manual_override: bool,
    pub target_soc: Option<i32>,
    pub price_p_per_kwh: Option<f64>,
    pub executed: bool,
    pub expired: bool,
    pub decision: Option<DecisionAction>,
    pub decision_at: Option<DateTime<Utc>>,
    pub retry_count: i64,
    pub last_retry_utc: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

impl Schedule {
    /// A row is pending iff neither terminal flag is set.
    pub fn is_pending(&self) -> bool {
        !self.executed && !self.expired
    }

    pub fn duration(&self) -> chrono::Duration {
        self.end_time - self.start_time
    }
}

/// Append-only audit row; never mutated after insert.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Decision {
    pub id: i64,
    pub timestamp: DateTime<Utc>,
    pub schedule_id: i64,
    pub start_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
    pub action: DecisionAction,
    pub reason: String,
    pub soc: Option<f64>,
    pub solar_power: Option<f64>,
    pub island_status: Option<bool>,
    pub price_p_per_kwh: Option<f64>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pending_row_has_both_terminal_flags_clear() {
        let sched = sample_schedule();
        assert!(sched.is_pending());
    }

    #[test]
    fn executed_row_is_not_pending() {
        let mut sched = sample_schedule();
        sched.executed = true;
        assert!(!sched.is_pending());
    }

    #[test]
    fn expired_row_is_not_pending() {
        let mut sched = sample_schedule();
        sched.expired = true;
        assert!(!sched.is_pending());
    }

    #[test]
    fn decision_action_round_trips_through_display_and_from_str() {
        for action in [
            DecisionAction::Completed,
            DecisionAction::Cancelled,
            DecisionAction::Expired,
            DecisionAction::Aborted,
            DecisionAction::Stopped,
            DecisionAction::Deleted,
            DecisionAction::Error,
        ] {
            let s = action.to_string();
            let parsed: DecisionAction = s.parse().unwrap();
            assert_eq!(parsed, action);
        }
    }

    #[test]
    fn only_expired_is_an_expiry_decision() {
        assert!(DecisionAction::Expired.is_expiry());
        assert!(!DecisionAction::Completed.is_expiry());
    }

    fn sample_schedule() -> Schedule {
        let now = Utc::now();
        Schedule {
            id: 1,
            start_time: now,
            end_time: now + chrono::Duration::minutes(30),
            mode: ScheduleMode::Autonomous,
            source: "scheduler".to_string(),
            manual_override: false,
            target_soc: Some(90),
            price_p_per_kwh: Some(12.3),
            executed: false,
            expired: false,
            decision: None,
            decision_at: None,
            retry_count: 0,
            last_retry_utc: None,
            created_at: now,
        }
    }
}
