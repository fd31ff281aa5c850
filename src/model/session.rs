//! Session and result data model.
//!
//! A [`TestSession`] is one attempt to run a plan against one product,
//! identified by its serial number. Sessions move through the state machine
//!
//! ```text
//! Pending ──Start──> Running ──┬──> Completed
//!                              ├──> Failed
//!                              ├──> Aborted   (Stop / operator NG)
//!                              └──> Error     (engine-internal fault)
//! ```
//!
//! and terminal sessions carry a [`FinalResult`]. Every executed point
//! produces one immutable [`TestResult`] row.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Session identifier.
pub type SessionId = Uuid;

/// Session lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SessionStatus {
    /// Created, not yet started
    Pending,
    /// Execution task in flight
    Running,
    /// All enabled points executed and passed
    Completed,
    /// Terminal with at least one FAIL/ERROR/SKIP row, or halted in normal mode
    Failed,
    /// Stopped by operator request or OPJudge NG
    Aborted,
    /// Engine-internal fault (repository unreachable, unrecoverable panic)
    Error,
}

impl SessionStatus {
    /// Terminal states never transition back to `Running`.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            SessionStatus::Completed
                | SessionStatus::Failed
                | SessionStatus::Aborted
                | SessionStatus::Error
        )
    }

    /// Only a pending session may begin execution.
    pub fn can_start(&self) -> bool {
        matches!(self, SessionStatus::Pending)
    }
}

impl std::fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            SessionStatus::Pending => "PENDING",
            SessionStatus::Running => "RUNNING",
            SessionStatus::Completed => "COMPLETED",
            SessionStatus::Failed => "FAILED",
            SessionStatus::Aborted => "ABORTED",
            SessionStatus::Error => "ERROR",
        };
        write!(f, "{s}")
    }
}

/// Overall verdict of a terminal session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FinalResult {
    /// Every executed point passed
    Pass,
    /// At least one point did not pass
    Fail,
    /// Session was aborted before completing
    Abort,
}

impl std::fmt::Display for FinalResult {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            FinalResult::Pass => "PASS",
            FinalResult::Fail => "FAIL",
            FinalResult::Abort => "ABORT",
        };
        write!(f, "{s}")
    }
}

/// Outcome of one executed point.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PointResult {
    /// Measured value satisfied the limits
    Pass,
    /// Measured value violated the limits
    Fail,
    /// Point not executed (missing upstream result or blocked precondition)
    Skip,
    /// Hardware, plan, or internal fault
    Error,
}

impl std::fmt::Display for PointResult {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            PointResult::Pass => "PASS",
            PointResult::Fail => "FAIL",
            PointResult::Skip => "SKIP",
            PointResult::Error => "ERROR",
        };
        write!(f, "{s}")
    }
}

/// One execution attempt against one product.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TestSession {
    /// Session identifier
    pub id: SessionId,
    /// Product serial number under test
    pub serial_number: String,
    /// Station running the plan
    pub station_id: String,
    /// Owning project, when known
    #[serde(default)]
    pub project_id: Option<String>,
    /// Operator, when known
    #[serde(default)]
    pub user_id: Option<String>,
    /// Lifecycle state
    pub status: SessionStatus,
    /// Set only on terminal states
    #[serde(default)]
    pub final_result: Option<FinalResult>,
    /// Execution start, set when the session turns RUNNING
    #[serde(default)]
    pub start_time: Option<DateTime<Utc>>,
    /// Execution end, set on terminal transition
    #[serde(default)]
    pub end_time: Option<DateTime<Utc>>,
    /// Enabled points in the loaded plan
    pub total_items: u32,
    /// Points with result PASS
    pub pass_items: u32,
    /// Points with result FAIL, ERROR or SKIP
    pub fail_items: u32,
    /// Execution policy: continue past failures to collect the full picture
    pub run_all_test: bool,
}

impl TestSession {
    /// Create a fresh PENDING session.
    pub fn new(
        serial_number: impl Into<String>,
        station_id: impl Into<String>,
        user_id: Option<String>,
        run_all_test: bool,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            serial_number: serial_number.into(),
            station_id: station_id.into(),
            project_id: None,
            user_id,
            status: SessionStatus::Pending,
            final_result: None,
            start_time: None,
            end_time: None,
            total_items: 0,
            pass_items: 0,
            fail_items: 0,
            run_all_test,
        }
    }
}

/// One row per executed point. Created by the engine, never mutated.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TestResult {
    /// Owning session
    pub session_id: SessionId,
    /// Plan point id (snapshot)
    pub test_plan_id: String,
    /// Plan item number (snapshot)
    pub item_no: i32,
    /// Plan item name (snapshot)
    pub item_name: String,
    /// Measured value, verbatim; empty string when no value was produced
    pub measured_value: String,
    /// Lower bound snapshot from the plan at execution time
    #[serde(default)]
    pub lower_limit: Option<f64>,
    /// Upper bound snapshot from the plan at execution time
    #[serde(default)]
    pub upper_limit: Option<f64>,
    /// Point outcome
    pub result: PointResult,
    /// Human-readable reason; empty on PASS
    pub error_message: String,
    /// Wall time spent executing the point
    pub execution_duration_ms: u64,
    /// When the point executed
    pub test_time: DateTime<Utc>,
}

/// Progress snapshot published after every executed point.
///
/// The same shape backs `Engine::status` and the HTTP status endpoint;
/// readers always observe a consistent snapshot, never partial updates.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionSnapshot {
    /// Session identifier
    pub session_id: SessionId,
    /// Lifecycle state
    pub status: SessionStatus,
    /// Points executed so far (monotonic)
    pub executed: u32,
    /// Enabled points in the plan
    pub total: u32,
    /// Item currently executing, if any
    #[serde(default)]
    pub current_item: Option<String>,
    /// PASS counter
    pub pass_items: u32,
    /// FAIL/ERROR/SKIP counter
    pub fail_items: u32,
    /// Set once the session is terminal
    #[serde(default)]
    pub final_result: Option<FinalResult>,
}

impl SessionSnapshot {
    /// Snapshot of a session that has no live executor (fresh or terminal).
    pub fn from_session(session: &TestSession) -> Self {
        Self {
            session_id: session.id,
            status: session.status,
            executed: session.pass_items + session.fail_items,
            total: session.total_items,
            current_item: None,
            pass_items: session.pass_items,
            fail_items: session.fail_items,
            final_result: session.final_result,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn terminal_states_cannot_restart() {
        for status in [
            SessionStatus::Completed,
            SessionStatus::Failed,
            SessionStatus::Aborted,
            SessionStatus::Error,
        ] {
            assert!(status.is_terminal());
            assert!(!status.can_start());
        }
        assert!(SessionStatus::Pending.can_start());
        assert!(!SessionStatus::Running.can_start());
        assert!(!SessionStatus::Running.is_terminal());
    }

    #[test]
    fn new_session_is_pending_with_zero_counters() {
        let session = TestSession::new("SN0001", "station-7", None, true);
        assert_eq!(session.status, SessionStatus::Pending);
        assert_eq!(session.pass_items + session.fail_items, 0);
        assert!(session.final_result.is_none());
        assert!(session.run_all_test);
    }

    #[test]
    fn status_serialises_in_wire_case() {
        let json = serde_json::to_string(&SessionStatus::Running).unwrap();
        assert_eq!(json, "\"RUNNING\"");
        let back: SessionStatus = serde_json::from_str("\"ABORTED\"").unwrap();
        assert_eq!(back, SessionStatus::Aborted);
    }
}
