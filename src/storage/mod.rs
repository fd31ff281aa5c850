//! Persistence and report ports.
//!
//! The engine never touches a database directly: plans come in through
//! [`PlanRepository`], sessions and per-point rows go out through
//! [`ResultRepository`], and terminal sessions are announced to a
//! [`ReportSink`]. The in-memory implementations in [`memory`] back tests and
//! single-box deployments; a relational implementation plugs in behind the
//! same traits.

pub mod memory;
pub mod report;

pub use memory::{InMemoryPlanRepository, InMemoryResultRepository};
pub use report::{CsvReportSink, NoopReportSink, ReportSink};

use crate::error::PdtResult;
use crate::model::{
    FinalResult, SessionId, SessionStatus, TestPoint, TestResult, TestSession,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Query parameters for a plan load.
#[derive(Debug, Clone, Default)]
pub struct PlanQuery {
    /// Station whose plan to load
    pub station_id: String,
    /// Optional project filter
    pub project_id: Option<String>,
    /// Optional named plan within the station
    pub test_plan_name: Option<String>,
    /// Drop disabled points before returning
    pub enabled_only: bool,
}

impl PlanQuery {
    /// Plan for a station, enabled points only.
    pub fn station(station_id: impl Into<String>) -> Self {
        Self {
            station_id: station_id.into(),
            project_id: None,
            test_plan_name: None,
            enabled_only: true,
        }
    }
}

/// Read side: ordered test points for a station/plan.
#[async_trait]
pub trait PlanRepository: Send + Sync {
    /// Load points ordered by `(sequence_order, item_no)`.
    ///
    /// An unknown station returns `Ok(None)` so the HTTP adapter can answer
    /// 404 rather than treating it as an empty plan.
    async fn load_plan(&self, query: &PlanQuery) -> PdtResult<Option<Vec<TestPoint>>>;
}

/// Partial update of a session row.
#[derive(Debug, Clone, Default)]
pub struct SessionUpdate {
    /// New lifecycle state
    pub status: Option<SessionStatus>,
    /// Final verdict (terminal transitions only)
    pub final_result: Option<FinalResult>,
    /// Execution start
    pub start_time: Option<DateTime<Utc>>,
    /// Execution end
    pub end_time: Option<DateTime<Utc>>,
    /// Enabled-point count, set when the plan is loaded
    pub total_items: Option<u32>,
    /// PASS counter
    pub pass_items: Option<u32>,
    /// FAIL/ERROR/SKIP counter
    pub fail_items: Option<u32>,
}

/// One SFC (MES) exchange, persisted for traceability.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SfcLogEntry {
    /// Owning session
    pub session_id: SessionId,
    /// SFC operation name
    pub operation: String,
    /// Request payload as sent
    pub request: serde_json::Value,
    /// Response body, verbatim
    pub response: String,
    /// Whether the service accepted the record
    pub ok: bool,
    /// When the exchange happened
    pub at: DateTime<Utc>,
}

/// Write side: sessions, per-point results, SFC logs.
#[async_trait]
pub trait ResultRepository: Send + Sync {
    /// Persist a fresh PENDING session row.
    async fn insert_session(&self, session: &TestSession) -> PdtResult<()>;

    /// Apply a partial update to a session row.
    async fn update_session(&self, id: SessionId, update: SessionUpdate) -> PdtResult<()>;

    /// Fetch a session row.
    async fn session(&self, id: SessionId) -> PdtResult<Option<TestSession>>;

    /// Persist one result row. At-least-once: duplicate delivery on
    /// `(session_id, test_plan_id)` is the repository's concern.
    async fn save_result(&self, result: &TestResult) -> PdtResult<()>;

    /// All result rows of a session in execution order.
    async fn results(&self, id: SessionId) -> PdtResult<Vec<TestResult>>;

    /// Persist one SFC exchange.
    async fn save_sfc_log(&self, entry: &SfcLogEntry) -> PdtResult<()>;
}
