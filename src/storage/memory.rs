//! In-memory repository implementations.
//!
//! Back tests and single-box deployments. Plans are seeded per station; the
//! result store enforces the `(session_id, test_plan_id)` uniqueness the
//! at-least-once save contract relies on.

use super::{PlanQuery, PlanRepository, ResultRepository, SessionUpdate, SfcLogEntry};
use crate::error::{PdtError, PdtResult};
use crate::model::{SessionId, TestPoint, TestResult, TestSession};
use async_trait::async_trait;
use std::collections::HashMap;
use tokio::sync::RwLock;

/// Plan store seeded at startup (or by tests).
pub struct InMemoryPlanRepository {
    plans: RwLock<HashMap<String, Vec<TestPoint>>>,
}

impl InMemoryPlanRepository {
    /// Empty store.
    pub fn new() -> Self {
        Self {
            plans: RwLock::new(HashMap::new()),
        }
    }

    /// Seed (or replace) a station's plan.
    pub async fn set_plan(&self, station_id: &str, points: Vec<TestPoint>) {
        self.plans
            .write()
            .await
            .insert(station_id.to_string(), points);
    }
}

impl Default for InMemoryPlanRepository {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl PlanRepository for InMemoryPlanRepository {
    async fn load_plan(&self, query: &PlanQuery) -> PdtResult<Option<Vec<TestPoint>>> {
        let plans = self.plans.read().await;
        let Some(points) = plans.get(&query.station_id) else {
            return Ok(None);
        };
        let mut points: Vec<TestPoint> = points
            .iter()
            .filter(|p| !query.enabled_only || p.enabled)
            .cloned()
            .collect();
        points.sort_by_key(TestPoint::sort_key);
        Ok(Some(points))
    }
}

#[derive(Default)]
struct ResultStore {
    sessions: HashMap<SessionId, TestSession>,
    results: HashMap<SessionId, Vec<TestResult>>,
    sfc_logs: Vec<SfcLogEntry>,
}

/// Session/result store.
pub struct InMemoryResultRepository {
    store: RwLock<ResultStore>,
}

impl InMemoryResultRepository {
    /// Empty store.
    pub fn new() -> Self {
        Self {
            store: RwLock::new(ResultStore::default()),
        }
    }

    /// SFC log rows recorded so far (test inspection).
    pub async fn sfc_logs(&self) -> Vec<SfcLogEntry> {
        self.store.read().await.sfc_logs.clone()
    }
}

impl Default for InMemoryResultRepository {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ResultRepository for InMemoryResultRepository {
    async fn insert_session(&self, session: &TestSession) -> PdtResult<()> {
        let mut store = self.store.write().await;
        if store.sessions.contains_key(&session.id) {
            return Err(PdtError::Repository(format!(
                "session {} already exists",
                session.id
            )));
        }
        store.sessions.insert(session.id, session.clone());
        Ok(())
    }

    async fn update_session(&self, id: SessionId, update: SessionUpdate) -> PdtResult<()> {
        let mut store = self.store.write().await;
        let session = store
            .sessions
            .get_mut(&id)
            .ok_or(PdtError::SessionNotFound(id))?;
        if let Some(status) = update.status {
            session.status = status;
        }
        if let Some(final_result) = update.final_result {
            session.final_result = Some(final_result);
        }
        if let Some(start_time) = update.start_time {
            session.start_time = Some(start_time);
        }
        if let Some(end_time) = update.end_time {
            session.end_time = Some(end_time);
        }
        if let Some(total) = update.total_items {
            session.total_items = total;
        }
        if let Some(pass) = update.pass_items {
            session.pass_items = pass;
        }
        if let Some(fail) = update.fail_items {
            session.fail_items = fail;
        }
        Ok(())
    }

    async fn session(&self, id: SessionId) -> PdtResult<Option<TestSession>> {
        Ok(self.store.read().await.sessions.get(&id).cloned())
    }

    async fn save_result(&self, result: &TestResult) -> PdtResult<()> {
        let mut store = self.store.write().await;
        let rows = store.results.entry(result.session_id).or_default();
        // At-least-once delivery: a duplicate (session_id, test_plan_id) row
        // replaces nothing and is silently dropped.
        if rows.iter().any(|r| r.test_plan_id == result.test_plan_id) {
            return Ok(());
        }
        rows.push(result.clone());
        Ok(())
    }

    async fn results(&self, id: SessionId) -> PdtResult<Vec<TestResult>> {
        Ok(self
            .store
            .read()
            .await
            .results
            .get(&id)
            .cloned()
            .unwrap_or_default())
    }

    async fn save_sfc_log(&self, entry: &SfcLogEntry) -> PdtResult<()> {
        self.store.write().await.sfc_logs.push(entry.clone());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{LimitType, PointResult, SessionStatus, ValueType};
    use chrono::Utc;

    fn point(item_no: i32, name: &str, enabled: bool) -> TestPoint {
        TestPoint {
            id: item_no.to_string(),
            item_no,
            item_name: name.to_string(),
            item_key: None,
            execute_name: "Wait".to_string(),
            switch_mode: None,
            parameters: Default::default(),
            command: None,
            timeout_ms: None,
            wait_msec: Some(1),
            use_result: None,
            lower_limit: None,
            upper_limit: None,
            eq_limit: None,
            limit_type: LimitType::None,
            value_type: ValueType::String,
            unit: None,
            enabled,
            sequence_order: item_no,
        }
    }

    #[tokio::test]
    async fn unknown_station_is_none_not_empty() {
        let repo = InMemoryPlanRepository::new();
        assert!(repo
            .load_plan(&PlanQuery::station("ghost"))
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn enabled_only_filters_and_orders() {
        let repo = InMemoryPlanRepository::new();
        let mut late = point(1, "late", true);
        late.sequence_order = 9;
        repo.set_plan(
            "st1",
            vec![late, point(2, "disabled", false), point(3, "early", true)],
        )
        .await;

        let plan = repo
            .load_plan(&PlanQuery::station("st1"))
            .await
            .unwrap()
            .unwrap();
        let names: Vec<&str> = plan.iter().map(|p| p.item_name.as_str()).collect();
        assert_eq!(names, vec!["early", "late"]);
    }

    #[tokio::test]
    async fn duplicate_result_rows_are_dropped() {
        let repo = InMemoryResultRepository::new();
        let session = TestSession::new("SN1", "st1", None, false);
        repo.insert_session(&session).await.unwrap();

        let row = TestResult {
            session_id: session.id,
            test_plan_id: "1".to_string(),
            item_no: 1,
            item_name: "p".to_string(),
            measured_value: "OK".to_string(),
            lower_limit: None,
            upper_limit: None,
            result: PointResult::Pass,
            error_message: String::new(),
            execution_duration_ms: 3,
            test_time: Utc::now(),
        };
        repo.save_result(&row).await.unwrap();
        repo.save_result(&row).await.unwrap();
        assert_eq!(repo.results(session.id).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn session_update_is_partial() {
        let repo = InMemoryResultRepository::new();
        let session = TestSession::new("SN1", "st1", None, false);
        repo.insert_session(&session).await.unwrap();

        repo.update_session(
            session.id,
            SessionUpdate {
                status: Some(SessionStatus::Running),
                total_items: Some(5),
                ..Default::default()
            },
        )
        .await
        .unwrap();

        let loaded = repo.session(session.id).await.unwrap().unwrap();
        assert_eq!(loaded.status, SessionStatus::Running);
        assert_eq!(loaded.total_items, 5);
        assert_eq!(loaded.serial_number, "SN1");
    }
}
