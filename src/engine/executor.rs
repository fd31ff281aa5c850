//! Per-session execution task.
//!
//! One task per in-flight session; the executor is the only writer of its
//! session row, its result rows and its `result_map`. Points run strictly
//! sequentially in `(sequence_order, item_no)` order.
//!
//! Failure policy:
//! - FAIL/ERROR halts the session in normal mode and continues under
//!   `run_all_test`;
//! - SKIP (dangling `use_result`) records a row and always continues;
//! - handler panics are captured via the per-point task and become ERROR
//!   outcomes;
//! - repository writes retry with exponential backoff; persistent failure
//!   moves the session to ERROR (an engine fault, distinct from per-point
//!   ERROR results).

use super::dispatcher::{run_point, DispatcherDeps, PointOutcome};
use super::progress::ProgressBus;
use crate::cancel::CancelToken;
use crate::error::PdtResult;
use crate::model::{
    FinalResult, PointResult, SessionSnapshot, SessionStatus, TestPoint, TestResult, TestSession,
};
use crate::storage::{PlanQuery, PlanRepository, ReportSink, ResultRepository, SessionUpdate};
use chrono::Utc;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};

/// Everything a session task needs.
pub struct ExecutorDeps {
    /// Dispatcher collaborators
    pub dispatcher: DispatcherDeps,
    /// Plan read port
    pub plans: Arc<dyn PlanRepository>,
    /// Session/result write port
    pub repository: Arc<dyn ResultRepository>,
    /// Terminal-session report sink
    pub report: Arc<dyn ReportSink>,
    /// Repository write retries before the session turns ERROR
    pub repository_retries: u32,
}

async fn save_with_retry<F, Fut>(retries: u32, mut op: F) -> PdtResult<()>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = PdtResult<()>>,
{
    let mut attempt: u32 = 0;
    loop {
        match op().await {
            Ok(()) => return Ok(()),
            Err(e) if attempt < retries => {
                attempt += 1;
                let backoff = Duration::from_millis(50u64 << attempt.min(6));
                warn!(error = %e, attempt, "repository write failed, retrying");
                tokio::time::sleep(backoff).await;
            }
            Err(e) => return Err(e),
        }
    }
}

fn result_row(session: &TestSession, point: &TestPoint, outcome: &PointOutcome) -> TestResult {
    TestResult {
        session_id: session.id,
        test_plan_id: point.id.clone(),
        item_no: point.item_no,
        item_name: point.item_name.clone(),
        measured_value: outcome.measured.clone(),
        lower_limit: point.lower_limit,
        upper_limit: point.upper_limit,
        result: outcome.result,
        error_message: outcome.error.clone(),
        execution_duration_ms: outcome.duration_ms,
        test_time: Utc::now(),
    }
}

/// Run one session from RUNNING to a terminal state.
pub async fn run_session(
    deps: Arc<ExecutorDeps>,
    session: TestSession,
    cancel: CancelToken,
    progress: ProgressBus,
) {
    let session_id = session.id;
    let retries = deps.repository_retries;
    let mut snapshot = SessionSnapshot::from_session(&session);
    snapshot.status = SessionStatus::Running;

    let started = Utc::now();
    if let Err(e) = save_with_retry(retries, || {
        deps.repository.update_session(
            session_id,
            SessionUpdate {
                status: Some(SessionStatus::Running),
                start_time: Some(started),
                ..Default::default()
            },
        )
    })
    .await
    {
        error!(session = %session_id, error = %e, "cannot mark session RUNNING");
        fail_engine(&deps, &mut snapshot, &progress).await;
        return;
    }
    progress.publish(snapshot.clone());

    let plan = match deps
        .plans
        .load_plan(&PlanQuery::station(&session.station_id))
        .await
    {
        Ok(Some(points)) => points,
        Ok(None) => {
            error!(session = %session_id, station = %session.station_id, "no plan for station");
            fail_engine(&deps, &mut snapshot, &progress).await;
            return;
        }
        Err(e) => {
            error!(session = %session_id, error = %e, "plan load failed");
            fail_engine(&deps, &mut snapshot, &progress).await;
            return;
        }
    };

    for issue in crate::model::validate_plan(&plan) {
        warn!(session = %session_id, %issue, "plan issue");
    }

    snapshot.total = plan.len() as u32;
    if let Err(e) = save_with_retry(retries, || {
        deps.repository.update_session(
            session_id,
            SessionUpdate {
                total_items: Some(snapshot.total),
                ..Default::default()
            },
        )
    })
    .await
    {
        error!(session = %session_id, error = %e, "cannot record plan size");
        fail_engine(&deps, &mut snapshot, &progress).await;
        return;
    }
    progress.publish(snapshot.clone());

    info!(session = %session_id, serial = %session.serial_number, points = plan.len(), "session started");

    let mut result_map: HashMap<String, String> = HashMap::new();
    let mut aborted = false;

    for point in &plan {
        if cancel.is_cancelled() {
            aborted = true;
            break;
        }

        snapshot.current_item = Some(point.item_name.clone());
        progress.publish(snapshot.clone());

        let outcome = match &point.use_result {
            Some(target) if !result_map.contains_key(target) => PointOutcome {
                result: PointResult::Skip,
                measured: String::new(),
                error: "missing upstream result".to_string(),
                duration_ms: 0,
                abort: false,
            },
            _ => dispatch_captured(&deps, &session, point, &result_map, cancel.clone()).await,
        };

        let row = result_row(&session, point, &outcome);
        if let Err(e) =
            save_with_retry(retries, || deps.repository.save_result(&row)).await
        {
            error!(session = %session_id, error = %e, "result persistence failed");
            fail_engine(&deps, &mut snapshot, &progress).await;
            return;
        }

        // Downstream points may consume the value even when this one failed.
        if outcome.result != PointResult::Skip {
            result_map.insert(point.item_name.clone(), outcome.measured.clone());
        }

        snapshot.executed += 1;
        if outcome.result == PointResult::Pass {
            snapshot.pass_items += 1;
        } else {
            snapshot.fail_items += 1;
        }
        let _ = save_with_retry(retries, || {
            deps.repository.update_session(
                session_id,
                SessionUpdate {
                    pass_items: Some(snapshot.pass_items),
                    fail_items: Some(snapshot.fail_items),
                    ..Default::default()
                },
            )
        })
        .await;
        progress.publish(snapshot.clone());

        if outcome.abort {
            info!(session = %session_id, item = %point.item_name, "abort requested");
            aborted = true;
            break;
        }
        if !session.run_all_test
            && matches!(outcome.result, PointResult::Fail | PointResult::Error)
        {
            info!(session = %session_id, item = %point.item_name, result = %outcome.result, "halting in normal mode");
            break;
        }
    }

    let (status, final_result) = if aborted {
        (SessionStatus::Aborted, FinalResult::Abort)
    } else if snapshot.fail_items == 0 {
        (SessionStatus::Completed, FinalResult::Pass)
    } else {
        (SessionStatus::Failed, FinalResult::Fail)
    };

    if let Err(e) = save_with_retry(retries, || {
        deps.repository.update_session(
            session_id,
            SessionUpdate {
                status: Some(status),
                final_result: Some(final_result),
                end_time: Some(Utc::now()),
                pass_items: Some(snapshot.pass_items),
                fail_items: Some(snapshot.fail_items),
                ..Default::default()
            },
        )
    })
    .await
    {
        error!(session = %session_id, error = %e, "terminal update failed");
        fail_engine(&deps, &mut snapshot, &progress).await;
        return;
    }

    snapshot.status = status;
    snapshot.final_result = Some(final_result);
    snapshot.current_item = None;
    progress.publish(snapshot.clone());

    info!(
        session = %session_id,
        status = %status,
        pass = snapshot.pass_items,
        fail = snapshot.fail_items,
        "session terminal"
    );

    notify_report(&deps, session_id).await;
}

/// Run the dispatcher inside its own task so a handler panic is contained.
async fn dispatch_captured(
    deps: &Arc<ExecutorDeps>,
    session: &TestSession,
    point: &TestPoint,
    result_map: &HashMap<String, String>,
    cancel: CancelToken,
) -> PointOutcome {
    let dispatcher = deps.dispatcher.clone();
    let session_id = session.id;
    let serial = session.serial_number.clone();
    let point = point.clone();
    let map = result_map.clone();

    let task = tokio::spawn(async move {
        run_point(&dispatcher, session_id, &serial, &point, &map, cancel).await
    });
    match task.await {
        Ok(outcome) => outcome,
        Err(join_err) => {
            let reason = if join_err.is_panic() {
                "handler panicked".to_string()
            } else {
                format!("handler task failed: {join_err}")
            };
            error!(session = %session_id, error = %reason, "point dispatch fault");
            PointOutcome {
                result: PointResult::Error,
                measured: String::new(),
                error: reason,
                duration_ms: 0,
                abort: false,
            }
        }
    }
}

/// Engine-internal fault: the session row (when still reachable) and the
/// snapshot both move to ERROR. `final_result` stays unset; ERROR is an
/// engine state, not a product verdict.
async fn fail_engine(deps: &Arc<ExecutorDeps>, snapshot: &mut SessionSnapshot, progress: &ProgressBus) {
    let _ = deps
        .repository
        .update_session(
            snapshot.session_id,
            SessionUpdate {
                status: Some(SessionStatus::Error),
                end_time: Some(Utc::now()),
                ..Default::default()
            },
        )
        .await;
    snapshot.status = SessionStatus::Error;
    snapshot.current_item = None;
    progress.publish(snapshot.clone());
    notify_report(deps, snapshot.session_id).await;
}

async fn notify_report(deps: &Arc<ExecutorDeps>, session_id: crate::model::SessionId) {
    let session = match deps.repository.session(session_id).await {
        Ok(Some(session)) => session,
        _ => return,
    };
    let results = deps.repository.results(session_id).await.unwrap_or_default();
    if let Err(e) = deps.report.on_session_terminal(&session, &results).await {
        warn!(session = %session_id, error = %e, "report sink failed");
    }
}
