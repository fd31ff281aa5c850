//! Session engine: lifecycle, execution tasks, progress.
//!
//! The [`TestEngine`] owns the session state machine
//! `PENDING → RUNNING → {COMPLETED, FAILED, ABORTED, ERROR}` and spawns one
//! executor task per started session. `start` is idempotent on non-PENDING
//! sessions, `stop` is idempotent after the first call, and `status` is safe
//! to poll at any cadence.

pub mod dispatcher;
pub mod executor;
pub mod progress;

pub use dispatcher::{DispatcherDeps, PointOutcome};
pub use executor::ExecutorDeps;
pub use progress::ProgressBus;

use crate::cancel::{cancel_pair, CancelHandle};
use crate::error::{PdtError, PdtResult};
use crate::model::{
    FinalResult, SessionId, SessionSnapshot, SessionStatus, TestResult, TestSession,
};
use crate::storage::{PlanQuery, SessionUpdate};
use chrono::Utc;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{watch, RwLock};
use tokio::task::JoinHandle;
use tracing::{info, warn};

/// New-session request.
#[derive(Debug, Clone)]
pub struct CreateSession {
    /// Product serial number
    pub serial_number: String,
    /// Station whose plan will run
    pub station_id: String,
    /// Optional owning project
    pub project_id: Option<String>,
    /// Optional operator
    pub user_id: Option<String>,
    /// Continue past failures, collecting the complete picture
    pub run_all_test: bool,
}

struct SessionHandle {
    cancel: CancelHandle,
    progress: watch::Receiver<SessionSnapshot>,
    task: JoinHandle<()>,
}

struct EngineInner {
    deps: Arc<ExecutorDeps>,
    sessions: RwLock<HashMap<SessionId, SessionHandle>>,
}

/// The test-execution engine.
#[derive(Clone)]
pub struct TestEngine {
    inner: Arc<EngineInner>,
}

impl TestEngine {
    /// Build the engine over its collaborator ports.
    pub fn new(deps: ExecutorDeps) -> Self {
        Self {
            inner: Arc::new(EngineInner {
                deps: Arc::new(deps),
                sessions: RwLock::new(HashMap::new()),
            }),
        }
    }

    /// Collaborator bundle (adapters need the instrument manager etc.).
    pub fn deps(&self) -> &ExecutorDeps {
        &self.inner.deps
    }

    /// Persist a PENDING session. No execution starts here.
    pub async fn create_session(&self, request: CreateSession) -> PdtResult<TestSession> {
        if request.serial_number.trim().is_empty() {
            return Err(PdtError::MissingParameter("serial_number".to_string()));
        }
        if request.station_id.trim().is_empty() {
            return Err(PdtError::MissingParameter("station_id".to_string()));
        }

        // The station must have a plan before a session is accepted.
        let known = self
            .inner
            .deps
            .plans
            .load_plan(&PlanQuery::station(&request.station_id))
            .await?
            .is_some();
        if !known {
            return Err(PdtError::StationNotFound(request.station_id));
        }

        let mut session = TestSession::new(
            request.serial_number,
            request.station_id,
            request.user_id,
            request.run_all_test,
        );
        session.project_id = request.project_id;
        self.inner.deps.repository.insert_session(&session).await?;
        info!(session = %session.id, serial = %session.serial_number, "session created");
        Ok(session)
    }

    /// Begin executing a PENDING session. Idempotent: a non-PENDING session
    /// is left untouched and its current status returned.
    pub async fn start(&self, id: SessionId) -> PdtResult<SessionStatus> {
        let mut sessions = self.inner.sessions.write().await;
        if let Some(handle) = sessions.get(&id) {
            return Ok(handle.progress.borrow().status);
        }

        let session = self
            .inner
            .deps
            .repository
            .session(id)
            .await?
            .ok_or(PdtError::SessionNotFound(id))?;
        if !session.status.can_start() {
            return Ok(session.status);
        }

        let (cancel_handle, cancel_token) = cancel_pair();
        let initial = SessionSnapshot::from_session(&session);
        let (bus, progress_rx) = ProgressBus::new(initial);

        let deps = self.inner.deps.clone();
        let task = tokio::spawn(async move {
            executor::run_session(deps, session, cancel_token, bus).await;
        });

        sessions.insert(
            id,
            SessionHandle {
                cancel: cancel_handle,
                progress: progress_rx,
                task,
            },
        );
        Ok(SessionStatus::Running)
    }

    /// Request cancellation. The executor finishes the current point's
    /// cleanup and transitions to ABORTED. Idempotent.
    pub async fn stop(&self, id: SessionId) -> PdtResult<SessionStatus> {
        {
            let sessions = self.inner.sessions.read().await;
            if let Some(handle) = sessions.get(&id) {
                handle.cancel.cancel();
                return Ok(handle.progress.borrow().status);
            }
        }

        // No live executor: a PENDING session aborts directly, a terminal
        // session is left as-is.
        let session = self
            .inner
            .deps
            .repository
            .session(id)
            .await?
            .ok_or(PdtError::SessionNotFound(id))?;
        if session.status == SessionStatus::Pending {
            self.inner
                .deps
                .repository
                .update_session(
                    id,
                    SessionUpdate {
                        status: Some(SessionStatus::Aborted),
                        final_result: Some(FinalResult::Abort),
                        end_time: Some(Utc::now()),
                        ..Default::default()
                    },
                )
                .await?;
            return Ok(SessionStatus::Aborted);
        }
        Ok(session.status)
    }

    /// Progress snapshot; safe to poll at any cadence.
    pub async fn status(&self, id: SessionId) -> PdtResult<SessionSnapshot> {
        {
            let sessions = self.inner.sessions.read().await;
            if let Some(handle) = sessions.get(&id) {
                return Ok(handle.progress.borrow().clone());
            }
        }
        let session = self
            .inner
            .deps
            .repository
            .session(id)
            .await?
            .ok_or(PdtError::SessionNotFound(id))?;
        Ok(SessionSnapshot::from_session(&session))
    }

    /// Subscribe to a live session's progress stream.
    pub async fn watch(&self, id: SessionId) -> Option<watch::Receiver<SessionSnapshot>> {
        let sessions = self.inner.sessions.read().await;
        sessions.get(&id).map(|handle| handle.progress.clone())
    }

    /// Result rows in execution order.
    pub async fn results(&self, id: SessionId) -> PdtResult<Vec<TestResult>> {
        self.inner
            .deps
            .repository
            .session(id)
            .await?
            .ok_or(PdtError::SessionNotFound(id))?;
        self.inner.deps.repository.results(id).await
    }

    /// Session row as persisted.
    pub async fn session(&self, id: SessionId) -> PdtResult<TestSession> {
        self.inner
            .deps
            .repository
            .session(id)
            .await?
            .ok_or(PdtError::SessionNotFound(id))
    }

    /// Wait for a session's executor task to finish (tests, shutdown).
    pub async fn join(&self, id: SessionId) {
        let handle = {
            let mut sessions = self.inner.sessions.write().await;
            sessions.remove(&id)
        };
        if let Some(handle) = handle {
            if let Err(e) = handle.task.await {
                warn!(session = %id, error = %e, "session task join failed");
            }
        }
    }

    /// Cancel every in-flight session, wait for their cleanup, and
    /// disconnect all instruments.
    pub async fn shutdown(&self) {
        let handles: Vec<(SessionId, SessionHandle)> = {
            let mut sessions = self.inner.sessions.write().await;
            sessions.drain().collect()
        };
        for (_, handle) in &handles {
            handle.cancel.cancel();
        }
        let joins = handles.into_iter().map(|(id, handle)| async move {
            if let Err(e) = handle.task.await {
                warn!(session = %id, error = %e, "session task join failed");
            }
        });
        futures::future::join_all(joins).await;
        self.inner.deps.dispatcher.instruments.disconnect_all().await;
    }
}
