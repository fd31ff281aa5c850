//! HTTP surface.
//!
//! Thin axum adapter over the engine: session control, instrument status,
//! and the test-plan read path. Authentication, RBAC and API docs live in
//! front of this service and are not part of the core.

use crate::engine::{CreateSession, TestEngine};
use crate::error::PdtError;
use crate::model::{SessionId, SessionStatus};
use crate::storage::PlanQuery;
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};

/// Shared state of the HTTP adapter.
#[derive(Clone)]
pub struct AppState {
    /// The engine
    pub engine: TestEngine,
    /// Suggested client polling cadence in milliseconds
    pub progress_poll_ms: u64,
}

/// Build the service router.
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/sessions", post(create_session))
        .route("/sessions/:id/start", post(start_session))
        .route("/sessions/:id/stop", post(stop_session))
        .route("/sessions/:id/status", get(session_status))
        .route("/sessions/:id/results", get(session_results))
        .route("/measurements/instruments", get(instrument_status))
        .route("/measurements/instruments/:id/reset", post(reset_instrument))
        .route("/stations/:sid/testplan", get(station_testplan))
        .with_state(state)
}

/// Error envelope returned on every non-2xx response.
#[derive(Debug, Serialize)]
struct ErrorBody {
    error: String,
}

struct ApiError(PdtError);

impl From<PdtError> for ApiError {
    fn from(err: PdtError) -> Self {
        Self(err)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self.0 {
            PdtError::SessionNotFound(_)
            | PdtError::StationNotFound(_)
            | PdtError::InstrumentNotConfigured(_) => StatusCode::NOT_FOUND,
            PdtError::MissingParameter(_)
            | PdtError::InvalidParameter { .. }
            | PdtError::UnknownExecuteName(_)
            | PdtError::Configuration(_) => StatusCode::BAD_REQUEST,
            PdtError::InstrumentBusy(_) => StatusCode::CONFLICT,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        let body = Json(ErrorBody {
            error: self.0.to_string(),
        });
        (status, body).into_response()
    }
}

#[derive(Debug, Deserialize)]
struct CreateSessionRequest {
    serial_number: String,
    station_id: String,
    #[serde(default)]
    project_id: Option<String>,
    #[serde(default)]
    user_id: Option<String>,
    #[serde(default)]
    run_all_test: bool,
}

#[derive(Debug, Serialize)]
struct CreateSessionResponse {
    session_id: SessionId,
    status: SessionStatus,
}

async fn create_session(
    State(state): State<AppState>,
    Json(request): Json<CreateSessionRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let session = state
        .engine
        .create_session(CreateSession {
            serial_number: request.serial_number,
            station_id: request.station_id,
            project_id: request.project_id,
            user_id: request.user_id,
            run_all_test: request.run_all_test,
        })
        .await?;
    Ok((
        StatusCode::CREATED,
        Json(CreateSessionResponse {
            session_id: session.id,
            status: session.status,
        }),
    ))
}

#[derive(Debug, Serialize)]
struct StatusResponse {
    status: SessionStatus,
}

async fn start_session(
    State(state): State<AppState>,
    Path(id): Path<SessionId>,
) -> Result<impl IntoResponse, ApiError> {
    let status = state.engine.start(id).await?;
    // Start on an already-terminal session is a state conflict.
    let code = if status.is_terminal() {
        StatusCode::CONFLICT
    } else {
        StatusCode::OK
    };
    Ok((code, Json(StatusResponse { status })))
}

async fn stop_session(
    State(state): State<AppState>,
    Path(id): Path<SessionId>,
) -> Result<impl IntoResponse, ApiError> {
    let status = state.engine.stop(id).await?;
    Ok(Json(StatusResponse { status }))
}

#[derive(Debug, Serialize)]
struct SessionStatusResponse {
    status: SessionStatus,
    executed: u32,
    total: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    current_item: Option<String>,
    pass_items: u32,
    fail_items: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    final_result: Option<crate::model::FinalResult>,
    poll_hint_ms: u64,
}

async fn session_status(
    State(state): State<AppState>,
    Path(id): Path<SessionId>,
) -> Result<impl IntoResponse, ApiError> {
    let snapshot = state.engine.status(id).await?;
    Ok(Json(SessionStatusResponse {
        status: snapshot.status,
        executed: snapshot.executed,
        total: snapshot.total,
        current_item: snapshot.current_item,
        pass_items: snapshot.pass_items,
        fail_items: snapshot.fail_items,
        final_result: snapshot.final_result,
        poll_hint_ms: state.progress_poll_ms,
    }))
}

async fn session_results(
    State(state): State<AppState>,
    Path(id): Path<SessionId>,
) -> Result<impl IntoResponse, ApiError> {
    let results = state.engine.results(id).await?;
    Ok(Json(results))
}

async fn instrument_status(State(state): State<AppState>) -> impl IntoResponse {
    Json(state.engine.deps().dispatcher.instruments.status())
}

async fn reset_instrument(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    state
        .engine
        .deps()
        .dispatcher
        .instruments
        .reset(&id)
        .await?;
    Ok(StatusCode::NO_CONTENT)
}

#[derive(Debug, Deserialize)]
struct TestplanParams {
    #[serde(default)]
    project_id: Option<String>,
    #[serde(default)]
    test_plan_name: Option<String>,
    #[serde(default = "default_enabled_only")]
    enabled_only: bool,
}

fn default_enabled_only() -> bool {
    true
}

async fn station_testplan(
    State(state): State<AppState>,
    Path(station_id): Path<String>,
    Query(params): Query<TestplanParams>,
) -> Result<impl IntoResponse, ApiError> {
    let query = PlanQuery {
        station_id: station_id.clone(),
        project_id: params.project_id,
        test_plan_name: params.test_plan_name,
        enabled_only: params.enabled_only,
    };
    let points = state
        .engine
        .deps()
        .plans
        .load_plan(&query)
        .await?
        .ok_or(PdtError::StationNotFound(station_id))?;
    Ok(Json(points))
}

#[derive(Debug, Serialize)]
struct Healthz {
    status: &'static str,
    instruments: usize,
}

async fn healthz(State(state): State<AppState>) -> impl IntoResponse {
    let instruments = state.engine.deps().dispatcher.instruments.status().len();
    Json(Healthz {
        status: "ok",
        instruments,
    })
}
