//! Measurement dispatcher: drives one point to a [`PointOutcome`].
//!
//! The dispatcher never propagates errors; every internal fault becomes an
//! ERROR outcome with a descriptive message. The pipeline:
//!
//! 1. resolve the execute-name through the alias table;
//! 2. apply `use_result` substitution to the parameters;
//! 3. `prepare` → `execute` → `cleanup`, with cleanup running whenever
//!    prepare was invoked, regardless of what failed in between;
//! 4. map sentinel error strings from the hardware layers to ERROR;
//! 5. judge real measured values through the validation kernel.
//!
//! Value-out-of-limit is decided only by the kernel; instrument-absent,
//! connection and protocol faults are always ERROR, never FAIL.

use crate::cancel::CancelToken;
use crate::error::PdtError;
use crate::handlers::{
    resolve_parameters, HandlerRegistry, OperatorGate, PointContext, SfcClient,
};
use crate::instruments::transport::TransportFactory;
use crate::instruments::InstrumentManager;
use crate::model::{ExecuteName, PointResult, SessionId, TestPoint};
use crate::storage::ResultRepository;
use crate::validation;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, warn};

/// Sentinel prefixes emitted by hardware layers that must map to ERROR
/// regardless of limits.
const SENTINEL_NO_INSTRUMENT: &str = "No instrument found";
const SENTINEL_ERROR_PREFIX: &str = "Error:";

/// Outcome of one dispatched point.
#[derive(Debug, Clone)]
pub struct PointOutcome {
    /// PASS/FAIL/ERROR (SKIP is decided by the executor, never here)
    pub result: PointResult,
    /// Measured value, verbatim; empty when none was produced
    pub measured: String,
    /// Failure/fault description; empty on PASS
    pub error: String,
    /// Wall time spent in the pipeline
    pub duration_ms: u64,
    /// The session must abort after persisting this outcome
    pub abort: bool,
}

impl PointOutcome {
    fn error_outcome(error: String, duration_ms: u64, abort: bool) -> Self {
        Self {
            result: PointResult::Error,
            measured: String::new(),
            error,
            duration_ms,
            abort,
        }
    }
}

/// Shared collaborators of the dispatcher, cloned into each session task.
#[derive(Clone)]
pub struct DispatcherDeps {
    /// Handler catalogue
    pub handlers: Arc<HandlerRegistry>,
    /// Instrument broker
    pub instruments: Arc<InstrumentManager>,
    /// Endpoint transport opener
    pub transports: Arc<dyn TransportFactory>,
    /// Operator gate
    pub operator: Arc<dyn OperatorGate>,
    /// MES client
    pub sfc: Arc<dyn SfcClient>,
    /// Repository (SFC exchange logging)
    pub repository: Arc<dyn ResultRepository>,
    /// Default handler I/O timeout (ms)
    pub default_timeout_ms: u64,
    /// Hard cap on per-point timeouts (ms)
    pub max_timeout_ms: u64,
}

/// Drive one point through prepare/execute/cleanup and the validation kernel.
pub async fn run_point(
    deps: &DispatcherDeps,
    session_id: SessionId,
    serial_number: &str,
    point: &TestPoint,
    result_map: &HashMap<String, String>,
    cancel: CancelToken,
) -> PointOutcome {
    let started = Instant::now();

    let Some(execute_name) = ExecuteName::parse(&point.execute_name) else {
        return PointOutcome::error_outcome(
            PdtError::UnknownExecuteName(point.execute_name.clone()).to_string(),
            elapsed_ms(started),
            false,
        );
    };
    let Some(mut handler) = deps.handlers.create(execute_name) else {
        return PointOutcome::error_outcome(
            PdtError::UnknownExecuteName(point.execute_name.clone()).to_string(),
            elapsed_ms(started),
            false,
        );
    };

    let (params, upstream) = resolve_parameters(point, result_map);
    let mut ctx = PointContext {
        session_id,
        serial_number: serial_number.to_string(),
        item_name: point.item_name.clone(),
        params,
        command: point.command.clone(),
        switch_mode: point.switch_mode.clone(),
        timeout: point.effective_timeout(deps.default_timeout_ms, deps.max_timeout_ms),
        wait_msec: point.wait_msec,
        upstream,
        cancel,
        instruments: deps.instruments.clone(),
        transports: deps.transports.clone(),
        operator: deps.operator.clone(),
        sfc: deps.sfc.clone(),
        repository: deps.repository.clone(),
        abort_requested: false,
    };

    // Prepare. Cleanup is owed from this point on, even when prepare fails.
    let prepared = handler.prepare(&mut ctx).await;
    let executed = match &prepared {
        Ok(()) => {
            if ctx.cancel.is_cancelled() {
                Err(PdtError::Cancelled)
            } else {
                handler.execute(&mut ctx).await
            }
        }
        Err(_) => Err(PdtError::Session("prepare failed".to_string())),
    };

    let cleanup_result = handler.cleanup(&mut ctx).await;

    let cancelled_after = ctx.cancel.is_cancelled();
    let abort = ctx.abort_requested || cancelled_after;
    let duration_ms = elapsed_ms(started);

    if let Err(prepare_err) = prepared {
        return PointOutcome::error_outcome(prepare_err.to_string(), duration_ms, abort);
    }

    match executed {
        Err(PdtError::Cancelled) => {
            PointOutcome::error_outcome(PdtError::Cancelled.to_string(), duration_ms, true)
        }
        Err(e) => {
            let mut error = e.to_string();
            if let Err(cleanup_err) = cleanup_result {
                // A failing cleanup may refine an already-failing outcome.
                error = format!("{error}; cleanup: {cleanup_err}");
            }
            PointOutcome::error_outcome(error, duration_ms, abort)
        }
        Ok(measured) => {
            if let Err(cleanup_err) = cleanup_result {
                // Never overwrites a successful execute.
                warn!(item = %point.item_name, error = %cleanup_err, "cleanup failed");
            }

            if measured.is_empty() {
                return PointOutcome::error_outcome(
                    "no measured value".to_string(),
                    duration_ms,
                    abort,
                );
            }
            if measured.starts_with(SENTINEL_NO_INSTRUMENT)
                || measured.starts_with(SENTINEL_ERROR_PREFIX)
            {
                return PointOutcome::error_outcome(measured, duration_ms, abort);
            }

            let verdict = validation::check_point(point, &measured);
            debug!(item = %point.item_name, measured = %measured, pass = verdict.is_pass(), "point judged");
            PointOutcome {
                result: if verdict.is_pass() {
                    PointResult::Pass
                } else {
                    PointResult::Fail
                },
                measured,
                error: verdict.reason().to_string(),
                duration_ms,
                abort,
            }
        }
    }
}

fn elapsed_ms(started: Instant) -> u64 {
    u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX)
}
