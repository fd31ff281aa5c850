//! Measurement handlers.
//!
//! A handler implements one kind of measurement as the three-phase capability
//! set `prepare` / `execute` / `cleanup`:
//!
//! - **prepare** parses parameters and acquires instrument leases. A missing
//!   required parameter is a plan error and becomes a per-point ERROR.
//! - **execute** performs the measurement and returns the measured value as a
//!   string. Out-of-limit is never decided here; that is the validation
//!   kernel's job.
//! - **cleanup** releases leases and closes transports. The dispatcher calls
//!   it on every exit path, panics included, whenever prepare was called.
//!
//! Handlers register in the [`HandlerRegistry`] keyed by normalised
//! execute-name; the dispatcher is a lookup plus the three-phase drive.
//! Cross-cutting concerns (timeouts, cancellation, sentinel mapping) are
//! wrapped around the trait by the dispatcher, not duplicated per handler.

pub mod basic;
pub mod chassis;
pub mod comm;
pub mod l6mpu;
pub mod power;
pub mod relay;
pub mod rf;
pub mod sfc;

pub use basic::{AutoPassGate, ChannelOperatorGate, OperatorGate, OperatorVerdict};
pub use sfc::{MockSfcClient, SfcClient};

use crate::cancel::CancelToken;
use crate::error::{PdtError, PdtResult};
use crate::instruments::{InstrumentLease, InstrumentManager};
use crate::instruments::transport::TransportFactory;
use crate::model::{ExecuteName, SessionId, TestPoint, UPSTREAM_VALUE_KEY};
use crate::storage::ResultRepository;
use async_trait::async_trait;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;

/// Everything a handler may need while driving one point.
pub struct PointContext {
    /// Owning session
    pub session_id: SessionId,
    /// Product serial number under test
    pub serial_number: String,
    /// Plan item name (for lease ownership labels and logs)
    pub item_name: String,
    /// Resolved parameters, `use_result` substitution already applied
    pub params: BTreeMap<String, String>,
    /// Hoisted `Command` parameter
    pub command: Option<String>,
    /// Driver/sub-mode selector
    pub switch_mode: Option<String>,
    /// Effective I/O timeout for this point
    pub timeout: Duration,
    /// Hoisted `WaitmSec` parameter
    pub wait_msec: Option<u64>,
    /// Upstream measured value, when the point declares `use_result`
    pub upstream: Option<String>,
    /// Session cancel signal
    pub cancel: CancelToken,
    /// Shared instrument broker
    pub instruments: Arc<InstrumentManager>,
    /// Endpoint transport opener
    pub transports: Arc<dyn TransportFactory>,
    /// Operator gate for OPJudge points
    pub operator: Arc<dyn OperatorGate>,
    /// SFC service client
    pub sfc: Arc<dyn SfcClient>,
    /// Repository, for SFC exchange logging
    pub repository: Arc<dyn ResultRepository>,
    /// Set by OPJudge on an NG verdict; the executor aborts the session
    pub abort_requested: bool,
}

impl PointContext {
    /// Required parameter lookup; absence is a plan error.
    pub fn require(&self, key: &str) -> PdtResult<&str> {
        self.params
            .get(key)
            .map(String::as_str)
            .filter(|s| !s.is_empty())
            .ok_or_else(|| PdtError::MissingParameter(key.to_string()))
    }

    /// Optional parameter lookup.
    pub fn get(&self, key: &str) -> Option<&str> {
        self.params.get(key).map(String::as_str).filter(|s| !s.is_empty())
    }

    /// Required parameter parsed as `f64`.
    pub fn require_f64(&self, key: &str) -> PdtResult<f64> {
        let raw = self.require(key)?;
        raw.trim().parse().map_err(|_| PdtError::InvalidParameter {
            name: key.to_string(),
            reason: format!("'{raw}' is not a number"),
        })
    }

    /// Required parameter parsed as `u64`.
    pub fn require_u64(&self, key: &str) -> PdtResult<u64> {
        let raw = self.require(key)?;
        raw.trim().parse().map_err(|_| PdtError::InvalidParameter {
            name: key.to_string(),
            reason: format!("'{raw}' is not a non-negative integer"),
        })
    }

    /// Instrument id for leasing: an explicit `Instrument` parameter wins,
    /// otherwise the first unit of the `switch_mode` driver (`<mode>_1`).
    pub fn instrument_id(&self) -> PdtResult<String> {
        if let Some(explicit) = self.get("Instrument") {
            return Ok(explicit.to_string());
        }
        match &self.switch_mode {
            Some(mode) if !mode.is_empty() => Ok(format!("{mode}_1")),
            _ => Err(PdtError::MissingParameter("Instrument".to_string())),
        }
    }

    /// Lease ownership label: `session/item`.
    pub fn owner(&self) -> String {
        format!("{}/{}", self.session_id, self.item_name)
    }

    /// Acquire the point's instrument.
    pub async fn acquire_instrument(&self) -> PdtResult<InstrumentLease> {
        let id = self.instrument_id()?;
        self.instruments.acquire(&id, &self.owner()).await
    }

    /// Fail fast when the session was cancelled.
    pub fn check_cancel(&self) -> PdtResult<()> {
        if self.cancel.is_cancelled() {
            Err(PdtError::Cancelled)
        } else {
            Ok(())
        }
    }
}

/// Three-phase measurement capability set.
#[async_trait]
pub trait MeasurementHandler: Send {
    /// Parse parameters and acquire resources.
    async fn prepare(&mut self, ctx: &mut PointContext) -> PdtResult<()>;

    /// Perform the measurement; returns the measured value.
    async fn execute(&mut self, ctx: &mut PointContext) -> PdtResult<String>;

    /// Release resources. Runs on every exit path once prepare was called.
    async fn cleanup(&mut self, ctx: &mut PointContext) -> PdtResult<()>;
}

/// Constructor closure for one handler kind.
pub type HandlerFactory = Box<dyn Fn() -> Box<dyn MeasurementHandler> + Send + Sync>;

/// Registry mapping execute-names to handler constructors.
///
/// Populated with the built-in catalogue at process init; adapters and tests
/// may override entries (the last registration wins).
pub struct HandlerRegistry {
    factories: HashMap<ExecuteName, HandlerFactory>,
}

impl HandlerRegistry {
    /// Empty registry.
    pub fn new() -> Self {
        Self {
            factories: HashMap::new(),
        }
    }

    /// Registry with the built-in handler catalogue.
    pub fn with_defaults() -> Self {
        let mut registry = Self::new();
        registry.register(ExecuteName::PowerSet, || Box::new(power::PowerSetHandler::new()));
        registry.register(ExecuteName::PowerRead, || {
            Box::new(power::PowerReadHandler::new())
        });
        registry.register(ExecuteName::ComPort, || Box::new(comm::ComPortHandler::new()));
        registry.register(ExecuteName::Console, || Box::new(comm::ConsoleHandler::new()));
        registry.register(ExecuteName::Tcpip, || Box::new(comm::TcpIpHandler::new()));
        registry.register(ExecuteName::Sfc, || Box::new(sfc::SfcHandler::new()));
        registry.register(ExecuteName::GetSn, || Box::new(basic::GetSnHandler));
        registry.register(ExecuteName::OpJudge, || Box::new(basic::OpJudgeHandler));
        registry.register(ExecuteName::Wait, || Box::new(basic::WaitHandler));
        registry.register(ExecuteName::Relay, || Box::new(relay::RelayHandler::new()));
        registry.register(ExecuteName::ChassisRotation, || {
            Box::new(chassis::ChassisRotationHandler::new())
        });
        registry.register(ExecuteName::RfMeasurements, || {
            Box::new(rf::RfMeasurementsHandler::new())
        });
        registry.register(ExecuteName::L6Mpu, || Box::new(l6mpu::L6MpuHandler::new()));
        registry.register(ExecuteName::Other, || Box::new(basic::OtherHandler));
        registry
    }

    /// Register (or override) a handler constructor.
    pub fn register<F>(&mut self, name: ExecuteName, factory: F)
    where
        F: Fn() -> Box<dyn MeasurementHandler> + Send + Sync + 'static,
    {
        self.factories.insert(name, Box::new(factory));
    }

    /// Construct a handler for an execute-name.
    pub fn create(&self, name: ExecuteName) -> Option<Box<dyn MeasurementHandler>> {
        self.factories.get(&name).map(|factory| factory())
    }
}

impl Default for HandlerRegistry {
    fn default() -> Self {
        Self::with_defaults()
    }
}

/// Resolve a point's effective parameters for execution.
///
/// Substitution runs in two steps, matching the legacy engine:
/// 1. every parameter whose value exactly matches an earlier point's
///    `item_name` is replaced by that point's measured value;
/// 2. when the point declares `use_result`, the referenced value is bound
///    under [`UPSTREAM_VALUE_KEY`] for handlers that consume it explicitly.
pub fn resolve_parameters(
    point: &TestPoint,
    result_map: &HashMap<String, String>,
) -> (BTreeMap<String, String>, Option<String>) {
    let mut params = point.parameters.clone();
    for value in params.values_mut() {
        if let Some(stored) = result_map.get(value.as_str()) {
            *value = stored.clone();
        }
    }

    let upstream = point
        .use_result
        .as_ref()
        .and_then(|name| result_map.get(name))
        .cloned();
    if let Some(upstream_value) = &upstream {
        params.insert(UPSTREAM_VALUE_KEY.to_string(), upstream_value.clone());
    }

    (params, upstream)
}
