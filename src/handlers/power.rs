//! Power supply and DMM/DAQ handlers.
//!
//! `PowerSet` programs a supply channel; `PowerRead` queries a measurement
//! channel. Both lease their instrument in prepare and release it in cleanup;
//! a driver I/O failure marks the instrument for reset before the next lease.

use super::{MeasurementHandler, PointContext};
use crate::error::{PdtError, PdtResult};
use crate::instruments::{InstrumentLease, MeasureKind};
use async_trait::async_trait;

fn driver_error(lease: &mut InstrumentLease, e: &anyhow::Error) -> PdtError {
    let msg = format!("{}: {e}", lease.id());
    lease.mark_failed(&msg);
    PdtError::Instrument(msg)
}

/// Drives a programmable supply selected by `switch_mode`.
pub struct PowerSetHandler {
    lease: Option<InstrumentLease>,
    volts: f64,
    amps: f64,
    channel: String,
}

impl PowerSetHandler {
    /// New, nothing acquired yet.
    pub fn new() -> Self {
        Self {
            lease: None,
            volts: 0.0,
            amps: 0.0,
            channel: String::new(),
        }
    }
}

impl Default for PowerSetHandler {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl MeasurementHandler for PowerSetHandler {
    async fn prepare(&mut self, ctx: &mut PointContext) -> PdtResult<()> {
        self.volts = ctx.require_f64("SetVolt")?;
        self.amps = ctx.require_f64("SetCurr")?;
        self.channel = ctx.get("Channel").unwrap_or("1").to_string();
        self.lease = Some(ctx.acquire_instrument().await?);
        Ok(())
    }

    async fn execute(&mut self, ctx: &mut PointContext) -> PdtResult<String> {
        ctx.check_cancel()?;
        let lease = self
            .lease
            .as_mut()
            .ok_or_else(|| PdtError::Instrument("supply lease missing".to_string()))?;
        let result = lease
            .driver_mut()?
            .set_output(&self.channel, self.volts, self.amps)
            .await;
        match result {
            Ok(()) => Ok(format!("{},{}", self.volts, self.amps)),
            Err(e) => Err(driver_error(lease, &e)),
        }
    }

    async fn cleanup(&mut self, _ctx: &mut PointContext) -> PdtResult<()> {
        self.lease.take();
        Ok(())
    }
}

/// Queries a DMM/DAQ channel selected by `switch_mode`.
pub struct PowerReadHandler {
    lease: Option<InstrumentLease>,
    kind: Option<MeasureKind>,
    channel: String,
    mode: String,
}

impl PowerReadHandler {
    /// New, nothing acquired yet.
    pub fn new() -> Self {
        Self {
            lease: None,
            kind: None,
            channel: String::new(),
            mode: String::new(),
        }
    }
}

impl Default for PowerReadHandler {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl MeasurementHandler for PowerReadHandler {
    async fn prepare(&mut self, ctx: &mut PointContext) -> PdtResult<()> {
        let item = ctx.require("Item")?;
        self.kind = Some(MeasureKind::parse(item).ok_or_else(|| PdtError::InvalidParameter {
            name: "Item".to_string(),
            reason: format!("unknown measurement item '{item}'"),
        })?);
        self.channel = ctx.require("Channel")?.to_string();
        self.mode = ctx.require("Type")?.to_string();
        self.lease = Some(ctx.acquire_instrument().await?);
        Ok(())
    }

    async fn execute(&mut self, ctx: &mut PointContext) -> PdtResult<String> {
        ctx.check_cancel()?;
        let kind = self
            .kind
            .ok_or_else(|| PdtError::MissingParameter("Item".to_string()))?;
        let lease = self
            .lease
            .as_mut()
            .ok_or_else(|| PdtError::Instrument("measurement lease missing".to_string()))?;
        let result = lease
            .driver_mut()?
            .read_measurement(kind, &self.channel, &self.mode)
            .await;
        match result {
            Ok(value) => Ok(value.trim().to_string()),
            Err(e) => Err(driver_error(lease, &e)),
        }
    }

    async fn cleanup(&mut self, _ctx: &mut PointContext) -> PdtResult<()> {
        self.lease.take();
        Ok(())
    }
}
