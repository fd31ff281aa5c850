//! Chassis rotation handler.
//!
//! Drives the turntable fixture through the chassis driver (framed serial
//! protocol, see [`crate::instruments::chassis_link`]). The measured value is
//! the final angle in degrees, or "OK" for door actuation.

use super::{MeasurementHandler, PointContext};
use crate::error::{PdtError, PdtResult};
use crate::instruments::InstrumentLease;
use async_trait::async_trait;

/// Rotates the chassis fixture.
pub struct ChassisRotationHandler {
    lease: Option<InstrumentLease>,
    operation: String,
    args: serde_json::Value,
}

impl ChassisRotationHandler {
    /// New, nothing acquired yet.
    pub fn new() -> Self {
        Self {
            lease: None,
            operation: String::new(),
            args: serde_json::Value::Null,
        }
    }
}

impl Default for ChassisRotationHandler {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl MeasurementHandler for ChassisRotationHandler {
    async fn prepare(&mut self, ctx: &mut PointContext) -> PdtResult<()> {
        let operation = ctx.require("Operation")?.trim().to_ascii_lowercase();
        let mut args = serde_json::Map::new();
        match operation.as_str() {
            "rotate_left" | "rotate_right" => {
                let angle = ctx.require_f64("Angle")?;
                args.insert("angle".to_string(), serde_json::json!(angle));
            }
            "home" => {}
            "door" => {
                let open = ctx
                    .get("State")
                    .map(|s| s.eq_ignore_ascii_case("open"))
                    .unwrap_or(false);
                args.insert("open".to_string(), serde_json::json!(open));
            }
            other => {
                return Err(PdtError::InvalidParameter {
                    name: "Operation".to_string(),
                    reason: format!("unknown chassis operation '{other}'"),
                })
            }
        }
        args.insert(
            "timeout_ms".to_string(),
            serde_json::json!(ctx.timeout.as_millis() as u64),
        );
        self.operation = operation;
        self.args = serde_json::Value::Object(args);
        self.lease = Some(ctx.acquire_instrument().await?);
        Ok(())
    }

    async fn execute(&mut self, ctx: &mut PointContext) -> PdtResult<String> {
        ctx.check_cancel()?;
        let lease = self
            .lease
            .as_mut()
            .ok_or_else(|| PdtError::Instrument("chassis lease missing".to_string()))?;
        let result = lease.driver_mut()?.custom(&self.operation, &self.args).await;
        match result {
            Ok(value) => Ok(value),
            Err(e) => {
                let msg = format!("{}: {e}", lease.id());
                lease.mark_failed(&msg);
                Err(PdtError::Instrument(msg))
            }
        }
    }

    async fn cleanup(&mut self, _ctx: &mut PointContext) -> PdtResult<()> {
        self.lease.take();
        Ok(())
    }
}
