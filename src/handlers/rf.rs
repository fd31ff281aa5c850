//! RF measurement handler.
//!
//! Queries an RF instrument at a frequency/bandwidth/detector tuple; the
//! reading (typically a level in dBm) is the measured value.

use super::{MeasurementHandler, PointContext};
use crate::error::{PdtError, PdtResult};
use crate::instruments::InstrumentLease;
use async_trait::async_trait;

/// One RF reading.
pub struct RfMeasurementsHandler {
    lease: Option<InstrumentLease>,
    args: serde_json::Value,
}

impl RfMeasurementsHandler {
    /// New, nothing acquired yet.
    pub fn new() -> Self {
        Self {
            lease: None,
            args: serde_json::Value::Null,
        }
    }
}

impl Default for RfMeasurementsHandler {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl MeasurementHandler for RfMeasurementsHandler {
    async fn prepare(&mut self, ctx: &mut PointContext) -> PdtResult<()> {
        let frequency = ctx.require("Frequency")?.to_string();
        let bandwidth = ctx.get("Bandwidth").unwrap_or("auto").to_string();
        let detector = ctx.get("Type").unwrap_or("power").to_string();
        self.args = serde_json::json!({
            "frequency": frequency,
            "bandwidth": bandwidth,
            "type": detector,
        });
        self.lease = Some(ctx.acquire_instrument().await?);
        Ok(())
    }

    async fn execute(&mut self, ctx: &mut PointContext) -> PdtResult<String> {
        ctx.check_cancel()?;
        let lease = self
            .lease
            .as_mut()
            .ok_or_else(|| PdtError::Instrument("rf lease missing".to_string()))?;
        let result = lease.driver_mut()?.custom("rf_measure", &self.args).await;
        match result {
            Ok(value) => Ok(value.trim().to_string()),
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
