//! Relay handler: toggles a relay through the DUT communications driver.

use super::{MeasurementHandler, PointContext};
use crate::error::{PdtError, PdtResult};
use crate::instruments::InstrumentLease;
use async_trait::async_trait;

fn parse_state(raw: &str) -> PdtResult<bool> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "on" | "1" | "close" | "closed" | "true" => Ok(true),
        "off" | "0" | "open" | "false" => Ok(false),
        other => Err(PdtError::InvalidParameter {
            name: "State".to_string(),
            reason: format!("unknown relay state '{other}'"),
        }),
    }
}

/// Toggles one relay and reports "OK".
pub struct RelayHandler {
    lease: Option<InstrumentLease>,
    relay_id: String,
    on: bool,
}

impl RelayHandler {
    /// New, nothing acquired yet.
    pub fn new() -> Self {
        Self {
            lease: None,
            relay_id: String::new(),
            on: false,
        }
    }
}

impl Default for RelayHandler {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl MeasurementHandler for RelayHandler {
    async fn prepare(&mut self, ctx: &mut PointContext) -> PdtResult<()> {
        self.relay_id = ctx.require("RelayId")?.to_string();
        self.on = parse_state(ctx.require("State")?)?;
        self.lease = Some(ctx.acquire_instrument().await?);
        Ok(())
    }

    async fn execute(&mut self, ctx: &mut PointContext) -> PdtResult<String> {
        ctx.check_cancel()?;
        let lease = self
            .lease
            .as_mut()
            .ok_or_else(|| PdtError::Instrument("relay lease missing".to_string()))?;
        let result = lease.driver_mut()?.set_relay(&self.relay_id, self.on).await;
        match result {
            Ok(()) => Ok("OK".to_string()),
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

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn relay_states_parse_legacy_spellings() {
        assert!(parse_state("ON").unwrap());
        assert!(parse_state("1").unwrap());
        assert!(parse_state("closed").unwrap());
        assert!(!parse_state("off").unwrap());
        assert!(!parse_state("0").unwrap());
        assert!(parse_state("half").is_err());
    }
}
