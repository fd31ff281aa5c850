//! Session-local handlers: GetSN, OPJudge, Wait, Other.
//!
//! None of these touch instruments. OPJudge talks to the operator through the
//! [`OperatorGate`] port; an NG verdict requests a session abort.

use super::{MeasurementHandler, PointContext};
use crate::error::{PdtError, PdtResult};
use crate::model::UPSTREAM_VALUE_KEY;
use async_trait::async_trait;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};

/// Operator's answer to an OPJudge prompt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OperatorVerdict {
    /// Operator confirmed
    Ok,
    /// Operator rejected; the session aborts
    Ng,
}

/// Side-channel to the station operator.
#[async_trait]
pub trait OperatorGate: Send + Sync {
    /// Present a prompt and await the verdict, bounded by `timeout`.
    async fn judge(&self, prompt: &str, timeout: Duration) -> PdtResult<OperatorVerdict>;
}

/// Headless stations: every prompt is confirmed immediately.
pub struct AutoPassGate;

#[async_trait]
impl OperatorGate for AutoPassGate {
    async fn judge(&self, _prompt: &str, _timeout: Duration) -> PdtResult<OperatorVerdict> {
        Ok(OperatorVerdict::Ok)
    }
}

/// One pending operator prompt.
pub struct OperatorPrompt {
    /// Prompt text from the plan
    pub prompt: String,
    /// Channel the verdict is delivered on
    pub reply: oneshot::Sender<OperatorVerdict>,
}

/// Channel-backed gate for interactive adapters and tests: prompts are
/// forwarded to a consumer which sends the verdict back.
pub struct ChannelOperatorGate {
    tx: mpsc::Sender<OperatorPrompt>,
}

impl ChannelOperatorGate {
    /// Create the gate and the prompt stream its consumer reads.
    pub fn new(capacity: usize) -> (Self, mpsc::Receiver<OperatorPrompt>) {
        let (tx, rx) = mpsc::channel(capacity);
        (Self { tx }, rx)
    }
}

#[async_trait]
impl OperatorGate for ChannelOperatorGate {
    async fn judge(&self, prompt: &str, timeout: Duration) -> PdtResult<OperatorVerdict> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send(OperatorPrompt {
                prompt: prompt.to_string(),
                reply: reply_tx,
            })
            .await
            .map_err(|_| PdtError::Operator("no operator console attached".to_string()))?;

        tokio::time::timeout(timeout, reply_rx)
            .await
            .map_err(|_| PdtError::Timeout(format!("operator prompt '{prompt}'")))?
            .map_err(|_| PdtError::Operator("operator console dropped the prompt".to_string()))
    }
}

/// Returns the session's serial number.
pub struct GetSnHandler;

#[async_trait]
impl MeasurementHandler for GetSnHandler {
    async fn prepare(&mut self, _ctx: &mut PointContext) -> PdtResult<()> {
        Ok(())
    }

    async fn execute(&mut self, ctx: &mut PointContext) -> PdtResult<String> {
        Ok(ctx.serial_number.clone())
    }

    async fn cleanup(&mut self, _ctx: &mut PointContext) -> PdtResult<()> {
        Ok(())
    }
}

/// Presents a prompt to the operator; NG aborts the session.
pub struct OpJudgeHandler;

#[async_trait]
impl MeasurementHandler for OpJudgeHandler {
    async fn prepare(&mut self, ctx: &mut PointContext) -> PdtResult<()> {
        ctx.require("Prompt")?;
        Ok(())
    }

    async fn execute(&mut self, ctx: &mut PointContext) -> PdtResult<String> {
        let prompt = ctx.require("Prompt")?.to_string();
        let verdict = ctx.operator.judge(&prompt, ctx.timeout).await?;
        match verdict {
            OperatorVerdict::Ok => Ok("OK".to_string()),
            OperatorVerdict::Ng => {
                ctx.abort_requested = true;
                Ok("NG".to_string())
            }
        }
    }

    async fn cleanup(&mut self, _ctx: &mut PointContext) -> PdtResult<()> {
        Ok(())
    }
}

/// Sleeps for `WaitmSec`; an abort request interrupts the sleep.
pub struct WaitHandler;

#[async_trait]
impl MeasurementHandler for WaitHandler {
    async fn prepare(&mut self, ctx: &mut PointContext) -> PdtResult<()> {
        if ctx.wait_msec.is_none() && ctx.get("WaitmSec").is_none() {
            return Err(PdtError::MissingParameter("WaitmSec".to_string()));
        }
        Ok(())
    }

    async fn execute(&mut self, ctx: &mut PointContext) -> PdtResult<String> {
        let ms = match ctx.wait_msec {
            Some(ms) => ms,
            None => ctx.require_u64("WaitmSec")?,
        };
        let mut cancel = ctx.cancel.clone();
        tokio::select! {
            () = tokio::time::sleep(Duration::from_millis(ms)) => Ok("OK".to_string()),
            () = cancel.cancelled() => Err(PdtError::Cancelled),
        }
    }

    async fn cleanup(&mut self, _ctx: &mut PointContext) -> PdtResult<()> {
        Ok(())
    }
}

/// Escape hatch: echoes its command, or the upstream value, or "OK".
pub struct OtherHandler;

#[async_trait]
impl MeasurementHandler for OtherHandler {
    async fn prepare(&mut self, _ctx: &mut PointContext) -> PdtResult<()> {
        Ok(())
    }

    async fn execute(&mut self, ctx: &mut PointContext) -> PdtResult<String> {
        if let Some(command) = ctx.get("Command").map(str::to_string) {
            return Ok(command);
        }
        if let Some(command) = ctx.command.clone() {
            return Ok(command);
        }
        if let Some(upstream) = ctx.get(UPSTREAM_VALUE_KEY).map(str::to_string) {
            return Ok(upstream);
        }
        Ok("OK".to_string())
    }

    async fn cleanup(&mut self, _ctx: &mut PointContext) -> PdtResult<()> {
        Ok(())
    }
}
