//! L6MPU handler.
//!
//! Issues commands to the fixture MPU over its console, serial, or hybrid
//! link. `Mode` selects the transport; hybrid tries the console first and
//! falls back to serial when the console is unreachable.

use super::{MeasurementHandler, PointContext};
use crate::error::{PdtError, PdtResult};
use crate::instruments::transport::CommandTransport;
use async_trait::async_trait;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LinkMode {
    Ssh,
    Serial,
    Hybrid,
}

impl LinkMode {
    fn parse(raw: Option<&str>) -> PdtResult<Self> {
        match raw.map(|s| s.trim().to_ascii_lowercase()).as_deref() {
            None | Some("ssh") | Some("console") => Ok(LinkMode::Ssh),
            Some("serial") => Ok(LinkMode::Serial),
            Some("hybrid") => Ok(LinkMode::Hybrid),
            Some(other) => Err(PdtError::InvalidParameter {
                name: "Mode".to_string(),
                reason: format!("unknown link mode '{other}'"),
            }),
        }
    }
}

/// Command exchange with the L6MPU.
pub struct L6MpuHandler {
    transport: Option<Box<dyn CommandTransport>>,
    command: String,
}

impl L6MpuHandler {
    /// New, link not yet opened.
    pub fn new() -> Self {
        Self {
            transport: None,
            command: String::new(),
        }
    }

    async fn open_serial(ctx: &PointContext) -> PdtResult<Box<dyn CommandTransport>> {
        let port = ctx.require("Port")?;
        let baud = ctx
            .get("Baud")
            .map(|raw| {
                raw.trim()
                    .parse::<u32>()
                    .map_err(|_| PdtError::InvalidParameter {
                        name: "Baud".to_string(),
                        reason: format!("'{raw}' is not a baud rate"),
                    })
            })
            .transpose()?
            .unwrap_or(115_200);
        ctx.transports.open_serial(port, baud).await
    }
}

impl Default for L6MpuHandler {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl MeasurementHandler for L6MpuHandler {
    async fn prepare(&mut self, ctx: &mut PointContext) -> PdtResult<()> {
        self.command = match ctx.get("Command") {
            Some(command) => command.to_string(),
            None => ctx
                .command
                .clone()
                .filter(|c| !c.is_empty())
                .ok_or_else(|| PdtError::MissingParameter("Command".to_string()))?,
        };

        let mode = LinkMode::parse(ctx.get("Mode"))?;
        self.transport = Some(match mode {
            LinkMode::Ssh => {
                let host = ctx.require("Host")?;
                ctx.transports.open_console(host).await?
            }
            LinkMode::Serial => Self::open_serial(ctx).await?,
            LinkMode::Hybrid => {
                let host = ctx.require("Host")?;
                match ctx.transports.open_console(host).await {
                    Ok(transport) => transport,
                    Err(console_err) => {
                        tracing::debug!(error = %console_err, "console unreachable, trying serial");
                        Self::open_serial(ctx).await?
                    }
                }
            }
        });
        Ok(())
    }

    async fn execute(&mut self, ctx: &mut PointContext) -> PdtResult<String> {
        ctx.check_cancel()?;
        let transport = self
            .transport
            .as_mut()
            .ok_or_else(|| PdtError::Transport("L6MPU link not open".to_string()))?;
        let response = transport.send_command(&self.command, ctx.timeout).await?;
        Ok(response)
    }

    async fn cleanup(&mut self, _ctx: &mut PointContext) -> PdtResult<()> {
        if let Some(mut transport) = self.transport.take() {
            if let Err(e) = transport.close().await {
                tracing::debug!(error = %e, "L6MPU link close failed");
            }
        }
        Ok(())
    }
}
