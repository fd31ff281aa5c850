//! Endpoint command/response handlers: ComPort, ConSole, TCPIP.
//!
//! These points address an endpoint directly from the plan row (port, host,
//! baud) and open a short-lived transport for the exchange. The reply text,
//! trimmed, is the measured value.

use super::{MeasurementHandler, PointContext};
use crate::error::{PdtError, PdtResult};
use crate::instruments::transport::CommandTransport;
use async_trait::async_trait;

async fn close_quietly(transport: &mut Option<Box<dyn CommandTransport>>) {
    if let Some(mut t) = transport.take() {
        if let Err(e) = t.close().await {
            tracing::debug!(error = %e, "transport close failed");
        }
    }
}

fn command_of(ctx: &PointContext) -> PdtResult<String> {
    if let Some(command) = ctx.get("Command") {
        return Ok(command.to_string());
    }
    if let Some(command) = &ctx.command {
        if !command.is_empty() {
            return Ok(command.clone());
        }
    }
    Err(PdtError::MissingParameter("Command".to_string()))
}

/// Serial command/response.
pub struct ComPortHandler {
    transport: Option<Box<dyn CommandTransport>>,
    command: String,
}

impl ComPortHandler {
    /// New, port not yet opened.
    pub fn new() -> Self {
        Self {
            transport: None,
            command: String::new(),
        }
    }
}

impl Default for ComPortHandler {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl MeasurementHandler for ComPortHandler {
    async fn prepare(&mut self, ctx: &mut PointContext) -> PdtResult<()> {
        let port = ctx.require("Port")?.to_string();
        let baud = ctx.require_u64("Baud")? as u32;
        self.command = command_of(ctx)?;
        self.transport = Some(ctx.transports.open_serial(&port, baud).await?);
        Ok(())
    }

    async fn execute(&mut self, ctx: &mut PointContext) -> PdtResult<String> {
        ctx.check_cancel()?;
        let transport = self
            .transport
            .as_mut()
            .ok_or_else(|| PdtError::Transport("serial port not open".to_string()))?;
        let reply = transport.send_command(&self.command, ctx.timeout).await?;
        Ok(reply.trim().to_string())
    }

    async fn cleanup(&mut self, _ctx: &mut PointContext) -> PdtResult<()> {
        close_quietly(&mut self.transport).await;
        Ok(())
    }
}

/// Console (SSH/telnet class) command/response.
pub struct ConsoleHandler {
    transport: Option<Box<dyn CommandTransport>>,
    command: String,
}

impl ConsoleHandler {
    /// New, session not yet opened.
    pub fn new() -> Self {
        Self {
            transport: None,
            command: String::new(),
        }
    }
}

impl Default for ConsoleHandler {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl MeasurementHandler for ConsoleHandler {
    async fn prepare(&mut self, ctx: &mut PointContext) -> PdtResult<()> {
        let host = ctx.require("Host")?.to_string();
        self.command = command_of(ctx)?;
        self.transport = Some(ctx.transports.open_console(&host).await?);
        Ok(())
    }

    async fn execute(&mut self, ctx: &mut PointContext) -> PdtResult<String> {
        ctx.check_cancel()?;
        let transport = self
            .transport
            .as_mut()
            .ok_or_else(|| PdtError::Transport("console not open".to_string()))?;
        let output = transport.send_command(&self.command, ctx.timeout).await?;
        Ok(output)
    }

    async fn cleanup(&mut self, _ctx: &mut PointContext) -> PdtResult<()> {
        close_quietly(&mut self.transport).await;
        Ok(())
    }
}

/// TCP line command/response.
pub struct TcpIpHandler {
    transport: Option<Box<dyn CommandTransport>>,
    command: String,
}

impl TcpIpHandler {
    /// New, socket not yet opened.
    pub fn new() -> Self {
        Self {
            transport: None,
            command: String::new(),
        }
    }
}

impl Default for TcpIpHandler {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl MeasurementHandler for TcpIpHandler {
    async fn prepare(&mut self, ctx: &mut PointContext) -> PdtResult<()> {
        let host = ctx.require("Host")?.to_string();
        let port = ctx.require_u64("Port")?;
        let port = u16::try_from(port).map_err(|_| PdtError::InvalidParameter {
            name: "Port".to_string(),
            reason: format!("'{port}' is out of range"),
        })?;
        self.command = command_of(ctx)?;
        self.transport = Some(ctx.transports.open_tcp(&host, port).await?);
        Ok(())
    }

    async fn execute(&mut self, ctx: &mut PointContext) -> PdtResult<String> {
        ctx.check_cancel()?;
        let transport = self
            .transport
            .as_mut()
            .ok_or_else(|| PdtError::Transport("socket not open".to_string()))?;
        let reply = transport.send_command(&self.command, ctx.timeout).await?;
        Ok(reply)
    }

    async fn cleanup(&mut self, _ctx: &mut PointContext) -> PdtResult<()> {
        close_quietly(&mut self.transport).await;
        Ok(())
    }
}
