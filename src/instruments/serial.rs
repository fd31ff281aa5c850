//! Serial transports (feature `instrument_serial`).
//!
//! Real serial links for the ComPort handler and the chassis fixture. Both
//! are half-duplex request/response: write the request, read the reply with a
//! bounded timeout.

use crate::error::{PdtError, PdtResult};
use crate::instruments::chassis_link::{
    decode_frame, driver_with_transport, encode_frame, ChassisFrame, ChassisTransport,
};
use crate::instruments::driver::{Driver, DriverRegistry};
use crate::instruments::transport::CommandTransport;
use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio_serial::{SerialPortBuilderExt, SerialStream};

/// Line-oriented serial transport for ComPort points.
pub struct SerialLineTransport {
    port: SerialStream,
}

impl SerialLineTransport {
    /// Open a port at 8N1 with the given baud rate.
    pub fn open(path: &str, baud: u32) -> PdtResult<Self> {
        let port = tokio_serial::new(path, baud)
            .open_native_async()
            .map_err(|e| PdtError::Transport(format!("open serial {path}: {e}")))?;
        Ok(Self { port })
    }
}

#[async_trait]
impl CommandTransport for SerialLineTransport {
    async fn send_command(&mut self, command: &str, timeout: Duration) -> PdtResult<String> {
        let line = format!("{command}\r\n");
        tokio::time::timeout(timeout, self.port.write_all(line.as_bytes()))
            .await
            .map_err(|_| PdtError::Timeout(format!("serial write '{command}'")))?
            .map_err(|e| PdtError::Transport(format!("serial write failed: {e}")))?;

        let mut buf = [0u8; 1024];
        let n = tokio::time::timeout(timeout, self.port.read(&mut buf))
            .await
            .map_err(|_| PdtError::Timeout(format!("serial read reply to '{command}'")))?
            .map_err(|e| PdtError::Transport(format!("serial read failed: {e}")))?;
        Ok(String::from_utf8_lossy(&buf[..n]).trim().to_string())
    }
}

/// Framed serial transport for the chassis fixture (9600 8N1).
pub struct SerialChassisTransport {
    port: SerialStream,
}

impl SerialChassisTransport {
    /// Open the fixture link.
    pub fn open(path: &str) -> Result<Self> {
        let port = tokio_serial::new(path, 9600)
            .open_native_async()
            .with_context(|| format!("open chassis serial {path}"))?;
        Ok(Self { port })
    }
}

#[async_trait]
impl ChassisTransport for SerialChassisTransport {
    async fn transact(&mut self, request: &ChassisFrame, timeout: Duration) -> Result<ChassisFrame> {
        let wire = encode_frame(request);
        tokio::time::timeout(timeout, self.port.write_all(&wire))
            .await
            .map_err(|_| anyhow!("chassis write timed out"))?
            .context("chassis write")?;

        // Responses are short; a single read normally carries a whole frame.
        let mut buf = vec![0u8; 256];
        let mut filled = 0usize;
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
            if remaining.is_zero() {
                return Err(anyhow!("chassis read timed out"));
            }
            let n = tokio::time::timeout(remaining, self.port.read(&mut buf[filled..]))
                .await
                .map_err(|_| anyhow!("chassis read timed out"))?
                .context("chassis read")?;
            if n == 0 {
                return Err(anyhow!("chassis link closed"));
            }
            filled += n;
            match decode_frame(&buf[..filled]) {
                Ok(frame) => return Ok(frame),
                // Keep reading until a full frame accumulates.
                Err(_) if filled < buf.len() => continue,
                Err(e) => return Err(e),
            }
        }
    }
}

/// Register the serial-backed `chassis` driver kind.
pub fn register(registry: &mut DriverRegistry) {
    registry.register("chassis", |spec| {
        let path = spec.resource.clone();
        let timeout = Duration::from_millis(spec.timeout_ms.unwrap_or(5_000));
        let driver = driver_with_transport(
            "chassis",
            Box::new(move || {
                Ok(Box::new(SerialChassisTransport::open(&path)?) as Box<dyn ChassisTransport>)
            }),
            timeout,
        );
        Ok(Box::new(driver) as Box<dyn Driver>)
    });
}
