//! Command/response transports for DUT-facing endpoints.
//!
//! ComPort, ConSole, TCPIP and L6MPU points talk to addressable endpoints
//! rather than pooled instruments: the plan row carries the address (port,
//! host, baud) and the handler opens a short-lived connection for the point.
//! The [`TransportFactory`] port keeps the engine testable; the standard
//! factory opens real sockets (and serial ports when the `instrument_serial`
//! feature is enabled), while tests inject scripted transports.

use crate::error::{PdtError, PdtResult};
use async_trait::async_trait;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

/// One open command/response connection.
#[async_trait]
pub trait CommandTransport: Send {
    /// Send a command line and read the reply, bounded by `timeout`.
    async fn send_command(&mut self, command: &str, timeout: Duration) -> PdtResult<String>;

    /// Close the connection. Errors are ignored by callers.
    async fn close(&mut self) -> PdtResult<()> {
        Ok(())
    }
}

impl std::fmt::Debug for dyn CommandTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "CommandTransport")
    }
}

/// Opens transports for the endpoint-style handlers.
#[async_trait]
pub trait TransportFactory: Send + Sync {
    /// Open a serial port at the given baud rate.
    async fn open_serial(&self, port: &str, baud: u32) -> PdtResult<Box<dyn CommandTransport>>;

    /// Open a TCP connection.
    async fn open_tcp(&self, host: &str, port: u16) -> PdtResult<Box<dyn CommandTransport>>;

    /// Open a console session. The host may carry an explicit `host:port`;
    /// the default console port is 23.
    async fn open_console(&self, host: &str) -> PdtResult<Box<dyn CommandTransport>>;
}

/// Line-oriented transport over a TCP stream.
///
/// Sends the command terminated by `\n`, reads until the first `\n` (or
/// connection close), returns the reply trimmed.
pub struct TcpLineTransport {
    stream: TcpStream,
}

impl TcpLineTransport {
    /// Connect with a bounded dial timeout.
    pub async fn connect(host: &str, port: u16, dial_timeout: Duration) -> PdtResult<Self> {
        let addr = format!("{host}:{port}");
        let stream = tokio::time::timeout(dial_timeout, TcpStream::connect(&addr))
            .await
            .map_err(|_| PdtError::Timeout(format!("connect {addr}")))?
            .map_err(|e| PdtError::Transport(format!("connect {addr}: {e}")))?;
        Ok(Self { stream })
    }
}

#[async_trait]
impl CommandTransport for TcpLineTransport {
    async fn send_command(&mut self, command: &str, timeout: Duration) -> PdtResult<String> {
        let line = format!("{command}\n");
        tokio::time::timeout(timeout, self.stream.write_all(line.as_bytes()))
            .await
            .map_err(|_| PdtError::Timeout(format!("write '{command}'")))?
            .map_err(|e| PdtError::Transport(format!("write failed: {e}")))?;

        let mut reply = Vec::new();
        let mut byte = [0u8; 1];
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
            if remaining.is_zero() {
                return Err(PdtError::Timeout(format!("read reply to '{command}'")));
            }
            let n = tokio::time::timeout(remaining, self.stream.read(&mut byte))
                .await
                .map_err(|_| PdtError::Timeout(format!("read reply to '{command}'")))?
                .map_err(|e| PdtError::Transport(format!("read failed: {e}")))?;
            if n == 0 {
                break;
            }
            if byte[0] == b'\n' {
                break;
            }
            reply.push(byte[0]);
        }
        Ok(String::from_utf8_lossy(&reply).trim().to_string())
    }

    async fn close(&mut self) -> PdtResult<()> {
        self.stream
            .shutdown()
            .await
            .map_err(|e| PdtError::Transport(format!("close failed: {e}")))
    }
}

/// Default factory: real sockets, feature-gated serial.
pub struct StdTransportFactory {
    dial_timeout: Duration,
}

impl StdTransportFactory {
    /// Create with the given dial timeout.
    pub fn new(dial_timeout: Duration) -> Self {
        Self { dial_timeout }
    }
}

impl Default for StdTransportFactory {
    fn default() -> Self {
        Self::new(Duration::from_secs(5))
    }
}

#[async_trait]
impl TransportFactory for StdTransportFactory {
    #[cfg(feature = "instrument_serial")]
    async fn open_serial(&self, port: &str, baud: u32) -> PdtResult<Box<dyn CommandTransport>> {
        let transport = crate::instruments::serial::SerialLineTransport::open(port, baud)?;
        Ok(Box::new(transport))
    }

    #[cfg(not(feature = "instrument_serial"))]
    async fn open_serial(&self, _port: &str, _baud: u32) -> PdtResult<Box<dyn CommandTransport>> {
        Err(PdtError::SerialFeatureDisabled)
    }

    async fn open_tcp(&self, host: &str, port: u16) -> PdtResult<Box<dyn CommandTransport>> {
        let transport = TcpLineTransport::connect(host, port, self.dial_timeout).await?;
        Ok(Box::new(transport))
    }

    async fn open_console(&self, host: &str) -> PdtResult<Box<dyn CommandTransport>> {
        let (host, port) = match host.rsplit_once(':') {
            Some((h, p)) => {
                let port = p.parse::<u16>().map_err(|_| PdtError::InvalidParameter {
                    name: "Host".to_string(),
                    reason: format!("bad console port '{p}'"),
                })?;
                (h, port)
            }
            None => (host, 23),
        };
        let transport = TcpLineTransport::connect(host, port, self.dial_timeout).await?;
        Ok(Box::new(transport))
    }
}
