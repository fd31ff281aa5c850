//! Generic SCPI instrument driver.
//!
//! Covers the SCPI-speaking bench classes the plans reference through
//! `switch_mode`: DAQ/DMM readers (`DAQ973A`), programmable supplies
//! (`MODEL2303`), and RF boxes. One driver, one connection; the measurement
//! vocabulary is plain SCPI:
//!
//! - identification/probe: `*IDN?`, `*RST`, `*OPC?`
//! - readings: `MEAS:VOLT:DC? (@101)`, `MEAS:CURR:AC? (@204)`, ...
//! - sourcing: `SOUR1:VOLT 12.0`, `SOUR1:CURR 1.5`, `OUTP1 ON`
//!
//! The wire is abstracted behind [`ScpiTransport`] so the driver logic is
//! testable without hardware: `scpi` connects a TCP socket (SCPI-raw port),
//! `mock_scpi` installs an emulated instrument.

use crate::config::InstrumentSpec;
use crate::error::PdtResult;
use crate::instruments::driver::{Driver, DriverRegistry, MeasureKind};
use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

/// Wire abstraction under the SCPI driver.
#[async_trait]
pub trait ScpiTransport: Send {
    /// Write a command, no reply expected.
    async fn write(&mut self, cmd: &str) -> Result<()>;

    /// Write a query and read the reply line.
    async fn query(&mut self, cmd: &str) -> Result<String>;

    /// Close the connection.
    async fn close(&mut self) -> Result<()>;
}

/// Emulated SCPI instrument for tests and bench stations without hardware.
///
/// Readings default to a fixed plausible value and can be pinned per
/// instrument through the registry file (`options.value = "12.01"`).
pub struct MockScpiTransport {
    identity: String,
    reading: String,
}

impl MockScpiTransport {
    /// Create with an optional pinned reading.
    pub fn new(resource: &str, reading: Option<String>) -> Self {
        Self {
            identity: format!("Mock SCPI Instrument,Model 1234,SN001,v1.0 [{resource}]"),
            reading: reading.unwrap_or_else(|| "1.234".to_string()),
        }
    }
}

#[async_trait]
impl ScpiTransport for MockScpiTransport {
    async fn write(&mut self, _cmd: &str) -> Result<()> {
        Ok(())
    }

    async fn query(&mut self, cmd: &str) -> Result<String> {
        let cmd = cmd.trim();
        if cmd == "*IDN?" {
            return Ok(self.identity.clone());
        }
        if cmd == "*OPC?" {
            return Ok("1".to_string());
        }
        if cmd == "SYST:ERR?" {
            return Ok("0,\"No error\"".to_string());
        }
        if cmd.starts_with("MEAS") {
            return Ok(self.reading.clone());
        }
        Ok("0".to_string())
    }

    async fn close(&mut self) -> Result<()> {
        Ok(())
    }
}

/// SCPI-raw socket transport (`TCPIP::<host>::<port>` resources).
pub struct TcpScpiTransport {
    stream: TcpStream,
    timeout: Duration,
}

impl TcpScpiTransport {
    /// Connect to the instrument's SCPI-raw port.
    pub async fn connect(host: &str, port: u16, timeout: Duration) -> Result<Self> {
        let addr = format!("{host}:{port}");
        let stream = tokio::time::timeout(timeout, TcpStream::connect(&addr))
            .await
            .map_err(|_| anyhow!("connect {addr} timed out"))?
            .with_context(|| format!("connect {addr}"))?;
        Ok(Self { stream, timeout })
    }

    async fn read_line(&mut self) -> Result<String> {
        let mut reply = Vec::new();
        let mut byte = [0u8; 1];
        let deadline = tokio::time::Instant::now() + self.timeout;
        loop {
            let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
            if remaining.is_zero() {
                return Err(anyhow!("SCPI read timed out"));
            }
            let n = tokio::time::timeout(remaining, self.stream.read(&mut byte))
                .await
                .map_err(|_| anyhow!("SCPI read timed out"))?
                .context("SCPI read")?;
            if n == 0 || byte[0] == b'\n' {
                break;
            }
            reply.push(byte[0]);
        }
        Ok(String::from_utf8_lossy(&reply).trim().to_string())
    }
}

#[async_trait]
impl ScpiTransport for TcpScpiTransport {
    async fn write(&mut self, cmd: &str) -> Result<()> {
        let line = format!("{cmd}\n");
        tokio::time::timeout(self.timeout, self.stream.write_all(line.as_bytes()))
            .await
            .map_err(|_| anyhow!("SCPI write timed out"))?
            .context("SCPI write")
    }

    async fn query(&mut self, cmd: &str) -> Result<String> {
        self.write(cmd).await?;
        self.read_line().await
    }

    async fn close(&mut self) -> Result<()> {
        self.stream.shutdown().await.context("SCPI close")
    }
}

enum ScpiWire {
    Mock { reading: Option<String> },
    Tcp { host: String, port: u16 },
}

/// SCPI driver over an abstract transport.
pub struct ScpiDriver {
    kind: String,
    resource: String,
    wire: ScpiWire,
    timeout: Duration,
    transport: Option<Box<dyn ScpiTransport>>,
}

impl ScpiDriver {
    fn transport_mut(&mut self) -> Result<&mut (dyn ScpiTransport + '_)> {
        match &mut self.transport {
            Some(t) => Ok(&mut **t),
            None => Err(anyhow!("SCPI transport not initialized")),
        }
    }

    fn measurement_query(kind: MeasureKind, channel: &str, mode: &str) -> String {
        let mode = mode.trim().to_ascii_uppercase();
        let function = match kind {
            MeasureKind::Volt if mode == "AC" => "VOLT:AC",
            MeasureKind::Volt => "VOLT:DC",
            MeasureKind::Curr if mode == "AC" => "CURR:AC",
            MeasureKind::Curr => "CURR:DC",
            MeasureKind::Res => "RES",
            MeasureKind::Temp => "TEMP",
            MeasureKind::Freq => "FREQ",
        };
        if channel.is_empty() {
            format!("MEAS:{function}?")
        } else {
            format!("MEAS:{function}? (@{channel})")
        }
    }
}

#[async_trait]
impl Driver for ScpiDriver {
    fn kind(&self) -> &str {
        &self.kind
    }

    async fn initialize(&mut self) -> Result<()> {
        let transport: Box<dyn ScpiTransport> = match &self.wire {
            ScpiWire::Mock { reading } => {
                Box::new(MockScpiTransport::new(&self.resource, reading.clone()))
            }
            ScpiWire::Tcp { host, port } => {
                Box::new(TcpScpiTransport::connect(host, *port, self.timeout).await?)
            }
        };
        self.transport = Some(transport);

        let identity = self.transport_mut()?.query("*IDN?").await?;
        tracing::info!(resource = %self.resource, identity = %identity, "SCPI instrument connected");

        let transport = self.transport_mut()?;
        transport.write("*RST").await?;
        transport.query("*OPC?").await?;
        Ok(())
    }

    async fn reset(&mut self) -> Result<()> {
        let transport = self.transport_mut()?;
        transport.write("*RST").await?;
        transport.query("*OPC?").await?;
        Ok(())
    }

    async fn shutdown(&mut self) -> Result<()> {
        if let Some(mut transport) = self.transport.take() {
            transport.close().await?;
        }
        Ok(())
    }

    async fn write(&mut self, cmd: &str) -> Result<()> {
        self.transport_mut()?.write(cmd).await
    }

    async fn query(&mut self, cmd: &str) -> Result<String> {
        self.transport_mut()?.query(cmd).await
    }

    async fn read_measurement(
        &mut self,
        kind: MeasureKind,
        channel: &str,
        mode: &str,
    ) -> Result<String> {
        let query = Self::measurement_query(kind, channel, mode);
        let reply = self.transport_mut()?.query(&query).await?;
        Ok(reply.trim().to_string())
    }

    async fn set_output(&mut self, channel: &str, volts: f64, amps: f64) -> Result<()> {
        let channel = if channel.is_empty() { "1" } else { channel };
        let transport = self.transport_mut()?;
        transport.write(&format!("SOUR{channel}:VOLT {volts}")).await?;
        transport.write(&format!("SOUR{channel}:CURR {amps}")).await?;
        transport.write(&format!("OUTP{channel} ON")).await?;
        Ok(())
    }

    async fn custom(&mut self, op: &str, args: &serde_json::Value) -> Result<String> {
        match op {
            // RF boxes measure power at a frequency/bandwidth/detector tuple.
            "rf_measure" => {
                let frequency = args
                    .get("frequency")
                    .and_then(|v| v.as_str())
                    .ok_or_else(|| anyhow!("rf_measure: missing frequency"))?;
                let bandwidth = args.get("bandwidth").and_then(|v| v.as_str()).unwrap_or("auto");
                let detector = args.get("type").and_then(|v| v.as_str()).unwrap_or("power");
                let transport = self.transport_mut()?;
                transport.write(&format!("FREQ:CENT {frequency}")).await?;
                transport.write(&format!("BAND:RES {bandwidth}")).await?;
                let reply = transport.query(&format!("MEAS:{}?", detector.to_ascii_uppercase())).await?;
                Ok(reply.trim().to_string())
            }
            other => Err(anyhow!("{}: operation '{}' not supported", self.kind, other)),
        }
    }
}

fn parse_tcp_resource(resource: &str) -> Option<(String, u16)> {
    // VISA-style resource: TCPIP::<host>::<port> (::INSTR suffix tolerated).
    let mut parts = resource.split("::");
    if !parts.next()?.eq_ignore_ascii_case("TCPIP") {
        return None;
    }
    let host = parts.next()?.to_string();
    let port = parts.next()?.parse::<u16>().ok()?;
    Some((host, port))
}

fn pinned_reading(spec: &InstrumentSpec) -> Option<String> {
    spec.options
        .get("value")
        .and_then(|v| v.as_str())
        .map(str::to_string)
}

/// Register the `scpi` and `mock_scpi` driver kinds.
pub fn register(registry: &mut DriverRegistry) {
    registry.register("scpi", |spec| {
        let (host, port) = parse_tcp_resource(&spec.resource).ok_or_else(|| {
            crate::error::PdtError::Configuration(format!(
                "instrument '{}': bad SCPI resource '{}'",
                spec.id, spec.resource
            ))
        })?;
        Ok(Box::new(ScpiDriver {
            kind: "scpi".to_string(),
            resource: spec.resource.clone(),
            wire: ScpiWire::Tcp { host, port },
            timeout: Duration::from_millis(spec.timeout_ms.unwrap_or(5_000)),
            transport: None,
        }) as Box<dyn Driver>)
    });

    registry.register("mock_scpi", |spec| {
        Ok(Box::new(ScpiDriver {
            kind: "mock_scpi".to_string(),
            resource: spec.resource.clone(),
            wire: ScpiWire::Mock {
                reading: pinned_reading(spec),
            },
            timeout: Duration::from_millis(spec.timeout_ms.unwrap_or(5_000)),
            transport: None,
        }) as Box<dyn Driver>)
    });
}

/// Build a mock SCPI driver directly (test helper).
pub fn mock_driver(resource: &str, reading: Option<String>) -> PdtResult<Box<dyn Driver>> {
    Ok(Box::new(ScpiDriver {
        kind: "mock_scpi".to_string(),
        resource: resource.to_string(),
        wire: ScpiWire::Mock { reading },
        timeout: Duration::from_millis(5_000),
        transport: None,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn initialize_probes_identity() {
        let mut driver = mock_driver("TCPIP::10.0.0.5::5025", None).unwrap();
        driver.initialize().await.unwrap();
        let idn = driver.query("*IDN?").await.unwrap();
        assert!(idn.contains("Mock SCPI Instrument"));
    }

    #[tokio::test]
    async fn measurement_queries_follow_type_and_channel() {
        assert_eq!(
            ScpiDriver::measurement_query(MeasureKind::Volt, "101", "DC"),
            "MEAS:VOLT:DC? (@101)"
        );
        assert_eq!(
            ScpiDriver::measurement_query(MeasureKind::Curr, "204", "AC"),
            "MEAS:CURR:AC? (@204)"
        );
        assert_eq!(
            ScpiDriver::measurement_query(MeasureKind::Res, "", "RES"),
            "MEAS:RES?"
        );
    }

    #[tokio::test]
    async fn pinned_reading_is_returned_verbatim() {
        let mut driver = mock_driver("mock", Some("12.01".to_string())).unwrap();
        driver.initialize().await.unwrap();
        let value = driver
            .read_measurement(MeasureKind::Volt, "101", "DC")
            .await
            .unwrap();
        assert_eq!(value, "12.01");
    }

    #[tokio::test]
    async fn query_before_initialize_fails() {
        let mut driver = mock_driver("mock", None).unwrap();
        let err = driver.query("*IDN?").await.unwrap_err();
        assert!(err.to_string().contains("not initialized"));
    }

    #[test]
    fn tcp_resource_parsing() {
        assert_eq!(
            parse_tcp_resource("TCPIP::10.0.0.5::5025"),
            Some(("10.0.0.5".to_string(), 5025))
        );
        assert_eq!(parse_tcp_resource("GPIB0::22::INSTR"), None);
        assert_eq!(parse_tcp_resource("TCPIP::host"), None);
    }
}
