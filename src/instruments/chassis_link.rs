//! Chassis fixture link: framed serial protocol and driver.
//!
//! The rotation fixture speaks a framed request/response protocol at
//! 9600 8N1, big-endian on the wire:
//!
//! ```text
//! [sync: 4 bytes = 0xA5 0xFF 0x00 0xCC] [length: 2] [msg_type: 2] [body] [crc16: 2]
//! ```
//!
//! `length` counts the msg_type and body bytes; the CRC16-Kermit covers the
//! same span. Response message types set the high bit of the request type.
//! Response bodies begin with a status byte: 0 = SUCCESS, 1 = GENERAL_FAILURE,
//! 2 = TIMEOUT.
//!
//! The framing codec is transport-independent; [`ChassisTransport`] carries
//! one frame transaction. The real serial transport lives behind the
//! `instrument_serial` feature, the mock turntable is always available.

use crate::instruments::driver::{Driver, DriverRegistry};
use anyhow::{anyhow, bail, Result};
use async_trait::async_trait;
use bytes::{Buf, BufMut, BytesMut};
use crc::{Crc, CRC_16_KERMIT};
use std::time::Duration;

/// Frame sync word.
pub const SYNC: [u8; 4] = [0xA5, 0xFF, 0x00, 0xCC];

/// Bit set on response message types.
pub const RESPONSE_BIT: u16 = 0x8000;

/// Request message types.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum ChassisMessageType {
    /// Rotate the turntable by a signed angle
    RotateTurntable = 0x0001,
    /// Read the current turntable angle
    GetAngle = 0x0002,
    /// Block until the turntable settles
    WaitForTurntable = 0x0003,
    /// Open/close the cliff-sensor door
    ActuateCliffDoor = 0x0004,
    /// Read the raw encoder count
    ReadEncoderCount = 0x0005,
}

impl ChassisMessageType {
    /// Decode a request type from the wire.
    pub fn from_wire(raw: u16) -> Option<Self> {
        match raw & !RESPONSE_BIT {
            0x0001 => Some(ChassisMessageType::RotateTurntable),
            0x0002 => Some(ChassisMessageType::GetAngle),
            0x0003 => Some(ChassisMessageType::WaitForTurntable),
            0x0004 => Some(ChassisMessageType::ActuateCliffDoor),
            0x0005 => Some(ChassisMessageType::ReadEncoderCount),
            _ => None,
        }
    }
}

/// Response status byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ChassisStatus {
    /// Operation completed
    Success = 0,
    /// Fixture reported a fault
    GeneralFailure = 1,
    /// Fixture timed out internally
    Timeout = 2,
}

impl ChassisStatus {
    /// Decode a status byte.
    pub fn from_wire(raw: u8) -> Option<Self> {
        match raw {
            0 => Some(ChassisStatus::Success),
            1 => Some(ChassisStatus::GeneralFailure),
            2 => Some(ChassisStatus::Timeout),
            _ => None,
        }
    }
}

/// One protocol frame (request or response).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChassisFrame {
    /// Raw message type, response bit included
    pub msg_type: u16,
    /// Frame body
    pub body: Vec<u8>,
}

impl ChassisFrame {
    /// Build a request frame.
    pub fn request(msg_type: ChassisMessageType, body: Vec<u8>) -> Self {
        Self {
            msg_type: msg_type as u16,
            body,
        }
    }

    /// Build the matching response frame (mock fixtures and tests).
    pub fn response(msg_type: ChassisMessageType, body: Vec<u8>) -> Self {
        Self {
            msg_type: msg_type as u16 | RESPONSE_BIT,
            body,
        }
    }

    /// Whether the response bit is set.
    pub fn is_response(&self) -> bool {
        self.msg_type & RESPONSE_BIT != 0
    }

    /// Leading status byte of a response body.
    pub fn status(&self) -> Result<ChassisStatus> {
        let raw = *self
            .body
            .first()
            .ok_or_else(|| anyhow!("chassis response has no status byte"))?;
        ChassisStatus::from_wire(raw).ok_or_else(|| anyhow!("unknown chassis status {raw}"))
    }
}

const CRC16: Crc<u16> = Crc::<u16>::new(&CRC_16_KERMIT);

/// CRC-16/KERMIT over a frame's msg_type+body span.
pub fn crc16_kermit(data: &[u8]) -> u16 {
    CRC16.checksum(data)
}

/// Encode a frame for the wire.
pub fn encode_frame(frame: &ChassisFrame) -> BytesMut {
    let length = (frame.body.len() + 2) as u16;
    let mut payload = BytesMut::with_capacity(2 + frame.body.len());
    payload.put_u16(frame.msg_type);
    payload.put_slice(&frame.body);
    let crc = crc16_kermit(&payload);

    let mut out = BytesMut::with_capacity(4 + 2 + payload.len() + 2);
    out.put_slice(&SYNC);
    out.put_u16(length);
    out.put_slice(&payload);
    out.put_u16(crc);
    out
}

/// Decode one frame from the wire, verifying sync and CRC.
pub fn decode_frame(raw: &[u8]) -> Result<ChassisFrame> {
    if raw.len() < 4 + 2 + 2 + 2 {
        bail!("chassis frame too short ({} bytes)", raw.len());
    }
    if raw[..4] != SYNC {
        bail!("bad chassis sync word {:02X?}", &raw[..4]);
    }
    let mut cursor = &raw[4..];
    let length = cursor.get_u16() as usize;
    if length < 2 || cursor.remaining() < length + 2 {
        bail!("chassis frame length {length} does not fit payload");
    }
    let payload = &raw[6..6 + length];
    let mut crc_bytes = &raw[6 + length..6 + length + 2];
    let crc = crc_bytes.get_u16();
    let computed = crc16_kermit(payload);
    if crc != computed {
        bail!("chassis CRC mismatch: got {crc:#06X}, computed {computed:#06X}");
    }
    let mut payload_cursor = payload;
    let msg_type = payload_cursor.get_u16();
    Ok(ChassisFrame {
        msg_type,
        body: payload_cursor.to_vec(),
    })
}

/// One frame transaction on the fixture link.
#[async_trait]
pub trait ChassisTransport: Send {
    /// Send a request frame and read the matching response.
    async fn transact(&mut self, request: &ChassisFrame, timeout: Duration) -> Result<ChassisFrame>;

    /// Close the link.
    async fn close(&mut self) -> Result<()> {
        Ok(())
    }
}

/// Emulated turntable: tracks angle and encoder count in memory.
pub struct MockChassisTransport {
    angle_centideg: i32,
    door_open: bool,
}

impl MockChassisTransport {
    /// Start at the home position.
    pub fn new() -> Self {
        Self {
            angle_centideg: 0,
            door_open: false,
        }
    }
}

impl Default for MockChassisTransport {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ChassisTransport for MockChassisTransport {
    async fn transact(&mut self, request: &ChassisFrame, _timeout: Duration) -> Result<ChassisFrame> {
        let msg_type = ChassisMessageType::from_wire(request.msg_type)
            .ok_or_else(|| anyhow!("unknown chassis message type {:#06X}", request.msg_type))?;
        let response = match msg_type {
            ChassisMessageType::RotateTurntable => {
                let mut body = request.body.as_slice();
                if body.remaining() < 4 {
                    bail!("rotate request body too short");
                }
                let delta = body.get_i32();
                self.angle_centideg = (self.angle_centideg + delta).rem_euclid(36_000);
                ChassisFrame::response(msg_type, vec![ChassisStatus::Success as u8])
            }
            ChassisMessageType::GetAngle => {
                let mut body = vec![ChassisStatus::Success as u8];
                body.put_i32(self.angle_centideg);
                ChassisFrame::response(msg_type, body)
            }
            ChassisMessageType::WaitForTurntable => {
                ChassisFrame::response(msg_type, vec![ChassisStatus::Success as u8])
            }
            ChassisMessageType::ActuateCliffDoor => {
                self.door_open = request.body.first().copied().unwrap_or(0) != 0;
                ChassisFrame::response(msg_type, vec![ChassisStatus::Success as u8])
            }
            ChassisMessageType::ReadEncoderCount => {
                let mut body = vec![ChassisStatus::Success as u8];
                // 100 counts per degree on the mock encoder.
                body.put_i32(self.angle_centideg);
                ChassisFrame::response(msg_type, body)
            }
        };
        Ok(response)
    }
}

/// Constructor for the fixture link; captures the resource address.
pub type ChassisTransportFactory = Box<dyn Fn() -> Result<Box<dyn ChassisTransport>> + Send>;

/// Chassis fixture driver over a [`ChassisTransport`].
pub struct ChassisDriver {
    kind: String,
    transport: Option<Box<dyn ChassisTransport>>,
    make_transport: ChassisTransportFactory,
    timeout: Duration,
}

impl ChassisDriver {
    fn transport_mut(&mut self) -> Result<&mut (dyn ChassisTransport + '_)> {
        match &mut self.transport {
            Some(t) => Ok(&mut **t),
            None => Err(anyhow!("chassis link not initialized")),
        }
    }

    async fn checked(&mut self, request: ChassisFrame, timeout: Duration) -> Result<ChassisFrame> {
        let io_timeout = if timeout.is_zero() { self.timeout } else { timeout };
        let transport = self.transport_mut()?;
        let response = transport.transact(&request, io_timeout).await?;
        if !response.is_response() || (response.msg_type & !RESPONSE_BIT) != request.msg_type {
            bail!(
                "chassis response type {:#06X} does not match request {:#06X}",
                response.msg_type,
                request.msg_type
            );
        }
        match response.status()? {
            ChassisStatus::Success => Ok(response),
            ChassisStatus::GeneralFailure => bail!("chassis reported GENERAL_FAILURE"),
            ChassisStatus::Timeout => bail!("chassis reported TIMEOUT"),
        }
    }

    async fn rotate(&mut self, delta_centideg: i32, timeout: Duration) -> Result<()> {
        let mut body = Vec::with_capacity(4);
        body.put_i32(delta_centideg);
        self.checked(
            ChassisFrame::request(ChassisMessageType::RotateTurntable, body),
            timeout,
        )
        .await?;

        let mut wait_body = Vec::with_capacity(4);
        wait_body.put_u32(timeout.as_millis().min(u128::from(u32::MAX)) as u32);
        self.checked(
            ChassisFrame::request(ChassisMessageType::WaitForTurntable, wait_body),
            timeout,
        )
        .await?;
        Ok(())
    }

    async fn angle_centideg(&mut self, timeout: Duration) -> Result<i32> {
        let response = self
            .checked(ChassisFrame::request(ChassisMessageType::GetAngle, vec![]), timeout)
            .await?;
        let mut body = &response.body[1..];
        if body.remaining() < 4 {
            bail!("chassis angle response body too short");
        }
        Ok(body.get_i32())
    }
}

#[async_trait]
impl Driver for ChassisDriver {
    fn kind(&self) -> &str {
        &self.kind
    }

    async fn initialize(&mut self) -> Result<()> {
        self.transport = Some((self.make_transport)()?);
        // Probe the link with an angle read.
        self.angle_centideg(self.timeout).await?;
        Ok(())
    }

    async fn reset(&mut self) -> Result<()> {
        // Return to home and verify the link answers.
        let angle = self.angle_centideg(self.timeout).await?;
        if angle != 0 {
            self.rotate(-angle, self.timeout).await?;
        }
        Ok(())
    }

    async fn shutdown(&mut self) -> Result<()> {
        if let Some(mut transport) = self.transport.take() {
            transport.close().await?;
        }
        Ok(())
    }

    async fn custom(&mut self, op: &str, args: &serde_json::Value) -> Result<String> {
        let timeout = args
            .get("timeout_ms")
            .and_then(|v| v.as_u64())
            .map(Duration::from_millis)
            .unwrap_or(self.timeout);
        match op {
            "rotate_left" | "rotate_right" => {
                let angle = args
                    .get("angle")
                    .and_then(|v| v.as_f64())
                    .ok_or_else(|| anyhow!("{op}: missing angle"))?;
                let mut delta = (angle * 100.0).round() as i32;
                if op == "rotate_left" {
                    delta = -delta;
                }
                self.rotate(delta, timeout).await?;
                let final_angle = self.angle_centideg(timeout).await?;
                Ok(format!("{:.1}", f64::from(final_angle) / 100.0))
            }
            "home" => {
                let angle = self.angle_centideg(timeout).await?;
                if angle != 0 {
                    self.rotate(-angle, timeout).await?;
                }
                let final_angle = self.angle_centideg(timeout).await?;
                Ok(format!("{:.1}", f64::from(final_angle) / 100.0))
            }
            "door" => {
                let open = args.get("open").and_then(|v| v.as_bool()).unwrap_or(false);
                self.checked(
                    ChassisFrame::request(
                        ChassisMessageType::ActuateCliffDoor,
                        vec![u8::from(open)],
                    ),
                    timeout,
                )
                .await?;
                Ok("OK".to_string())
            }
            "encoder" => {
                let response = self
                    .checked(
                        ChassisFrame::request(ChassisMessageType::ReadEncoderCount, vec![]),
                        timeout,
                    )
                    .await?;
                let mut body = &response.body[1..];
                if body.remaining() < 4 {
                    bail!("encoder response body too short");
                }
                Ok(body.get_i32().to_string())
            }
            other => bail!("chassis: operation '{other}' not supported"),
        }
    }
}

/// Register the `mock_chassis` driver kind. The serial-backed `chassis` kind
/// registers from the serial module when the feature is enabled.
pub fn register(registry: &mut DriverRegistry) {
    registry.register("mock_chassis", |spec| {
        Ok(Box::new(ChassisDriver {
            kind: "mock_chassis".to_string(),
            transport: None,
            make_transport: Box::new(|| Ok(Box::new(MockChassisTransport::new()) as Box<dyn ChassisTransport>)),
            timeout: Duration::from_millis(spec.timeout_ms.unwrap_or(5_000)),
        }) as Box<dyn Driver>)
    });
}

/// Build a chassis driver over an arbitrary transport constructor.
pub fn driver_with_transport(
    kind: &str,
    make_transport: ChassisTransportFactory,
    timeout: Duration,
) -> ChassisDriver {
    ChassisDriver {
        kind: kind.to_string(),
        transport: None,
        make_transport,
        timeout,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn crc16_kermit_check_value() {
        // Standard check string for CRC-16/KERMIT.
        assert_eq!(crc16_kermit(b"123456789"), 0x2189);
        assert_eq!(crc16_kermit(b""), 0x0000);
    }

    #[test]
    fn frame_round_trip() {
        let frame = ChassisFrame::request(ChassisMessageType::RotateTurntable, vec![0, 0, 0x23, 0x28]);
        let wire = encode_frame(&frame);
        assert_eq!(&wire[..4], &SYNC);
        let decoded = decode_frame(&wire).unwrap();
        assert_eq!(decoded, frame);
    }

    #[test]
    fn corrupted_crc_is_rejected() {
        let frame = ChassisFrame::request(ChassisMessageType::GetAngle, vec![]);
        let mut wire = encode_frame(&frame);
        let last = wire.len() - 1;
        wire[last] ^= 0xFF;
        let err = decode_frame(&wire).unwrap_err();
        assert!(err.to_string().contains("CRC mismatch"));
    }

    #[test]
    fn bad_sync_is_rejected() {
        let frame = ChassisFrame::request(ChassisMessageType::GetAngle, vec![]);
        let mut wire = encode_frame(&frame);
        wire[0] = 0x00;
        assert!(decode_frame(&wire).is_err());
    }

    #[tokio::test]
    async fn mock_turntable_rotates_and_reports_angle() {
        let mut driver = driver_with_transport(
            "mock_chassis",
            Box::new(|| Ok(Box::new(MockChassisTransport::new()) as Box<dyn ChassisTransport>)),
            Duration::from_millis(500),
        );
        driver.initialize().await.unwrap();

        let angle = driver
            .custom("rotate_right", &serde_json::json!({"angle": 90.0}))
            .await
            .unwrap();
        assert_eq!(angle, "90.0");

        let angle = driver
            .custom("rotate_left", &serde_json::json!({"angle": 30.0}))
            .await
            .unwrap();
        assert_eq!(angle, "60.0");

        let home = driver.custom("home", &serde_json::json!({})).await.unwrap();
        assert_eq!(home, "0.0");
    }
}
