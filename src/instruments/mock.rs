//! Mock instrument drivers.
//!
//! Bench stations and tests run against emulated hardware. Readings jitter
//! around a nominal value unless the registry file pins them:
//!
//! ```toml
//! [[instruments]]
//! id = "DAQ973A_1"
//! driver = "mock_dmm"
//! [instruments.options]
//! value = "12.01"       # pinned reading, returned verbatim
//! ```

use crate::config::InstrumentSpec;
use crate::instruments::driver::{Driver, DriverRegistry, MeasureKind};
use anyhow::{anyhow, bail, Result};
use async_trait::async_trait;
use rand::Rng;

fn option_str(spec: &InstrumentSpec, key: &str) -> Option<String> {
    spec.options.get(key).and_then(|v| v.as_str()).map(str::to_string)
}

fn option_f64(spec: &InstrumentSpec, key: &str) -> Option<f64> {
    let value = spec.options.get(key)?;
    value
        .as_float()
        .or_else(|| value.as_integer().map(|i| i as f64))
}

/// Programmable supply mock: remembers the last programmed output.
pub struct MockSupplyDriver {
    connected: bool,
    last_output: Option<(String, f64, f64)>,
}

#[async_trait]
impl Driver for MockSupplyDriver {
    fn kind(&self) -> &str {
        "mock_supply"
    }

    async fn initialize(&mut self) -> Result<()> {
        self.connected = true;
        Ok(())
    }

    async fn reset(&mut self) -> Result<()> {
        self.last_output = None;
        Ok(())
    }

    async fn shutdown(&mut self) -> Result<()> {
        self.connected = false;
        Ok(())
    }

    async fn set_output(&mut self, channel: &str, volts: f64, amps: f64) -> Result<()> {
        if !self.connected {
            bail!("supply not connected");
        }
        self.last_output = Some((channel.to_string(), volts, amps));
        Ok(())
    }

    async fn query(&mut self, cmd: &str) -> Result<String> {
        match (cmd, &self.last_output) {
            ("OUTP?", Some((_, v, i))) => Ok(format!("{v},{i}")),
            ("OUTP?", None) => Ok("0,0".to_string()),
            _ => Err(anyhow!("mock_supply: unknown query '{cmd}'")),
        }
    }
}

/// DMM/DAQ mock: fixed or jittered readings per measure kind.
pub struct MockDmmDriver {
    pinned: Option<String>,
    nominal: f64,
    connected: bool,
}

#[async_trait]
impl Driver for MockDmmDriver {
    fn kind(&self) -> &str {
        "mock_dmm"
    }

    async fn initialize(&mut self) -> Result<()> {
        self.connected = true;
        Ok(())
    }

    async fn reset(&mut self) -> Result<()> {
        Ok(())
    }

    async fn shutdown(&mut self) -> Result<()> {
        self.connected = false;
        Ok(())
    }

    async fn read_measurement(
        &mut self,
        kind: MeasureKind,
        _channel: &str,
        _mode: &str,
    ) -> Result<String> {
        if !self.connected {
            bail!("dmm not connected");
        }
        if let Some(pinned) = &self.pinned {
            return Ok(pinned.clone());
        }
        let base = match kind {
            MeasureKind::Volt => self.nominal,
            MeasureKind::Curr => self.nominal * 0.001,
            MeasureKind::Res => self.nominal * 1_000.0,
            MeasureKind::Temp => 25.0,
            MeasureKind::Freq => 50.0,
        };
        let jitter: f64 = rand::thread_rng().gen_range(-0.005..0.005);
        Ok(format!("{:.4}", base * (1.0 + jitter)))
    }
}

/// RF box mock: answers `rf_measure` with a level in dBm.
pub struct MockRfDriver {
    pinned: Option<String>,
    connected: bool,
}

#[async_trait]
impl Driver for MockRfDriver {
    fn kind(&self) -> &str {
        "mock_rf"
    }

    async fn initialize(&mut self) -> Result<()> {
        self.connected = true;
        Ok(())
    }

    async fn reset(&mut self) -> Result<()> {
        Ok(())
    }

    async fn shutdown(&mut self) -> Result<()> {
        self.connected = false;
        Ok(())
    }

    async fn custom(&mut self, op: &str, _args: &serde_json::Value) -> Result<String> {
        if !self.connected {
            bail!("rf box not connected");
        }
        match op {
            "rf_measure" => {
                if let Some(pinned) = &self.pinned {
                    return Ok(pinned.clone());
                }
                let jitter: f64 = rand::thread_rng().gen_range(-0.3..0.3);
                Ok(format!("{:.2}", -20.0 + jitter))
            }
            other => bail!("mock_rf: operation '{other}' not supported"),
        }
    }
}

/// DUT communications mock: relays plus a command console.
pub struct MockDutCommDriver {
    connected: bool,
    relays: std::collections::HashMap<String, bool>,
    reply: Option<String>,
}

#[async_trait]
impl Driver for MockDutCommDriver {
    fn kind(&self) -> &str {
        "mock_dut"
    }

    async fn initialize(&mut self) -> Result<()> {
        self.connected = true;
        Ok(())
    }

    async fn reset(&mut self) -> Result<()> {
        self.relays.clear();
        Ok(())
    }

    async fn shutdown(&mut self) -> Result<()> {
        self.connected = false;
        Ok(())
    }

    async fn set_relay(&mut self, relay: &str, on: bool) -> Result<()> {
        if !self.connected {
            bail!("dut comm not connected");
        }
        self.relays.insert(relay.to_string(), on);
        Ok(())
    }

    async fn query(&mut self, cmd: &str) -> Result<String> {
        if !self.connected {
            bail!("dut comm not connected");
        }
        if let Some(state) = cmd.strip_prefix("RELAY? ") {
            let on = self.relays.get(state).copied().unwrap_or(false);
            return Ok(if on { "1" } else { "0" }.to_string());
        }
        Ok(self
            .reply
            .clone()
            .unwrap_or_else(|| format!("ack {}", cmd.trim())))
    }

    async fn write(&mut self, _cmd: &str) -> Result<()> {
        if !self.connected {
            bail!("dut comm not connected");
        }
        Ok(())
    }
}

/// A driver whose initialize always fails; stands in for absent hardware.
pub struct UnreachableDriver {
    message: String,
}

#[async_trait]
impl Driver for UnreachableDriver {
    fn kind(&self) -> &str {
        "unreachable"
    }

    async fn initialize(&mut self) -> Result<()> {
        bail!("{}", self.message)
    }

    async fn reset(&mut self) -> Result<()> {
        bail!("{}", self.message)
    }

    async fn shutdown(&mut self) -> Result<()> {
        Ok(())
    }
}

/// Register the mock driver kinds.
pub fn register(registry: &mut DriverRegistry) {
    registry.register("mock_supply", |_spec| {
        Ok(Box::new(MockSupplyDriver {
            connected: false,
            last_output: None,
        }) as Box<dyn Driver>)
    });

    registry.register("mock_dmm", |spec| {
        Ok(Box::new(MockDmmDriver {
            pinned: option_str(spec, "value"),
            nominal: option_f64(spec, "nominal").unwrap_or(12.0),
            connected: false,
        }) as Box<dyn Driver>)
    });

    registry.register("mock_rf", |spec| {
        Ok(Box::new(MockRfDriver {
            pinned: option_str(spec, "value"),
            connected: false,
        }) as Box<dyn Driver>)
    });

    registry.register("mock_dut", |spec| {
        Ok(Box::new(MockDutCommDriver {
            connected: false,
            relays: std::collections::HashMap::new(),
            reply: option_str(spec, "reply"),
        }) as Box<dyn Driver>)
    });

    registry.register("unreachable", |spec| {
        Ok(Box::new(UnreachableDriver {
            message: option_str(spec, "message")
                .unwrap_or_else(|| format!("{}: no instrument present", spec.id)),
        }) as Box<dyn Driver>)
    });
}
