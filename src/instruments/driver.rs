//! Driver contract and driver registry.
//!
//! A [`Driver`] is a stateful connection to one physical instrument. Drivers
//! expose `initialize`/`reset` plus a capability set specific to their class;
//! capabilities a driver does not implement fall through to a default
//! "unsupported" error. Reconnection after an I/O error is the driver's
//! responsibility, signalled to the manager via the slot's needs-reset flag.
//!
//! The [`DriverRegistry`] maps a driver kind (from the instrument registry
//! file) to a constructor closure. New drivers register at process init.

use crate::config::InstrumentSpec;
use crate::error::{PdtError, PdtResult};
use anyhow::{bail, Result};
use async_trait::async_trait;
use std::collections::HashMap;

/// Quantity selector for measurement-class drivers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MeasureKind {
    /// Voltage
    Volt,
    /// Current
    Curr,
    /// Resistance
    Res,
    /// Temperature
    Temp,
    /// Frequency
    Freq,
}

impl MeasureKind {
    /// Parse the plan's `Item` parameter.
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "volt" | "voltage" => Some(MeasureKind::Volt),
            "curr" | "current" => Some(MeasureKind::Curr),
            "res" | "resistance" => Some(MeasureKind::Res),
            "temp" | "temperature" => Some(MeasureKind::Temp),
            "freq" | "frequency" => Some(MeasureKind::Freq),
            _ => None,
        }
    }
}

/// Stateful connection to one instrument.
///
/// Drivers use `anyhow` internally; the manager and handlers convert failures
/// into [`PdtError::Instrument`] at the boundary.
#[async_trait]
pub trait Driver: Send {
    /// Driver kind, as registered.
    fn kind(&self) -> &str;

    /// Establish the hardware connection, reset and probe the instrument.
    async fn initialize(&mut self) -> Result<()>;

    /// Force the instrument back to a known state.
    async fn reset(&mut self) -> Result<()>;

    /// Release the hardware connection.
    async fn shutdown(&mut self) -> Result<()>;

    /// Raw command write.
    async fn write(&mut self, _cmd: &str) -> Result<()> {
        bail!("{}: write not supported", self.kind())
    }

    /// Raw command query (write + read reply).
    async fn query(&mut self, _cmd: &str) -> Result<String> {
        bail!("{}: query not supported", self.kind())
    }

    /// Read one measurement from a channel.
    async fn read_measurement(
        &mut self,
        _kind: MeasureKind,
        _channel: &str,
        _mode: &str,
    ) -> Result<String> {
        bail!("{}: read_measurement not supported", self.kind())
    }

    /// Program a supply output.
    async fn set_output(&mut self, _channel: &str, _volts: f64, _amps: f64) -> Result<()> {
        bail!("{}: set_output not supported", self.kind())
    }

    /// Toggle a relay.
    async fn set_relay(&mut self, _relay: &str, _on: bool) -> Result<()> {
        bail!("{}: set_relay not supported", self.kind())
    }

    /// Driver-specific operation escape hatch.
    async fn custom(&mut self, op: &str, _args: &serde_json::Value) -> Result<String> {
        bail!("{}: operation '{}' not supported", self.kind(), op)
    }
}

impl std::fmt::Debug for dyn Driver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Driver({})", self.kind())
    }
}

/// Constructor closure for one driver kind.
pub type DriverFactory = Box<dyn Fn(&InstrumentSpec) -> PdtResult<Box<dyn Driver>> + Send + Sync>;

/// Registry of driver constructors keyed by driver kind.
pub struct DriverRegistry {
    factories: HashMap<String, DriverFactory>,
}

impl DriverRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self {
            factories: HashMap::new(),
        }
    }

    /// Registry pre-populated with the built-in drivers.
    pub fn with_defaults() -> Self {
        let mut registry = Self::new();
        crate::instruments::register_builtin_drivers(&mut registry);
        registry
    }

    /// Register a constructor for a driver kind.
    pub fn register<F>(&mut self, kind: &str, factory: F)
    where
        F: Fn(&InstrumentSpec) -> PdtResult<Box<dyn Driver>> + Send + Sync + 'static,
    {
        self.factories.insert(kind.to_string(), Box::new(factory));
    }

    /// Construct a driver for a spec; the connection is not yet open.
    pub fn create(&self, spec: &InstrumentSpec) -> PdtResult<Box<dyn Driver>> {
        match self.factories.get(&spec.driver) {
            Some(factory) => factory(spec),
            None => Err(PdtError::Configuration(format!(
                "no driver registered for kind '{}' (instrument '{}')",
                spec.driver, spec.id
            ))),
        }
    }

    /// Registered kinds, for diagnostics.
    pub fn kinds(&self) -> Vec<String> {
        self.factories.keys().cloned().collect()
    }
}

impl Default for DriverRegistry {
    fn default() -> Self {
        Self::with_defaults()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn measure_kind_parses_plan_spellings() {
        assert_eq!(MeasureKind::parse("volt"), Some(MeasureKind::Volt));
        assert_eq!(MeasureKind::parse("Voltage"), Some(MeasureKind::Volt));
        assert_eq!(MeasureKind::parse("CURR"), Some(MeasureKind::Curr));
        assert_eq!(MeasureKind::parse("freq"), Some(MeasureKind::Freq));
        assert_eq!(MeasureKind::parse("power"), None);
    }

    #[test]
    fn unregistered_kind_is_a_configuration_error() {
        let registry = DriverRegistry::new();
        let spec = InstrumentSpec {
            id: "DAQ973A_1".to_string(),
            driver: "scpi".to_string(),
            resource: String::new(),
            baud: None,
            timeout_ms: None,
            options: toml::value::Table::new(),
        };
        let err = registry.create(&spec).unwrap_err();
        assert!(err.to_string().contains("no driver registered"));
    }
}
