//! # WebPDTool Core Library
//!
//! Test-execution engine and measurement subsystem for end-of-line production
//! test stations. A station operator selects a product, scans a serial
//! number, and the engine walks the station's test plan, driving laboratory
//! instruments, serial/console/TCP endpoints, relays and chassis fixtures.
//! Every point yields a measured value, validated against its plan limits;
//! the session ends PASS/FAIL/ABORT and is persisted with per-point results.
//!
//! ## Crate Structure
//!
//! - **`cancel`**: cooperative cancellation pair shared by a session and its
//!   handlers.
//! - **`config`**: figment-based settings (TOML file + environment
//!   overrides): timeouts, instrument registry, report output, HTTP bind.
//! - **`engine`**: the session state machine, per-session executor task,
//!   measurement dispatcher and progress bus.
//! - **`error`**: the central `PdtError` enum.
//! - **`handlers`**: the measurement-handler catalogue (power, command
//!   endpoints, SFC, operator gate, relay, chassis, RF, L6MPU) behind the
//!   three-phase `prepare`/`execute`/`cleanup` capability set.
//! - **`instruments`**: the instrument-connection manager (lazy singleton
//!   connections, exclusive leases), the driver contract and the built-in
//!   SCPI/chassis/mock drivers.
//! - **`model`**: engine-visible data model: test plans, sessions, results.
//! - **`server`**: thin axum HTTP adapter over the engine.
//! - **`storage`**: repository and report-sink ports with in-memory
//!   implementations.
//! - **`tracing_setup`**: tracing-subscriber initialisation.
//! - **`validation`**: the pure validation kernel (7 limit types × 3 value
//!   types) inherited from the legacy desktop application.

pub mod cancel;
pub mod config;
pub mod engine;
pub mod error;
pub mod handlers;
pub mod instruments;
pub mod model;
pub mod server;
pub mod storage;
pub mod tracing_setup;
pub mod validation;
