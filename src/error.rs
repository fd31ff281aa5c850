//! Custom error types for the application.
//!
//! This module defines the primary error type, `PdtError`, for the entire
//! server. Using the `thiserror` crate, it provides a centralized and
//! consistent way to handle different kinds of errors, from configuration and
//! I/O issues to instrument and session-level problems.
//!
//! ## Error Hierarchy
//!
//! `PdtError` consolidates the error sources of the core:
//!
//! - **`Config`**: Wraps errors from the `figment` crate, typically file
//!   parsing or format issues in the configuration files.
//! - **`Configuration`**: Semantic errors in the configuration, such as values
//!   that parse but are logically invalid. Caught during the validation step.
//! - **`Io`**: Wraps standard `std::io::Error` for file and network I/O.
//! - **`Instrument`**: Errors originating from instrument drivers, anything
//!   from a communication failure to an invalid command sent to the hardware.
//! - **`Repository`**: Persistence-port failures. The session executor retries
//!   these a bounded number of times before moving the session to ERROR.
//! - **`MissingParameter` / `InvalidParameter` / `UnknownExecuteName`**: Plan
//!   errors raised while dispatching a point; these become per-point ERROR
//!   results and never abort the whole session.
//!
//! By using `#[from]`, `PdtError` can be seamlessly created from underlying
//! error types, simplifying error handling throughout the crate with the `?`
//! operator.

use thiserror::Error;

/// Convenience alias for results using the application error type.
pub type PdtResult<T> = std::result::Result<T, PdtError>;

/// Central error type for the test-execution core.
#[derive(Error, Debug)]
pub enum PdtError {
    #[error("Configuration error: {0}")]
    Config(#[from] figment::Error),

    #[error("Configuration validation error: {0}")]
    Configuration(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Instrument error: {0}")]
    Instrument(String),

    #[error("Instrument '{0}' is not configured")]
    InstrumentNotConfigured(String),

    #[error("Instrument '{0}' is busy (acquire timed out)")]
    InstrumentBusy(String),

    #[error("Missing required parameter {0}")]
    MissingParameter(String),

    #[error("Invalid parameter {name}: {reason}")]
    InvalidParameter {
        /// Parameter key as it appears in the plan.
        name: String,
        /// Why the value was rejected.
        reason: String,
    },

    #[error("Unknown execute_name '{0}'")]
    UnknownExecuteName(String),

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Operation '{0}' timed out")]
    Timeout(String),

    #[error("Operation cancelled")]
    Cancelled,

    #[error("Repository error: {0}")]
    Repository(String),

    #[error("Session {0} not found")]
    SessionNotFound(uuid::Uuid),

    #[error("Station '{0}' has no test plan")]
    StationNotFound(String),

    #[error("Session error: {0}")]
    Session(String),

    #[error("SFC service error: {0}")]
    Sfc(String),

    #[error("Operator gate error: {0}")]
    Operator(String),

    #[error("Report sink error: {0}")]
    Report(String),

    #[error("Serial support not enabled. Rebuild with --features instrument_serial")]
    SerialFeatureDisabled,
}

impl PdtError {
    /// Plan errors are per-point faults that never abort the session.
    pub fn is_plan_error(&self) -> bool {
        matches!(
            self,
            PdtError::MissingParameter(_)
                | PdtError::InvalidParameter { .. }
                | PdtError::UnknownExecuteName(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_parameter_display_names_the_key() {
        let err = PdtError::MissingParameter("SetVolt".to_string());
        assert_eq!(err.to_string(), "Missing required parameter SetVolt");
        assert!(err.is_plan_error());
    }

    #[test]
    fn instrument_errors_are_not_plan_errors() {
        let err = PdtError::Instrument("query failed".to_string());
        assert!(!err.is_plan_error());
    }
}
