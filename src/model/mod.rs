//! Engine-visible data model: test plans, sessions, and results.
//!
//! Storage layout is delegated to the repository ports in [`crate::storage`];
//! everything here is what the execution core itself reads and writes.

pub mod plan;
pub mod session;

pub use plan::{
    parse_parameters_json, validate_plan, ExecuteName, LimitType, PlanRecord, TestPoint,
    ValueType, UPSTREAM_VALUE_KEY,
};
pub use session::{
    FinalResult, PointResult, SessionId, SessionSnapshot, SessionStatus, TestResult, TestSession,
};
