//! # imgq Core
//!
//! Foundational types shared by the imgq crates: the unified error type,
//! result aliases, and tracing subscriber setup.

pub mod error;
pub mod result;
pub mod telemetry;

pub use error::*;
pub use result::*;
pub use telemetry::{init_tracing, LogFormat, TelemetryConfig};
