//! # Grafto Core
//!
//! Error definitions and tracing initialisation shared by every Grafto crate.

pub mod error;
pub mod result;
pub mod telemetry;

pub use error::*;
pub use result::*;
pub use telemetry::{init_tracing, LogFormat, LoggingConfig};
