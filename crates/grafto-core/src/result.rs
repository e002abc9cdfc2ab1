//! Result type aliases for Grafto.

use crate::GraftoError;

/// A specialized `Result` type for Grafto operations.
pub type GraftoResult<T> = Result<T, GraftoError>;
