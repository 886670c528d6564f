//! Shared error model for cross-crate APIs.

use thiserror::Error;

/// Unified result type used by public interfaces in `shoal`.
pub type ShoalResult<T> = Result<T, ShoalError>;

/// High-level error categories for setup and validation paths.
///
/// Runtime outcomes that are data rather than failures (a missing key, a wrong-type read, a
/// blocking timeout) are not errors; they travel as `OpStatus` values through the coordinator.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ShoalError {
    /// Configuration is invalid for the requested operation.
    #[error("invalid configuration: {0}")]
    InvalidConfig(&'static str),

    /// Runtime state does not allow this operation.
    #[error("invalid runtime state: {0}")]
    InvalidState(&'static str),

    /// A command's key layout cannot be applied to the given argument vector.
    #[error("invalid key layout: {0}")]
    KeyLayout(String),
}
