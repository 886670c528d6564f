//! Signaled operation outcomes used across the coordinator.
//!
//! These are values, not failures: a missing key or a blocking timeout is normal data flow for
//! the commands the coordinator runs. Programming errors are asserted, never signaled.

/// Outcome of one shard-local operation or of a whole transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpStatus {
    /// Normal completion.
    Ok,
    /// No shard produced a hit for the requested keys.
    KeyNotFound,
    /// A key holds a value of an incompatible shape; invalidates aggregate reads.
    WrongType,
    /// A blocking wait ran past its deadline.
    TimedOut,
    /// The connection closed or the wait was cancelled explicitly.
    Cancelled,
}

/// Value-or-status result; `Ok(_)` implies `OpStatus::Ok`.
pub type OpResult<T> = Result<T, OpStatus>;
