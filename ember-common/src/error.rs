//! Shared error model for cross-crate APIs.

use thiserror::Error;

/// Unified result type used by all public interfaces in the ember workspace.
pub type EmberResult<T> = Result<T, EmberError>;

/// High-level error categories surfaced by the coordinator and shard engine.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum EmberError {
    /// Configuration is invalid for the requested operation.
    #[error("invalid configuration: {0}")]
    InvalidConfig(&'static str),

    /// Runtime state does not allow this operation.
    #[error("invalid runtime state: {0}")]
    InvalidState(&'static str),

    /// The destination shard worker is gone and can not accept tasks.
    #[error("shard worker is unavailable: shard {0}")]
    ShardUnavailable(u16),

    /// Command arguments do not match the command's declared key shape.
    #[error("invalid command arguments: {0}")]
    InvalidArgs(&'static str),
}

/// Status of one shard-local operation run by a transaction callback.
///
/// Statuses are values, not failures: a multi-shard hop requires `Ok` from
/// every callback, while single-shard hops surface the status to the caller
/// verbatim.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpStatus {
    /// Normal completion.
    Ok,
    /// No key matched the inspection.
    KeyNotFound,
    /// A key existed with an incompatible value type.
    WrongType,
}

/// Failure half of [`OpResult`] for value-returning shard inspections.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum OpError {
    /// No key matched the inspection.
    #[error("key not found")]
    KeyNotFound,
    /// A key existed with an incompatible value type.
    #[error("wrong value type")]
    WrongType,
}

/// Result of a value-returning shard inspection such as `find_first`.
pub type OpResult<T> = Result<T, OpError>;

impl From<OpError> for OpStatus {
    fn from(error: OpError) -> Self {
        match error {
            OpError::KeyNotFound => Self::KeyNotFound,
            OpError::WrongType => Self::WrongType,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{OpError, OpStatus};
    use googletest::prelude::*;
    use rstest::rstest;

    #[rstest]
    #[case(OpError::KeyNotFound, OpStatus::KeyNotFound)]
    #[case(OpError::WrongType, OpStatus::WrongType)]
    fn op_error_maps_to_matching_status(#[case] error: OpError, #[case] status: OpStatus) {
        assert_that!(OpStatus::from(error), eq(status));
    }
}
