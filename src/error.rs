use std::collections::TryReserveError;

use thiserror::Error;

/// Errors surfaced by the engine's APIs.
///
/// The record path fails only on allocator exhaustion, and in that case
/// leaves no partial state behind so the caller may retry; broken
/// internal invariants abort rather than propagate.
#[derive(Error, Debug)]
pub enum Error {
    /// Configuration failed validation.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// The allocator could not grow the delta's staging tables; the
    /// record was not applied.
    #[error("allocation failed while staging a record: {0}")]
    ResourceExhausted(#[from] TryReserveError),

    /// A view named a measure that has not been registered.
    #[error("unknown measure: {0}")]
    UnknownMeasure(String),

    /// A measure with the same name has already been registered.
    #[error("measure already registered: {0}")]
    DuplicateMeasure(String),

    /// The view behind this handle has been unregistered.
    #[error("view handle no longer refers to a registered view")]
    StaleViewHandle,
}

/// Convenience alias used throughout the crate.
pub type Result<T> = std::result::Result<T, Error>;
