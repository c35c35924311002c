//! Classified error types shared across the crate.
//!
//! Operational failures (I/O, child processes, pipeline actions) travel as
//! [`anyhow::Error`] with context attached at each boundary. The types here
//! exist for errors that callers need to *classify*: a malformed piece of
//! metadata is fatal when the owning step is enabled but only worth a warning
//! when it is disabled, so it must stay distinguishable after crossing an
//! `anyhow` boundary (via `downcast_ref`).

use thiserror::Error;

/// Malformed or invalid metadata / configuration.
///
/// Always fatal to the entity being constructed. Never silently repaired.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{0}")]
pub struct SpecificationError(pub String);

impl SpecificationError {
    pub fn new(message: impl Into<String>) -> Self {
        Self(message.into())
    }
}

/// No metadata tree was found where one was expected.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{0}")]
pub struct MetadataError(pub String);

impl MetadataError {
    pub fn new(message: impl Into<String>) -> Self {
        Self(message.into())
    }
}

/// Return true when the error chain contains a [`SpecificationError`].
///
/// Used by the plan orchestrator to decide whether a wake failure of a
/// disabled step may be downgraded to a warning.
pub fn is_specification_error(error: &anyhow::Error) -> bool {
    error
        .chain()
        .any(|cause| cause.downcast_ref::<SpecificationError>().is_some())
}
