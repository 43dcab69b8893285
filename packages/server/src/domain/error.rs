//! Domain-level errors.

use thiserror::Error;

/// Failure of the external persistence collaborator.
///
/// A store failure aborts the operation before any broadcast: observers never
/// see a state change unaccompanied by a persisted fact.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum StoreError {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("storage failure: {0}")]
    Backend(String),
}
