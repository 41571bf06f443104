//! Engine-level error taxonomy.

use crate::store::StoreError;

/// Errors surfaced by the engine to its callers.
///
/// Runner failures are never represented here: they are recorded on the
/// failing step itself and drive the step state machine instead.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    /// Invalid template, configuration or input; rejected before any state change.
    #[error("bad request: {0}")]
    BadRequest(String),

    /// Caller is not allowed to act on this task or resolution.
    #[error("forbidden: {0}")]
    Forbidden(String),

    /// Referenced entity does not exist.
    #[error("not found: {0}")]
    NotFound(String),

    /// Attempt to mutate a locked or terminal resolution.
    #[error("conflict: {0}")]
    Conflict(String),

    /// Invalid engine setup detected at init; startup aborts.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// Persistence or lock failure; the current pass aborts without state
    /// change and the retry collector picks the resolution up again.
    #[error(transparent)]
    Store(#[from] StoreError),
}

pub type EngineResult<T> = Result<T, EngineError>;
