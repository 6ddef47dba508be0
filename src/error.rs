use std::sync::Arc;

use crate::store::StoreError;

/// Result type for administrative operations of the flag service.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors surfaced by the administrative write path and the refresh thread.
///
/// Evaluation never returns these: a failed evaluation degrades to its fail-closed answer.
#[derive(thiserror::Error, Debug, Clone)]
#[non_exhaustive]
pub enum Error {
    /// The backing config store failed to read or write.
    #[error(transparent)]
    Store(#[from] StoreError),

    /// A definition was rejected before reaching the store.
    #[error("invalid definition: {0}")]
    Validation(String),

    /// A partial update targeted a definition that does not exist.
    #[error("definition not found: {0}")]
    NotFound(String),

    /// A definition could not be encoded for the store.
    #[error("failed to serialize definition")]
    // serde_json::Error is not clonable, so we're wrapping it in an Arc.
    Serialization(#[source] Arc<serde_json::Error>),

    /// An I/O error, e.g. the refresh thread failed to spawn.
    #[error(transparent)]
    Io(Arc<std::io::Error>),

    /// Indicates that the refresh thread panicked. This should normally never happen.
    #[error("refresh thread panicked")]
    RefreshThreadPanicked,
}

impl From<std::io::Error> for Error {
    fn from(value: std::io::Error) -> Self {
        Self::Io(Arc::new(value))
    }
}

impl From<serde_json::Error> for Error {
    fn from(value: serde_json::Error) -> Self {
        Self::Serialization(Arc::new(value))
    }
}

/// Reasons an evaluation could not complete normally.
///
/// These never leave the crate's evaluation API; they are logged and replaced with the
/// fail-closed answer.
#[derive(thiserror::Error, Debug, Clone, Copy, PartialEq, Eq)]
#[non_exhaustive]
pub enum EvaluationError {
    /// An experiment reached variant selection without any variants.
    #[error("experiment has no variants")]
    NoVariants,

    /// The stored definition carries a value that cannot be evaluated.
    #[error("definition is malformed")]
    MalformedDefinition,
}
