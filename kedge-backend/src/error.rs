//! Error types for backend operations.

use thiserror::Error;

/// Error type for cache backend operations.
///
/// Backend failures never fail a request in the coordinator: lookups
/// degrade to a miss and writes are logged and swallowed. The split into
/// internal vs connection errors exists for diagnostics.
#[derive(Debug, Error)]
pub enum BackendError {
    /// Internal backend error, state or computation error.
    ///
    /// Any error not related to network interaction.
    #[error(transparent)]
    Internal(Box<dyn std::error::Error + Send + Sync>),

    /// Network interaction error.
    ///
    /// Errors occurring during communication with remote backends.
    #[error(transparent)]
    Connection(Box<dyn std::error::Error + Send + Sync>),

    /// The backend has been closed.
    #[error("backend is closed")]
    Closed,
}

impl BackendError {
    /// Wrap an arbitrary error as an internal backend error.
    pub fn internal<E>(error: E) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        BackendError::Internal(Box::new(error))
    }
}
