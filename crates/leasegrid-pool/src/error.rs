//! Pool matcher error types.

use thiserror::Error;

/// Result type alias for pool operations.
pub type PoolResult<T> = Result<T, PoolError>;

/// Errors that can occur during pool matching operations.
#[derive(Debug, Error)]
pub enum PoolError {
    /// No capacity or the constraints cannot be satisfied. Retryable;
    /// never logged as an error.
    #[error("request denied: {0}")]
    Denied(String),

    /// Pool definition file problem.
    #[error("pool config error: {0}")]
    Config(String),

    #[error("state store error: {0}")]
    State(#[from] leasegrid_state::StateError),
}
