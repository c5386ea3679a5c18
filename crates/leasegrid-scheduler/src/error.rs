//! Scheduler error taxonomy.
//!
//! `Denied` is a legitimate capacity/policy refusal — safe to retry with
//! different parameters, never logged as an error. `Scheduling` is an
//! internal or backing inconsistency — always logged at high severity at
//! the point of detection and surfaced here after best-effort backout of
//! partial side effects. `State` is a backing-store failure and is never
//! silently retried. Lock acquisition timeouts map to `Denied`.

use thiserror::Error;

/// Result type alias for scheduler operations.
pub type SchedulerResult<T> = Result<T, SchedulerError>;

/// Errors that can occur during scheduling operations.
#[derive(Debug, Error)]
pub enum SchedulerError {
    /// No capacity or policy forbids the request. Retryable.
    #[error("request denied: {0}")]
    Denied(String),

    /// Internal inconsistency or collaborator failure; not the caller's
    /// fault and no retry is implied.
    #[error("scheduling failure: {0}")]
    Scheduling(String),

    #[error("state store error: {0}")]
    State(#[from] leasegrid_state::StateError),
}

impl From<leasegrid_pool::PoolError> for SchedulerError {
    fn from(err: leasegrid_pool::PoolError) -> Self {
        match err {
            leasegrid_pool::PoolError::Denied(reason) => SchedulerError::Denied(reason),
            leasegrid_pool::PoolError::Config(reason) => SchedulerError::Scheduling(reason),
            leasegrid_pool::PoolError::State(e) => SchedulerError::State(e),
        }
    }
}
