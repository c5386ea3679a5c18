//! Market error taxonomy.
//!
//! `Denied` mirrors the scheduler's convention: a policy refusal (tier
//! disabled, bid under the floor) that the caller may retry with other
//! parameters. `NotFound` is its own variant because cancellation and
//! queries need to distinguish "no such request" from a store failure.

use thiserror::Error;

pub type MarketResult<T> = Result<T, MarketError>;

#[derive(Debug, Error)]
pub enum MarketError {
    /// Policy refusal. Retryable with different parameters.
    #[error("request denied: {0}")]
    Denied(String),

    #[error("no such async request: {0}")]
    NotFound(String),

    /// Launch or destroy action against the backing instances failed.
    #[error("instance action failed: {0}")]
    Action(String),

    #[error("state store error: {0}")]
    State(#[from] leasegrid_state::StateError),
}
