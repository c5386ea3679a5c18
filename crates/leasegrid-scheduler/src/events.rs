//! Typed lifecycle event interfaces.
//!
//! The scheduler publishes lifecycle events to a small set of subscribers
//! known at composition time (the async market manager, chiefly). The set
//! is fixed at wiring, not an open-ended dynamic listener list.

use leasegrid_state::InstanceId;

/// Receives lifecycle events from the scheduler.
pub trait StateChangeListener: Send + Sync {
    /// A batch of instances finished create finalization and became
    /// active. Fired once per activation, possibly with a single id.
    fn instances_scheduled(&self, ids: &[InstanceId]);

    /// An instance entered the destroying state.
    fn instance_destroying(&self, id: InstanceId);
}

/// Gives capacity back to the guaranteed tier on demand.
///
/// Implemented by the market manager: by the time `release_space`
/// returns, the reduced market ceiling has already triggered whatever
/// preemptions were necessary.
pub trait SpaceReclaimer: Send + Sync {
    fn release_space(&self, memory_mb: u64) -> anyhow::Result<()>;
}
