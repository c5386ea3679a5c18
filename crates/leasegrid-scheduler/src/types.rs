//! Request/response value objects for slot reservation.

use leasegrid_state::InstanceId;

/// A transient resource request: reserved-but-unassigned instance ids plus
/// the constraints they share. Created per `schedule()` call and consumed
/// once a `Reservation` is produced.
#[derive(Debug, Clone, PartialEq)]
pub struct NodeRequest {
    pub ids: Vec<InstanceId>,
    /// Memory per instance (MB).
    pub memory_mb: u64,
    /// Requested lease duration, seconds.
    pub duration_secs: u64,
    /// Network associations every placed node must support.
    pub associations: Vec<String>,
    /// Client-supplied request group tag, passed through unmodified.
    pub group_id: Option<String>,
}

/// Result of a successful match: parallel id/hostname vectors plus
/// optional per-id durations (co-scheduled groups may mix durations).
///
/// A zero-length reservation is a valid "best-effort accepted but not yet
/// placed" response. Any other length must exactly match the request's id
/// count — a mismatch is an internal error and the caller must back out
/// all partial allocations.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Reservation {
    pub ids: Vec<InstanceId>,
    pub hostnames: Vec<String>,
    pub durations: Option<Vec<u64>>,
}

impl Reservation {
    /// The "accepted, placement deferred" response.
    pub fn deferred() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }

    /// Duration for the id at `index`, falling back to `default_secs`
    /// when the reservation carries no per-id durations.
    pub fn duration_for(&self, index: usize, default_secs: u64) -> u64 {
        self.durations
            .as_ref()
            .and_then(|d| d.get(index).copied())
            .unwrap_or(default_secs)
    }
}
