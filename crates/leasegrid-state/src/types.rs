//! Domain types for the LeaseGrid state store.
//!
//! These types represent the persisted state of VM instances, lease tasks,
//! resource pool entries, async (spot/backfill) requests, and spot price
//! points. All types are serializable to/from JSON for storage in redb
//! tables.

use std::cmp::Ordering;

use serde::{Deserialize, Serialize};

/// Unique integer identifier for a VM instance.
pub type InstanceId = u64;

/// Unique identifier for an async (spot/backfill) request.
pub type RequestId = String;

// ── Instance ──────────────────────────────────────────────────────

/// A leased VM instance record.
///
/// Owned by the instance home; the scheduler mutates state/host/time
/// fields exclusively through that interface, never directly.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Instance {
    pub id: InstanceId,
    /// Current lifecycle state (see the scheduler's state constants).
    pub state: i32,
    /// Assigned node, absent until scheduled.
    pub hostname: Option<String>,
    /// Lease window start, epoch seconds.
    pub start_time: Option<u64>,
    /// Lease window end, epoch seconds.
    pub stop_time: Option<u64>,
    /// Groups co-scheduled instances; absent for standalone VMs.
    pub ensemble_id: Option<String>,
    /// Preemptable instances can be destroyed to reclaim capacity.
    pub preemptable: bool,
    /// Memory reserved for this instance (MB).
    pub memory_mb: u64,
    /// Whether client-visible operations are currently allowed.
    pub ops_enabled: bool,
    /// Opaque identity of the requesting caller.
    pub caller: String,
}

impl Instance {
    /// Build the key for the instances table.
    pub fn table_key(&self) -> String {
        self.id.to_string()
    }
}

// ── Lease task ────────────────────────────────────────────────────

/// Per-instance slot bookkeeping: what was reserved where, and when the
/// lease expires. The sweeper polls these rows; slot release reads them
/// to know how much memory to return to which node.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LeaseTask {
    pub instance_id: InstanceId,
    /// Memory reserved on the node (MB).
    pub memory_mb: u64,
    /// Node the slot was reserved on, absent for deferred placement.
    pub hostname: Option<String>,
    /// Lease deadline, epoch seconds. Absent until placement is concrete.
    pub stop_time: Option<u64>,
    /// Set once shutdown has been requested — irreversible.
    pub shutdown_requested: bool,
}

impl LeaseTask {
    /// Build the key for the lease tasks table.
    pub fn table_key(&self) -> String {
        self.instance_id.to_string()
    }
}

// ── Resource pool entry ───────────────────────────────────────────

/// One physical node in a named resource pool.
///
/// Invariant: `0 <= mem_current <= mem_max`. The matcher clamps rather
/// than errors when a reload shrinks capacity under an active lease.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PoolEntry {
    /// Name of the pool this entry belongs to.
    pub pool: String,
    pub hostname: String,
    /// Memory currently available (MB).
    pub mem_current: u64,
    /// Total memory capacity (MB).
    pub mem_max: u64,
    /// Comma-separated supported network associations, or `"*"` for all.
    pub associations: String,
}

impl PoolEntry {
    /// Build the composite key for the pool entries table.
    pub fn table_key(&self) -> String {
        format!("{}/{}", self.pool, self.hostname)
    }

    /// Memory currently leased out of this entry (MB).
    pub fn mem_in_use(&self) -> u64 {
        self.mem_max.saturating_sub(self.mem_current)
    }

    /// True if no memory is leased from this entry.
    pub fn is_vacant(&self) -> bool {
        self.mem_current == self.mem_max
    }
}

// ── Async request ─────────────────────────────────────────────────

/// Lifecycle status of an async request.
///
/// Open → Active → (Closed | back to Open); any → Cancelled or Failed.
/// Cancelled, Closed, and Failed are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AsyncStatus {
    Open,
    Active,
    Closed,
    Cancelled,
    Failed,
}

/// A spot or backfill request in the preemptable market tier.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AsyncRequest {
    pub id: RequestId,
    /// Spot (priced) vs backfill (fixed floor priority).
    pub spot: bool,
    /// Price ceiling for spot requests. Backfill requests carry 0.0,
    /// strictly below the spot price floor, so the shared bid ordering
    /// places them under every live spot bid.
    pub max_bid: f64,
    /// Persistent requests re-bind finished VMs instead of shrinking.
    pub persistent: bool,
    pub status: AsyncStatus,
    pub caller: String,
    pub group_id: Option<String>,
    /// Number of instances requested.
    pub instance_count: u32,
    /// Memory per instance (MB).
    pub memory_mb: u64,
    /// Currently running instance ids, in allocation order.
    pub allocated_vms: Vec<InstanceId>,
    /// Instances that completed; non-persistent requests do not replace them.
    pub finished_vms: Vec<InstanceId>,
    /// Instances marked for teardown but not yet confirmed gone.
    pub to_be_preempted: Vec<InstanceId>,
    /// Epoch seconds at admission. Tie-breaks equal bids (older wins).
    pub creation_time: u64,
    /// Cause recorded when the request transitions to Failed.
    pub error: Option<String>,
}

impl AsyncRequest {
    /// Instances this request still wants overall. Persistent requests
    /// always want the full count; others subtract finished VMs.
    pub fn needed_instances(&self) -> u32 {
        if self.persistent {
            self.instance_count
        } else {
            self.instance_count
                .saturating_sub(self.finished_vms.len() as u32)
        }
    }

    /// Instances currently allocated.
    pub fn allocated_instances(&self) -> u32 {
        self.allocated_vms.len() as u32
    }

    /// Instances still unallocated. Never negative under correct
    /// operation; saturates defensively.
    pub fn unallocated_instances(&self) -> u32 {
        self.needed_instances()
            .saturating_sub(self.allocated_instances())
    }

    /// A request is alive while it can still be allocated to.
    pub fn is_alive(&self) -> bool {
        matches!(self.status, AsyncStatus::Open | AsyncStatus::Active)
    }

    /// Alive and still wanting more instances.
    pub fn is_hungry(&self) -> bool {
        self.is_alive() && self.unallocated_instances() > 0
    }

    /// One-way status latch: only Open and Active may transition.
    /// Returns false (and leaves the record untouched) once the request
    /// has reached a terminal state.
    pub fn set_status(&mut self, status: AsyncStatus) -> bool {
        match self.status {
            AsyncStatus::Open | AsyncStatus::Active => {
                self.status = status;
                true
            }
            AsyncStatus::Closed | AsyncStatus::Cancelled | AsyncStatus::Failed => false,
        }
    }

    /// Market ordering: lower bid first; among equal bids, older request
    /// first. The tie-break favors incumbents when a preemption scan
    /// walks the collection from the bottom.
    pub fn cmp_by_bid(&self, other: &AsyncRequest) -> Ordering {
        self.max_bid
            .total_cmp(&other.max_bid)
            .then_with(|| self.creation_time.cmp(&other.creation_time))
    }

    /// Record freshly launched instances, preserving allocation order.
    pub fn add_allocated(&mut self, ids: &[InstanceId]) {
        self.allocated_vms.extend_from_slice(ids);
    }

    /// Remove an instance from the allocation, wherever it sits.
    /// Returns true if it was allocated to this request.
    pub fn remove_allocated(&mut self, id: InstanceId) -> bool {
        let before = self.allocated_vms.len();
        self.allocated_vms.retain(|&v| v != id);
        self.to_be_preempted.retain(|&v| v != id);
        self.allocated_vms.len() != before
    }

    /// The `count` most recently allocated instances (LIFO order).
    pub fn most_recent_allocations(&self, count: usize) -> Vec<InstanceId> {
        self.allocated_vms
            .iter()
            .rev()
            .take(count)
            .copied()
            .collect()
    }
}

// ── Price history ─────────────────────────────────────────────────

/// One point in the append-only spot price history.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PricePoint {
    /// Epoch milliseconds when this price took effect. Writers keep
    /// timestamps strictly increasing so every change is retained.
    pub timestamp: u64,
    pub price: f64,
}

impl PricePoint {
    /// Zero-padded key so redb iteration order is chronological.
    pub fn table_key(&self) -> String {
        format!("{:020}", self.timestamp)
    }
}
