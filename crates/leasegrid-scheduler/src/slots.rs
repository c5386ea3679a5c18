//! Slot manager — the seam between the scheduler and the pool matcher.
//!
//! `PoolSlotManager` reserves concrete slots immediately and records a
//! lease task row per id so that `release_space` can find the host and
//! memory to retire later. A best-effort variant would return deferred
//! reservations and notify placement via `slot_reserved`; the trait
//! carries the flags the scheduler branches on.

use std::sync::Arc;

use tracing::{debug, error, warn};

use leasegrid_pool::PoolMatcher;
use leasegrid_state::{InstanceId, LeaseTask, StateStore};

use crate::error::{SchedulerError, SchedulerResult};
use crate::types::{NodeRequest, Reservation};

/// Reserves and releases node slots for instance ids.
pub trait SlotManager: Send + Sync {
    /// True if this manager may accept a request without immediately
    /// producing a concrete placement.
    fn is_best_effort(&self) -> bool;

    /// True if `reserve_coscheduled_space` is supported.
    fn supports_coscheduling(&self) -> bool;

    /// Place every id in the request. The response length must equal the
    /// request's id count unless this manager is best-effort.
    fn reserve_space(&self, request: &NodeRequest) -> SchedulerResult<Reservation>;

    /// Jointly place the accumulated requests of a co-scheduling group.
    fn reserve_coscheduled_space(&self, requests: &[NodeRequest])
    -> SchedulerResult<Reservation>;

    /// Return the slot held by `id` to its node.
    fn release_space(&self, id: InstanceId) -> SchedulerResult<()>;
}

/// Concrete slot manager over the resource pool matcher.
pub struct PoolSlotManager {
    matcher: Arc<PoolMatcher>,
    state: StateStore,
    /// Restrict placement to one named pool, or search all pools.
    pool: Option<String>,
}

impl PoolSlotManager {
    pub fn new(matcher: Arc<PoolMatcher>, state: StateStore, pool: Option<String>) -> Self {
        Self {
            matcher,
            state,
            pool,
        }
    }

    /// Reserve one slot and record its lease task row.
    fn reserve_one(&self, id: InstanceId, request: &NodeRequest) -> SchedulerResult<String> {
        let hostname = self.matcher.reserve_space(
            self.pool.as_deref(),
            request.memory_mb,
            &request.associations,
        )?;
        self.state.put_task(&LeaseTask {
            instance_id: id,
            memory_mb: request.memory_mb,
            hostname: Some(hostname.clone()),
            stop_time: None,
            shutdown_requested: false,
        })?;
        Ok(hostname)
    }

    /// Best-effort backout: release every id, continuing past individual
    /// failures so one bad unwind does not prevent attempting the rest.
    fn backout(&self, ids: &[InstanceId]) {
        for &id in ids {
            if let Err(e) = self.release_space(id) {
                error!(id, error = %e, "backout release failed, continuing");
            }
        }
    }
}

impl SlotManager for PoolSlotManager {
    fn is_best_effort(&self) -> bool {
        false
    }

    fn supports_coscheduling(&self) -> bool {
        true
    }

    fn reserve_space(&self, request: &NodeRequest) -> SchedulerResult<Reservation> {
        let mut hostnames = Vec::with_capacity(request.ids.len());
        let mut reserved: Vec<InstanceId> = Vec::new();

        for &id in &request.ids {
            match self.reserve_one(id, request) {
                Ok(hostname) => {
                    hostnames.push(hostname);
                    reserved.push(id);
                }
                Err(e) => {
                    self.backout(&reserved);
                    return Err(e);
                }
            }
        }

        Ok(Reservation {
            ids: request.ids.clone(),
            hostnames,
            durations: None,
        })
    }

    fn reserve_coscheduled_space(
        &self,
        requests: &[NodeRequest],
    ) -> SchedulerResult<Reservation> {
        let mut reservation = Reservation {
            ids: Vec::new(),
            hostnames: Vec::new(),
            durations: Some(Vec::new()),
        };

        for request in requests {
            for &id in &request.ids {
                match self.reserve_one(id, request) {
                    Ok(hostname) => {
                        reservation.ids.push(id);
                        reservation.hostnames.push(hostname);
                        if let Some(durations) = reservation.durations.as_mut() {
                            durations.push(request.duration_secs);
                        }
                    }
                    Err(e) => {
                        self.backout(&reservation.ids);
                        return Err(e);
                    }
                }
            }
        }

        debug!(placed = reservation.len(), "co-scheduled group placed");
        Ok(reservation)
    }

    fn release_space(&self, id: InstanceId) -> SchedulerResult<()> {
        let Some(task) = self.state.get_task(id)? else {
            warn!(id, "no lease task for id, nothing to release");
            return Ok(());
        };
        if let Some(hostname) = &task.hostname {
            self.matcher.retire_mem(hostname, task.memory_mb)?;
        }
        self.state.delete_task(id)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use leasegrid_pool::{EntryDefinition, PoolDefinition};

    fn matcher(entries: &[(&str, u64)]) -> Arc<PoolMatcher> {
        let defs = vec![PoolDefinition {
            name: "default".to_string(),
            source_mtime: 1,
            entries: entries
                .iter()
                .map(|(h, m)| EntryDefinition {
                    hostname: h.to_string(),
                    mem_max: *m,
                    associations: "*".to_string(),
                })
                .collect(),
        }];
        Arc::new(PoolMatcher::open(StateStore::open_in_memory().unwrap(), defs).unwrap())
    }

    fn request(ids: &[InstanceId], memory_mb: u64) -> NodeRequest {
        NodeRequest {
            ids: ids.to_vec(),
            memory_mb,
            duration_secs: 3600,
            associations: Vec::new(),
            group_id: None,
        }
    }

    #[test]
    fn batch_reserve_and_release_round_trip() {
        let m = matcher(&[("n1", 1000), ("n2", 1000)]);
        let state = StateStore::open_in_memory().unwrap();
        let slots = PoolSlotManager::new(m.clone(), state.clone(), None);

        let resv = slots.reserve_space(&request(&[1, 2], 600)).unwrap();
        assert_eq!(resv.len(), 2);
        assert_eq!(m.totals().free_mb, 800);
        assert!(state.get_task(1).unwrap().is_some());

        slots.release_space(1).unwrap();
        slots.release_space(2).unwrap();
        assert_eq!(m.totals().free_mb, 2000);
        assert!(state.get_task(1).unwrap().is_none());
    }

    #[test]
    fn partial_failure_backs_out_everything() {
        // Two nodes of 600 MB: two 500 MB slots fit, the third does not.
        let m = matcher(&[("n1", 600), ("n2", 600)]);
        let state = StateStore::open_in_memory().unwrap();
        let slots = PoolSlotManager::new(m.clone(), state.clone(), None);

        let err = slots.reserve_space(&request(&[1, 2, 3], 500)).unwrap_err();
        assert!(matches!(err, SchedulerError::Denied(_)));

        // Pool memory unchanged from before the call; no stray tasks.
        assert_eq!(m.totals().free_mb, 1200);
        assert!(state.list_tasks().unwrap().is_empty());
    }

    #[test]
    fn coscheduled_reservation_carries_per_request_durations() {
        let m = matcher(&[("n1", 2000)]);
        let state = StateStore::open_in_memory().unwrap();
        let slots = PoolSlotManager::new(m, state, None);

        let mut short = request(&[1], 200);
        short.duration_secs = 60;
        let mut long = request(&[2, 3], 300);
        long.duration_secs = 600;

        let resv = slots.reserve_coscheduled_space(&[short, long]).unwrap();
        assert_eq!(resv.ids, vec![1, 2, 3]);
        assert_eq!(resv.durations, Some(vec![60, 600, 600]));
    }

    #[test]
    fn release_unknown_id_is_harmless() {
        let m = matcher(&[("n1", 1000)]);
        let slots = PoolSlotManager::new(m, StateStore::open_in_memory().unwrap(), None);
        slots.release_space(42).unwrap();
    }
}
