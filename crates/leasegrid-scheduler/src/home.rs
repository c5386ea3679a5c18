//! Instance home — lifecycle CRUD for VM instance records.
//!
//! The scheduler and the market manager mutate instance records only
//! through this interface. The production implementation is backed by
//! the state store; tests may substitute their own.

use tracing::{debug, info};

use leasegrid_state::{Instance, InstanceId, StateResult, StateStore};

/// Lifecycle CRUD for individual VM records.
pub trait InstanceHome: Send + Sync {
    /// Look up an instance. `Ok(None)` is "not found" — the caller
    /// decides whether that is a benign race or an inconsistency.
    fn find(&self, id: InstanceId) -> StateResult<Option<Instance>>;

    /// Insert or update an instance record.
    fn save(&self, instance: &Instance) -> StateResult<()>;

    /// Destroy several instances in one call, tagged with a reason.
    fn destroy_multiple(&self, ids: &[InstanceId], reason: &str) -> StateResult<()>;

    /// Destroy every instance in an ensemble group in one call. Returns
    /// the number destroyed.
    fn destroy_group(&self, group_id: &str, reason: &str) -> StateResult<u32>;

    /// Graceful teardown of one instance with a shutdown grace period.
    fn trash(&self, id: InstanceId, timeout_secs: u64, caller: &str) -> StateResult<()>;
}

/// State-store-backed instance home.
pub struct StoreInstanceHome {
    state: StateStore,
}

impl StoreInstanceHome {
    pub fn new(state: StateStore) -> Self {
        Self { state }
    }
}

impl InstanceHome for StoreInstanceHome {
    fn find(&self, id: InstanceId) -> StateResult<Option<Instance>> {
        self.state.get_instance(id)
    }

    fn save(&self, instance: &Instance) -> StateResult<()> {
        self.state.put_instance(instance)
    }

    fn destroy_multiple(&self, ids: &[InstanceId], reason: &str) -> StateResult<()> {
        for &id in ids {
            self.state.delete_instance(id)?;
        }
        info!(count = ids.len(), reason, "instances destroyed");
        Ok(())
    }

    fn destroy_group(&self, group_id: &str, reason: &str) -> StateResult<u32> {
        let mut count = 0;
        for instance in self.state.list_instances()? {
            if instance.ensemble_id.as_deref() == Some(group_id) {
                self.state.delete_instance(instance.id)?;
                count += 1;
            }
        }
        info!(group = group_id, count, reason, "instance group destroyed");
        Ok(count)
    }

    fn trash(&self, id: InstanceId, timeout_secs: u64, caller: &str) -> StateResult<()> {
        debug!(id, timeout_secs, caller, "trashing instance");
        self.state.delete_instance(id)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn instance(id: InstanceId, ensemble: Option<&str>) -> Instance {
        Instance {
            id,
            state: 0,
            hostname: None,
            start_time: None,
            stop_time: None,
            ensemble_id: ensemble.map(str::to_string),
            preemptable: false,
            memory_mb: 256,
            ops_enabled: false,
            caller: "alice".to_string(),
        }
    }

    #[test]
    fn find_save_destroy() {
        let home = StoreInstanceHome::new(StateStore::open_in_memory().unwrap());
        home.save(&instance(1, None)).unwrap();
        home.save(&instance(2, None)).unwrap();

        assert!(home.find(1).unwrap().is_some());
        home.destroy_multiple(&[1, 2], "test").unwrap();
        assert!(home.find(1).unwrap().is_none());
        assert!(home.find(2).unwrap().is_none());
    }

    #[test]
    fn destroy_group_only_hits_members() {
        let home = StoreInstanceHome::new(StateStore::open_in_memory().unwrap());
        home.save(&instance(1, Some("ens-1"))).unwrap();
        home.save(&instance(2, Some("ens-1"))).unwrap();
        home.save(&instance(3, Some("ens-2"))).unwrap();
        home.save(&instance(4, None)).unwrap();

        assert_eq!(home.destroy_group("ens-1", "test").unwrap(), 2);
        assert!(home.find(1).unwrap().is_none());
        assert!(home.find(3).unwrap().is_some());
        assert!(home.find(4).unwrap().is_some());
    }
}
