//! Instance launch/destroy seam for the market tier.
//!
//! The manager decides *how many* instances a request should hold; this
//! trait performs the actual creation and teardown. [`SlotBackedLauncher`]
//! is the production implementation over the pool matcher and state
//! store; tests substitute scripted ones.

use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use tracing::{error, info};

use leasegrid_pool::PoolMatcher;
use leasegrid_scheduler::states::STATE_STARTED;
use leasegrid_scheduler::Scheduler;
use leasegrid_state::{AsyncRequest, Instance, InstanceId, LeaseTask, StateStore};

pub trait InstanceLauncher: Send + Sync {
    /// Launch `count` preemptable instances for the request and return
    /// their ids in allocation order.
    fn launch(&self, request: &AsyncRequest, count: u32) -> anyhow::Result<Vec<InstanceId>>;

    /// Tear down specific instances.
    fn destroy(&self, ids: &[InstanceId], reason: &str) -> anyhow::Result<()>;

    /// Tear down every instance in a backing group in one call.
    fn destroy_group(&self, group_id: &str, reason: &str) -> anyhow::Result<()>;
}

/// Production launcher: reserves matcher slots directly and writes the
/// instance and lease-task rows itself.
///
/// Teardown deliberately does not route through the scheduler's
/// destroying notification: the manager holds its decision lock while
/// tearing down, and that notification would call straight back into the
/// manager's listener.
pub struct SlotBackedLauncher {
    matcher: Arc<PoolMatcher>,
    state: StateStore,
    /// Id minting is shared with the guaranteed tier so ids never collide.
    scheduler: Arc<Scheduler>,
}

impl SlotBackedLauncher {
    pub fn new(matcher: Arc<PoolMatcher>, state: StateStore, scheduler: Arc<Scheduler>) -> Self {
        Self {
            matcher,
            state,
            scheduler,
        }
    }

    fn launch_one(&self, id: InstanceId, request: &AsyncRequest) -> anyhow::Result<()> {
        let hostname = self.matcher.reserve_space(None, request.memory_mb, &[])?;
        let result = self
            .state
            .put_task(&LeaseTask {
                instance_id: id,
                memory_mb: request.memory_mb,
                hostname: Some(hostname.clone()),
                // Market instances have no lease deadline; they run
                // until finished or preempted.
                stop_time: None,
                shutdown_requested: false,
            })
            .and_then(|()| {
                self.state.put_instance(&Instance {
                    id,
                    state: STATE_STARTED,
                    hostname: Some(hostname.clone()),
                    start_time: Some(epoch_secs()),
                    stop_time: None,
                    ensemble_id: request.group_id.clone(),
                    preemptable: true,
                    memory_mb: request.memory_mb,
                    ops_enabled: true,
                    caller: request.caller.clone(),
                })
            });
        if let Err(e) = result {
            // Unwind the slot so a failed row write cannot leak memory.
            if let Err(retire) = self.matcher.retire_mem(&hostname, request.memory_mb) {
                error!(id, error = %retire, "slot unwind failed after write error");
            }
            let _ = self.state.delete_task(id);
            return Err(e.into());
        }
        Ok(())
    }

    fn destroy_one(&self, id: InstanceId) -> anyhow::Result<()> {
        if let Some(task) = self.state.get_task(id)? {
            if let Some(hostname) = &task.hostname {
                self.matcher.retire_mem(hostname, task.memory_mb)?;
            }
            self.state.delete_task(id)?;
        }
        self.state.delete_instance(id)?;
        Ok(())
    }
}

impl InstanceLauncher for SlotBackedLauncher {
    fn launch(&self, request: &AsyncRequest, count: u32) -> anyhow::Result<Vec<InstanceId>> {
        let ids = self.scheduler.allocate_ids(count);
        let mut created: Vec<InstanceId> = Vec::new();
        for &id in &ids {
            if let Err(e) = self.launch_one(id, request) {
                // Best-effort backout of the batch, continuing past
                // individual failures.
                for &done in &created {
                    if let Err(unwind) = self.destroy_one(done) {
                        error!(id = done, error = %unwind, "launch backout failed, continuing");
                    }
                }
                return Err(e);
            }
            created.push(id);
        }
        info!(request = %request.id, count, "market instances launched");
        Ok(ids)
    }

    fn destroy(&self, ids: &[InstanceId], reason: &str) -> anyhow::Result<()> {
        let mut first_error = None;
        for &id in ids {
            if let Err(e) = self.destroy_one(id) {
                error!(id, error = %e, "teardown failed, continuing");
                first_error.get_or_insert(e);
            }
        }
        info!(count = ids.len(), reason, "market instances destroyed");
        match first_error {
            None => Ok(()),
            Some(e) => Err(e),
        }
    }

    fn destroy_group(&self, group_id: &str, reason: &str) -> anyhow::Result<()> {
        let members: Vec<InstanceId> = self
            .state
            .list_instances()?
            .into_iter()
            .filter(|i| i.preemptable && i.ensemble_id.as_deref() == Some(group_id))
            .map(|i| i.id)
            .collect();
        self.destroy(&members, reason)
    }
}

fn epoch_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

#[cfg(test)]
mod tests {
    use super::*;
    use leasegrid_pool::{EntryDefinition, PoolDefinition};
    use leasegrid_scheduler::{PoolSlotManager, StoreInstanceHome};
    use leasegrid_state::AsyncStatus;

    fn fixture(node_mb: u64) -> (StateStore, Arc<PoolMatcher>, SlotBackedLauncher) {
        let state = StateStore::open_in_memory().unwrap();
        let defs = vec![PoolDefinition {
            name: "default".to_string(),
            source_mtime: 1,
            entries: vec![EntryDefinition {
                hostname: "n1".to_string(),
                mem_max: node_mb,
                associations: "*".to_string(),
            }],
        }];
        let matcher = Arc::new(PoolMatcher::open(state.clone(), defs).unwrap());
        let home = Arc::new(StoreInstanceHome::new(state.clone()));
        let slots = Arc::new(PoolSlotManager::new(matcher.clone(), state.clone(), None));
        let scheduler =
            Arc::new(Scheduler::new(state.clone(), home, slots).unwrap());
        let launcher = SlotBackedLauncher::new(matcher.clone(), state.clone(), scheduler);
        (state, matcher, launcher)
    }

    fn request(group: Option<&str>) -> AsyncRequest {
        AsyncRequest {
            id: "sir-1".to_string(),
            spot: true,
            max_bid: 0.10,
            persistent: false,
            status: AsyncStatus::Open,
            caller: "alice".to_string(),
            group_id: group.map(str::to_string),
            instance_count: 2,
            memory_mb: 256,
            allocated_vms: Vec::new(),
            finished_vms: Vec::new(),
            to_be_preempted: Vec::new(),
            creation_time: 0,
            error: None,
        }
    }

    #[test]
    fn launch_creates_records_and_consumes_capacity() {
        let (state, matcher, launcher) = fixture(1024);
        let ids = launcher.launch(&request(None), 2).unwrap();

        assert_eq!(ids.len(), 2);
        assert_eq!(matcher.totals().free_mb, 512);
        for &id in &ids {
            let instance = state.get_instance(id).unwrap().unwrap();
            assert!(instance.preemptable);
            assert!(instance.ops_enabled);
            assert_eq!(instance.state, STATE_STARTED);
            let task = state.get_task(id).unwrap().unwrap();
            assert!(task.stop_time.is_none());
        }
    }

    #[test]
    fn destroy_returns_capacity_and_drops_records() {
        let (state, matcher, launcher) = fixture(1024);
        let ids = launcher.launch(&request(None), 2).unwrap();

        launcher.destroy(&ids, "test").unwrap();
        assert_eq!(matcher.totals().free_mb, 1024);
        for &id in &ids {
            assert!(state.get_instance(id).unwrap().is_none());
            assert!(state.get_task(id).unwrap().is_none());
        }
    }

    #[test]
    fn over_capacity_launch_backs_out_whole_batch() {
        let (state, matcher, launcher) = fixture(256);
        let err = launcher.launch(&request(None), 2);

        assert!(err.is_err());
        assert_eq!(matcher.totals().free_mb, 256);
        assert!(state.list_instances().unwrap().is_empty());
        assert!(state.list_tasks().unwrap().is_empty());
    }

    #[test]
    fn group_destroy_only_hits_preemptable_members() {
        let (state, matcher, launcher) = fixture(2048);
        launcher.launch(&request(Some("grp-1")), 2).unwrap();

        // A guaranteed instance in the same ensemble must survive.
        state
            .put_instance(&Instance {
                id: 999,
                state: STATE_STARTED,
                hostname: Some("n1".to_string()),
                start_time: None,
                stop_time: None,
                ensemble_id: Some("grp-1".to_string()),
                preemptable: false,
                memory_mb: 256,
                ops_enabled: true,
                caller: "alice".to_string(),
            })
            .unwrap();

        launcher.destroy_group("grp-1", "test").unwrap();
        assert_eq!(matcher.totals().free_mb, 2048);
        let left = state.list_instances().unwrap();
        assert_eq!(left.len(), 1);
        assert_eq!(left[0].id, 999);
    }
}
