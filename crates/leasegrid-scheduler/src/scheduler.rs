//! Scheduler — converts resource requests into slot reservations and
//! reconciles instance lifecycle notifications.
//!
//! The scheduler is the control point that:
//! - Allocates instance ids and asks the slot manager for placements
//! - Accumulates co-scheduled (ensemble) batches under per-group locks
//! - Tracks the creation-pending window so notifications racing ahead of
//!   record creation retry instead of failing
//! - Publishes typed lifecycle events to a fixed set of subscribers
//! - Exposes the query surface the lease sweeper polls

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use tracing::{debug, error, info, warn};

use leasegrid_state::{Instance, InstanceId, LeaseTask, StateStore};

use crate::error::{SchedulerError, SchedulerResult};
use crate::events::{SpaceReclaimer, StateChangeListener};
use crate::home::InstanceHome;
use crate::locks::LockRegistry;
use crate::pending::PendingSet;
use crate::slots::SlotManager;
use crate::states::*;
use crate::types::{NodeRequest, Reservation};

/// Optional payload accompanying a state notification.
#[derive(Debug, Clone, Default)]
pub struct NotificationInfo {
    pub start_time: Option<u64>,
    pub stop_time: Option<u64>,
    pub hostname: Option<String>,
}

/// Typed lookup result: the retry-vs-fatal branch is explicit in the
/// type instead of inferred from exception identity.
#[derive(Debug)]
pub enum Lookup {
    Found(Instance),
    /// Not visible yet, but its creation is in flight — retry.
    NotFoundPending,
    /// Not visible and not pending — a genuine inconsistency.
    NotFoundInconsistent,
}

/// Accumulated, not-yet-finalized co-scheduling group.
#[derive(Default)]
struct CoschedGroup {
    done: bool,
    requests: Vec<NodeRequest>,
}

/// The scheduler adapter.
pub struct Scheduler {
    state: StateStore,
    home: Arc<dyn InstanceHome>,
    slots: Arc<dyn SlotManager>,
    pending: PendingSet,
    locks: LockRegistry,
    listeners: Mutex<Vec<Arc<dyn StateChangeListener>>>,
    reclaimer: Mutex<Option<Arc<dyn SpaceReclaimer>>>,
    groups: Mutex<HashMap<String, CoschedGroup>>,
    next_id: AtomicU64,
    /// Bounded creation-pending poll: capped attempts, short fixed sleep.
    /// The one deliberate bounded wait in notification handling.
    poll_attempts: u32,
    poll_interval: Duration,
}

impl Scheduler {
    pub fn new(
        state: StateStore,
        home: Arc<dyn InstanceHome>,
        slots: Arc<dyn SlotManager>,
    ) -> SchedulerResult<Self> {
        let next_id = state.max_instance_id()? + 1;
        Ok(Self {
            state,
            home,
            slots,
            pending: PendingSet::new(),
            locks: LockRegistry::default(),
            listeners: Mutex::new(Vec::new()),
            reclaimer: Mutex::new(None),
            groups: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(next_id),
            poll_attempts: 10,
            poll_interval: Duration::from_millis(50),
        })
    }

    /// Register a lifecycle event subscriber. The set is fixed at
    /// composition time.
    pub fn add_listener(&self, listener: Arc<dyn StateChangeListener>) {
        self.listeners
            .lock()
            .expect("listener list poisoned")
            .push(listener);
    }

    /// Wire the market-tier reclaimer used for one retry after a
    /// capacity denial.
    pub fn set_reclaimer(&self, reclaimer: Arc<dyn SpaceReclaimer>) {
        *self.reclaimer.lock().expect("reclaimer poisoned") = Some(reclaimer);
    }

    /// True while any id is inside its creation-pending window.
    pub fn has_pending_creations(&self) -> bool {
        !self.pending.is_empty()
    }

    // ── Scheduling ─────────────────────────────────────────────────

    /// Turn a resource request into a reservation.
    ///
    /// Without `cosched_id` the whole batch is placed immediately. With
    /// one, the batch is appended to the named ensemble under its group
    /// lock and an empty (deferred) reservation is returned; placement
    /// happens in [`Scheduler::proceed_coschedule`].
    #[allow(clippy::too_many_arguments)]
    pub async fn schedule(
        &self,
        memory_mb: u64,
        duration_secs: u64,
        associations: Vec<String>,
        num_nodes: u32,
        group_id: Option<String>,
        cosched_id: Option<String>,
    ) -> SchedulerResult<Reservation> {
        if num_nodes == 0 {
            return Err(SchedulerError::Denied("zero nodes requested".to_string()));
        }

        let ids = self.allocate_ids(num_nodes);
        // The pending window must open before any notification about
        // these ids could possibly arrive.
        self.pending.mark_all(&ids);

        let request = NodeRequest {
            ids: ids.clone(),
            memory_mb,
            duration_secs,
            associations,
            group_id,
        };

        let result = match cosched_id {
            None => self.schedule_immediate(&request),
            Some(cid) => self.schedule_coscheduled(request.clone(), &cid).await,
        };

        if result.is_err() {
            // Later notification lookups must not be stuck believing a
            // create race is in progress.
            self.pending.clear_all(&ids);
        }
        result
    }

    /// Mint fresh instance ids. Shared with collaborators that create
    /// instances outside the schedule path, so ids never collide.
    pub fn allocate_ids(&self, count: u32) -> Vec<InstanceId> {
        let first = self.next_id.fetch_add(u64::from(count), Ordering::SeqCst);
        (first..first + u64::from(count)).collect()
    }

    fn schedule_immediate(&self, request: &NodeRequest) -> SchedulerResult<Reservation> {
        let reservation = match self.slots.reserve_space(request) {
            Ok(r) => r,
            Err(SchedulerError::Denied(reason)) => self.retry_after_reclaim(request, reason)?,
            Err(e) => return Err(e),
        };

        if reservation.is_empty() && self.slots.is_best_effort() {
            // Accepted, placement deferred to slot_reserved.
            return Ok(reservation);
        }

        if reservation.len() != request.ids.len() {
            error!(
                expected = request.ids.len(),
                got = reservation.len(),
                "reservation length mismatch, backing out all partial allocations"
            );
            for &id in &reservation.ids {
                if let Err(e) = self.slots.release_space(id) {
                    error!(id, error = %e, "backout release failed, continuing");
                }
            }
            return Err(SchedulerError::Denied(
                "internal scheduling inconsistency, request aborted".to_string(),
            ));
        }

        // Uniform lease window across the batch.
        let start = epoch_secs();
        let stop = start + request.duration_secs;
        for &id in &request.ids {
            if let Some(mut task) = self.state.get_task(id)? {
                task.stop_time = Some(stop);
                self.state.put_task(&task)?;
            }
        }

        debug!(
            nodes = reservation.len(),
            memory_mb = request.memory_mb,
            stop,
            "batch scheduled"
        );
        Ok(reservation)
    }

    /// One reclaim-and-retry round after a capacity denial, when a
    /// market-tier reclaimer is wired. The reclaim call blocks until the
    /// reduced ceiling has already triggered its preemptions.
    fn retry_after_reclaim(
        &self,
        request: &NodeRequest,
        reason: String,
    ) -> SchedulerResult<Reservation> {
        let reclaimer = self.reclaimer.lock().expect("reclaimer poisoned").clone();
        let Some(reclaimer) = reclaimer else {
            return Err(SchedulerError::Denied(reason));
        };

        let wanted = request.memory_mb * request.ids.len() as u64;
        info!(wanted_mb = wanted, "denied for capacity, reclaiming from market tier");
        if let Err(e) = reclaimer.release_space(wanted) {
            warn!(error = %e, "market reclaim failed");
            return Err(SchedulerError::Denied(reason));
        }
        self.slots.reserve_space(request)
    }

    async fn schedule_coscheduled(
        &self,
        request: NodeRequest,
        cosched_id: &str,
    ) -> SchedulerResult<Reservation> {
        if !self.slots.supports_coscheduling() {
            return Err(SchedulerError::Denied(
                "slot manager cannot co-schedule".to_string(),
            ));
        }

        let _guard = self.locks.lock(cosched_id).await?;
        {
            let mut groups = self.groups.lock().expect("group map poisoned");
            let group = groups.entry(cosched_id.to_string()).or_default();
            if group.done {
                return Err(SchedulerError::Denied(format!(
                    "ensemble '{cosched_id}' already finalized"
                )));
            }
            group.requests.push(request);
        }
        debug!(ensemble = cosched_id, "batch appended, placement deferred");
        Ok(Reservation::deferred())
    }

    /// Finalize a co-scheduling group: jointly place every accumulated
    /// batch and mark the group done.
    pub async fn proceed_coschedule(&self, cosched_id: &str) -> SchedulerResult<()> {
        let _guard = self.locks.lock(cosched_id).await?;

        let requests = {
            let groups = self.groups.lock().expect("group map poisoned");
            let group = groups.get(cosched_id).ok_or_else(|| {
                SchedulerError::Denied(format!("unknown ensemble '{cosched_id}'"))
            })?;
            if group.done {
                return Err(SchedulerError::Denied(format!(
                    "ensemble '{cosched_id}' already finalized"
                )));
            }
            group.requests.clone()
        };
        if requests.is_empty() {
            return Err(SchedulerError::Denied(format!(
                "ensemble '{cosched_id}' has no accumulated requests"
            )));
        }

        let reservation = self.slots.reserve_coscheduled_space(&requests)?;

        if reservation.is_empty() && !self.slots.is_best_effort() {
            return Err(SchedulerError::Scheduling(
                "concrete slot manager returned an empty joint placement".to_string(),
            ));
        }

        // Point of no return: the group is finalized and its tracked
        // requests dropped before individual notifications go out.
        {
            let mut groups = self.groups.lock().expect("group map poisoned");
            if let Some(group) = groups.get_mut(cosched_id) {
                group.done = true;
                group.requests.clear();
            }
        }

        if !self.slots.is_best_effort() {
            let default_duration = requests[0].duration_secs;
            let mut first_error = None;
            for (idx, &id) in reservation.ids.iter().enumerate() {
                let duration = reservation.duration_for(idx, default_duration);
                let hostname = reservation.hostnames[idx].clone();
                if let Err(e) = self.slot_reserved(id, duration, &hostname).await {
                    error!(id, error = %e, "slot-reserved delivery failed, continuing");
                    first_error.get_or_insert(e);
                }
            }
            if let Some(e) = first_error {
                return Err(e);
            }
        }

        info!(
            ensemble = cosched_id,
            placed = reservation.len(),
            "co-scheduling group finalized"
        );
        self.locks.gc();
        Ok(())
    }

    /// Deferred-placement notification: a slot is now concrete for `id`.
    /// Updates the lease deadline, populates the instance, and activates
    /// it — the delayed equivalent of the first-legal branch.
    pub async fn slot_reserved(
        &self,
        id: InstanceId,
        duration_secs: u64,
        hostname: &str,
    ) -> SchedulerResult<()> {
        let start = epoch_secs();
        let stop = start + duration_secs;

        if let Some(mut task) = self.state.get_task(id)? {
            task.stop_time = Some(stop);
            self.state.put_task(&task)?;
        }

        match self.lookup(id).await? {
            Lookup::Found(mut instance) => {
                instance.hostname = Some(hostname.to_string());
                instance.start_time = Some(start);
                instance.stop_time = Some(stop);
                instance.ops_enabled = true;
                if instance.state < STATE_FIRST_LEGAL {
                    instance.state = STATE_FIRST_LEGAL;
                }
                self.home.save(&instance)?;
                self.pending.clear(id);
                self.publish_scheduled(&[id]);
                Ok(())
            }
            _ => {
                self.pending.clear(id);
                error!(id, hostname, "no instance record behind a reserved slot");
                Err(SchedulerError::Scheduling(format!(
                    "instance {id} not found for slot-reserved notification"
                )))
            }
        }
    }

    // ── Notifications ──────────────────────────────────────────────

    /// Central reconciliation point for lifecycle transitions, called by
    /// whatever owns instance state changes.
    pub async fn state_notification(
        &self,
        id: InstanceId,
        state: i32,
        info: NotificationInfo,
    ) -> SchedulerResult<()> {
        if !is_valid_state(state) {
            return Err(SchedulerError::Scheduling(format!(
                "invalid state {state} ({}) for instance {id}",
                state_name(state)
            )));
        }

        match state {
            STATE_DESTROYING => self.handle_destroying(id),
            STATE_FIRST_LEGAL => self.handle_first_legal(id, info).await,
            STATE_READYING_FOR_TRANSPORT => self.handle_readying_for_transport(id),
            other => {
                if let Some(mut instance) = self.home.find(id)? {
                    instance.state = other;
                    self.home.save(&instance)?;
                }
                debug!(id, state = %state_name(other), "state recorded");
                Ok(())
            }
        }
    }

    fn handle_destroying(&self, id: InstanceId) -> SchedulerResult<()> {
        // Guards against double notifications during backout-during-create.
        self.pending.clear(id);

        // A lost release is logged at high severity but never blocks the
        // transition; the capacity leak is an operator concern, the
        // destroy must proceed.
        if let Err(e) = self.slots.release_space(id) {
            error!(id, error = %e, "slot release failed during destroy, capacity may leak");
        }

        if let Some(mut instance) = self.home.find(id)? {
            instance.state = STATE_DESTROYING;
            instance.ops_enabled = false;
            self.home.save(&instance)?;
        }

        let listeners = self.listeners.lock().expect("listener list poisoned").clone();
        for listener in listeners {
            listener.instance_destroying(id);
        }
        debug!(id, "destroying notification processed");
        Ok(())
    }

    async fn handle_first_legal(
        &self,
        id: InstanceId,
        info: NotificationInfo,
    ) -> SchedulerResult<()> {
        let instance = match self.lookup(id).await? {
            Lookup::Found(instance) => instance,
            _ => {
                self.pending.clear(id);
                error!(
                    id,
                    ?info,
                    "first-legal notification for an instance that never became visible"
                );
                return Err(SchedulerError::Scheduling(format!(
                    "instance {id} not found after creation-pending window"
                )));
            }
        };

        // Exactly one clear per id, regardless of branch.
        self.pending.clear(id);

        let task = self.state.get_task(id)?;
        let stop_time = info.stop_time.or(task.as_ref().and_then(|t| t.stop_time));

        match stop_time {
            None if self.slots.is_best_effort() || instance.ensemble_id.is_some() => {
                // Delayed placement; the eventual slot_reserved call
                // re-delivers this.
                debug!(id, "no concrete stop time yet, awaiting slot-reserved");
                Ok(())
            }
            None => Err(SchedulerError::Scheduling(format!(
                "no stop time known for concretely placed instance {id}"
            ))),
            Some(stop) => {
                let mut instance = instance;
                if let Some(mut task) = task {
                    task.stop_time = Some(stop);
                    self.state.put_task(&task)?;
                }
                if let Some(hostname) = info.hostname {
                    instance.hostname = Some(hostname);
                }
                instance.start_time = Some(info.start_time.unwrap_or_else(epoch_secs));
                instance.stop_time = Some(stop);
                instance.state = STATE_FIRST_LEGAL;
                instance.ops_enabled = true;
                self.home.save(&instance)?;

                self.publish_scheduled(&[id]);
                debug!(id, stop, "instance activated");
                Ok(())
            }
        }
    }

    fn handle_readying_for_transport(&self, id: InstanceId) -> SchedulerResult<()> {
        if let Some(mut instance) = self.home.find(id)? {
            instance.ops_enabled = false;
            instance.state = STATE_READYING_FOR_TRANSPORT;
            self.home.save(&instance)?;
        }
        // Irreversible once reached.
        if let Some(mut task) = self.state.get_task(id)? {
            task.shutdown_requested = true;
            self.state.put_task(&task)?;
        }
        debug!(id, "shutdown requested, client operations disabled");
        Ok(())
    }

    fn publish_scheduled(&self, ids: &[InstanceId]) {
        let listeners = self.listeners.lock().expect("listener list poisoned").clone();
        for listener in listeners {
            listener.instances_scheduled(ids);
        }
    }

    // ── Lookup with the creation-pending window ────────────────────

    /// Single-shot typed lookup.
    pub fn lookup_once(&self, id: InstanceId) -> SchedulerResult<Lookup> {
        match self.home.find(id)? {
            Some(instance) => Ok(Lookup::Found(instance)),
            None if self.pending.is_pending(id) => Ok(Lookup::NotFoundPending),
            None => Ok(Lookup::NotFoundInconsistent),
        }
    }

    /// Lookup with bounded polling across the creation-pending window:
    /// capped attempts with a short fixed sleep, then the miss is treated
    /// as a genuine inconsistency.
    async fn lookup(&self, id: InstanceId) -> SchedulerResult<Lookup> {
        for attempt in 0..self.poll_attempts {
            match self.lookup_once(id)? {
                Lookup::NotFoundPending => {
                    debug!(id, attempt, "creation pending, retrying lookup");
                    tokio::time::sleep(self.poll_interval).await;
                }
                resolved => return Ok(resolved),
            }
        }
        warn!(id, attempts = self.poll_attempts, "creation-pending window exhausted");
        Ok(Lookup::NotFoundInconsistent)
    }

    // ── Sweep query surface ────────────────────────────────────────

    /// Instances whose lease expired and whose shutdown has not yet been
    /// requested.
    pub fn tasks_to_shutdown(&self, now: u64) -> SchedulerResult<Vec<InstanceId>> {
        Ok(self
            .state
            .list_tasks()?
            .into_iter()
            .filter(|t| !t.shutdown_requested && t.stop_time.is_some_and(|s| s <= now))
            .map(|t| t.instance_id)
            .collect())
    }

    /// True while any lease task rows remain.
    pub fn any_left(&self) -> SchedulerResult<bool> {
        Ok(!self.state.list_tasks()?.is_empty())
    }

    /// Direct task access for collaborators that must inspect slots.
    pub fn task(&self, id: InstanceId) -> SchedulerResult<Option<LeaseTask>> {
        Ok(self.state.get_task(id)?)
    }
}

/// Current Unix epoch in seconds.
pub(crate) fn epoch_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}
