//! The async request manager: admission, the price-and-allocate cycle,
//! proportional preemption, and the fluctuating capacity ceiling.
//!
//! Every decision method serializes on one manager-wide mutex; the cycle
//! is a read-modify-write over price, ceiling, and the request
//! collection, and concurrent triggers must not interleave. Request
//! mutations are written through to the store before the method returns.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{SystemTime, UNIX_EPOCH};

use tracing::{debug, error, info, warn};

use leasegrid_pool::PoolMatcher;
use leasegrid_scheduler::{SpaceReclaimer, StateChangeListener};
use leasegrid_state::{
    AsyncRequest, AsyncStatus, InstanceId, PricePoint, RequestId, StateStore,
};

use crate::error::{MarketError, MarketResult};
use crate::filter;
use crate::launch::InstanceLauncher;
use crate::pricing::PricingModel;

/// Market tier policy knobs.
#[derive(Debug, Clone)]
pub struct MarketSettings {
    pub spot_enabled: bool,
    pub backfill_enabled: bool,
    /// Price floor; spot bids under it are denied at admission.
    pub min_price: f64,
    /// Target guaranteed-tier utilization in (0, 1]; drives the reserve.
    pub max_utilization: f64,
    /// Memory always held back for the guaranteed tier (MB).
    pub min_reserved_mb: u64,
    /// Memory per market instance (MB); the ceiling is counted in these.
    pub instance_mem_mb: u64,
}

/// Admission parameters for a new async request.
#[derive(Debug, Clone)]
pub struct AsyncCreate {
    pub spot: bool,
    /// Ignored for backfill; those carry the 0.0 sentinel.
    pub max_bid: f64,
    pub persistent: bool,
    pub caller: String,
    pub group_id: Option<String>,
    pub instance_count: u32,
    pub memory_mb: u64,
}

/// Shared mutable market state, guarded by the manager-wide mutex.
struct Inner {
    /// BTreeMap so cycle passes walk requests in a stable order.
    requests: BTreeMap<RequestId, AsyncRequest>,
    /// Instance id → owning request, for listener dispatch.
    vm_index: HashMap<InstanceId, RequestId>,
    current_price: f64,
    /// Market ceiling in instances.
    max_vms: u32,
    /// Timestamp of the last history point, to keep keys unique when
    /// several price changes land in the same millisecond.
    last_price_ts: u64,
}

pub struct AsyncRequestManager {
    state: StateStore,
    matcher: Arc<PoolMatcher>,
    launcher: Arc<dyn InstanceLauncher>,
    pricing: Box<dyn PricingModel>,
    settings: MarketSettings,
    seq: AtomicU64,
    inner: Mutex<Inner>,
}

impl AsyncRequestManager {
    /// Load persisted requests and the last known price. The ceiling
    /// stays zero until [`AsyncRequestManager::init`] runs with pools
    /// populated.
    pub fn new(
        state: StateStore,
        matcher: Arc<PoolMatcher>,
        launcher: Arc<dyn InstanceLauncher>,
        pricing: Box<dyn PricingModel>,
        settings: MarketSettings,
    ) -> MarketResult<Self> {
        let mut requests = BTreeMap::new();
        let mut vm_index = HashMap::new();
        for request in state.list_async_requests()? {
            for &vm in &request.allocated_vms {
                vm_index.insert(vm, request.id.clone());
            }
            requests.insert(request.id.clone(), request);
        }
        let latest = state.latest_price()?;
        let last_price_ts = latest.as_ref().map(|p| p.timestamp).unwrap_or(0);
        let current_price = latest.map(|p| p.price).unwrap_or(settings.min_price);
        info!(
            requests = requests.len(),
            price = current_price,
            "async request manager loaded"
        );
        Ok(Self {
            state,
            matcher,
            launcher,
            pricing,
            settings,
            seq: AtomicU64::new(1),
            inner: Mutex::new(Inner {
                requests,
                vm_index,
                current_price,
                max_vms: 0,
                last_price_ts,
            }),
        })
    }

    /// One-time hook after the guaranteed pool is known populated:
    /// seeds the price history, computes the first ceiling, and runs a
    /// full cycle.
    pub fn init(&self) -> MarketResult<()> {
        let mut inner = self.lock_inner();
        if self.state.latest_price()?.is_none() {
            let price = inner.current_price;
            self.record_price(&mut inner, price);
        }
        inner.max_vms = self.market_ceiling(&inner);
        info!(
            max_vms = inner.max_vms,
            price = inner.current_price,
            "market initialized"
        );
        self.change_price_and_allocate(&mut inner);
        Ok(())
    }

    // ── Admission and cancellation ─────────────────────────────────

    pub fn add_request(&self, create: AsyncCreate) -> MarketResult<AsyncRequest> {
        if create.instance_count == 0 {
            return Err(MarketError::Denied("zero instances requested".to_string()));
        }
        if create.spot {
            if !self.settings.spot_enabled {
                return Err(MarketError::Denied("spot tier is disabled".to_string()));
            }
            if create.max_bid < self.settings.min_price {
                return Err(MarketError::Denied(format!(
                    "bid {} is below the price floor {}",
                    create.max_bid, self.settings.min_price
                )));
            }
        } else if !self.settings.backfill_enabled {
            return Err(MarketError::Denied("backfill tier is disabled".to_string()));
        }

        let id = self.next_id(create.spot);
        let request = AsyncRequest {
            id: id.clone(),
            spot: create.spot,
            // Backfill sits below every live spot bid.
            max_bid: if create.spot { create.max_bid } else { 0.0 },
            persistent: create.persistent,
            status: AsyncStatus::Open,
            caller: create.caller,
            group_id: create.group_id,
            instance_count: create.instance_count,
            memory_mb: create.memory_mb,
            allocated_vms: Vec::new(),
            finished_vms: Vec::new(),
            to_be_preempted: Vec::new(),
            creation_time: epoch_secs(),
            error: None,
        };

        // Durable before any allocation decision.
        self.state.put_async_request(&request)?;

        let mut inner = self.lock_inner();
        inner.requests.insert(id.clone(), request);
        info!(request = %id, spot = create.spot, "async request admitted");
        if create.spot {
            self.change_price_and_allocate(&mut inner);
        } else {
            // Backfill never moves the price.
            self.allocate_backfill(&mut inner);
        }
        inner
            .requests
            .get(&id)
            .cloned()
            .ok_or(MarketError::NotFound(id))
    }

    /// Cancel a request, tearing down whatever it holds. A second cancel
    /// is a status no-op and returns the unchanged record.
    pub fn cancel_request(&self, id: &str) -> MarketResult<AsyncRequest> {
        let mut inner = self.lock_inner();
        let held = {
            let Some(request) = inner.requests.get_mut(id) else {
                return Err(MarketError::NotFound(id.to_string()));
            };
            if !request.set_status(AsyncStatus::Cancelled) {
                return Ok(request.clone());
            }
            self.persist(request);
            request.allocated_instances()
        };
        info!(request = id, held, "async request cancelled");
        if held > 0 {
            self.preempt(&mut inner, id, held);
            // Freed capacity goes back into the market.
            self.change_price_and_allocate(&mut inner);
        }
        inner
            .requests
            .get(id)
            .cloned()
            .ok_or_else(|| MarketError::NotFound(id.to_string()))
    }

    pub fn cancel_requests(&self, ids: &[String]) -> MarketResult<Vec<AsyncRequest>> {
        ids.iter().map(|id| self.cancel_request(id)).collect()
    }

    // ── Queries ────────────────────────────────────────────────────

    pub fn get_request(&self, id: &str) -> Option<AsyncRequest> {
        self.lock_inner().requests.get(id).cloned()
    }

    pub fn get_requests_by_caller(&self, caller: &str, spot: bool) -> Vec<AsyncRequest> {
        let inner = self.lock_inner();
        filter::by_caller(inner.requests.values(), caller, spot)
            .into_iter()
            .cloned()
            .collect()
    }

    pub fn spot_price(&self) -> f64 {
        self.lock_inner().current_price
    }

    pub fn price_history(&self, start: u64, end: u64) -> MarketResult<Vec<PricePoint>> {
        Ok(self.state.list_prices(start, end)?)
    }

    pub fn max_vms(&self) -> u32 {
        self.lock_inner().max_vms
    }

    pub fn alive_backfill_count(&self) -> usize {
        let inner = self.lock_inner();
        filter::alive_backfill(inner.requests.values()).len()
    }

    // ── Capacity ceiling ───────────────────────────────────────────

    /// Recompute the ceiling from current guaranteed-tier usage and run
    /// the cycle if it moved. Called on every guaranteed-tier change.
    pub fn recalculate_max_vms(&self) {
        let mut inner = self.lock_inner();
        let ceiling = self.market_ceiling(&inner);
        self.change_max_vms(&mut inner, ceiling);
    }

    /// Blocking capacity handback: by the time this returns, the reduced
    /// ceiling has already triggered whatever preemptions were needed.
    pub fn release_space(&self, memory_mb: u64) -> MarketResult<()> {
        let mut inner = self.lock_inner();
        let held = self.market_memory(&inner);
        let to_free = memory_mb.min(held);
        let ceiling = ((held - to_free) / self.settings.instance_mem_mb) as u32;
        info!(requested_mb = memory_mb, freeing_mb = to_free, ceiling, "market space handback");
        self.change_max_vms(&mut inner, ceiling);
        Ok(())
    }

    fn change_max_vms(&self, inner: &mut Inner, ceiling: u32) {
        if ceiling == inner.max_vms {
            return;
        }
        info!(from = inner.max_vms, to = ceiling, "market ceiling changed");
        inner.max_vms = ceiling;
        self.change_price_and_allocate(inner);
    }

    /// `reserved = max((1-u)/u * used_guaranteed, min_reserved)`;
    /// `avail = max((free + used_market) - reserved, 0)`.
    fn market_ceiling(&self, inner: &Inner) -> u32 {
        let totals = self.matcher.totals();
        let used_total = totals.max_mb.saturating_sub(totals.free_mb);
        let used_market = self.market_memory(inner);
        let used_guaranteed = used_total.saturating_sub(used_market);

        let ratio = (1.0 - self.settings.max_utilization) / self.settings.max_utilization;
        let reserved =
            ((ratio * used_guaranteed as f64) as u64).max(self.settings.min_reserved_mb);
        let avail = (totals.free_mb + used_market).saturating_sub(reserved);
        (avail / self.settings.instance_mem_mb) as u32
    }

    /// Memory currently held by alive market requests (MB).
    fn market_memory(&self, inner: &Inner) -> u64 {
        filter::alive(inner.requests.values())
            .iter()
            .map(|r| u64::from(r.allocated_instances()) * r.memory_mb)
            .sum()
    }

    // ── The price-and-allocate cycle ───────────────────────────────

    fn change_price_and_allocate(&self, inner: &mut Inner) {
        self.update_price(inner);
        self.allocate_requests(inner);
        if inner.max_vms == 0 {
            // Price must reflect that nothing fits.
            self.update_price(inner);
        }
    }

    fn update_price(&self, inner: &mut Inner) {
        let alive = filter::alive_spot(inner.requests.values());
        let next = self
            .pricing
            .next_price(inner.max_vms, &alive, inner.current_price);
        if next != inner.current_price {
            info!(from = inner.current_price, to = next, "spot price changed");
            inner.current_price = next;
            self.record_price(inner, next);
        }
    }

    /// Append to the price history with a strictly increasing timestamp.
    fn record_price(&self, inner: &mut Inner, price: f64) {
        let ts = epoch_millis().max(inner.last_price_ts + 1);
        inner.last_price_ts = ts;
        let point = PricePoint {
            timestamp: ts,
            price,
        };
        if let Err(e) = self.state.put_price(&point) {
            error!(error = %e, "price history write failed");
        }
    }

    /// Fixed-order allocation pass: preempt under-bids, fit backfill,
    /// share the equal-bid tier evenly, satisfy higher bids in full.
    fn allocate_requests(&self, inner: &mut Inner) {
        let price = inner.current_price;

        let under: Vec<(RequestId, u32)> = filter::lower_than(inner.requests.values(), price)
            .into_iter()
            .filter(|r| r.allocated_instances() > 0)
            .map(|r| (r.id.clone(), r.allocated_instances()))
            .collect();
        for (id, held) in under {
            debug!(request = %id, held, price, "bid under clearing price, preempting");
            self.preempt(inner, &id, held);
        }

        self.allocate_backfill(inner);

        // Equal-bid tier shares whatever the higher bids leave.
        let (higher_needed, equal_ids, equal_held) = {
            let values: Vec<&AsyncRequest> = inner.requests.values().collect();
            let higher = filter::higher_than(values.iter().copied(), price);
            let equal = filter::equal_price(values.iter().copied(), price);
            (
                filter::needed_instances(&higher),
                ids_by_age(&equal),
                filter::allocated_instances(&equal),
            )
        };
        let equal_avail = inner.max_vms.saturating_sub(higher_needed);
        if equal_held > equal_avail {
            self.preempt_proportionally(inner, &equal_ids, equal_held - equal_avail);
        } else {
            self.allocate_evenly(inner, &equal_ids, equal_avail - equal_held);
        }

        // Higher bids are never capacity-constrained relative to equal
        // or lower bids; they preempt them instead.
        let higher_ids: Vec<RequestId> = filter::higher_than(inner.requests.values(), price)
            .into_iter()
            .filter(|r| r.is_hungry())
            .map(|r| r.id.clone())
            .collect();
        for id in higher_ids {
            let unmet = inner
                .requests
                .get(&id)
                .map(|r| r.unallocated_instances())
                .unwrap_or(0);
            self.allocate_to(inner, &id, unmet);
        }
    }

    /// Backfill gets the capacity left after demand from every spot bid
    /// at or above the clearing price, shrinking if spot demand grew.
    fn allocate_backfill(&self, inner: &mut Inner) {
        let price = inner.current_price;
        let (spot_demand, backfill_ids, backfill_held) = {
            let values: Vec<&AsyncRequest> = inner.requests.values().collect();
            let at_or_above: Vec<&AsyncRequest> = values
                .iter()
                .copied()
                .filter(|r| r.is_alive() && r.spot && r.max_bid >= price)
                .collect();
            let backfill = filter::alive_backfill(values.iter().copied());
            (
                filter::needed_instances(&at_or_above),
                ids_by_age(&backfill),
                filter::allocated_instances(&backfill),
            )
        };
        let available = inner.max_vms.saturating_sub(spot_demand);
        if backfill_held > available {
            self.preempt_proportionally(inner, &backfill_ids, backfill_held - available);
        } else {
            self.allocate_evenly(inner, &backfill_ids, available - backfill_held);
        }
    }

    /// Even distribution: `per = max(available/remaining, 1)` rounds
    /// until slots or hungry requests run out.
    fn allocate_evenly(&self, inner: &mut Inner, ids: &[RequestId], mut available: u32) {
        let mut remaining: Vec<RequestId> = ids
            .iter()
            .filter(|id| {
                inner
                    .requests
                    .get(*id)
                    .is_some_and(AsyncRequest::is_hungry)
            })
            .cloned()
            .collect();

        while available > 0 && !remaining.is_empty() {
            let per = (available / remaining.len() as u32).max(1);
            let mut granted_this_round = 0;
            let mut next_round = Vec::new();

            for id in &remaining {
                if available == 0 {
                    break;
                }
                let unmet = inner
                    .requests
                    .get(id)
                    .map(|r| r.unallocated_instances())
                    .unwrap_or(0);
                let grant = per.min(unmet).min(available);
                if grant > 0 {
                    let before = allocated_of(inner, id);
                    self.allocate_to(inner, id, grant);
                    let delta = allocated_of(inner, id).saturating_sub(before);
                    available -= delta.min(available);
                    granted_this_round += delta;
                }
                if inner
                    .requests
                    .get(id)
                    .is_some_and(AsyncRequest::is_hungry)
                {
                    next_round.push(id.clone());
                }
            }

            if granted_this_round == 0 {
                break;
            }
            remaining = next_round;
        }
    }

    fn allocate_to(&self, inner: &mut Inner, id: &str, count: u32) {
        if count == 0 {
            return;
        }
        let Some(request) = inner.requests.get(id).cloned() else {
            return;
        };
        match self.launcher.launch(&request, count) {
            Ok(vms) => {
                for &vm in &vms {
                    inner.vm_index.insert(vm, id.to_string());
                }
                if let Some(req) = inner.requests.get_mut(id) {
                    req.add_allocated(&vms);
                    req.set_status(AsyncStatus::Active);
                    self.persist(req);
                }
                debug!(request = id, count = vms.len(), "market instances launched");
            }
            Err(e) => {
                error!(request = id, error = %e, "launch failed, request marked failed");
                if let Some(req) = inner.requests.get_mut(id) {
                    req.set_status(AsyncStatus::Failed);
                    req.error = Some(e.to_string());
                    self.persist(req);
                }
            }
        }
    }

    // ── Preemption ─────────────────────────────────────────────────

    /// Spread `need` preemptions across the group: each request gives up
    /// `round(need * own/total)`, floored at 1 for Active requests,
    /// clamped in iteration order so the total never overshoots.
    fn preempt_proportionally(&self, inner: &mut Inner, ids: &[RequestId], need: u32) {
        let total: u32 = ids.iter().map(|id| allocated_of(inner, id)).sum();
        if total == 0 || need == 0 {
            return;
        }
        let need = need.min(total);
        let mut still = need;

        for id in ids {
            if still == 0 {
                break;
            }
            let (own, active) = match inner.requests.get(id) {
                Some(r) => (r.allocated_instances(), r.status == AsyncStatus::Active),
                None => continue,
            };
            if own == 0 {
                continue;
            }
            let mut share =
                (f64::from(need) * f64::from(own) / f64::from(total)).round() as u32;
            if share == 0 && active {
                // Every active contender gives up at least one.
                share = 1;
            }
            let share = share.min(own).min(still);
            let done = self.preempt(inner, id, share);
            still -= done.min(still);
        }

        if still > 0 {
            // Rounding remainder: take from the biggest holders, newest
            // first among equals.
            let mut holders: Vec<(RequestId, u32, u64)> = ids
                .iter()
                .filter_map(|id| {
                    inner
                        .requests
                        .get(id)
                        .map(|r| (id.clone(), r.allocated_instances(), r.creation_time))
                })
                .filter(|(_, held, _)| *held > 0)
                .collect();
            holders.sort_by(|a, b| b.1.cmp(&a.1).then(b.2.cmp(&a.2)));
            for (id, held, _) in holders {
                if still == 0 {
                    break;
                }
                let done = self.preempt(inner, &id, held.min(still));
                still -= done.min(still);
            }
            if still > 0 {
                warn!(short = still, "preemption requirement not fully met");
            }
        }
    }

    /// Preempt `quantity` instances from one request. Returns how many
    /// were actually torn down.
    fn preempt(&self, inner: &mut Inner, id: &str, quantity: u32) -> u32 {
        let own = allocated_of(inner, id);
        if own == 0 || quantity == 0 {
            return 0;
        }
        let quantity = quantity.min(own);

        let mut group_teardown = None;
        let victims = {
            let price = inner.current_price;
            let Some(request) = inner.requests.get_mut(id) else {
                return 0;
            };
            let victims = if quantity == own {
                // Emptying the request: settle its status before teardown.
                settle_emptied(request, price);
                if request.instance_count > 1 && !request.is_alive() {
                    group_teardown = request.group_id.clone();
                }
                request.allocated_vms.clone()
            } else {
                request.most_recent_allocations(quantity as usize)
            };
            request.to_be_preempted = victims.clone();
            self.persist(request);
            victims
        };
        info!(request = id, count = victims.len(), "preempting instances");

        let result = match &group_teardown {
            Some(group) => self.launcher.destroy_group(group, "market preemption"),
            None => self.launcher.destroy(&victims, "market preemption"),
        };
        match result {
            Ok(()) => {
                for vm in &victims {
                    inner.vm_index.remove(vm);
                }
                if let Some(request) = inner.requests.get_mut(id) {
                    for vm in &victims {
                        request.remove_allocated(*vm);
                    }
                    self.persist(request);
                }
                quantity
            }
            Err(e) => {
                error!(request = id, error = %e, "preemption teardown failed");
                if let Some(request) = inner.requests.get_mut(id) {
                    // Overrides whatever status was just settled; a lost
                    // teardown must be visible on the record.
                    request.status = AsyncStatus::Failed;
                    request.error = Some(e.to_string());
                    self.persist(request);
                }
                0
            }
        }
    }

    // ── Lifecycle bookkeeping ──────────────────────────────────────

    /// One of our instances finished on its own (not preempted by us).
    fn vm_finished(&self, instance: InstanceId) {
        let mut inner = self.lock_inner();
        let Some(id) = inner.vm_index.remove(&instance) else {
            return;
        };
        let price = inner.current_price;
        if let Some(request) = inner.requests.get_mut(&id) {
            request.remove_allocated(instance);
            request.finished_vms.push(instance);
            if request.allocated_instances() == 0 {
                settle_emptied(request, price);
            }
            self.persist(request);
            info!(request = %id, instance, "market instance finished");
        }
        // Freed capacity, and the ceiling itself may have moved.
        let ceiling = self.market_ceiling(&inner);
        inner.max_vms = ceiling;
        self.change_price_and_allocate(&mut inner);
    }

    // ── Plumbing ───────────────────────────────────────────────────

    fn lock_inner(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().expect("market state poisoned")
    }

    /// Write-through. A store failure is logged and does not unwind the
    /// in-memory decision; the next successful write restores agreement.
    fn persist(&self, request: &AsyncRequest) {
        if let Err(e) = self.state.put_async_request(request) {
            error!(request = %request.id, error = %e, "request write-through failed");
        }
    }

    fn next_id(&self, spot: bool) -> RequestId {
        let n = self.seq.fetch_add(1, Ordering::SeqCst);
        let prefix = if spot { "sir" } else { "bf" };
        format!("{prefix}-{}-{n}", epoch_secs())
    }
}

/// Ids of the given requests ordered oldest first (incumbents lead).
fn ids_by_age(requests: &[&AsyncRequest]) -> Vec<RequestId> {
    let mut with_age: Vec<(u64, RequestId)> = requests
        .iter()
        .map(|r| (r.creation_time, r.id.clone()))
        .collect();
    with_age.sort();
    with_age.into_iter().map(|(_, id)| id).collect()
}

fn allocated_of(inner: &Inner, id: &str) -> u32 {
    inner
        .requests
        .get(id)
        .map(|r| r.allocated_instances())
        .unwrap_or(0)
}

/// All-VMs-finished bookkeeping: close a non-persistent request that is
/// satisfied or priced out; otherwise reopen it to compete again.
fn settle_emptied(request: &mut AsyncRequest, current_price: f64) {
    let priced_out = request.spot && request.max_bid < current_price;
    if !request.persistent && (request.needed_instances() == 0 || priced_out) {
        request.set_status(AsyncStatus::Closed);
    } else {
        request.set_status(AsyncStatus::Open);
    }
}

fn epoch_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

fn epoch_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

// ── Scheduler hooks ───────────────────────────────────────────────

impl StateChangeListener for AsyncRequestManager {
    /// Guaranteed-tier activations shrink our ceiling; our own VMs were
    /// already accounted for at launch.
    fn instances_scheduled(&self, ids: &[InstanceId]) {
        let any_foreign = {
            let inner = self.lock_inner();
            ids.iter().any(|id| !inner.vm_index.contains_key(id))
        };
        if any_foreign {
            self.recalculate_max_vms();
        }
    }

    fn instance_destroying(&self, id: InstanceId) {
        let mine = self.lock_inner().vm_index.contains_key(&id);
        if mine {
            self.vm_finished(id);
        } else {
            self.recalculate_max_vms();
        }
    }
}

impl SpaceReclaimer for AsyncRequestManager {
    fn release_space(&self, memory_mb: u64) -> anyhow::Result<()> {
        AsyncRequestManager::release_space(self, memory_mb)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pricing::MaximizeUtilization;
    use leasegrid_pool::{EntryDefinition, PoolDefinition};
    use std::sync::atomic::AtomicBool;

    const FLOOR: f64 = 0.05;
    const VM_MB: u64 = 256;

    /// Launcher that really consumes matcher capacity, so the ceiling
    /// math in the manager stays exact.
    struct TestLauncher {
        matcher: Arc<PoolMatcher>,
        placements: Mutex<HashMap<InstanceId, (String, u64)>>,
        groups: Mutex<HashMap<String, Vec<InstanceId>>>,
        destroyed: Mutex<Vec<InstanceId>>,
        next: AtomicU64,
        fail_destroy: AtomicBool,
    }

    impl TestLauncher {
        fn new(matcher: Arc<PoolMatcher>) -> Self {
            Self {
                matcher,
                placements: Mutex::new(HashMap::new()),
                groups: Mutex::new(HashMap::new()),
                destroyed: Mutex::new(Vec::new()),
                next: AtomicU64::new(1),
                fail_destroy: AtomicBool::new(false),
            }
        }

        fn destroy_one(&self, id: InstanceId) -> anyhow::Result<()> {
            if self.fail_destroy.load(Ordering::SeqCst) {
                anyhow::bail!("simulated teardown failure");
            }
            if let Some((host, mem)) = self.placements.lock().unwrap().remove(&id) {
                self.matcher.retire_mem(&host, mem)?;
            }
            self.destroyed.lock().unwrap().push(id);
            Ok(())
        }
    }

    impl InstanceLauncher for TestLauncher {
        fn launch(&self, request: &AsyncRequest, count: u32) -> anyhow::Result<Vec<InstanceId>> {
            let mut ids = Vec::new();
            for _ in 0..count {
                let host = self
                    .matcher
                    .reserve_space(None, request.memory_mb, &[])?;
                let id = self.next.fetch_add(1, Ordering::SeqCst);
                self.placements
                    .lock()
                    .unwrap()
                    .insert(id, (host, request.memory_mb));
                if let Some(group) = &request.group_id {
                    self.groups
                        .lock()
                        .unwrap()
                        .entry(group.clone())
                        .or_default()
                        .push(id);
                }
                ids.push(id);
            }
            Ok(ids)
        }

        fn destroy(&self, ids: &[InstanceId], _reason: &str) -> anyhow::Result<()> {
            for &id in ids {
                self.destroy_one(id)?;
            }
            Ok(())
        }

        fn destroy_group(&self, group_id: &str, _reason: &str) -> anyhow::Result<()> {
            let ids = self
                .groups
                .lock()
                .unwrap()
                .remove(group_id)
                .unwrap_or_default();
            for id in ids {
                self.destroy_one(id)?;
            }
            Ok(())
        }
    }

    struct Fixture {
        manager: AsyncRequestManager,
        matcher: Arc<PoolMatcher>,
        launcher: Arc<TestLauncher>,
    }

    /// `slots` market instance slots above the reserve.
    fn fixture(slots: u32) -> Fixture {
        let reserve = 512;
        let node_mb = u64::from(slots) * VM_MB + reserve;
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
        let launcher = Arc::new(TestLauncher::new(matcher.clone()));
        let manager = AsyncRequestManager::new(
            state,
            matcher.clone(),
            launcher.clone(),
            Box::new(MaximizeUtilization { min_price: FLOOR }),
            MarketSettings {
                spot_enabled: true,
                backfill_enabled: true,
                min_price: FLOOR,
                max_utilization: 0.5,
                min_reserved_mb: reserve,
                instance_mem_mb: VM_MB,
            },
        )
        .unwrap();
        manager.init().unwrap();
        Fixture {
            manager,
            matcher,
            launcher,
        }
    }

    fn spot(caller: &str, bid: f64, count: u32) -> AsyncCreate {
        AsyncCreate {
            spot: true,
            max_bid: bid,
            persistent: false,
            caller: caller.to_string(),
            group_id: None,
            instance_count: count,
            memory_mb: VM_MB,
        }
    }

    fn backfill(caller: &str, count: u32) -> AsyncCreate {
        AsyncCreate {
            spot: false,
            max_bid: 0.0,
            persistent: false,
            caller: caller.to_string(),
            group_id: None,
            instance_count: count,
            memory_mb: VM_MB,
        }
    }

    // ── admission ──────────────────────────────────────────────────

    #[test]
    fn admission_policy_checks() {
        let f = fixture(4);
        assert!(matches!(
            f.manager.add_request(spot("a", FLOOR / 2.0, 1)),
            Err(MarketError::Denied(_))
        ));
        assert!(matches!(
            f.manager.add_request(spot("a", 0.10, 0)),
            Err(MarketError::Denied(_))
        ));

        let r = f.manager.add_request(spot("a", 0.10, 1)).unwrap();
        assert_eq!(r.status, AsyncStatus::Active);
        assert_eq!(r.allocated_instances(), 1);
        // Write-through: the durable record agrees with the returned one.
        assert_eq!(f.manager.state.get_async_request(&r.id).unwrap().unwrap(), r);
    }

    #[test]
    fn everything_fits_at_the_floor() {
        let f = fixture(4);
        let r1 = f.manager.add_request(spot("a", 0.10, 2)).unwrap();
        let r2 = f.manager.add_request(spot("b", 0.30, 2)).unwrap();

        assert_eq!(f.manager.spot_price(), FLOOR);
        assert_eq!(r1.allocated_instances(), 2);
        assert_eq!(r2.allocated_instances(), 2);
        assert_eq!(f.manager.max_vms(), 4);
    }

    // ── price clearing ─────────────────────────────────────────────

    #[test]
    fn oversubscription_clears_at_marginal_bid() {
        let f = fixture(2);
        let r1 = f.manager.add_request(spot("a", 0.10, 1)).unwrap();
        let r2 = f.manager.add_request(spot("b", 0.10, 1)).unwrap();
        let r3 = f.manager.add_request(spot("c", 0.20, 1)).unwrap();

        assert_eq!(f.manager.spot_price(), 0.10);

        // The 0.20 bidder is satisfied in full; the two 0.10 bidders
        // share the one remaining slot.
        let r3 = f.manager.get_request(&r3.id).unwrap();
        assert_eq!(r3.allocated_instances(), 1);
        assert_eq!(r3.status, AsyncStatus::Active);

        let equal: Vec<AsyncRequest> = [&r1.id, &r2.id]
            .iter()
            .map(|id| f.manager.get_request(id).unwrap())
            .collect();
        let held: u32 = equal.iter().map(|r| r.allocated_instances()).sum();
        assert_eq!(held, 1);
        let starved = equal.iter().find(|r| r.allocated_instances() == 0).unwrap();
        assert_eq!(starved.status, AsyncStatus::Open);
    }

    #[test]
    fn under_bids_are_preempted_when_price_rises() {
        let f = fixture(2);
        let low = f.manager.add_request(spot("a", 0.10, 2)).unwrap();
        assert_eq!(low.allocated_instances(), 2);

        // Two higher bids push the clearing price to 0.30.
        f.manager.add_request(spot("b", 0.30, 1)).unwrap();
        f.manager.add_request(spot("c", 0.40, 1)).unwrap();

        assert_eq!(f.manager.spot_price(), 0.30);
        let low = f.manager.get_request(&low.id).unwrap();
        assert_eq!(low.allocated_instances(), 0);
        // Priced out and non-persistent: closed, not reopened.
        assert_eq!(low.status, AsyncStatus::Closed);
        assert_eq!(f.launcher.destroyed.lock().unwrap().len(), 2);
    }

    #[test]
    fn price_changes_are_persisted_to_history() {
        let f = fixture(2);
        f.manager.add_request(spot("a", 0.10, 1)).unwrap();
        f.manager.add_request(spot("b", 0.10, 1)).unwrap();
        f.manager.add_request(spot("c", 0.20, 1)).unwrap();

        let history = f.manager.price_history(0, u64::MAX).unwrap();
        assert_eq!(history.first().map(|p| p.price), Some(FLOOR));
        assert_eq!(history.last().map(|p| p.price), Some(0.10));
    }

    // ── proportional preemption ────────────────────────────────────

    #[test]
    fn ceiling_drop_preempts_proportionally() {
        let f = fixture(9);
        let r1 = f.manager.add_request(spot("a", 0.10, 3)).unwrap();
        let r2 = f.manager.add_request(spot("b", 0.10, 1)).unwrap();
        let r3 = f.manager.add_request(spot("c", 0.10, 5)).unwrap();
        assert_eq!(
            [&r1, &r2, &r3].map(|r| r.allocated_instances()),
            [3, 1, 5]
        );

        // Hand back six instances' worth of memory.
        AsyncRequestManager::release_space(&f.manager, 6 * VM_MB).unwrap();

        let held = [&r1.id, &r2.id, &r3.id]
            .map(|id| f.manager.get_request(id).unwrap().allocated_instances());
        // Shares 2/1/3 of the six, proportional to 3/1/5 with a floor of
        // one per active request.
        assert_eq!(held, [1, 0, 2]);
        assert_eq!(f.launcher.destroyed.lock().unwrap().len(), 6);
        assert_eq!(f.manager.max_vms(), 3);

        // The emptied middle request reopens to compete later.
        assert_eq!(
            f.manager.get_request(&r2.id).unwrap().status,
            AsyncStatus::Open
        );
    }

    #[test]
    fn preemption_takes_most_recent_allocations_first() {
        let f = fixture(4);
        let r = f.manager.add_request(spot("a", 0.10, 4)).unwrap();
        let order = r.allocated_vms.clone();

        AsyncRequestManager::release_space(&f.manager, 2 * VM_MB).unwrap();

        let r = f.manager.get_request(&r.id).unwrap();
        assert_eq!(r.allocated_vms, order[..2].to_vec());
        assert_eq!(
            f.launcher.destroyed.lock().unwrap().as_slice(),
            &[order[3], order[2]]
        );
    }

    #[test]
    fn teardown_failure_fails_the_request_and_records_cause() {
        let f = fixture(4);
        let r = f.manager.add_request(spot("a", 0.10, 2)).unwrap();

        f.launcher.fail_destroy.store(true, Ordering::SeqCst);
        AsyncRequestManager::release_space(&f.manager, 4 * VM_MB).unwrap();

        let r = f.manager.get_request(&r.id).unwrap();
        assert_eq!(r.status, AsyncStatus::Failed);
        assert!(r.error.as_deref().unwrap().contains("simulated"));
    }

    #[test]
    fn emptied_multi_instance_group_is_destroyed_as_a_group() {
        let f = fixture(2);
        let mut create = spot("a", 0.10, 2);
        create.group_id = Some("grp-1".to_string());
        let r = f.manager.add_request(create).unwrap();
        assert_eq!(r.allocated_instances(), 2);

        AsyncRequestManager::release_space(&f.manager, 2 * VM_MB).unwrap();

        assert!(f.launcher.groups.lock().unwrap().is_empty());
        assert_eq!(f.launcher.destroyed.lock().unwrap().len(), 2);
    }

    // ── backfill ───────────────────────────────────────────────────

    #[test]
    fn backfill_fills_spare_capacity_and_yields_to_spot() {
        let f = fixture(4);
        let b = f.manager.add_request(backfill("ops", 4)).unwrap();
        assert_eq!(b.allocated_instances(), 4);
        assert_eq!(f.manager.spot_price(), FLOOR);

        // Spot demand at the floor squeezes backfill down.
        let s = f.manager.add_request(spot("a", 0.10, 3)).unwrap();
        assert_eq!(s.allocated_instances(), 3);
        let b = f.manager.get_request(&b.id).unwrap();
        assert_eq!(b.allocated_instances(), 1);
    }

    #[test]
    fn backfill_denied_when_tier_disabled() {
        let mut f = fixture(4);
        f.manager.settings.backfill_enabled = false;
        assert!(matches!(
            f.manager.add_request(backfill("ops", 1)),
            Err(MarketError::Denied(_))
        ));
        assert_eq!(f.manager.alive_backfill_count(), 0);
    }

    // ── cancellation ───────────────────────────────────────────────

    #[test]
    fn cancel_tears_down_and_is_idempotent() {
        let f = fixture(4);
        let r = f.manager.add_request(spot("a", 0.10, 2)).unwrap();
        let free_before = f.matcher.totals().free_mb;

        let cancelled = f.manager.cancel_request(&r.id).unwrap();
        assert_eq!(cancelled.status, AsyncStatus::Cancelled);
        assert_eq!(cancelled.allocated_instances(), 0);
        assert_eq!(f.matcher.totals().free_mb, free_before + 2 * VM_MB);

        // Second cancel is a status no-op.
        let again = f.manager.cancel_request(&r.id).unwrap();
        assert_eq!(again.status, AsyncStatus::Cancelled);

        assert!(matches!(
            f.manager.cancel_request("sir-0-999"),
            Err(MarketError::NotFound(_))
        ));
    }

    #[test]
    fn cancelled_capacity_flows_to_waiting_requests() {
        let f = fixture(2);
        let r1 = f.manager.add_request(spot("a", 0.10, 2)).unwrap();
        let r2 = f.manager.add_request(spot("b", 0.10, 2)).unwrap();
        // Incumbent keeps its allocation; the newcomer waits.
        assert_eq!(r2.allocated_instances(), 0);
        assert_eq!(r2.status, AsyncStatus::Open);

        f.manager.cancel_request(&r1.id).unwrap();
        let r2 = f.manager.get_request(&r2.id).unwrap();
        assert_eq!(r2.allocated_instances(), 2);
    }

    // ── lifecycle hooks ────────────────────────────────────────────

    #[test]
    fn guaranteed_tier_growth_shrinks_the_ceiling() {
        let f = fixture(4);
        assert_eq!(f.manager.max_vms(), 4);

        // A guaranteed lease takes two instances' worth directly from
        // the matcher, then the listener hears about it.
        f.matcher.reserve_space(None, 2 * VM_MB, &[]).unwrap();
        f.manager.instances_scheduled(&[9001]);

        // used_guaranteed=512, max_util=0.5 → reserved=max(512,512)=512.
        assert_eq!(f.manager.max_vms(), 2);
    }

    #[test]
    fn own_instance_finishing_closes_satisfied_request() {
        let f = fixture(4);
        let r = f.manager.add_request(spot("a", 0.10, 1)).unwrap();
        let vm = r.allocated_vms[0];

        // The launcher's slot is released by the guaranteed machinery in
        // production; mirror that before the event arrives.
        {
            let mut placements = f.launcher.placements.lock().unwrap();
            let (host, mem) = placements.remove(&vm).unwrap();
            f.matcher.retire_mem(&host, mem).unwrap();
        }
        f.manager.instance_destroying(vm);

        let r = f.manager.get_request(&r.id).unwrap();
        assert_eq!(r.status, AsyncStatus::Closed);
        assert_eq!(r.allocated_instances(), 0);
        assert_eq!(r.finished_vms, vec![vm]);
    }

    #[test]
    fn persistent_request_rebinds_after_finish() {
        let f = fixture(4);
        let mut create = spot("a", 0.10, 1);
        create.persistent = true;
        let r = f.manager.add_request(create).unwrap();
        let first_vm = r.allocated_vms[0];

        {
            let mut placements = f.launcher.placements.lock().unwrap();
            let (host, mem) = placements.remove(&first_vm).unwrap();
            f.matcher.retire_mem(&host, mem).unwrap();
        }
        f.manager.instance_destroying(first_vm);

        // Still wants one, and the cycle re-allocated immediately.
        let r = f.manager.get_request(&r.id).unwrap();
        assert_eq!(r.needed_instances(), 1);
        assert_eq!(r.allocated_instances(), 1);
        assert_ne!(r.allocated_vms[0], first_vm);
    }

    // ── restart recovery ───────────────────────────────────────────

    #[test]
    fn requests_and_price_survive_reload() {
        let f = fixture(4);
        f.manager.add_request(spot("a", 0.10, 1)).unwrap();
        f.manager.add_request(spot("b", 0.10, 1)).unwrap();

        let reloaded = AsyncRequestManager::new(
            f.manager.state.clone(),
            f.matcher.clone(),
            f.launcher.clone(),
            Box::new(MaximizeUtilization { min_price: FLOOR }),
            f.manager.settings.clone(),
        )
        .unwrap();

        assert_eq!(reloaded.get_requests_by_caller("a", true).len(), 1);
        let r = &reloaded.get_requests_by_caller("b", true)[0];
        assert_eq!(r.allocated_instances(), 1);
        assert_eq!(reloaded.spot_price(), f.manager.spot_price());
    }
}
