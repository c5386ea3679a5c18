//! Pure predicate/query helpers over async request collections.
//!
//! The manager composes these; none of them mutate. All price
//! comparisons use value equality on f64 — bids are admitted from a
//! finite price grid, never computed, so equality is well defined.

use leasegrid_state::AsyncRequest;

/// Requests that can still be allocated to (Open or Active).
pub fn alive<'a, I>(requests: I) -> Vec<&'a AsyncRequest>
where
    I: IntoIterator<Item = &'a AsyncRequest>,
{
    requests.into_iter().filter(|r| r.is_alive()).collect()
}

/// Alive spot requests.
pub fn alive_spot<'a, I>(requests: I) -> Vec<&'a AsyncRequest>
where
    I: IntoIterator<Item = &'a AsyncRequest>,
{
    requests.into_iter().filter(|r| r.is_alive() && r.spot).collect()
}

/// Alive backfill requests.
pub fn alive_backfill<'a, I>(requests: I) -> Vec<&'a AsyncRequest>
where
    I: IntoIterator<Item = &'a AsyncRequest>,
{
    requests
        .into_iter()
        .filter(|r| r.is_alive() && !r.spot)
        .collect()
}

/// Alive spot requests bidding exactly `price`.
pub fn equal_price<'a, I>(requests: I, price: f64) -> Vec<&'a AsyncRequest>
where
    I: IntoIterator<Item = &'a AsyncRequest>,
{
    requests
        .into_iter()
        .filter(|r| r.is_alive() && r.spot && r.max_bid == price)
        .collect()
}

/// Alive spot requests bidding strictly above `price`.
pub fn higher_than<'a, I>(requests: I, price: f64) -> Vec<&'a AsyncRequest>
where
    I: IntoIterator<Item = &'a AsyncRequest>,
{
    requests
        .into_iter()
        .filter(|r| r.is_alive() && r.spot && r.max_bid > price)
        .collect()
}

/// Spot requests bidding strictly below `price` (preemption candidates).
pub fn lower_than<'a, I>(requests: I, price: f64) -> Vec<&'a AsyncRequest>
where
    I: IntoIterator<Item = &'a AsyncRequest>,
{
    requests
        .into_iter()
        .filter(|r| r.spot && r.max_bid < price)
        .collect()
}

/// Requests owned by `caller`, split by tier.
pub fn by_caller<'a, I>(requests: I, caller: &str, spot: bool) -> Vec<&'a AsyncRequest>
where
    I: IntoIterator<Item = &'a AsyncRequest>,
{
    requests
        .into_iter()
        .filter(|r| r.spot == spot && r.caller == caller)
        .collect()
}

/// Total instances still wanted by the given requests.
pub fn needed_instances(requests: &[&AsyncRequest]) -> u32 {
    requests.iter().map(|r| r.needed_instances()).sum()
}

/// Total instances currently allocated to the given requests.
pub fn allocated_instances(requests: &[&AsyncRequest]) -> u32 {
    requests.iter().map(|r| r.allocated_instances()).sum()
}

#[cfg(test)]
mod tests {
    use super::*;
    use leasegrid_state::AsyncStatus;

    fn request(id: &str, spot: bool, bid: f64, status: AsyncStatus) -> AsyncRequest {
        AsyncRequest {
            id: id.to_string(),
            spot,
            max_bid: bid,
            persistent: false,
            status,
            caller: "alice".to_string(),
            group_id: None,
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
    fn price_partitions() {
        let reqs = vec![
            request("low", true, 0.05, AsyncStatus::Active),
            request("at", true, 0.10, AsyncStatus::Open),
            request("high", true, 0.20, AsyncStatus::Open),
            request("dead", true, 0.20, AsyncStatus::Cancelled),
            request("bf", false, 0.0, AsyncStatus::Open),
        ];

        let ids = |v: Vec<&AsyncRequest>| v.iter().map(|r| r.id.clone()).collect::<Vec<_>>();
        assert_eq!(ids(lower_than(&reqs, 0.10)), vec!["low"]);
        assert_eq!(ids(equal_price(&reqs, 0.10)), vec!["at"]);
        assert_eq!(ids(higher_than(&reqs, 0.10)), vec!["high"]);
        assert_eq!(ids(alive_backfill(&reqs)), vec!["bf"]);
        assert_eq!(alive_spot(&reqs).len(), 3);
    }

    #[test]
    fn caller_filter_splits_tiers() {
        let mut other = request("r2", true, 0.1, AsyncStatus::Open);
        other.caller = "bob".to_string();
        let reqs = vec![
            request("r1", true, 0.1, AsyncStatus::Open),
            request("b1", false, 0.0, AsyncStatus::Open),
            other,
        ];

        assert_eq!(by_caller(&reqs, "alice", true).len(), 1);
        assert_eq!(by_caller(&reqs, "alice", false).len(), 1);
        assert_eq!(by_caller(&reqs, "bob", true).len(), 1);
    }

    #[test]
    fn demand_sums() {
        let mut r = request("r", true, 0.1, AsyncStatus::Active);
        r.allocated_vms = vec![1];
        let reqs = [&r];
        assert_eq!(needed_instances(&reqs), 2);
        assert_eq!(allocated_instances(&reqs), 1);
    }
}
