//! Spot pricing models.

use leasegrid_state::AsyncRequest;
use tracing::debug;

/// Computes the next clearing price from the current market shape.
pub trait PricingModel: Send + Sync {
    /// `max_vms` is the current market ceiling in instances, `alive_spot`
    /// the competing spot requests, `current` the price in effect.
    fn next_price(&self, max_vms: u32, alive_spot: &[&AsyncRequest], current: f64) -> f64;
}

/// Clears the market at the bid of the last instance that fits.
///
/// Each alive spot request is expanded into one bid per instance it still
/// wants; bids are sorted descending. If everything fits under the
/// ceiling the price falls to the floor; otherwise the price is the bid
/// of the `max_vms`-th instance, so exactly the highest-value `max_vms`
/// instance-bids clear.
pub struct MaximizeUtilization {
    pub min_price: f64,
}

impl PricingModel for MaximizeUtilization {
    fn next_price(&self, max_vms: u32, alive_spot: &[&AsyncRequest], current: f64) -> f64 {
        let mut bids: Vec<f64> = Vec::new();
        for request in alive_spot {
            for _ in 0..request.needed_instances() {
                bids.push(request.max_bid);
            }
        }

        if bids.is_empty() {
            return self.min_price;
        }
        if max_vms == 0 {
            // No capacity at all: price out every bid.
            let highest = bids.iter().fold(f64::MIN, |a, &b| a.max(b));
            return highest + self.min_price;
        }

        bids.sort_by(|a, b| b.total_cmp(a));
        let next = if bids.len() <= max_vms as usize {
            self.min_price
        } else {
            bids[max_vms as usize - 1]
        };
        if next != current {
            debug!(current, next, demand = bids.len(), max_vms, "clearing price moved");
        }
        next
    }
}
