//! leasegrid-market — the spot/backfill preemptable market tier.
//!
//! A continuous-reallocation market over the capacity the guaranteed tier
//! is not using. Spot requests bid a price; backfill requests run below
//! every spot bid at the price floor. On every trigger (admission,
//! guaranteed-tier change, instance finished) the manager recomputes the
//! clearing price, preempts bids under it, and redistributes remaining
//! capacity — evenly among equal bids, in full to higher bids.
//!
//! # Components
//!
//! - **`manager`** — [`AsyncRequestManager`]: admission, the
//!   price-and-allocate cycle, proportional preemption, the capacity
//!   ceiling, and the scheduler listener/reclaimer hooks
//! - **`pricing`** — [`PricingModel`] and the default
//!   [`MaximizeUtilization`] model
//! - **`filter`** — pure predicates over request collections
//! - **`backfill`** — [`BackfillDriver`]: keeps backfill admission
//!   pressure up to the configured cap, backing off on denial
//! - **`launch`** — [`InstanceLauncher`], the seam to actual VM
//!   creation/teardown

pub mod backfill;
pub mod error;
pub mod filter;
pub mod launch;
pub mod manager;
pub mod pricing;

pub use backfill::{BackfillDriver, BackfillSettings};
pub use error::{MarketError, MarketResult};
pub use launch::{InstanceLauncher, SlotBackedLauncher};
pub use manager::{AsyncCreate, AsyncRequestManager, MarketSettings};
pub use pricing::{MaximizeUtilization, PricingModel};
