//! leasegrid-scheduler — the scheduler adapter.
//!
//! Converts `(memory, duration, associations, node count, ensemble)`
//! requests into concrete slot reservations via the pool matcher, manages
//! the instance lifecycle state machine, serializes co-scheduled groups
//! under per-group locks, and reconciles state notifications against the
//! creation-pending race window.
//!
//! # Architecture
//!
//! ```text
//! Scheduler
//!   ├── SlotManager (reserve / release node slots; PoolSlotManager
//!   │   bridges to the leasegrid-pool matcher)
//!   ├── InstanceHome (instance record CRUD, destruction)
//!   ├── LockRegistry (fair named locks, one per ensemble)
//!   ├── PendingSet (creation-pending ids, consulted on every notification)
//!   └── listeners (typed lifecycle events to a small fixed subscriber set)
//! ```
//!
//! The sweeper is a periodic loop over the adapter's query surface
//! (`tasks_to_shutdown`, `any_left`) that drives expired leases to
//! shutdown.

pub mod error;
pub mod events;
pub mod home;
pub mod locks;
pub mod pending;
pub mod scheduler;
pub mod slots;
pub mod states;
pub mod sweeper;
pub mod types;

pub use error::{SchedulerError, SchedulerResult};
pub use events::{SpaceReclaimer, StateChangeListener};
pub use home::{InstanceHome, StoreInstanceHome};
pub use locks::LockRegistry;
pub use pending::PendingSet;
pub use scheduler::{Lookup, NotificationInfo, Scheduler};
pub use slots::{PoolSlotManager, SlotManager};
pub use sweeper::Sweeper;
pub use types::{NodeRequest, Reservation};
