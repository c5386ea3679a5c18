//! leasegrid-state — embedded state store for LeaseGrid.
//!
//! Backed by [redb](https://docs.rs/redb), provides persistent and in-memory
//! state management for VM instances, lease tasks, resource pool entries,
//! async (spot/backfill) requests, and the spot price history.
//!
//! # Architecture
//!
//! All domain types are JSON-serialized into redb's `&[u8]` value columns.
//! Composite keys (`{pool}/{hostname}`, zero-padded timestamps) enable
//! prefix scans and ordered range reads.
//!
//! The `StateStore` is `Clone` + `Send` + `Sync` (backed by `Arc<Database>`)
//! and can be shared across async tasks. Every mutation commits before the
//! call returns — readers observe either the old record or the fully new
//! one, never a partial write.

pub mod error;
pub mod store;
pub mod tables;
pub mod types;

pub use error::{StateError, StateResult};
pub use store::StateStore;
pub use types::*;
