//! LeaseGrid resource pool matcher — node bin-packing and capacity accounting.
//!
//! This crate answers two questions for the scheduler:
//!
//! - "find a node with ≥N MB supporting these network associations" —
//!   [`PoolMatcher::reserve_space`]
//! - "return M MB to node H" — [`PoolMatcher::retire_mem`]
//!
//! Pools are named collections of node entries loaded from TOML definition
//! files. The matcher supports hot reload: entries whose definition did not
//! change carry their exact in-use accounting across the reload; changed
//! entries are recomputed from the new capacity minus what is currently
//! leased, clamped so the `0 <= mem_current <= mem_max` invariant holds.
//!
//! # Components
//!
//! - **`config`** — TOML pool definition loading (with source mtimes)
//! - **`matcher`** — the matcher itself (two-pass search, retire, reload)

pub mod config;
pub mod error;
pub mod matcher;

pub use config::{EntryDefinition, PoolDefinition, load_pool_dir};
pub use error::{PoolError, PoolResult};
pub use matcher::{PoolMatcher, PoolTotals};
