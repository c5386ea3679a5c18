//! redb table definitions for the LeaseGrid state store.
//!
//! Each table uses `&str` keys and `&[u8]` values (JSON-serialized domain
//! types). Composite keys follow the pattern `{pool}/{hostname}`; instance
//! and task keys are the decimal instance id; price points use zero-padded
//! timestamps so iteration order is chronological.

use redb::TableDefinition;

/// VM instance records keyed by decimal instance id.
pub const INSTANCES: TableDefinition<&str, &[u8]> = TableDefinition::new("instances");

/// Lease task rows (slot bookkeeping) keyed by decimal instance id.
pub const LEASE_TASKS: TableDefinition<&str, &[u8]> = TableDefinition::new("lease_tasks");

/// Resource pool entries keyed by `{pool}/{hostname}`.
pub const POOL_ENTRIES: TableDefinition<&str, &[u8]> = TableDefinition::new("pool_entries");

/// Async (spot/backfill) requests keyed by request id.
pub const ASYNC_REQUESTS: TableDefinition<&str, &[u8]> = TableDefinition::new("async_requests");

/// Spot price history keyed by zero-padded epoch milliseconds.
pub const PRICE_HISTORY: TableDefinition<&str, &[u8]> = TableDefinition::new("price_history");
