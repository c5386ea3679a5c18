//! StateStore — redb-backed state persistence for LeaseGrid.
//!
//! Provides typed CRUD operations over instances, lease tasks, pool
//! entries, async requests, and the spot price history. All values are
//! JSON-serialized into redb's `&[u8]` value columns. The store supports
//! both on-disk and in-memory backends (the latter for testing).

use std::path::Path;
use std::sync::Arc;

use redb::{Database, ReadableDatabase, ReadableTable};
use tracing::debug;

use crate::error::{StateError, StateResult};
use crate::tables::*;
use crate::types::*;

/// Convert any `Display` error into a `StateError` variant via a closure factory.
macro_rules! map_err {
    ($variant:ident) => {
        |e| StateError::$variant(e.to_string())
    };
}

/// Thread-safe state store backed by redb.
#[derive(Clone)]
pub struct StateStore {
    db: Arc<Database>,
}

impl StateStore {
    /// Open (or create) a persistent state store at the given path.
    pub fn open(path: &Path) -> StateResult<Self> {
        let db = Database::create(path).map_err(map_err!(Open))?;
        let store = Self { db: Arc::new(db) };
        store.ensure_tables()?;
        debug!(?path, "state store opened");
        Ok(store)
    }

    /// Create an ephemeral in-memory state store (for testing).
    pub fn open_in_memory() -> StateResult<Self> {
        let backend = redb::backends::InMemoryBackend::new();
        let db = Database::builder()
            .create_with_backend(backend)
            .map_err(map_err!(Open))?;
        let store = Self { db: Arc::new(db) };
        store.ensure_tables()?;
        debug!("in-memory state store opened");
        Ok(store)
    }

    /// Create all tables if they don't exist yet.
    fn ensure_tables(&self) -> StateResult<()> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        // Opening a table in a write transaction creates it if absent.
        txn.open_table(INSTANCES).map_err(map_err!(Table))?;
        txn.open_table(LEASE_TASKS).map_err(map_err!(Table))?;
        txn.open_table(POOL_ENTRIES).map_err(map_err!(Table))?;
        txn.open_table(ASYNC_REQUESTS).map_err(map_err!(Table))?;
        txn.open_table(PRICE_HISTORY).map_err(map_err!(Table))?;
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(())
    }

    /// Generic put: JSON-serialize and insert under `key`.
    fn put<T: serde::Serialize>(
        &self,
        table: redb::TableDefinition<&str, &[u8]>,
        key: &str,
        value: &T,
    ) -> StateResult<()> {
        let bytes = serde_json::to_vec(value).map_err(map_err!(Serialize))?;
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        {
            let mut t = txn.open_table(table).map_err(map_err!(Table))?;
            t.insert(key, bytes.as_slice()).map_err(map_err!(Write))?;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(())
    }

    /// Generic get: read and JSON-deserialize the value under `key`.
    fn get<T: serde::de::DeserializeOwned>(
        &self,
        table: redb::TableDefinition<&str, &[u8]>,
        key: &str,
    ) -> StateResult<Option<T>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let t = txn.open_table(table).map_err(map_err!(Table))?;
        match t.get(key).map_err(map_err!(Read))? {
            Some(guard) => {
                let value = serde_json::from_slice(guard.value()).map_err(map_err!(Deserialize))?;
                Ok(Some(value))
            }
            None => Ok(None),
        }
    }

    /// Generic delete. Returns true if the key existed.
    fn delete(
        &self,
        table: redb::TableDefinition<&str, &[u8]>,
        key: &str,
    ) -> StateResult<bool> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let existed;
        {
            let mut t = txn.open_table(table).map_err(map_err!(Table))?;
            existed = t.remove(key).map_err(map_err!(Write))?.is_some();
        }
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(existed)
    }

    /// Generic full-table scan in key order.
    fn list<T: serde::de::DeserializeOwned>(
        &self,
        table: redb::TableDefinition<&str, &[u8]>,
    ) -> StateResult<Vec<T>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let t = txn.open_table(table).map_err(map_err!(Table))?;
        let mut results = Vec::new();
        for entry in t.iter().map_err(map_err!(Read))? {
            let (_, value) = entry.map_err(map_err!(Read))?;
            let item = serde_json::from_slice(value.value()).map_err(map_err!(Deserialize))?;
            results.push(item);
        }
        Ok(results)
    }

    // ── Instances ──────────────────────────────────────────────────

    /// Insert or update an instance record.
    pub fn put_instance(&self, instance: &Instance) -> StateResult<()> {
        self.put(INSTANCES, &instance.table_key(), instance)
    }

    /// Get an instance by id.
    pub fn get_instance(&self, id: InstanceId) -> StateResult<Option<Instance>> {
        self.get(INSTANCES, &id.to_string())
    }

    /// Delete an instance by id. Returns true if it existed.
    pub fn delete_instance(&self, id: InstanceId) -> StateResult<bool> {
        self.delete(INSTANCES, &id.to_string())
    }

    /// List all instance records.
    pub fn list_instances(&self) -> StateResult<Vec<Instance>> {
        self.list(INSTANCES)
    }

    /// Highest instance id ever stored, for seeding the id counter.
    pub fn max_instance_id(&self) -> StateResult<InstanceId> {
        Ok(self
            .list_instances()?
            .iter()
            .map(|i| i.id)
            .max()
            .unwrap_or(0))
    }

    // ── Lease tasks ────────────────────────────────────────────────

    /// Insert or update a lease task row.
    pub fn put_task(&self, task: &LeaseTask) -> StateResult<()> {
        self.put(LEASE_TASKS, &task.table_key(), task)
    }

    /// Get a lease task by instance id.
    pub fn get_task(&self, id: InstanceId) -> StateResult<Option<LeaseTask>> {
        self.get(LEASE_TASKS, &id.to_string())
    }

    /// Delete a lease task by instance id. Returns true if it existed.
    pub fn delete_task(&self, id: InstanceId) -> StateResult<bool> {
        self.delete(LEASE_TASKS, &id.to_string())
    }

    /// List all lease task rows.
    pub fn list_tasks(&self) -> StateResult<Vec<LeaseTask>> {
        self.list(LEASE_TASKS)
    }

    // ── Pool entries ───────────────────────────────────────────────

    /// Insert or update a pool entry.
    pub fn put_pool_entry(&self, entry: &PoolEntry) -> StateResult<()> {
        self.put(POOL_ENTRIES, &entry.table_key(), entry)
    }

    /// Get a pool entry by pool name and hostname.
    pub fn get_pool_entry(&self, pool: &str, hostname: &str) -> StateResult<Option<PoolEntry>> {
        self.get(POOL_ENTRIES, &format!("{pool}/{hostname}"))
    }

    /// List all pool entries across pools.
    pub fn list_pool_entries(&self) -> StateResult<Vec<PoolEntry>> {
        self.list(POOL_ENTRIES)
    }

    /// List all entries for a given pool (key prefix scan).
    pub fn list_entries_for_pool(&self, pool: &str) -> StateResult<Vec<PoolEntry>> {
        let prefix = format!("{pool}/");
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let t = txn.open_table(POOL_ENTRIES).map_err(map_err!(Table))?;
        let mut results = Vec::new();
        for entry in t.iter().map_err(map_err!(Read))? {
            let (key, value) = entry.map_err(map_err!(Read))?;
            if key.value().starts_with(&prefix) {
                let e: PoolEntry =
                    serde_json::from_slice(value.value()).map_err(map_err!(Deserialize))?;
                results.push(e);
            }
        }
        Ok(results)
    }

    /// Delete all entries for a pool. Returns number deleted.
    pub fn delete_entries_for_pool(&self, pool: &str) -> StateResult<u32> {
        let prefix = format!("{pool}/");
        // Collect keys in a read transaction first.
        let keys: Vec<String> = {
            let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
            let t = txn.open_table(POOL_ENTRIES).map_err(map_err!(Table))?;
            t.iter()
                .map_err(map_err!(Read))?
                .filter_map(|entry| {
                    let (key, _) = entry.ok()?;
                    let k = key.value().to_string();
                    k.starts_with(&prefix).then_some(k)
                })
                .collect()
        };
        // Delete in a write transaction.
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let count = keys.len() as u32;
        {
            let mut t = txn.open_table(POOL_ENTRIES).map_err(map_err!(Table))?;
            for key in &keys {
                t.remove(key.as_str()).map_err(map_err!(Write))?;
            }
        }
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(count)
    }

    // ── Async requests ─────────────────────────────────────────────

    /// Insert or update an async request record.
    pub fn put_async_request(&self, request: &AsyncRequest) -> StateResult<()> {
        self.put(ASYNC_REQUESTS, &request.id, request)
    }

    /// Get an async request by id.
    pub fn get_async_request(&self, id: &str) -> StateResult<Option<AsyncRequest>> {
        self.get(ASYNC_REQUESTS, id)
    }

    /// List all async requests (closed/cancelled included — history is kept).
    pub fn list_async_requests(&self) -> StateResult<Vec<AsyncRequest>> {
        self.list(ASYNC_REQUESTS)
    }

    // ── Price history ──────────────────────────────────────────────

    /// Append a price point. History is append-only; callers keep
    /// timestamps strictly increasing so nothing is overwritten.
    pub fn put_price(&self, point: &PricePoint) -> StateResult<()> {
        self.put(PRICE_HISTORY, &point.table_key(), point)
    }

    /// Price points with `start <= timestamp <= end`, chronological order.
    pub fn list_prices(&self, start: u64, end: u64) -> StateResult<Vec<PricePoint>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let t = txn.open_table(PRICE_HISTORY).map_err(map_err!(Table))?;
        let mut results = Vec::new();
        for entry in t.iter().map_err(map_err!(Read))? {
            let (_, value) = entry.map_err(map_err!(Read))?;
            let point: PricePoint =
                serde_json::from_slice(value.value()).map_err(map_err!(Deserialize))?;
            if point.timestamp >= start && point.timestamp <= end {
                results.push(point);
            }
        }
        Ok(results)
    }

    /// The most recent recorded price, if any.
    pub fn latest_price(&self) -> StateResult<Option<PricePoint>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let t = txn.open_table(PRICE_HISTORY).map_err(map_err!(Table))?;
        match t.last().map_err(map_err!(Read))? {
            Some((_, value)) => {
                let point: PricePoint =
                    serde_json::from_slice(value.value()).map_err(map_err!(Deserialize))?;
                Ok(Some(point))
            }
            None => Ok(None),
        }
    }
}
