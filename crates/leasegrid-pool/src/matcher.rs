//! The pool matcher — two-pass node search, capacity retirement, hot reload.
//!
//! All pool state lives behind one mutex. A reload builds a complete new
//! pool map and swaps it in while holding the lock, so placement and
//! retirement never observe a half-updated set. Entry mutations are
//! written through to the state store before the lock is released.

use std::collections::BTreeMap;
use std::sync::Mutex;

use tracing::{debug, info, warn};

use leasegrid_state::{PoolEntry, StateStore};

use crate::config::PoolDefinition;
use crate::error::{PoolError, PoolResult};

/// A named pool of node entries, keyed by hostname.
#[derive(Debug, Clone)]
struct Resourcepool {
    source_mtime: u64,
    entries: BTreeMap<String, PoolEntry>,
}

/// Aggregate capacity view, consumed by the market ceiling calculation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolTotals {
    /// Memory currently available across all entries (MB).
    pub free_mb: u64,
    /// Total memory capacity across all entries (MB).
    pub max_mb: u64,
}

/// Thread-safe resource pool matcher.
pub struct PoolMatcher {
    state: StateStore,
    pools: Mutex<BTreeMap<String, Resourcepool>>,
}

impl PoolMatcher {
    /// Build a matcher from pool definitions, recovering in-use accounting
    /// from entries persisted by a previous run.
    pub fn open(state: StateStore, defs: Vec<PoolDefinition>) -> PoolResult<Self> {
        // Seed the "old" set from the store so that a restart behaves like
        // a reload: leased memory stays leased. Mtime zero forces the
        // carried-over entries through the changed-entry recompute path.
        let mut seeded: BTreeMap<String, Resourcepool> = BTreeMap::new();
        for entry in state.list_pool_entries()? {
            seeded
                .entry(entry.pool.clone())
                .or_insert_with(|| Resourcepool {
                    source_mtime: 0,
                    entries: BTreeMap::new(),
                })
                .entries
                .insert(entry.hostname.clone(), entry);
        }

        let matcher = Self {
            state,
            pools: Mutex::new(seeded),
        };
        matcher.reload(defs)?;
        Ok(matcher)
    }

    /// Find a node with at least `memory_mb` available that supports every
    /// requested association, reserve the memory, and return its hostname.
    ///
    /// Search order per candidate pool (the named pool, or every pool in
    /// iteration order): completely vacant entries first, then any entry
    /// with enough remaining memory. A denial reason distinguishes an
    /// unknown pool name, a pool with no entries, and unsatisfiable
    /// constraints.
    pub fn reserve_space(
        &self,
        pool: Option<&str>,
        memory_mb: u64,
        associations: &[String],
    ) -> PoolResult<String> {
        let mut pools = self.pools.lock().expect("pool lock poisoned");

        let candidates: Vec<String> = match pool {
            Some(name) => {
                if !pools.contains_key(name) {
                    return Err(PoolError::Denied(format!("unknown pool '{name}'")));
                }
                vec![name.to_string()]
            }
            None => pools.keys().cloned().collect(),
        };

        let mut saw_entries = false;
        for name in &candidates {
            let rp = pools.get_mut(name).expect("candidate pool vanished");
            if rp.entries.is_empty() {
                continue;
            }
            saw_entries = true;

            // First pass: prefer handing out a fully idle node over
            // fragmenting a partially used one.
            let hit = Self::find_match(rp, memory_mb, associations, true)
                .or_else(|| Self::find_match(rp, memory_mb, associations, false));

            if let Some(hostname) = hit {
                let entry = rp.entries.get_mut(&hostname).expect("matched entry");
                entry.mem_current -= memory_mb;
                self.state.put_pool_entry(entry)?;
                debug!(
                    pool = %name,
                    host = %hostname,
                    reserved_mb = memory_mb,
                    remaining_mb = entry.mem_current,
                    "space reserved"
                );
                return Ok(hostname);
            }
        }

        if !saw_entries {
            return Err(PoolError::Denied(match pool {
                Some(name) => format!("pool '{name}' has no entries"),
                None => "no pool has any entries".to_string(),
            }));
        }
        Err(PoolError::Denied(format!(
            "no entry satisfies {memory_mb} MB with associations [{}]",
            associations.join(",")
        )))
    }

    fn find_match(
        rp: &Resourcepool,
        memory_mb: u64,
        associations: &[String],
        vacant_only: bool,
    ) -> Option<String> {
        rp.entries
            .values()
            .find(|e| {
                (!vacant_only || e.is_vacant())
                    && e.mem_current >= memory_mb
                    && associations_match(&e.associations, associations)
            })
            .map(|e| e.hostname.clone())
    }

    /// Return `memory_mb` to the node that holds `hostname`.
    ///
    /// Clamps to `mem_max` (the pool config may have shrunk the node while
    /// it was partially leased). A hostname no pool contains is a warning,
    /// not an error — a live config change can remove a node that still
    /// has in-flight leases.
    pub fn retire_mem(&self, hostname: &str, memory_mb: u64) -> PoolResult<()> {
        let mut pools = self.pools.lock().expect("pool lock poisoned");

        for (name, rp) in pools.iter_mut() {
            if let Some(entry) = rp.entries.get_mut(hostname) {
                let raised = entry.mem_current + memory_mb;
                if raised > entry.mem_max {
                    warn!(
                        pool = %name,
                        host = %hostname,
                        retired_mb = memory_mb,
                        mem_max = entry.mem_max,
                        "retirement would exceed capacity, clamping"
                    );
                    entry.mem_current = entry.mem_max;
                } else {
                    entry.mem_current = raised;
                }
                self.state.put_pool_entry(entry)?;
                debug!(
                    pool = %name,
                    host = %hostname,
                    retired_mb = memory_mb,
                    available_mb = entry.mem_current,
                    "memory retired"
                );
                return Ok(());
            }
        }

        warn!(
            host = %hostname,
            retired_mb = memory_mb,
            "no pool contains host, memory not retired (removed by a config change?)"
        );
        Ok(())
    }

    /// Replace the pool set with freshly parsed definitions.
    ///
    /// Entries whose definition is unchanged (same max memory, same
    /// association string, same file mtime) carry over their exact in-use
    /// accounting. Changed entries recompute `current = new_max − in_use`,
    /// clamped to zero. Pools or entries that vanished are logged with
    /// their in-use status before that information is lost.
    pub fn reload(&self, defs: Vec<PoolDefinition>) -> PoolResult<()> {
        let mut pools = self.pools.lock().expect("pool lock poisoned");
        let old = std::mem::take(&mut *pools);
        let mut fresh: BTreeMap<String, Resourcepool> = BTreeMap::new();

        for def in defs {
            let old_pool = old.get(&def.name);
            let mtime_unchanged = old_pool.is_some_and(|p| p.source_mtime == def.source_mtime);

            let mut entries = BTreeMap::new();
            for ed in &def.entries {
                let old_entry = old_pool.and_then(|p| p.entries.get(&ed.hostname));
                let entry = match old_entry {
                    Some(oe)
                        if mtime_unchanged
                            && oe.mem_max == ed.mem_max
                            && oe.associations == ed.associations =>
                    {
                        // Unchanged — carry the accounting over untouched.
                        oe.clone()
                    }
                    Some(oe) => {
                        let in_use = oe.mem_in_use();
                        let current = ed.mem_max.saturating_sub(in_use);
                        if ed.mem_max >= oe.mem_max {
                            info!(
                                pool = %def.name,
                                host = %ed.hostname,
                                old_max = oe.mem_max,
                                new_max = ed.mem_max,
                                in_use_mb = in_use,
                                "entry capacity grew or redefined"
                            );
                        } else {
                            warn!(
                                pool = %def.name,
                                host = %ed.hostname,
                                old_max = oe.mem_max,
                                new_max = ed.mem_max,
                                in_use_mb = in_use,
                                "entry capacity shrank under active leases, clamping"
                            );
                        }
                        PoolEntry {
                            pool: def.name.clone(),
                            hostname: ed.hostname.clone(),
                            mem_current: current,
                            mem_max: ed.mem_max,
                            associations: ed.associations.clone(),
                        }
                    }
                    None => PoolEntry {
                        pool: def.name.clone(),
                        hostname: ed.hostname.clone(),
                        mem_current: ed.mem_max,
                        mem_max: ed.mem_max,
                        associations: ed.associations.clone(),
                    },
                };
                self.state.put_pool_entry(&entry)?;
                entries.insert(ed.hostname.clone(), entry);
            }

            // Entries dropped from a surviving pool.
            if let Some(op) = old_pool {
                for (host, oe) in &op.entries {
                    if !entries.contains_key(host) {
                        warn!(
                            pool = %def.name,
                            host = %host,
                            in_use_mb = oe.mem_in_use(),
                            "entry removed from pool definition"
                        );
                        self.state.delete_entries_for_pool(&def.name)?;
                        // Re-persist the survivors after the prefix delete.
                        for e in entries.values() {
                            self.state.put_pool_entry(e)?;
                        }
                        break;
                    }
                }
            }

            fresh.insert(
                def.name.clone(),
                Resourcepool {
                    source_mtime: def.source_mtime,
                    entries,
                },
            );
        }

        // Pools dropped entirely: their in-use status would otherwise be lost.
        for (name, rp) in &old {
            if !fresh.contains_key(name) {
                for (host, oe) in &rp.entries {
                    warn!(
                        pool = %name,
                        host = %host,
                        in_use_mb = oe.mem_in_use(),
                        "pool removed from configuration"
                    );
                }
                self.state.delete_entries_for_pool(name)?;
            }
        }

        info!(pools = fresh.len(), "resource pools reloaded");
        *pools = fresh;
        Ok(())
    }

    /// Aggregate free/max capacity across all pools.
    pub fn totals(&self) -> PoolTotals {
        let pools = self.pools.lock().expect("pool lock poisoned");
        let mut totals = PoolTotals { free_mb: 0, max_mb: 0 };
        for rp in pools.values() {
            for e in rp.entries.values() {
                totals.free_mb += e.mem_current;
                totals.max_mb += e.mem_max;
            }
        }
        totals
    }

    /// Snapshot of every entry, for diagnostics.
    pub fn entries(&self) -> Vec<PoolEntry> {
        let pools = self.pools.lock().expect("pool lock poisoned");
        pools
            .values()
            .flat_map(|rp| rp.entries.values().cloned())
            .collect()
    }
}

/// Association matching: no requirement matches anything; `"*"` supports
/// everything; otherwise every requested name must appear in the entry's
/// comma-split list. A single miss disqualifies the entry.
fn associations_match(entry_assocs: &str, needed: &[String]) -> bool {
    if needed.is_empty() {
        return true;
    }
    if entry_assocs == "*" {
        return true;
    }
    let supported: Vec<&str> = entry_assocs.split(',').map(str::trim).collect();
    needed.iter().all(|n| supported.contains(&n.as_str()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EntryDefinition;

    fn def(name: &str, mtime: u64, entries: &[(&str, u64, &str)]) -> PoolDefinition {
        PoolDefinition {
            name: name.to_string(),
            source_mtime: mtime,
            entries: entries
                .iter()
                .map(|(h, m, a)| EntryDefinition {
                    hostname: h.to_string(),
                    mem_max: *m,
                    associations: a.to_string(),
                })
                .collect(),
        }
    }

    fn matcher(defs: Vec<PoolDefinition>) -> PoolMatcher {
        PoolMatcher::open(StateStore::open_in_memory().unwrap(), defs).unwrap()
    }

    fn no_assocs() -> Vec<String> {
        Vec::new()
    }

    #[test]
    fn association_matching_rules() {
        assert!(associations_match("*", &["public".to_string()]));
        assert!(associations_match("public,private", &no_assocs()));
        assert!(associations_match(
            "public, private",
            &["private".to_string()]
        ));
        // A single miss disqualifies — no partial credit.
        assert!(!associations_match(
            "public",
            &["public".to_string(), "private".to_string()]
        ));
    }

    #[test]
    fn empty_first_preference() {
        // Host A fully empty, host B 50% used but listed first
        // alphabetically would win without the vacancy pass.
        let m = matcher(vec![def("default", 1, &[("a-used", 1000, "*"), ("b-empty", 1000, "*")])]);
        // Occupy half of a-used.
        let h = m.reserve_space(Some("default"), 500, &no_assocs()).unwrap();
        assert_eq!(h, "a-used");

        // 400 MB fits both, but b-empty is vacant and must win.
        let h = m.reserve_space(Some("default"), 400, &no_assocs()).unwrap();
        assert_eq!(h, "b-empty");
    }

    #[test]
    fn second_pass_uses_fragmented_entries() {
        let m = matcher(vec![def("default", 1, &[("n1", 1000, "*")])]);
        m.reserve_space(None, 300, &no_assocs()).unwrap();
        // No vacant entry remains; the fragmented one still qualifies.
        let h = m.reserve_space(None, 500, &no_assocs()).unwrap();
        assert_eq!(h, "n1");
        assert_eq!(m.totals().free_mb, 200);
    }

    #[test]
    fn denial_reasons_are_distinguishable() {
        let m = matcher(vec![def("default", 1, &[("n1", 100, "*")])]);

        let unknown = m.reserve_space(Some("nope"), 10, &no_assocs());
        assert!(matches!(unknown, Err(PoolError::Denied(ref r)) if r.contains("unknown pool")));

        let m2 = matcher(vec![def("empty", 1, &[])]);
        let bare = m2.reserve_space(Some("empty"), 10, &no_assocs());
        assert!(matches!(bare, Err(PoolError::Denied(ref r)) if r.contains("no entries")));

        let no_fit = m.reserve_space(Some("default"), 500, &no_assocs());
        assert!(matches!(no_fit, Err(PoolError::Denied(ref r)) if r.contains("no entry satisfies")));
    }

    #[test]
    fn association_miss_disqualifies_entry() {
        let m = matcher(vec![def(
            "default",
            1,
            &[("plain", 1000, "public"), ("both", 1000, "public,private")],
        )]);
        let need = vec!["public".to_string(), "private".to_string()];
        let h = m.reserve_space(None, 100, &need).unwrap();
        assert_eq!(h, "both");
    }

    #[test]
    fn retire_returns_memory_and_clamps() {
        let m = matcher(vec![def("default", 1, &[("n1", 1000, "*")])]);
        m.reserve_space(None, 600, &no_assocs()).unwrap();
        m.retire_mem("n1", 600).unwrap();
        assert_eq!(m.totals().free_mb, 1000);

        // Retiring more than was leased clamps at mem_max.
        m.retire_mem("n1", 500).unwrap();
        assert_eq!(m.totals().free_mb, 1000);
    }

    #[test]
    fn retire_unknown_host_is_a_warning_not_an_error() {
        let m = matcher(vec![def("default", 1, &[("n1", 1000, "*")])]);
        m.retire_mem("gone", 100).unwrap();
    }

    #[test]
    fn invariant_holds_under_mixed_operations() {
        let m = matcher(vec![def("default", 1, &[("n1", 1000, "*"), ("n2", 500, "*")])]);
        m.reserve_space(None, 400, &no_assocs()).unwrap();
        m.reserve_space(None, 500, &no_assocs()).unwrap();
        m.retire_mem("n1", 400).unwrap();
        m.reserve_space(None, 300, &no_assocs()).unwrap();

        for e in m.entries() {
            assert!(e.mem_current <= e.mem_max, "entry {} over max", e.hostname);
        }
    }

    #[test]
    fn reload_preserves_in_use_for_unchanged_entries() {
        let m = matcher(vec![def("default", 7, &[("n1", 1000, "*")])]);
        m.reserve_space(None, 600, &no_assocs()).unwrap();

        // Same definition, same mtime — accounting untouched.
        m.reload(vec![def("default", 7, &[("n1", 1000, "*")])]).unwrap();
        assert_eq!(m.totals(), PoolTotals { free_mb: 400, max_mb: 1000 });
    }

    #[test]
    fn reload_recomputes_changed_entries() {
        let m = matcher(vec![def("default", 7, &[("n1", 1000, "*")])]);
        m.reserve_space(None, 600, &no_assocs()).unwrap();

        // Capacity grew: current = 2000 − 600 in use.
        m.reload(vec![def("default", 8, &[("n1", 2000, "*")])]).unwrap();
        assert_eq!(m.totals(), PoolTotals { free_mb: 1400, max_mb: 2000 });

        // Capacity shrank below in-use: clamp to zero, never negative.
        m.reload(vec![def("default", 9, &[("n1", 500, "*")])]).unwrap();
        assert_eq!(m.totals(), PoolTotals { free_mb: 0, max_mb: 500 });

        // Retiring the original lease later clamps at the new max.
        m.retire_mem("n1", 600).unwrap();
        assert_eq!(m.totals(), PoolTotals { free_mb: 500, max_mb: 500 });
    }

    #[test]
    fn reload_drops_vanished_pools() {
        let m = matcher(vec![
            def("default", 1, &[("n1", 1000, "*")]),
            def("gpu", 1, &[("g1", 4000, "*")]),
        ]);
        m.reload(vec![def("default", 1, &[("n1", 1000, "*")])]).unwrap();

        assert!(matches!(
            m.reserve_space(Some("gpu"), 100, &no_assocs()),
            Err(PoolError::Denied(_))
        ));
        assert_eq!(m.totals(), PoolTotals { free_mb: 1000, max_mb: 1000 });
    }

    #[test]
    fn open_recovers_accounting_from_the_store() {
        let store = StateStore::open_in_memory().unwrap();
        {
            let m = PoolMatcher::open(store.clone(), vec![def("default", 1, &[("n1", 1000, "*")])])
                .unwrap();
            m.reserve_space(None, 250, &no_assocs()).unwrap();
        }

        // A fresh matcher over the same store must not double-allocate.
        let m = PoolMatcher::open(store, vec![def("default", 2, &[("n1", 1000, "*")])]).unwrap();
        assert_eq!(m.totals(), PoolTotals { free_mb: 750, max_mb: 1000 });
    }
}
