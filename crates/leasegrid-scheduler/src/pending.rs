//! Creation-pending id tracking.
//!
//! Ids are announced here before the backing instance record is
//! guaranteed visible to lookups, so a state notification racing ahead of
//! object creation can tell a benign in-flight create from a genuine
//! inconsistency. Guarded independently of the main scheduling paths —
//! it is consulted on every notification.

use std::collections::HashSet;
use std::sync::Mutex;

use leasegrid_state::InstanceId;

/// Shared set of ids whose creation is in flight.
#[derive(Default)]
pub struct PendingSet {
    ids: Mutex<HashSet<InstanceId>>,
}

impl PendingSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Open the pending window for a batch of ids.
    pub fn mark_all(&self, ids: &[InstanceId]) {
        let mut set = self.ids.lock().expect("pending set poisoned");
        set.extend(ids.iter().copied());
    }

    /// Close the window for one id. Returns true if it was pending, so a
    /// double notification clears at most once.
    pub fn clear(&self, id: InstanceId) -> bool {
        self.ids.lock().expect("pending set poisoned").remove(&id)
    }

    /// Close the window for a batch (error backout path).
    pub fn clear_all(&self, ids: &[InstanceId]) {
        let mut set = self.ids.lock().expect("pending set poisoned");
        for id in ids {
            set.remove(id);
        }
    }

    pub fn is_pending(&self, id: InstanceId) -> bool {
        self.ids.lock().expect("pending set poisoned").contains(&id)
    }

    pub fn len(&self) -> usize {
        self.ids.lock().expect("pending set poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mark_query_clear() {
        let pending = PendingSet::new();
        pending.mark_all(&[1, 2, 3]);

        assert!(pending.is_pending(2));
        assert!(pending.clear(2));
        assert!(!pending.clear(2)); // second clear is a no-op
        assert!(!pending.is_pending(2));

        pending.clear_all(&[1, 3, 99]);
        assert!(pending.is_empty());
    }
}
