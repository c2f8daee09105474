// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! C3: the data-repo -- a concurrent map from task-instance key to the
//! output data chunks it produced, reference-counted so an entry is
//! reclaimed exactly when its last successor has consumed it (§4.2).
//!
//! A single guarded collection indexed by a stable key, with an "exactly
//! one entry created per key" guarantee provided by doing the lookup-or-insert
//! under one critical section.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::instance::{DataPair, InstanceKey};
use abi::FlowIndex;

/// One produced-data entry: the chunks a task instance emitted, indexed by
/// output flow, plus a reference count of outstanding successors that still
/// need to read it.
pub struct DataRepoEntry {
    pub key: InstanceKey,
    chunks: Mutex<HashMap<FlowIndex, DataPair>>,
    refcount: AtomicUsize,
}

impl DataRepoEntry {
    fn new(key: InstanceKey) -> Self {
        DataRepoEntry {
            key,
            chunks: Mutex::new(HashMap::new()),
            refcount: AtomicUsize::new(0),
        }
    }

    pub fn publish(&self, pair: DataPair) {
        self.chunks.lock().insert(pair.flow, pair);
    }

    pub fn chunk(&self, flow: FlowIndex) -> Option<DataPair> {
        self.chunks.lock().get(&flow).cloned()
    }

    pub fn refcount(&self) -> usize {
        self.refcount.load(Ordering::Acquire)
    }
}

impl Clone for DataPair {
    fn clone(&self) -> Self {
        DataPair { flow: self.flow, data: self.data.clone() }
    }
}

/// The process-wide (per-handle, in practice) data-repo.
#[derive(Default)]
pub struct DataRepo {
    entries: Mutex<HashMap<InstanceKey, Arc<DataRepoEntry>>>,
}

impl DataRepo {
    pub fn new() -> Self {
        DataRepo::default()
    }

    /// Returns the entry for `key`, creating it if absent. At most one
    /// entry is ever created per key even under concurrent callers, since
    /// creation happens under the same lock as the lookup.
    pub fn lookup_or_create(&self, key: InstanceKey) -> Arc<DataRepoEntry> {
        let mut entries = self.entries.lock();
        Arc::clone(
            entries
                .entry(key)
                .or_insert_with(|| Arc::new(DataRepoEntry::new(key))),
        )
    }

    pub fn lookup(&self, key: InstanceKey) -> Option<Arc<DataRepoEntry>> {
        self.entries.lock().get(&key).cloned()
    }

    /// Adds one outstanding successor reference to `entry`.
    pub fn retain(&self, entry: &Arc<DataRepoEntry>) {
        entry.refcount.fetch_add(1, Ordering::AcqRel);
    }

    /// Drops one outstanding successor reference. Returns `true` if this
    /// call dropped the count to zero, in which case the entry has already
    /// been removed from the repo and its chunks dropped.
    pub fn release(&self, entry: &Arc<DataRepoEntry>) -> bool {
        let prev = entry.refcount.fetch_sub(1, Ordering::AcqRel);
        debug_assert!(prev > 0, "data-repo entry released more times than retained");
        if prev == 1 {
            let mut entries = self.entries.lock();
            entries.remove(&entry.key);
            entry.chunks.lock().clear();
            true
        } else {
            false
        }
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::instance::DataRef;
    use abi::{HandleId, ParamTuple, TaskClassId};
    use std::sync::Arc as StdArc;

    fn key(n: i32) -> InstanceKey {
        InstanceKey::new(HandleId(1), TaskClassId(3), ParamTuple::from_slice(&[n]))
    }

    #[test]
    fn lookup_or_create_is_idempotent_per_key() {
        let repo = DataRepo::new();
        let a = repo.lookup_or_create(key(1));
        let b = repo.lookup_or_create(key(1));
        assert!(StdArc::ptr_eq(&a, &b));
    }

    #[test]
    fn release_to_zero_evicts_entry() {
        let repo = DataRepo::new();
        let entry = repo.lookup_or_create(key(2));
        entry.publish(DataPair {
            flow: FlowIndex(0),
            data: DataRef::Local(StdArc::from(vec![9u8])),
        });
        repo.retain(&entry);
        repo.retain(&entry);
        assert!(!repo.release(&entry));
        assert_eq!(repo.len(), 1);
        assert!(repo.release(&entry));
        assert_eq!(repo.len(), 0);
    }
}
