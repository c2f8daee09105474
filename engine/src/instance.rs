// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Shared value types for one activated task instance and the data it
//! carries, used by the dependency store (C4), data-repo (C3) and scheduler
//! (C5) alike so none of them need to agree on a shape by convention.
//!
//! Grounded on the teacher kernel's `task::Task` record: a fixed identity
//! (here, a task class plus a parameter tuple, rather than the kernel's
//! task-table index) paired with whatever per-activation state the rest of
//! the system hangs off it.

use std::sync::Arc;

use abi::{DataCookie, FlowIndex, HandleId, ParamTuple, Priority, Rank, TaskClassId};

use crate::pool::{Pool, PoolHandle};

/// Identifies one instance of a parameterized task family: the class plus
/// its bound parameter tuple (§3 "Task instance"). Two instances of
/// different classes, or the same class with different parameters, are
/// always distinct -- this is the key the dependency store indexes by.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub struct InstanceKey {
    pub handle: HandleId,
    pub class: TaskClassId,
    pub params: ParamTuple,
}

impl InstanceKey {
    pub fn new(handle: HandleId, class: TaskClassId, params: ParamTuple) -> Self {
        InstanceKey { handle, class, params }
    }
}

/// Where one piece of flow data lives.
///
/// A task's output is always produced locally and stays `Local` until a
/// remote consumer asks for it (§4.6 three-phase remote-dep protocol); an
/// input that was fetched from a peer is `Local` too, once `PUT_DATA` has
/// landed it in the data-repo. `Remote` is the transient state between
/// `ACTIVATE` and the matching `PUT_DATA`.
#[derive(Clone)]
pub enum DataRef {
    Local(Arc<[u8]>),
    Remote { owner: Rank, cookie: DataCookie },
}

impl DataRef {
    pub fn as_local(&self) -> Option<&Arc<[u8]>> {
        match self {
            DataRef::Local(bytes) => Some(bytes),
            DataRef::Remote { .. } => None,
        }
    }
}

/// One flow's worth of data bound to an instance, as handed to the task
/// hook at execution time or shipped out via `PUT_DATA`.
#[derive(Clone)]
pub struct DataPair {
    pub flow: FlowIndex,
    pub data: DataRef,
}

/// Points a not-yet-executed instance at a producer's published chunk for
/// one of its input flows, so the worker that eventually runs it (C6) can
/// fetch the data without re-walking the dependency graph, and so it knows
/// which data-repo entries to `release` once it has read them.
#[derive(Clone, Copy, Debug)]
pub struct InputBinding {
    pub dest_flow: FlowIndex,
    pub source_key: InstanceKey,
    pub source_flow: FlowIndex,
}

/// The growable buffers behind one checked-out task-instance record (§3
/// "Task instance"): locals and input bindings. This is the `T` the memory
/// pool (C2, §4.1) actually recycles -- on return to the freelist its `Vec`s
/// keep their allocated capacity, so a later checkout reuses the backing
/// storage instead of re-allocating.
#[derive(Default)]
pub struct InstanceSlot {
    pub locals: Vec<i32>,
    pub inputs: Vec<InputBinding>,
}

impl InstanceSlot {
    fn reset(&mut self) {
        self.locals.clear();
        self.inputs.clear();
    }
}

/// The memory pool (C2) backing task-instance records. One per handle,
/// shared by every worker that allocates or frees instances of that
/// handle's classes -- matching §4.1's "per-thread freelist ... falls back
/// to a shared overflow list," with cross-thread free landing wherever the
/// completing worker happens to run, per the pool's own contract.
pub type InstancePool = Pool<InstanceSlot>;

pub fn new_instance_pool() -> InstancePool {
    Pool::new(InstanceSlot::default)
}

/// The fully-bound, ready-to-schedule description of one task instance: its
/// identity, its locals (parameters plus any computed by `release_deps`),
/// the rank and priority the scheduler needs without consulting the
/// dependency store again, and the data-repo bindings for its input flows.
///
/// Backed by a [`PoolHandle<InstanceSlot>`] rather than owning its `Vec`s
/// directly: the record is "allocated from the pool when the engine first
/// decides to schedule it; freed back to the pool after the task completes"
/// (§3 "Task instance" lifecycle) for real, not just in the doc comment --
/// dropping a `TaskInstance` returns its buffers to whichever thread's
/// freelist is current when that happens.
pub struct TaskInstance {
    pub key: InstanceKey,
    pub rank: Rank,
    pub priority: Priority,
    slot: PoolHandle<InstanceSlot>,
}

impl std::ops::Deref for TaskInstance {
    type Target = InstanceSlot;
    fn deref(&self) -> &InstanceSlot {
        &self.slot
    }
}

impl std::ops::DerefMut for TaskInstance {
    fn deref_mut(&mut self) -> &mut InstanceSlot {
        &mut self.slot
    }
}

impl TaskInstance {
    /// Checks out a record from `pool` and populates its locals. Mirrors
    /// §4.6's "allocate a fresh instance from the pool ... copy all fields
    /// except the intrusive link, zero its data-pair array."
    pub fn new(pool: &InstancePool, key: InstanceKey, locals: Vec<i32>, rank: Rank, priority: Priority) -> Self {
        let mut slot = pool.allocate();
        slot.reset();
        slot.locals = locals;
        TaskInstance { key, rank, priority, slot }
    }

    pub fn with_inputs(mut self, inputs: Vec<InputBinding>) -> Self {
        self.slot.inputs = inputs;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn instance_keys_distinguish_params() {
        let handle = HandleId(1);
        let class = TaskClassId(7);
        let a = InstanceKey::new(handle, class, ParamTuple::from_slice(&[1, 2]));
        let b = InstanceKey::new(handle, class, ParamTuple::from_slice(&[1, 3]));
        assert_ne!(a, b);
    }

    #[test]
    fn data_ref_local_projects_bytes() {
        let bytes: Arc<[u8]> = Arc::from(vec![1, 2, 3]);
        let data = DataRef::Local(bytes.clone());
        assert_eq!(data.as_local().unwrap().as_ref(), &[1, 2, 3]);

        let remote = DataRef::Remote { owner: Rank(2), cookie: DataCookie(9) };
        assert!(remote.as_local().is_none());
    }
}
