// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! C5: the ready-list and the pluggable scheduler contract (§4.4).
//!
//! An intrusive doubly-linked ring would let a task instance be
//! pushed/removed without allocating; the nearest safe-Rust equivalent that
//! keeps the same priority-then-FIFO ordering contract without unsafe
//! intrusive links is a `BinaryHeap` keyed on `(priority, insertion
//! sequence)`, giving the same "higher priority first, FIFO among ties"
//! guarantee (see DESIGN.md for the tradeoff). The scheduler trait below is
//! the real deliverable -- only its *contract* is fixed, not a built-in
//! work-stealing implementation.

use std::cmp::Ordering as CmpOrdering;
use std::collections::BinaryHeap;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;

use crate::instance::TaskInstance;
use crate::sync::Barrier;

struct Ranked {
    instance: TaskInstance,
    sequence: u64,
}

impl PartialEq for Ranked {
    fn eq(&self, other: &Self) -> bool {
        self.instance.priority == other.instance.priority && self.sequence == other.sequence
    }
}
impl Eq for Ranked {}

impl PartialOrd for Ranked {
    fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
        Some(self.cmp(other))
    }
}

impl Ord for Ranked {
    fn cmp(&self, other: &Self) -> CmpOrdering {
        // BinaryHeap is a max-heap: higher priority should sort greater;
        // among equal priorities, the *earlier* sequence number (FIFO)
        // should sort greater so it pops first.
        self.instance
            .priority
            .cmp(&other.instance.priority)
            .then_with(|| other.sequence.cmp(&self.sequence))
    }
}

/// A priority-ordered ready list, push-sorted with FIFO tie-breaking.
pub struct ReadyRing {
    heap: Mutex<BinaryHeap<Ranked>>,
    next_sequence: AtomicU64,
}

impl Default for ReadyRing {
    fn default() -> Self {
        ReadyRing {
            heap: Mutex::new(BinaryHeap::new()),
            next_sequence: AtomicU64::new(0),
        }
    }
}

impl ReadyRing {
    pub fn new() -> Self {
        ReadyRing::default()
    }

    /// Inserts `instance`, maintaining priority order (§4.4 `push_sorted`).
    pub fn push_sorted(&self, instance: TaskInstance) {
        let sequence = self.next_sequence.fetch_add(1, Ordering::Relaxed);
        self.heap.lock().push(Ranked { instance, sequence });
    }

    /// Removes and returns the highest-priority, earliest-inserted
    /// instance, or `None` if the ring is empty. Non-blocking, per the
    /// scheduler contract's requirement on `select`.
    pub fn pop(&self) -> Option<TaskInstance> {
        self.heap.lock().pop().map(|r| r.instance)
    }

    pub fn len(&self) -> usize {
        self.heap.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Execution-unit identity handed to the scheduler by the worker loop (C6).
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct ExecutionUnitId {
    pub vp: u32,
    pub worker: u32,
}

/// The pluggable scheduler capability set from §4.4 / §9: `{select,
/// schedule, flow_init}`. Deliberately not a built-in work-stealing pool --
/// per the design note, only this contract is in scope. [`DefaultScheduler`]
/// below is the one implementation the engine needs to function end to end;
/// named alternatives (LFQ, GD, LHQ, AP, PBQ, LTQ) are out of scope.
pub trait Scheduler: Send + Sync {
    /// Called once per worker during startup, under the workers' barrier.
    fn flow_init(&self, eu: ExecutionUnitId, barrier: &Barrier) {
        let _ = (eu, barrier);
    }

    /// Non-blocking: returns the next instance this execution unit should
    /// run, or `None` if nothing is ready for it right now.
    fn select(&self, eu: ExecutionUnitId) -> Option<TaskInstance>;

    /// Hands a freshly-ready instance to the scheduler for placement.
    fn schedule(&self, eu: ExecutionUnitId, instance: TaskInstance);
}

/// A scheduler with one [`ReadyRing`] per virtual process, shared by every
/// worker in that VP (§4.5: "a VP groups workers that share memory pools and
/// a scheduler scoreboard"). `select` always checks its own VP's ring only;
/// cross-VP stealing is explicitly out of scope (§1 Non-goals).
pub struct DefaultScheduler {
    rings: Vec<ReadyRing>,
}

impl DefaultScheduler {
    pub fn new(num_vps: usize) -> Self {
        DefaultScheduler {
            rings: (0..num_vps).map(|_| ReadyRing::new()).collect(),
        }
    }

    fn ring(&self, vp: u32) -> &ReadyRing {
        &self.rings[vp as usize]
    }
}

impl Scheduler for DefaultScheduler {
    fn select(&self, eu: ExecutionUnitId) -> Option<TaskInstance> {
        self.ring(eu.vp).pop()
    }

    fn schedule(&self, eu: ExecutionUnitId, instance: TaskInstance) {
        self.ring(eu.vp).push_sorted(instance);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::instance::InstanceKey;
    use abi::{HandleId, ParamTuple, Priority, Rank, TaskClassId};

    fn instance(priority: i32, n: i32) -> TaskInstance {
        let pool = crate::instance::new_instance_pool();
        TaskInstance::new(
            &pool,
            InstanceKey::new(HandleId(0), TaskClassId(0), ParamTuple::from_slice(&[n])),
            vec![n],
            Rank(0),
            Priority(priority),
        )
    }

    #[test]
    fn higher_priority_pops_first() {
        let ring = ReadyRing::new();
        ring.push_sorted(instance(1, 1));
        ring.push_sorted(instance(5, 2));
        ring.push_sorted(instance(3, 3));

        assert_eq!(ring.pop().unwrap().priority, Priority(5));
        assert_eq!(ring.pop().unwrap().priority, Priority(3));
        assert_eq!(ring.pop().unwrap().priority, Priority(1));
        assert!(ring.pop().is_none());
    }

    #[test]
    fn equal_priority_is_fifo() {
        let ring = ReadyRing::new();
        ring.push_sorted(instance(1, 10));
        ring.push_sorted(instance(1, 20));
        ring.push_sorted(instance(1, 30));

        assert_eq!(ring.pop().unwrap().locals, vec![10]);
        assert_eq!(ring.pop().unwrap().locals, vec![20]);
        assert_eq!(ring.pop().unwrap().locals, vec![30]);
    }

    #[test]
    fn default_scheduler_isolates_vps() {
        let sched = DefaultScheduler::new(2);
        let eu0 = ExecutionUnitId { vp: 0, worker: 0 };
        let eu1 = ExecutionUnitId { vp: 1, worker: 0 };
        sched.schedule(eu0, instance(1, 1));
        assert!(sched.select(eu1).is_none());
        assert!(sched.select(eu0).is_some());
    }
}

/// §8 testable property 7: for any two ready tasks A, B with
/// `priority(A) > priority(B)` pushed in arbitrary order, `select` (here,
/// `pop`) returns A before B.
#[cfg(test)]
mod proptests {
    use super::*;
    use crate::instance::InstanceKey;
    use abi::{HandleId, ParamTuple, Priority, Rank, TaskClassId};
    use proptest::prelude::*;

    fn instance(priority: i32, n: i32) -> TaskInstance {
        let pool = crate::instance::new_instance_pool();
        TaskInstance::new(
            &pool,
            InstanceKey::new(HandleId(0), TaskClassId(0), ParamTuple::from_slice(&[n])),
            vec![n],
            Rank(0),
            Priority(priority),
        )
    }

    proptest! {
        #[test]
        fn higher_priority_always_pops_before_lower(
            pairs in prop::collection::vec((-1000i32..1000, 0i32..1_000_000), 2..30)
        ) {
            let ring = ReadyRing::new();
            for (i, (priority, _tag)) in pairs.iter().enumerate() {
                ring.push_sorted(instance(*priority, i as i32));
            }

            let mut popped = Vec::new();
            while let Some(inst) = ring.pop() {
                popped.push(inst.priority.0);
            }

            for window in popped.windows(2) {
                prop_assert!(window[0] >= window[1]);
            }
        }
    }
}
