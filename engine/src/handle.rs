// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The handle (§3 "Handle"): one registered, in-flight task graph.
//!
//! Grounded on the teacher kernel's `Task` record in spirit only -- a handle
//! is not a schedulable entity itself, it is the owner of the per-graph
//! state (task classes, dependency store, data-repo, remaining-task count,
//! completion callback) that every task instance of that graph shares. The
//! one-`DependencyStore`-per-handle shape (rather than §3's one-per-class)
//! is a documented simplification: [`InstanceKey`] already carries the task
//! class id, so a single lazily-populated map serves every class in the
//! handle without losing the "one readiness word per instance" contract.

use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, OnceLock};

use counters::Count;
use parking_lot::Mutex;

use crate::datarepo::DataRepo;
use crate::depstore::DependencyStore;
use crate::instance::{new_instance_pool, InstanceKey, InstancePool, TaskInstance};
use crate::taskclass::{EvalCtx, TaskClass};
use abi::{HandleId, ParamTuple, Priority, Rank, TaskClassId};

counters::counters!(HANDLE_EVENTS, HandleEvent);

#[derive(Copy, Clone, Count)]
enum HandleEvent {
    /// A task instance was discovered (registered in the dependency store)
    /// but is not yet ready to run.
    Discovered,
    /// A task instance finished executing.
    Executed,
}

/// Per-handle diagnostic counts, per §10.6 "Handle-level statistics": tasks
/// executed versus tasks discovered-but-not-yet-ready.
#[derive(Debug, Default, Clone, Copy)]
pub struct HandleStats {
    pub discovered: u32,
    pub executed: u32,
}

type CompletionCallback = Box<dyn FnOnce(HandleId) + Send + 'static>;

/// One registered task graph (§3 "Handle", §6 handle entrypoints).
pub struct Handle {
    id: OnceLock<HandleId>,
    classes: HashMap<TaskClassId, Arc<TaskClass>>,
    depstore: DependencyStore,
    datarepo: DataRepo,
    /// C2: the memory pool task instances of this handle's classes are
    /// checked out of and returned to (§4.1, §3 "Task instance" lifecycle).
    instance_pool: InstancePool,
    /// Number of task instances known to be outstanding: incremented when an
    /// instance becomes ready (startup enumeration or release-deps fan-out),
    /// decremented when that instance finishes executing. Reaching 0 fires
    /// the completion callback exactly once (§6, §8 property 4).
    ///
    /// This is a simplification of the original's `nb_local_tasks`, which
    /// additionally tracks an "unrolling in progress" phase so the counter
    /// never observes a premature zero while the graph is still being
    /// discovered. Here, every increment strictly happens-before the
    /// corresponding decrement (an instance is never decremented until the
    /// worker that ran it observed it in the first place), so the same
    /// invariant holds without a separate phase flag.
    remaining_tasks: AtomicI64,
    callback: Mutex<Option<CompletionCallback>>,
    completed: Mutex<bool>,
    stats: Mutex<HandleStats>,
}

impl Handle {
    pub fn new(classes: HashMap<TaskClassId, Arc<TaskClass>>) -> Arc<Handle> {
        Arc::new(Handle {
            id: OnceLock::new(),
            classes,
            depstore: DependencyStore::new(),
            datarepo: DataRepo::new(),
            instance_pool: new_instance_pool(),
            remaining_tasks: AtomicI64::new(0),
            callback: Mutex::new(None),
            completed: Mutex::new(false),
            stats: Mutex::new(HandleStats::default()),
        })
    }

    /// The id assigned by the registry at `handle_register` time.
    ///
    /// # Panics
    /// Panics if called before registration -- mirrors the C API's
    /// undefined behavior for using a handle before `handle_register`.
    pub fn id(&self) -> HandleId {
        *self.id.get().expect("handle used before handle_register")
    }

    pub(crate) fn assign_id(&self, id: HandleId) {
        self.id.set(id).expect("handle already registered");
    }

    pub fn classes(&self) -> &HashMap<TaskClassId, Arc<TaskClass>> {
        &self.classes
    }

    pub fn class(&self, id: TaskClassId) -> Option<&Arc<TaskClass>> {
        self.classes.get(&id)
    }

    pub fn depstore(&self) -> &DependencyStore {
        &self.depstore
    }

    pub fn datarepo(&self) -> &DataRepo {
        &self.datarepo
    }

    pub fn instance_pool(&self) -> &InstancePool {
        &self.instance_pool
    }

    pub fn stats(&self) -> HandleStats {
        *self.stats.lock()
    }

    pub fn set_complete_callback(&self, cb: impl FnOnce(HandleId) + Send + 'static) {
        *self.callback.lock() = Some(Box::new(cb));
    }

    /// `handle_dec_nbtask`: drops the remaining-task counter by `n`. Invokes
    /// the completion callback exactly once, from whichever caller's
    /// decrement is the one that observes the counter reach zero.
    pub fn dec_nbtask(&self, n: i64) {
        HandleEvent::Executed.count(&HANDLE_EVENTS);
        let after = self.remaining_tasks.fetch_sub(n, Ordering::AcqRel) - n;
        debug_assert!(after >= 0, "handle remaining-task counter went negative");
        self.stats.lock().executed += 1;
        if after == 0 {
            let mut completed = self.completed.lock();
            if !*completed {
                *completed = true;
                if let Some(cb) = self.callback.lock().take() {
                    cb(self.id());
                }
            }
        }
    }

    /// `pub(crate)` so the release-deps fan-out (C7) and the remote-dep
    /// landing path (C8) can count a freshly-ready successor as outstanding
    /// the moment it is created, not just at startup enumeration.
    pub(crate) fn inc_nbtask(&self, n: i64) {
        self.remaining_tasks.fetch_add(n, Ordering::AcqRel);
    }

    pub fn remaining_tasks(&self) -> i64 {
        self.remaining_tasks.load(Ordering::Acquire)
    }

    /// Discovers this handle's startup instances (§4.3 "Initial state"): for
    /// every class whose `dependencies_goal` is the empty mask (mask
    /// encoding) or whose fixed counter target is 0, walks the Cartesian
    /// product of its parameter space -- `min`/`max`/`inc`, each possibly an
    /// inline expression over previously bound locals (§10.6's left-to-right
    /// ordering) -- and keeps only the instances this `local_rank` owns per
    /// the class's `data_affinity` predicate.
    ///
    /// Every other class is left untouched: its instances are discovered
    /// lazily by the release-deps fan-out (C7) the first time a producer
    /// names them, exactly as §4.6's `ensure_registered` does.
    pub fn enqueue_startup_instances(&self, local_rank: Rank) -> Vec<TaskInstance> {
        let mut out = Vec::new();
        for class in self.classes.values() {
            if !is_startup_class(class) {
                continue;
            }
            let mut locals = Vec::with_capacity(class.num_params());
            enumerate_params(class, 0, &mut locals, &mut |locals| {
                let rank = (class.data_affinity)(locals);
                if rank != local_rank {
                    return;
                }
                let key = InstanceKey::new(self.id(), class.id, ParamTuple::from_slice(locals));
                if class.flags.use_deps_mask {
                    self.depstore.install_mask(key, 0, true);
                } else {
                    self.depstore.install_counter(key, Some(0));
                }
                HandleEvent::Discovered.count(&HANDLE_EVENTS);
                self.stats.lock().discovered += 1;
                self.inc_nbtask(1);
                out.push(TaskInstance::new(
                    &self.instance_pool,
                    key,
                    locals.to_vec(),
                    rank,
                    class.default_priority,
                ));
            });
        }
        out
    }
}

/// A class has no antecedents -- and so is eligible for upfront startup
/// enumeration -- exactly when its static `dependencies_goal` requires
/// nothing: an empty mask, or (for the counter encoding) a fixed target of
/// zero. A class with any real producer dependency is discovered lazily
/// instead (§4.6).
fn is_startup_class(class: &TaskClass) -> bool {
    if class.flags.use_deps_mask {
        class.dependencies_goal == 0
    } else {
        !class.flags.has_in_in_dependencies && !class.flags.has_ctl_gather && class.dependencies_goal == 0
    }
}

fn enumerate_params(class: &TaskClass, depth: usize, locals: &mut Vec<i32>, on_tuple: &mut dyn FnMut(&[i32])) {
    if depth == class.params.len() {
        on_tuple(locals);
        return;
    }
    let eval_ctx = EvalCtx { globals: &[], locals };
    let param = &class.params[depth];
    let min = param.min.eval(eval_ctx);
    let max = param.max.eval(eval_ctx);
    let inc = param.inc.eval(eval_ctx).max(1);

    let mut value = min;
    while value <= max {
        locals.push(value);
        enumerate_params(class, depth + 1, locals, on_tuple);
        locals.pop();
        value += inc;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::taskclass::{compute_deps_goal, FlowDesc, FlowKind, ParamDesc};
    use abi::{ClassFlags, FlowIndex};
    use std::sync::atomic::AtomicU32;

    fn startup_class(id: u32, p_min: i32, p_max: i32) -> Arc<TaskClass> {
        let mut flows = vec![FlowDesc {
            name: "out",
            kind: FlowKind::Write,
            in_deps: Vec::new(),
            out_deps: Vec::new(),
            mask_bit: None,
        }];
        let goal = compute_deps_goal(&mut flows);
        Arc::new(TaskClass {
            id: TaskClassId(id),
            name: "startup",
            params: vec![ParamDesc::range(p_min, p_max)],
            num_locals: 1,
            flows,
            dependencies_goal: goal,
            flags: ClassFlags::default(),
            default_priority: Priority(0),
            hook: Arc::new(|_, _| 0),
            data_affinity: Arc::new(|_| Rank(0)),
            key_to_string: Arc::new(|p| format!("startup({p:?})")),
            produce: crate::taskclass::locals_as_bytes_produce(vec![FlowIndex(0)]),
        })
    }

    #[test]
    fn startup_enumeration_respects_param_range_and_affinity() {
        let class = startup_class(1, 0, 3);
        let mut classes = HashMap::new();
        classes.insert(class.id, class);
        let handle = Handle::new(classes);
        handle.assign_id(HandleId(0));

        let instances = handle.enqueue_startup_instances(Rank(0));
        assert_eq!(instances.len(), 4);
        assert_eq!(handle.remaining_tasks(), 4);
    }

    #[test]
    fn dec_nbtask_fires_callback_exactly_once() {
        let class = startup_class(2, 0, 0);
        let mut classes = HashMap::new();
        classes.insert(class.id, class);
        let handle = Handle::new(classes);
        handle.assign_id(HandleId(5));

        let fired = Arc::new(AtomicU32::new(0));
        let fired_cb = Arc::clone(&fired);
        handle.set_complete_callback(move |id| {
            assert_eq!(id, HandleId(5));
            fired_cb.fetch_add(1, Ordering::SeqCst);
        });

        let instances = handle.enqueue_startup_instances(Rank(0));
        assert_eq!(instances.len(), 1);
        handle.dec_nbtask(1);
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }
}
