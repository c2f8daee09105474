// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! C7: the release-deps engine (§4.6) -- the fan-out that runs after a task
//! instance completes, routing each successor either into the local ready
//! list or into an outgoing remote-dep packet.
//!
//! Grounded on the teacher kernel's `task::force_fault`/notification-fanout
//! shape (one completed entity driving updates to several dependents under
//! a shared table lock) generalized from "tasks blocked on a notification
//! mask" to "task instances blocked on a dependency readiness word."

use std::collections::HashMap;
use std::sync::Arc;

use tracing::{instrument, trace, warn};

use crate::datarepo::DataRepo;
use crate::depstore::{DependencyStore, Readiness};
use crate::err::{EngineError, EngineResult};
use crate::instance::{DataPair, InputBinding, InstanceKey, InstancePool, TaskInstance};
use crate::ready::{ExecutionUnitId, Scheduler};
use crate::remote::RemoteDep;
use crate::taskclass::{EvalCtx, TaskClass};
use abi::{FlowIndex, HandleId, Rank, TaskClassId};

/// Everything the release-deps fan-out needs to touch, borrowed for the
/// duration of one call. Built fresh by the worker loop (C6) from the
/// handle's owned state rather than stored, since its lifetime is tied to
/// one completed-instance event.
pub struct ReleaseContext<'a> {
    pub handle: HandleId,
    pub classes: &'a HashMap<TaskClassId, Arc<TaskClass>>,
    pub depstore: &'a DependencyStore,
    pub datarepo: &'a DataRepo,
    pub pool: &'a InstancePool,
    pub scheduler: &'a dyn Scheduler,
    pub remote: &'a RemoteDep,
    pub local_rank: Rank,
    pub eu: ExecutionUnitId,
    /// Counts a freshly-ready successor as outstanding the instant it is
    /// created (`Handle::inc_nbtask`), so the remaining-task counter only
    /// reaches zero once every successor it ever produced has, in turn,
    /// completed -- not just when the instance that produced it has.
    pub nbtask_inc: &'a dyn Fn(i64),
}

/// A locally-ready successor the caller must still place: either scheduled
/// normally, or -- for `IMMEDIATE_TASK` classes -- executed inline on the
/// current worker before `release_deps` returns to its caller, per §4.6.
pub enum Placement {
    Scheduled,
    Immediate(TaskInstance),
}

/// Drives the release-deps fan-out for one completed instance (§4.6).
/// `produced` holds the data this instance published for each of its own
/// output flows, keyed by flow index, already retained once for the
/// fan-out's own bookkeeping purposes (the caller owns publishing it into
/// the data-repo entry beforehand).
#[instrument(skip(ctx, produced), fields(class = ?completed_class.id))]
pub fn release_deps(
    ctx: &ReleaseContext<'_>,
    completed_key: InstanceKey,
    completed_class: &TaskClass,
    completed_locals: &[i32],
    produced: &HashMap<FlowIndex, DataPair>,
) -> EngineResult<Vec<Placement>> {
    let source_entry = ctx.datarepo.lookup_or_create(completed_key);
    for pair in produced.values() {
        source_entry.publish(pair.clone());
    }

    let mut placements = Vec::new();

    for (flow_index, flow) in completed_class.flows.iter().enumerate() {
        if !flow.kind.is_output() {
            continue;
        }
        let source_flow = FlowIndex(flow_index as u8);
        for out_dep in &flow.out_deps {
            let eval_ctx = EvalCtx { globals: &[], locals: completed_locals };
            if let Some(guard) = &out_dep.guard {
                if guard.eval(eval_ctx) == 0 {
                    continue;
                }
            }

            let dest_locals = (out_dep.bind_successor_locals)(completed_locals);
            let dest_class = ctx
                .classes
                .get(&out_dep.dest_class)
                .ok_or(EngineError::UnknownClass(out_dep.dest_class))?;
            let dest_params = &dest_locals[..dest_class.num_params()];
            let dest_rank = (dest_class.data_affinity)(dest_params);
            let dest_key = InstanceKey::new(
                ctx.handle,
                out_dep.dest_class,
                abi::ParamTuple::from_slice(dest_params),
            );

            if dest_rank != ctx.local_rank {
                trace!(?dest_rank, dest_class = ?out_dep.dest_class, "routing successor remotely");
                ctx.remote.activate(
                    dest_rank,
                    ctx.handle,
                    out_dep.dest_class,
                    out_dep.dest_flow,
                    abi::ParamTuple::from_slice(dest_params),
                    completed_class.default_priority,
                    &source_entry,
                    source_flow,
                )?;
                continue;
            }

            ensure_registered(ctx.depstore, dest_key, dest_class);

            let readiness = if dest_class.flags.use_deps_mask {
                // The readiness word is indexed by the compacted input-only
                // mask bit, not `out_dep.dest_flow`'s raw position in
                // `dest_class.flows` -- translate before OR-ing it in.
                let mask_flow = dest_class.mask_bit(out_dep.dest_flow);
                let dest_class = Arc::clone(dest_class);
                ctx.depstore.arrive_mask(dest_key, mask_flow, || {
                    check_in_dependencies_with_mask(&dest_class, &dest_locals)
                })
            } else {
                let dest_class = Arc::clone(dest_class);
                let dest_locals_owned = dest_locals.clone();
                ctx.depstore.arrive_counter(dest_key, move || {
                    count_in_dependencies_with_counter(&dest_class, &dest_locals_owned)
                })
            };

            if readiness != Readiness::Ready {
                continue;
            }

            ctx.datarepo.retain(&source_entry);
            let inputs = vec![InputBinding {
                dest_flow: out_dep.dest_flow,
                source_key: completed_key,
                source_flow,
            }];

            (ctx.nbtask_inc)(1);
            let new_instance =
                TaskInstance::new(ctx.pool, dest_key, dest_locals, dest_rank, dest_class.default_priority)
                    .with_inputs(inputs);

            if dest_class.flags.immediate_task {
                placements.push(Placement::Immediate(new_instance));
            } else {
                ctx.scheduler.schedule(ctx.eu, new_instance);
                placements.push(Placement::Scheduled);
            }
        }
    }

    Ok(placements)
}

/// Registers `dest_key` in the dependency store on first touch, using the
/// class's static `dependencies_goal` (mask) or a fixed counter target when
/// the class has no per-instance-variable target. `pub(crate)` because the
/// remote-dep dispatch (C8) applies the same first-touch registration to a
/// destination instance named by an inbound `ACTIVATE`.
pub(crate) fn ensure_registered(depstore: &DependencyStore, dest_key: InstanceKey, dest_class: &TaskClass) {
    if depstore.contains(dest_key) {
        return;
    }
    if dest_class.flags.use_deps_mask {
        depstore.install_mask(dest_key, dest_class.dependencies_goal, false);
    } else {
        let fixed = if dest_class.flags.has_in_in_dependencies || dest_class.flags.has_ctl_gather {
            None
        } else {
            Some(dest_class.dependencies_goal as i32)
        };
        depstore.install_counter(dest_key, fixed);
    }
}

/// `check_IN_dependencies_with_mask` (§4.3): the bitmask of input flows that
/// have no producing task at all, or whose guard is false for this
/// instance's locals -- both conditions pre-satisfy the bit without an
/// actual arrival.
pub(crate) fn check_in_dependencies_with_mask(class: &TaskClass, locals: &[i32]) -> u32 {
    let eval_ctx = EvalCtx { globals: &[], locals };
    let mut bits = 0u32;
    for flow in &class.flows {
        if !flow.kind.is_input() {
            continue;
        }
        let Some(bit) = flow.mask_bit else { continue };
        let pre_satisfied = flow.in_deps.iter().all(|dep| {
            if dep.source_class.is_none() {
                return true;
            }
            match &dep.guard {
                Some(guard) => guard.eval(eval_ctx) == 0,
                None => false,
            }
        });
        if pre_satisfied {
            bits |= 1 << bit;
        }
    }
    bits
}

/// `count_IN_dependencies_with_counter` (§4.3): sums `ctl_gather_nb`
/// expressions where present, else +1 per matched in-dep, across every
/// input flow. `pub(crate)` for the same reason as [`ensure_registered`]:
/// the remote-dep dispatch (C8) folds a `PUT_DATA` arrival through the same
/// counter protocol a local successor uses.
pub(crate) fn count_in_dependencies_with_counter(class: &TaskClass, locals: &[i32]) -> i32 {
    let eval_ctx = EvalCtx { globals: &[], locals };
    let mut total = 0i32;
    for flow in &class.flows {
        if !flow.kind.is_input() {
            continue;
        }
        for dep in &flow.in_deps {
            if let Some(guard) = &dep.guard {
                if guard.eval(eval_ctx) == 0 {
                    continue;
                }
            }
            total += match &dep.ctl_gather_nb {
                Some(expr) => expr.eval(eval_ctx),
                None => 1,
            };
        }
    }
    total
}

/// Releases the input bindings an instance consumed once it has finished
/// executing (worker loop, C6), dropping the corresponding producer
/// data-repo references. A producer's refcount reaches zero exactly when
/// every successor that retained it has, in turn, completed and released it
/// -- testable property 3.
pub fn release_consumed_inputs(datarepo: &DataRepo, instance: &TaskInstance) {
    for binding in &instance.inputs {
        if let Some(entry) = datarepo.lookup(binding.source_key) {
            datarepo.release(&entry);
        }
    }
}
