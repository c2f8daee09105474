// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! C6: the execution unit (worker thread) and the virtual process (VP) that
//! groups workers sharing memory pools and a scheduler scoreboard (§4.5).
//!
//! A fixed table of execution contexts is built up front, each bound to its
//! assigned slot (a core, translated through the vp-map), and then control
//! is handed to a per-slot run loop, [`Worker::run`] -- real OS threads
//! rather than a single address space shared by cooperative tasks.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tracing::{info_span, trace, warn};

use crate::err::EngineResult;
use crate::handle::Handle;
use crate::instance::TaskInstance;
use crate::ready::{ExecutionUnitId, Scheduler};
use crate::release::{self, Placement, ReleaseContext};
use crate::remote::{RemoteDep, RemoteMessage};
use crate::sync::Barrier;
use abi::{FlowIndex, Rank};

/// One thread of execution, bound to a core (§4.5). Built by [`VirtualProcess::spawn_workers`];
/// never constructed directly by application code.
pub struct ExecutionUnit {
    pub id: ExecutionUnitId,
    pub core: Option<usize>,
}

/// A group of workers sharing memory pools and a scheduler scoreboard
/// (§3 "VP (virtual process)"). One [`ReadyRing`](crate::ready::ReadyRing) per
/// VP already lives inside the scheduler (§4.4); the VP record here is the
/// thing the context (C10) spawns threads against.
pub struct VirtualProcess {
    pub vp_id: u32,
    pub cores: Vec<Option<usize>>,
}

impl VirtualProcess {
    pub fn new(vp_id: u32, cores: Vec<Option<usize>>) -> Self {
        VirtualProcess { vp_id, cores }
    }

    pub fn worker_count(&self) -> usize {
        self.cores.len()
    }
}

/// Shared, read-only state every worker thread needs for the lifetime of a
/// run: the handle being executed, the scheduler, the remote-dep engine, and
/// the shutdown flag. Built once by the context (C10) and handed to every
/// spawned thread as an `Arc`.
pub struct WorkerShared {
    pub handle: Arc<Handle>,
    pub scheduler: Arc<dyn Scheduler>,
    pub remote: Arc<RemoteDep>,
    pub local_rank: Rank,
    pub barrier: Arc<Barrier>,
    pub finalizing: AtomicBool,
    /// Only the worker with this identity additionally drives remote-dep
    /// progress on idle ticks, per §4.5 "the 'master' worker of VP 0 may
    /// additionally act as the remote-dep driver when no dedicated
    /// communication thread is configured."
    pub remote_driver: ExecutionUnitId,
    /// When `Some`, a dedicated comm thread (§4.7 model (b)) already drives
    /// remote-dep progress; the `remote_driver` worker asks it for a pump
    /// instead of ticking the transport itself.
    pub comm: Option<crate::commthread::CommThreadHandle>,
}

/// Drives one worker's progress loop (§4.5): select, execute, release,
/// occasionally tick remote-dep progress.
pub struct Worker {
    eu: ExecutionUnit,
    shared: Arc<WorkerShared>,
}

impl Worker {
    pub fn new(eu: ExecutionUnit, shared: Arc<WorkerShared>) -> Self {
        Worker { eu, shared }
    }

    /// Binds this thread to its assigned core, if any, then enters the
    /// startup barrier. Mirrors §4.5: "each worker binds its thread to its
    /// assigned core ... then enters a barrier."
    fn bind_and_wait(&self) {
        if let Some(core_id) = self.eu.core {
            if let Some(core) = core_affinity::get_core_ids()
                .and_then(|cores| cores.into_iter().find(|c| c.id == core_id))
            {
                if !core_affinity::set_for_current(core) {
                    warn!(core = core_id, "failed to bind worker thread to core");
                }
            } else {
                warn!(core = core_id, "requested core not present in topology");
            }
        }
        self.shared.scheduler.flow_init(self.eu.id, &self.shared.barrier);
        self.shared.barrier.wait();
    }

    /// The main progress loop (§4.5 (i)-(iii)). Returns once the shared
    /// finalization flag is observed set and this worker's own ready-list
    /// ring is drained -- matching §5's "any still-ready tasks are simply
    /// not drained" only at the granularity `fini` actually enforces (the
    /// final barrier, not an exhaustive drain guarantee).
    pub fn run(self) {
        let span = info_span!("worker", vp = self.eu.id.vp, worker = self.eu.id.worker);
        let _enter = span.enter();
        self.bind_and_wait();

        loop {
            if self.shared.finalizing.load(Ordering::Acquire) {
                break;
            }

            match self.shared.scheduler.select(self.eu.id) {
                Some(instance) => self.execute_one(instance),
                None => {
                    if self.eu.id == self.shared.remote_driver {
                        match &self.shared.comm {
                            Some(comm) => comm.want_progress(),
                            None => self.tick_remote(),
                        }
                    }
                    std::thread::yield_now();
                }
            }
        }
    }

    /// Invokes the task body for `instance`, then drives the release-deps
    /// fan-out (C7) for its completion, handling any `IMMEDIATE_TASK`
    /// successors in-line per §4.6 (and, per §9's open question, without
    /// bounding the recursion depth -- a faithful port of the original's
    /// stack-frame execution, not the "safer" deferred-ring alternative the
    /// spec names but does not mandate).
    fn execute_one(&self, instance: TaskInstance) {
        let handle = &self.shared.handle;
        let Some(class) = handle.class(instance.key.class).cloned() else {
            warn!(class = ?instance.key.class, "executing instance of unknown class");
            return;
        };

        trace!(key = %class.format_key(&instance.locals), "executing");

        let mut input_lens = Vec::with_capacity(instance.inputs.len());
        for binding in &instance.inputs {
            let len = handle
                .datarepo()
                .lookup(binding.source_key)
                .and_then(|entry| entry.chunk(binding.source_flow))
                .and_then(|pair| pair.data.as_local().map(|b| b.len() as i32))
                .unwrap_or(0);
            input_lens.push(len);
        }

        let status = (class.hook)(&instance.locals, &input_lens);
        if status != 0 {
            warn!(status, class = ?class.id, "task hook returned nonzero status");
        }

        let produced = (class.produce)(&instance.locals);
        let produced = produced
            .into_iter()
            .map(|(flow, bytes)| {
                (
                    flow,
                    crate::instance::DataPair {
                        flow,
                        data: crate::instance::DataRef::Local(std::sync::Arc::from(bytes)),
                    },
                )
            })
            .collect();

        release::release_consumed_inputs(handle.datarepo(), &instance);

        let nbtask_inc = |n: i64| handle.inc_nbtask(n);
        let release_ctx = ReleaseContext {
            handle: handle.id(),
            classes: handle.classes(),
            depstore: handle.depstore(),
            datarepo: handle.datarepo(),
            pool: handle.instance_pool(),
            scheduler: self.shared.scheduler.as_ref(),
            remote: self.shared.remote.as_ref(),
            local_rank: self.shared.local_rank,
            eu: self.eu.id,
            nbtask_inc: &nbtask_inc,
        };

        match release::release_deps(&release_ctx, instance.key, &class, &instance.locals, &produced) {
            Ok(placements) => self.run_immediate_placements(placements),
            Err(err) => warn!(error = %err, "release-deps fan-out failed"),
        }

        handle.dec_nbtask(1);
    }

    fn run_immediate_placements(&self, placements: Vec<Placement>) {
        for placement in placements {
            if let Placement::Immediate(instance) = placement {
                self.execute_one(instance);
            }
        }
    }

    /// §4.7 progress model (a): polled from workers, no dedicated
    /// communication thread. Drains whatever the transport delivered and
    /// dispatches each message to the local release-deps path.
    fn tick_remote(&self) {
        for (from, message) in self.shared.remote.poll() {
            if let Err(err) = self.dispatch_remote(from, message) {
                warn!(error = %err, ?from, "remote-dep dispatch failed");
            }
        }
    }

    fn dispatch_remote(&self, from: Rank, message: RemoteMessage) -> EngineResult<()> {
        dispatch_remote_message(
            &self.shared.handle,
            self.shared.scheduler.as_ref(),
            self.shared.remote.as_ref(),
            self.shared.local_rank,
            self.eu.id,
            from,
            message,
            &|instance| self.execute_one(instance),
        )
    }
}

/// Dispatches one drained remote message against a handle's full state.
/// Free-standing rather than a `Worker` method so both progress models of
/// §4.7 can drive it: model (a)'s worker polling ([`Worker::dispatch_remote`])
/// and model (b)'s dedicated comm thread ([`crate::commthread`]), which owns
/// no `Worker` of its own. `on_immediate` is how a landed `PUT_DATA`'s
/// `IMMEDIATE_TASK` successor (if any) gets placed: a worker runs it inline,
/// the comm thread instead schedules it like any other instance (§9's design
/// note: the comm thread does not execute task bodies).
pub(crate) fn dispatch_remote_message(
    handle: &Handle,
    scheduler: &dyn Scheduler,
    remote: &RemoteDep,
    local_rank: Rank,
    eu: ExecutionUnitId,
    from: Rank,
    message: RemoteMessage,
    on_immediate: &dyn Fn(TaskInstance),
) -> EngineResult<()> {
    match message {
        RemoteMessage::Activate { header, offered } => {
            let dest_key = crate::remote::activated_instance_key(handle.id(), &header);
            if let Some(class) = handle.class(header.dest_class).cloned() {
                release::ensure_registered(handle.depstore(), dest_key, &class);
            }
            for (_flow, cookie) in offered {
                remote.request(from, cookie, dest_key, header.dest_flow)?;
            }
            Ok(())
        }
        RemoteMessage::GetData { cookie } => remote.serve(from, cookie),
        RemoteMessage::PutData { cookie, bytes } => {
            remote.complete_send(cookie);
            land_put_data(handle, scheduler, remote, local_rank, eu, from, cookie, bytes, on_immediate)
        }
    }
}

/// Step 4 of §4.7: a landed `PUT_DATA` drives the local release-deps engine
/// for the instance it completes, exactly as a local successor would be
/// driven by [`release::release_deps`] -- publish the chunk under a
/// synthetic local key, run the same mask/counter arrival protocol, and
/// place the result if it turns out ready.
#[allow(clippy::too_many_arguments)]
fn land_put_data(
    handle: &Handle,
    scheduler: &dyn Scheduler,
    remote: &RemoteDep,
    local_rank: Rank,
    eu: ExecutionUnitId,
    from: Rank,
    cookie: abi::DataCookie,
    bytes: Arc<[u8]>,
    on_immediate: &dyn Fn(TaskInstance),
) -> EngineResult<()> {
    let Some((dest_key, dest_flow)) = remote.take_inbound(cookie) else {
        warn!(?cookie, ?from, "PUT_DATA landed for an unknown or already-consumed cookie");
        return Ok(());
    };
    let class = handle
        .class(dest_key.class)
        .cloned()
        .ok_or(crate::err::EngineError::UnknownClass(dest_key.class))?;

    let source_key = crate::remote::remote_source_key(handle.id(), cookie);
    let source_entry = handle.datarepo().lookup_or_create(source_key);
    source_entry.publish(crate::instance::DataPair {
        flow: dest_flow,
        data: crate::instance::DataRef::Local(bytes),
    });

    release::ensure_registered(handle.depstore(), dest_key, &class);
    let dest_locals = dest_key.params.as_slice();

    let readiness = if class.flags.use_deps_mask {
        // Same translation as `release::release_deps`: the readiness word
        // is indexed by the compacted input-only mask bit, not `dest_flow`'s
        // raw position in the class's flow table.
        let mask_flow = class.mask_bit(dest_flow);
        let class_for_retry = Arc::clone(&class);
        handle.depstore().arrive_mask(dest_key, mask_flow, || {
            release::check_in_dependencies_with_mask(&class_for_retry, dest_locals)
        })
    } else {
        let class_for_retry = Arc::clone(&class);
        let locals_owned = dest_locals.to_vec();
        handle.depstore().arrive_counter(dest_key, move || {
            release::count_in_dependencies_with_counter(&class_for_retry, &locals_owned)
        })
    };

    if readiness != crate::depstore::Readiness::Ready {
        return Ok(());
    }

    handle.datarepo().retain(&source_entry);
    let inputs = vec![crate::instance::InputBinding {
        dest_flow,
        source_key,
        source_flow: dest_flow,
    }];
    handle.inc_nbtask(1);
    let instance =
        TaskInstance::new(handle.instance_pool(), dest_key, dest_locals.to_vec(), local_rank, class.default_priority)
            .with_inputs(inputs);

    if class.flags.immediate_task {
        on_immediate(instance);
    } else {
        scheduler.schedule(eu, instance);
    }
    Ok(())
}

/// Convenience bundle handed out by [`VirtualProcess::spawn_workers`]: every
/// join handle for this VP's worker threads, so the context (C10) can join
/// them all at `fini` without re-deriving the VP/worker layout.
pub struct SpawnedVp {
    pub vp_id: u32,
    pub handles: Vec<std::thread::JoinHandle<()>>,
}

impl VirtualProcess {
    /// Spawns one OS thread per worker in this VP, each running [`Worker::run`].
    /// The calling thread is expected to become worker 0 of VP 0 itself (C10
    /// step 4); this spawns the remaining `N-1`.
    pub fn spawn_workers(
        &self,
        shared: Arc<WorkerShared>,
        skip_first: bool,
    ) -> SpawnedVp {
        let mut handles = Vec::new();
        for (idx, core) in self.cores.iter().enumerate() {
            if skip_first && idx == 0 {
                continue;
            }
            let eu = ExecutionUnit {
                id: ExecutionUnitId { vp: self.vp_id, worker: idx as u32 },
                core: *core,
            };
            let shared = Arc::clone(&shared);
            let vp_id = self.vp_id;
            let name = format!("ptg-vp{vp_id}-w{idx}");
            let join = std::thread::Builder::new()
                .name(name)
                .spawn(move || Worker::new(eu, shared).run())
                .expect("failed to spawn worker thread");
            handles.push(join);
        }
        SpawnedVp { vp_id: self.vp_id, handles }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handle::Handle;
    use crate::ready::DefaultScheduler;
    use crate::remote::{LoopbackTransport, Network};
    use crate::taskclass::{compute_deps_goal, locals_as_bytes_produce, FlowDesc, FlowKind, ParamDesc, TaskClass};
    use abi::{ClassFlags, HandleId, Priority};
    use std::collections::HashMap;
    use std::sync::atomic::AtomicU32;

    fn single_write_class() -> Arc<TaskClass> {
        let mut flows = vec![FlowDesc {
            name: "out",
            kind: FlowKind::Write,
            in_deps: Vec::new(),
            out_deps: Vec::new(),
            mask_bit: None,
        }];
        let goal = compute_deps_goal(&mut flows);
        Arc::new(TaskClass {
            id: abi::TaskClassId(1),
            name: "s1",
            params: vec![ParamDesc::range(0, 0)],
            num_locals: 1,
            flows,
            dependencies_goal: goal,
            flags: ClassFlags::default(),
            default_priority: Priority(0),
            hook: Arc::new(|_, _| 0),
            data_affinity: Arc::new(|_| Rank(0)),
            key_to_string: Arc::new(|p| format!("s1({p:?})")),
            produce: locals_as_bytes_produce(vec![FlowIndex(0)]),
        })
    }

    /// Scenario S1 (§8): single task, single node, no network activity.
    #[test]
    fn s1_single_task_completes_and_fires_callback() {
        let class = single_write_class();
        let mut classes = HashMap::new();
        classes.insert(class.id, class);
        let handle = Handle::new(classes);
        handle.assign_id(HandleId(1));

        let fired = Arc::new(AtomicU32::new(0));
        let fired2 = Arc::clone(&fired);
        handle.set_complete_callback(move |_| {
            fired2.fetch_add(1, Ordering::SeqCst);
        });

        let instances = handle.enqueue_startup_instances(Rank(0));
        assert_eq!(instances.len(), 1);

        let scheduler: Arc<dyn Scheduler> = Arc::new(DefaultScheduler::new(1));
        let network = Network::new();
        let transport = Arc::new(LoopbackTransport::new(network, Rank(0), 16));
        let remote = Arc::new(RemoteDep::new(
            Rank(0),
            transport,
            Arc::new(crate::datarepo::DataRepo::new()),
        ));
        let eu = ExecutionUnitId { vp: 0, worker: 0 };
        let shared = Arc::new(WorkerShared {
            handle: Arc::clone(&handle),
            scheduler,
            remote,
            local_rank: Rank(0),
            barrier: Arc::new(Barrier::new(1)),
            finalizing: AtomicBool::new(false),
            remote_driver: eu,
            comm: None,
        });

        let worker = Worker::new(ExecutionUnit { id: eu, core: None }, shared);
        worker.execute_one(instances.into_iter().next().unwrap());

        assert_eq!(handle.remaining_tasks(), 0);
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }
}
