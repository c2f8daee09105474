// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! C10: context lifecycle -- `init`, thread spawn, topology binding, `fini`
//! (§4.9).
//!
//! `init` allocates the fixed records -- VPs and per-VP worker thread
//! handles -- and binds each execution unit to its assigned slot before
//! handing control to the run loop. `fini` is the mirror image, tearing
//! everything down in reverse order.

use std::collections::HashMap;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use clap::Parser;
use tracing::{info, warn};

use crate::datarepo::DataRepo;
use crate::err::{EngineError, EngineResult};
use crate::handle::Handle;
use crate::ready::{DefaultScheduler, Scheduler};
use crate::registry::HandleRegistry;
use crate::remote::{LoopbackTransport, Network, RemoteDep, Transport};
use crate::sync::Barrier;
use crate::vpmap::{parse_binding, parse_vpmap, Binding, VpMap};
use crate::worker::{VirtualProcess, Worker, WorkerShared};
use abi::{HandleId, Rank};

/// `Context::init`'s configuration, parsed either from `argv` (§6's CLI
/// grammar, via `clap`, matching the `cli` crate's own parser) or built
/// programmatically -- so embedding the engine from a test does not require
/// faking `argv` (§10.4).
#[derive(Clone, Debug, Parser)]
#[command(name = "ptg-engine", disable_help_flag = true)]
pub struct ContextConfig {
    /// `-c/--cores`
    #[arg(short = 'c', long, default_value_t = default_cores())]
    pub cores: usize,

    /// `-V/--vpmap`
    #[arg(short = 'V', long = "vpmap", default_value = "flat")]
    pub vpmap: String,

    /// `-b/--dague_bind`
    #[arg(short = 'b', long = "dague_bind")]
    pub bind: Option<String>,

    /// `-C/--dague_bind_comm`
    #[arg(short = 'C', long = "dague_bind_comm")]
    pub bind_comm: Option<usize>,

    /// `-H/--ht`
    #[arg(short = 'H', long = "ht", default_value_t = 1)]
    pub hyperthreads: usize,

    /// `--dot[=FILE]`: accepted and stored per §6, but the .dot emitter
    /// itself is out of scope (§1) -- the context only remembers the toggle
    /// for a collaborator to consult.
    #[arg(long = "dot")]
    pub dot: Option<Option<String>>,

    /// Local rank of this process in the distributed run. Not part of §6's
    /// CLI grammar (which is node-local); set by whatever launcher starts
    /// one process per rank. Defaults to 0 for single-node use.
    #[arg(skip)]
    pub rank: Rank,
}

impl Default for ContextConfig {
    fn default() -> Self {
        ContextConfig {
            cores: default_cores(),
            vpmap: "flat".to_string(),
            bind: None,
            bind_comm: None,
            hyperthreads: 1,
            dot: None,
            rank: Rank(0),
        }
    }
}

fn default_cores() -> usize {
    num_cpus::get().max(1)
}

/// The materialized VP layout derived from a [`ContextConfig`]'s vp-map
/// (§4.9 step 2). `flat` yields one VP per core, one worker per VP;
/// `rr:vps:threads:cores` yields the requested shape directly; `hwloc` and
/// `file:` defer to a real topology/file reader out of scope here and fall
/// back to `flat` with a logged warning (§7 Config policy).
fn materialize_vps(config: &ContextConfig) -> Vec<VirtualProcess> {
    let vpmap = parse_vpmap(&config.vpmap).unwrap_or_else(|err| {
        warn!(error = %err, "falling back to flat vp-map");
        VpMap::Flat
    });

    let binding = config.bind.as_deref().and_then(|s| match parse_binding(s) {
        Ok(b) => Some(b),
        Err(err) => {
            warn!(error = %err, "ignoring unparseable core binding");
            None
        }
    });
    let bound_cores: Option<Vec<usize>> = match &binding {
        Some(Binding::Inline { selector, .. }) => Some(selector.resolve(config.cores)),
        _ => None,
    };

    match vpmap {
        VpMap::RoundRobin { vps, threads, cores: _ } => (0..vps as u32)
            .map(|vp_id| {
                let cores = (0..threads)
                    .map(|w| {
                        bound_cores
                            .as_ref()
                            .map(|list| list[(vp_id as usize * threads + w) % list.len().max(1)])
                    })
                    .collect();
                VirtualProcess::new(vp_id, cores)
            })
            .collect(),
        VpMap::Flat | VpMap::Hwloc => {
            let n = config.cores.max(1);
            let cores = bound_cores.unwrap_or_else(|| (0..n).collect());
            (0..n as u32)
                .map(|i| VirtualProcess::new(i, vec![cores.get(i as usize).copied()]))
                .collect()
        }
        VpMap::File(_) => {
            warn!("file: vp-map requires a topology reader outside the engine's scope; falling back to flat");
            let n = config.cores.max(1);
            (0..n as u32).map(|i| VirtualProcess::new(i, vec![Some(i as usize)])).collect()
        }
    }
}

/// The running context: owns every VP's worker threads, the handle registry,
/// the scheduler, and the remote-dep engine for one node's lifetime (§4.9).
pub struct Context {
    config: ContextConfig,
    vps: Vec<VirtualProcess>,
    scheduler: Arc<dyn Scheduler>,
    registry: Arc<HandleRegistry>,
    shared: Vec<Arc<WorkerShared>>,
    spawned: Vec<crate::worker::SpawnedVp>,
    comm: Option<crate::commthread::CommThreadHandle>,
    comm_join: Option<std::thread::JoinHandle<()>>,
    started: bool,
}

impl Context {
    /// `init(nb_cores, argv) → context` (§4.9 / §6). Parses configuration,
    /// discovers/materializes the VP layout, and allocates the context and
    /// per-VP records. Does *not* spawn threads or enqueue any handle yet --
    /// that is `start`'s job, so a caller can `enqueue` before the first
    /// `select` ever runs (step 4 of §4.9 folds spawn + enqueue-eligibility
    /// together in the original; splitting them here lets `client` submit a
    /// handle from the same thread that will become worker 0).
    pub fn init(config: ContextConfig) -> EngineResult<Context> {
        info!(cores = config.cores, vpmap = %config.vpmap, "engine init");
        let vps = materialize_vps(&config);
        let total_workers: usize = vps.iter().map(VirtualProcess::worker_count).sum();
        if total_workers == 0 {
            return Err(EngineError::Resource("vp-map produced zero workers".into()));
        }
        let scheduler: Arc<dyn Scheduler> = Arc::new(DefaultScheduler::new(vps.len()));
        Ok(Context {
            config,
            vps,
            scheduler,
            registry: Arc::new(HandleRegistry::new()),
            shared: Vec::new(),
            spawned: Vec::new(),
            comm: None,
            comm_join: None,
            started: false,
        })
    }

    pub fn from_args() -> EngineResult<Context> {
        Self::init(ContextConfig::parse())
    }

    /// `handle_register` plus startup-instance discovery and scheduling
    /// (§4.9's `enqueue`): registers the handle, discovers its startup
    /// instances for this rank, and hands each one to the scheduler for the
    /// VP its class's data-affinity selects (here: always VP 0, since a
    /// single-node `Context` has not yet picked a VP-assignment policy for
    /// startup instances beyond "the first one" -- documented as an explicit
    /// simplification in DESIGN.md).
    pub fn enqueue(&self, handle: Arc<Handle>) -> EngineResult<HandleId> {
        let id = self.registry.register(Arc::clone(&handle));
        let instances = handle.enqueue_startup_instances(self.config.rank);
        let eu = crate::ready::ExecutionUnitId { vp: 0, worker: 0 };
        for instance in instances {
            self.scheduler.schedule(eu, instance);
        }
        Ok(id)
    }

    pub fn lookup(&self, id: HandleId) -> Option<Arc<Handle>> {
        self.registry.lookup(id)
    }

    /// `start(context)` (§6, §4.9 step 4): spawns `N-1` worker threads; the
    /// caller's own thread is expected to run VP 0 worker 0 by calling
    /// [`Context::run_inline`] afterward (or a real binary does so via the
    /// `cli` crate's main loop).
    pub fn start(&mut self, handle: Arc<Handle>) -> EngineResult<()> {
        if self.started {
            return Err(EngineError::Resource("context already started".into()));
        }
        self.started = true;

        let datarepo = Arc::new(DataRepo::new());
        let network = Network::new();
        let transport: Arc<dyn Transport> =
            Arc::new(LoopbackTransport::new(network, self.config.rank, 16));
        let remote = Arc::new(RemoteDep::new(self.config.rank, transport, Arc::clone(&datarepo)));

        let total_workers: usize = self.vps.iter().map(VirtualProcess::worker_count).sum();
        let barrier = Arc::new(Barrier::new(total_workers.max(1)));
        let master = crate::ready::ExecutionUnitId { vp: 0, worker: 0 };

        // §4.7 model (b): a dedicated comm thread, bound to `-C/--dague_bind_comm`'s
        // core, takes over remote-dep progress entirely; the master worker then
        // asks it to pump instead of ticking the transport itself.
        if let Some(core) = self.config.bind_comm {
            let (comm, join) = crate::commthread::spawn(
                Arc::clone(&remote),
                Some(core),
                Arc::clone(&handle),
                Arc::clone(&self.scheduler),
                self.config.rank,
            );
            self.comm = Some(comm);
            self.comm_join = Some(join);
        }

        for vp in &self.vps {
            let shared = Arc::new(WorkerShared {
                handle: Arc::clone(&handle),
                scheduler: Arc::clone(&self.scheduler),
                remote: Arc::clone(&remote),
                local_rank: self.config.rank,
                barrier: Arc::clone(&barrier),
                finalizing: std::sync::atomic::AtomicBool::new(false),
                remote_driver: master,
                comm: self.comm.clone(),
            });
            let skip_first = vp.vp_id == 0;
            let spawned = vp.spawn_workers(Arc::clone(&shared), skip_first);
            self.shared.push(shared);
            self.spawned.push(spawned);
        }

        Ok(())
    }

    /// Runs the calling thread as VP 0 worker 0, per §4.9 step 4: "the
    /// current thread becomes worker 0 of VP 0." Blocks until `fini` sets the
    /// finalization flag.
    pub fn run_inline(&self) {
        let Some(shared) = self.shared.first().cloned() else {
            return;
        };
        let eu = crate::worker::ExecutionUnit {
            id: crate::ready::ExecutionUnitId { vp: 0, worker: 0 },
            core: self.vps.first().and_then(|vp| vp.cores.first().copied().flatten()),
        };
        Worker::new(eu, shared).run();
    }

    /// `wait(context)` (§6): blocks until every registered handle's
    /// remaining-task counter has reached zero. Polling rather than a
    /// dedicated condvar, since completion is already observable through
    /// each handle's own counter and this keeps `wait` decoupled from how
    /// many handles are outstanding.
    pub fn wait(&self, handle: &Handle) {
        while handle.remaining_tasks() > 0 {
            std::thread::sleep(std::time::Duration::from_micros(500));
        }
    }

    /// `progress(context)` (§6): a single pump of remote-dep traffic, for
    /// callers that want application-driven progress instead of (or in
    /// addition to) the worker-loop ticks of §4.7's model (a). Only does
    /// anything once a comm thread (model (b)) is running -- before `start`,
    /// or under model (a), remote-dep progress is entirely the worker loop's
    /// job, since it alone carries the handle and release-deps context a
    /// landed `PUT_DATA` needs.
    pub fn progress(&self) {
        if let Some(comm) = &self.comm {
            comm.want_progress();
        }
    }

    /// `fini(context)` (§4.9): sets the finalization flag, releases the
    /// barrier so any workers still parked in startup observe it, joins
    /// every spawned worker thread, then tears down the scheduler, remote-dep
    /// engine, and registries (all simply dropped with the `Context`, in
    /// reverse order of the `Arc`s built during `init`/`start`).
    pub fn fini(mut self) {
        for shared in &self.shared {
            shared.finalizing.store(true, Ordering::Release);
            shared.barrier.release_all();
        }
        for spawned in self.spawned.drain(..) {
            for handle in spawned.handles {
                let _ = handle.join();
            }
        }
        if let Some(comm) = self.comm.take() {
            comm.shutdown();
        }
        if let Some(join) = self.comm_join.take() {
            let _ = join.join();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::taskclass::{compute_deps_goal, locals_as_bytes_produce, FlowDesc, FlowKind, ParamDesc, TaskClass};
    use abi::{ClassFlags, FlowIndex, Priority, TaskClassId};
    use std::sync::atomic::AtomicU32;

    fn single_class() -> Arc<TaskClass> {
        let mut flows = vec![FlowDesc {
            name: "out",
            kind: FlowKind::Write,
            in_deps: Vec::new(),
            out_deps: Vec::new(),
            mask_bit: None,
        }];
        let goal = compute_deps_goal(&mut flows);
        Arc::new(TaskClass {
            id: TaskClassId(1),
            name: "solo",
            params: vec![ParamDesc::range(0, 0)],
            num_locals: 1,
            flows,
            dependencies_goal: goal,
            flags: ClassFlags::default(),
            default_priority: Priority(0),
            hook: Arc::new(|_, _| 0),
            data_affinity: Arc::new(|_| Rank(0)),
            key_to_string: Arc::new(|p| format!("solo({p:?})")),
            produce: locals_as_bytes_produce(vec![FlowIndex(0)]),
        })
    }

    /// Scenario S1 (§8), end to end through `Context`.
    #[test]
    fn s1_through_context_lifecycle() {
        let class = single_class();
        let mut classes = HashMap::new();
        classes.insert(class.id, class);
        let handle = Handle::new(classes);

        let fired = Arc::new(AtomicU32::new(0));
        let fired2 = Arc::clone(&fired);
        handle.set_complete_callback(move |_| {
            fired2.fetch_add(1, Ordering::SeqCst);
        });

        let mut config = ContextConfig::default();
        config.cores = 2;
        let mut ctx = Context::init(config).unwrap();
        ctx.enqueue(Arc::clone(&handle)).unwrap();
        ctx.start(Arc::clone(&handle)).unwrap();

        let shared0 = Arc::clone(&ctx.shared[0]);
        let core0 = ctx.vps[0].cores.first().copied().flatten();
        let inline = std::thread::spawn(move || {
            let eu = crate::worker::ExecutionUnit {
                id: crate::ready::ExecutionUnitId { vp: 0, worker: 0 },
                core: core0,
            };
            Worker::new(eu, shared0).run();
        });

        ctx.wait(&handle);
        assert_eq!(fired.load(Ordering::SeqCst), 1);

        ctx.fini();
        inline.join().unwrap();
    }

    #[test]
    fn init_rejects_empty_vp_map() {
        let mut config = ContextConfig::default();
        config.vpmap = "rr:0:0:0".to_string();
        assert!(Context::init(config).is_err());
    }
}
