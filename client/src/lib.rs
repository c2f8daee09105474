// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The surface a generated PTG module (the external translator collaborator,
//! §1) links against: a fluent builder over `engine::taskclass::TaskClass`
//! and a thin wrapper for assembling a set of classes into a submittable
//! `engine::handle::Handle`.
//!
//! Grounded on the teacher's `userlib` crate: `userlib` is the thin, safe
//! surface a hand-written task links against to talk to the kernel (`sys_*`
//! wrappers over raw syscalls) without knowing the kernel's internal
//! representation; `client` plays the same role here, wrapping `engine`'s
//! internal `TaskClass`/`Handle` construction behind a builder a translator
//! (or, in this workspace, a human test author) can use without
//! hand-assembling every field and getting `dependencies_goal` or
//! `mask_bit` wrong.

use std::collections::HashMap;
use std::sync::Arc;

use engine::taskclass::{
    compute_deps_goal, AffinityFn, Expr, FlowDesc, FlowKind, HookFn, InDep, KeyToStringFn, OutDep, ParamDesc,
    ProduceFn, TaskClass,
};
use engine::{Context, EngineResult, Handle};
use abi::{ClassFlags, FlowIndex, HandleId, Priority, Rank, TaskClassId};

mod err;
pub use err::ClientError;

pub use engine::taskclass::{locals_as_bytes_produce, EvalCtx};

/// Builds one `TaskClass` (§3 "Task class", §6 "Task-class description").
///
/// Required fields (`hook`, `data_affinity`) have no default: a translator
/// that forgets to set them gets a compile-time-adjacent error from
/// [`TaskClassBuilder::build`] rather than a silently-degenerate class.
pub struct TaskClassBuilder {
    id: TaskClassId,
    name: &'static str,
    params: Vec<ParamDesc>,
    num_locals: usize,
    flows: Vec<FlowDesc>,
    flags: ClassFlags,
    default_priority: Priority,
    hook: Option<HookFn>,
    data_affinity: Option<AffinityFn>,
    key_to_string: Option<KeyToStringFn>,
    produce: Option<ProduceFn>,
}

impl TaskClassBuilder {
    pub fn new(id: TaskClassId, name: &'static str) -> Self {
        TaskClassBuilder {
            id,
            name,
            params: Vec::new(),
            num_locals: 0,
            flows: Vec::new(),
            flags: ClassFlags::default(),
            default_priority: Priority(0),
            hook: None,
            data_affinity: None,
            key_to_string: None,
            produce: None,
        }
    }

    /// Appends one parameter descriptor. `num_locals` grows to match if it
    /// has not been set explicitly, since `L >= P` always holds (§3).
    pub fn param(mut self, desc: ParamDesc) -> Self {
        self.params.push(desc);
        self.num_locals = self.num_locals.max(self.params.len());
        self
    }

    /// Convenience for the common case: a constant `[min, max]` range with
    /// increment 1.
    pub fn param_range(self, min: i32, max: i32) -> Self {
        self.param(ParamDesc::range(min, max))
    }

    /// Sets `L`, the local-variable count, explicitly -- for classes that
    /// bind locals beyond their own parameters (e.g. a value computed by an
    /// earlier out-dep's `bind_successor_locals`). Must be `>= P`.
    pub fn locals(mut self, n: usize) -> Self {
        self.num_locals = n;
        self
    }

    pub fn flow(mut self, name: &'static str, kind: FlowKind, in_deps: Vec<InDep>, out_deps: Vec<OutDep>) -> Self {
        self.flows.push(FlowDesc::new(name, kind, in_deps, out_deps));
        self
    }

    pub fn flags(mut self, flags: ClassFlags) -> Self {
        self.flags = flags;
        self
    }

    pub fn priority(mut self, priority: i32) -> Self {
        self.default_priority = Priority(priority);
        self
    }

    pub fn hook(mut self, hook: impl Fn(&[i32], &[i32]) -> i32 + Send + Sync + 'static) -> Self {
        self.hook = Some(Arc::new(hook));
        self
    }

    pub fn data_affinity(mut self, affinity: impl Fn(&[i32]) -> Rank + Send + Sync + 'static) -> Self {
        self.data_affinity = Some(Arc::new(affinity));
        self
    }

    /// `key_to_string` (§10.6): defaults to a generic `name(p0,p1,...)`
    /// formatter if never set, so every class is diagnosable even when a
    /// translator doesn't bother to customize it.
    pub fn key_to_string(mut self, f: impl Fn(&[i32]) -> String + Send + Sync + 'static) -> Self {
        self.key_to_string = Some(Arc::new(f));
        self
    }

    pub fn produce(mut self, produce: ProduceFn) -> Self {
        self.produce = Some(produce);
        self
    }

    /// Convenience: every output flow produces the instance's locals,
    /// little-endian -- the default a translator reaches for when it does
    /// not care what bytes flow downstream, only that something does.
    pub fn produce_locals_as_bytes(mut self) -> Self {
        let output_flows: Vec<FlowIndex> = self
            .flows
            .iter()
            .enumerate()
            .filter(|(_, f)| f.kind.is_output())
            .map(|(i, _)| FlowIndex(i as u8))
            .collect();
        self.produce = Some(locals_as_bytes_produce(output_flows));
        self
    }

    /// Assembles the class, deriving `dependencies_goal` from the flow
    /// table (§10.6's `TaskClass::compute_deps_goal` helper) rather than
    /// asking the caller to hand-compute the bitmask.
    pub fn build(mut self) -> Result<Arc<TaskClass>, ClientError> {
        let hook = self.hook.ok_or(ClientError::MissingHook(self.name))?;
        let data_affinity = self.data_affinity.ok_or(ClientError::MissingAffinity(self.name))?;
        if self.num_locals < self.params.len() {
            return Err(ClientError::TooFewLocals(self.name));
        }
        let goal = compute_deps_goal(&mut self.flows);
        let name = self.name;
        let key_to_string = self
            .key_to_string
            .unwrap_or_else(|| default_key_to_string(name));
        let produce = self.produce.ok_or(ClientError::MissingProduce(self.name))?;

        Ok(Arc::new(TaskClass {
            id: self.id,
            name: self.name,
            params: self.params,
            num_locals: self.num_locals,
            flows: self.flows,
            dependencies_goal: goal,
            flags: self.flags,
            default_priority: self.default_priority,
            hook,
            data_affinity,
            key_to_string,
            produce,
        }))
    }
}

fn default_key_to_string(name: &'static str) -> KeyToStringFn {
    Arc::new(move |params: &[i32]| {
        let rendered: Vec<String> = params.iter().map(|v| v.to_string()).collect();
        format!("{name}({})", rendered.join(","))
    })
}

/// A guard expression that is always true -- shorthand for an unconditional
/// in-dep/out-dep edge.
pub fn always() -> Expr {
    Expr::Const(1)
}

/// An in-dep edge with no guard, naming its producer directly.
pub fn simple_in_dep(source_class: TaskClassId, source_flow: FlowIndex) -> InDep {
    InDep::simple(source_class, source_flow)
}

/// An out-dep edge whose destination locals are exactly the source's
/// locals, unconditionally -- the common "pass everything straight
/// through" successor shape.
pub fn passthrough_out_dep(dest_class: TaskClassId, dest_flow: FlowIndex) -> OutDep {
    OutDep {
        guard: None,
        dest_class,
        dest_flow,
        bind_successor_locals: Arc::new(|locals: &[i32]| locals.to_vec()),
    }
}

/// Assembles a set of classes into one submittable [`Handle`] (§3 "Handle").
/// This is the `client`-facing equivalent of a PTG translator's generated
/// "build the task graph" entrypoint.
pub struct HandleBuilder {
    classes: HashMap<TaskClassId, Arc<TaskClass>>,
}

impl Default for HandleBuilder {
    fn default() -> Self {
        HandleBuilder { classes: HashMap::new() }
    }
}

impl HandleBuilder {
    pub fn new() -> Self {
        HandleBuilder::default()
    }

    pub fn class(mut self, class: Arc<TaskClass>) -> Self {
        self.classes.insert(class.id, class);
        self
    }

    pub fn classes(mut self, classes: impl IntoIterator<Item = Arc<TaskClass>>) -> Self {
        for class in classes {
            self.classes.insert(class.id, class);
        }
        self
    }

    pub fn build(self) -> Arc<Handle> {
        Handle::new(self.classes)
    }
}

/// Registers `handle` with `ctx` and enqueues its startup instances --
/// `handle_register` plus `enqueue` from §6's entrypoint list, folded into
/// one call since a `client` caller never wants to register without also
/// discovering startup work.
pub fn submit(ctx: &Context, handle: Arc<Handle>) -> EngineResult<HandleId> {
    ctx.enqueue(handle)
}

#[cfg(test)]
mod tests {
    use super::*;
    use engine::taskclass::locals_as_bytes_produce;

    fn solo_class(id: u32) -> Arc<TaskClass> {
        TaskClassBuilder::new(TaskClassId(id), "solo")
            .param_range(0, 3)
            .flow("out", FlowKind::Write, Vec::new(), Vec::new())
            .hook(|_, _| 0)
            .data_affinity(|_| Rank(0))
            .produce(locals_as_bytes_produce(vec![FlowIndex(0)]))
            .build()
            .unwrap()
    }

    #[test]
    fn builder_derives_deps_goal_and_mask_bits() {
        let class = TaskClassBuilder::new(TaskClassId(1), "consumer")
            .flow("in", FlowKind::Read, vec![simple_in_dep(TaskClassId(2), FlowIndex(0))], Vec::new())
            .flow("ctl", FlowKind::Control, vec![InDep::pure_control()], Vec::new())
            .hook(|_, _| 0)
            .data_affinity(|_| Rank(0))
            .produce_locals_as_bytes()
            .build()
            .unwrap();
        assert_eq!(class.dependencies_goal, 0b11);
    }

    #[test]
    fn builder_rejects_missing_hook() {
        let err = TaskClassBuilder::new(TaskClassId(3), "broken")
            .data_affinity(|_| Rank(0))
            .produce(locals_as_bytes_produce(vec![]))
            .build()
            .unwrap_err();
        assert!(matches!(err, ClientError::MissingHook("broken")));
    }

    #[test]
    fn handle_builder_assembles_and_submits() {
        let class = solo_class(9);
        let handle = HandleBuilder::new().class(class).build();

        let mut config = engine::ContextConfig::default();
        config.cores = 1;
        let ctx = Context::init(config).unwrap();
        let id = submit(&ctx, Arc::clone(&handle)).unwrap();
        assert_eq!(id, HandleId(0));
        assert_eq!(handle.remaining_tasks(), 4);
    }
}
