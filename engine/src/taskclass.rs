// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The task-class ABI (§6): the record a PTG translator (or, in this
//! workspace, the `client` builder) hands the engine to describe one kind of
//! task.
//!
//! A `'static` descriptor plus a handful of hooks, rather than a trait
//! object per task. Hooks are `Arc<dyn Fn>` rather than raw function
//! pointers because a translator's closures routinely capture per-class
//! constant folding (locals count, flow table) that a freestanding `fn`
//! pointer can't carry; see DESIGN.md for the tradeoff.

use std::fmt;
use std::sync::Arc;

use abi::{ClassFlags, FlowIndex, Priority, Rank, TaskClassId};

/// Evaluation context for an inline expression: the handle-level globals
/// (opaque, translator-defined) plus the locals bound so far, in strict
/// left-to-right order per §10.6 -- evaluating parameter `k`'s `min`/`max`/
/// `inc` expression may only read locals `0..k`.
#[derive(Clone, Copy)]
pub struct EvalCtx<'a> {
    pub globals: &'a [i32],
    pub locals: &'a [i32],
}

impl<'a> EvalCtx<'a> {
    pub fn local(&self, index: usize) -> i32 {
        self.locals[index]
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum BinOp {
    Add,
    Sub,
    Mul,
    Div,
}

/// A discriminated expression node. The engine never parses these -- it
/// only evaluates them (§6) -- so `Inline` is the escape hatch a translator
/// uses for anything richer than constant folding and the four binary ops.
#[derive(Clone)]
pub enum Expr {
    Const(i32),
    BinaryOp(BinOp, Box<Expr>, Box<Expr>),
    Inline(Arc<dyn Fn(EvalCtx) -> i32 + Send + Sync>),
}

impl Expr {
    pub fn eval(&self, ctx: EvalCtx) -> i32 {
        match self {
            Expr::Const(v) => *v,
            Expr::BinaryOp(op, lhs, rhs) => {
                let l = lhs.eval(ctx);
                let r = rhs.eval(ctx);
                match op {
                    BinOp::Add => l + r,
                    BinOp::Sub => l - r,
                    BinOp::Mul => l * r,
                    BinOp::Div => l / r,
                }
            }
            Expr::Inline(f) => f(ctx),
        }
    }

    pub fn inline(f: impl Fn(EvalCtx) -> i32 + Send + Sync + 'static) -> Self {
        Expr::Inline(Arc::new(f))
    }
}

impl fmt::Debug for Expr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Expr::Const(v) => write!(f, "Const({v})"),
            Expr::BinaryOp(op, l, r) => write!(f, "BinaryOp({op:?}, {l:?}, {r:?})"),
            Expr::Inline(_) => write!(f, "Inline(..)"),
        }
    }
}

/// `min`/`max`/`inc` for one parameter, each possibly an inline expression
/// over previously bound locals.
#[derive(Clone, Debug)]
pub struct ParamDesc {
    pub min: Expr,
    pub max: Expr,
    pub inc: Expr,
}

impl ParamDesc {
    pub const fn range(min: i32, max: i32) -> Self {
        ParamDesc {
            min: Expr::Const(min),
            max: Expr::Const(max),
            inc: Expr::Const(1),
        }
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum FlowKind {
    Read,
    Write,
    ReadWrite,
    Control,
}

impl FlowKind {
    pub fn is_input(self) -> bool {
        matches!(self, FlowKind::Read | FlowKind::ReadWrite | FlowKind::Control)
    }

    pub fn is_output(self) -> bool {
        matches!(self, FlowKind::Write | FlowKind::ReadWrite)
    }
}

/// One incoming dependency edge declared on an input flow.
#[derive(Clone)]
pub struct InDep {
    /// When `Some`, this in-dep is only active if the guard evaluates to
    /// non-zero for the destination instance's locals.
    pub guard: Option<Expr>,
    /// `None` for a pure control input with no producing task -- these are
    /// pre-satisfied by `check_in_dependencies_with_mask` (§4.3).
    pub source_class: Option<TaskClassId>,
    pub source_flow: Option<FlowIndex>,
    /// Present only on control-gather in-deps (`HAS_CTL_GATHER`): the number
    /// of activations this edge folds in, as a function of the destination
    /// instance's locals.
    pub ctl_gather_nb: Option<Expr>,
}

impl InDep {
    pub fn simple(source_class: TaskClassId, source_flow: FlowIndex) -> Self {
        InDep {
            guard: None,
            source_class: Some(source_class),
            source_flow: Some(source_flow),
            ctl_gather_nb: None,
        }
    }

    pub fn pure_control() -> Self {
        InDep {
            guard: None,
            source_class: None,
            source_flow: None,
            ctl_gather_nb: None,
        }
    }
}

/// One outgoing dependency edge declared on an output flow.
///
/// `bind_successor_locals` computes the destination instance's bound locals
/// (its parameter tuple, left-to-right) from the completed instance's bound
/// locals. A real PTG translator generates this from the dataflow edge's
/// index expressions; here it is supplied directly.
#[derive(Clone)]
pub struct OutDep {
    pub guard: Option<Expr>,
    pub dest_class: TaskClassId,
    pub dest_flow: FlowIndex,
    pub bind_successor_locals: Arc<dyn Fn(&[i32]) -> Vec<i32> + Send + Sync>,
}

#[derive(Clone)]
pub struct FlowDesc {
    pub name: &'static str,
    pub kind: FlowKind,
    pub in_deps: Vec<InDep>,
    pub out_deps: Vec<OutDep>,
    /// Assigned by `compute_deps_goal`: the bit position of this flow within
    /// the mask encoding's readiness word, if it is an input flow.
    pub(crate) mask_bit: Option<u8>,
}

impl FlowDesc {
    /// Builds a flow with no mask bit assigned yet -- the translator-facing
    /// constructor. `mask_bit` is assigned later, in declaration order
    /// across the whole class, by [`compute_deps_goal`].
    pub fn new(name: &'static str, kind: FlowKind, in_deps: Vec<InDep>, out_deps: Vec<OutDep>) -> Self {
        FlowDesc { name, kind, in_deps, out_deps, mask_bit: None }
    }
}

pub type HookFn = Arc<dyn Fn(&[i32], &[i32]) -> i32 + Send + Sync>;
pub type AffinityFn = Arc<dyn Fn(&[i32]) -> Rank + Send + Sync>;
pub type KeyToStringFn = Arc<dyn Fn(&[i32]) -> String + Send + Sync>;
/// Produces the bytes an instance writes to each of its output flows. Stands
/// in for the out-of-scope numerical kernel body's actual writes -- the
/// engine only needs *some* bytes to flow through the data-repo and the
/// remote-dep protocol, not a particular linear-algebra result.
pub type ProduceFn = Arc<dyn Fn(&[i32]) -> std::collections::HashMap<FlowIndex, Vec<u8>> + Send + Sync>;

/// The static description of one kind of task (§3 "Task class").
pub struct TaskClass {
    pub id: TaskClassId,
    pub name: &'static str,
    pub params: Vec<ParamDesc>,
    pub num_locals: usize,
    pub flows: Vec<FlowDesc>,
    pub dependencies_goal: u32,
    pub flags: ClassFlags,
    pub default_priority: Priority,
    /// The task body. Takes bound locals and input data lengths (a stand-in
    /// for the out-of-scope numerical kernel body) and returns a hook status
    /// (0 = success, matching §7's "User" error kind).
    pub hook: HookFn,
    /// Maps a parameter tuple to the rank that owns that instance.
    pub data_affinity: AffinityFn,
    /// Debug formatting hook (§10.6): `classname(p0,p1,...)`.
    pub key_to_string: KeyToStringFn,
    /// What this instance hands off to its output flows, post-`hook`.
    pub produce: ProduceFn,
}

impl fmt::Debug for TaskClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskClass")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("params", &self.params.len())
            .field("flows", &self.flows.len())
            .field("dependencies_goal", &format_args!("{:#b}", self.dependencies_goal))
            .finish()
    }
}

impl TaskClass {
    pub fn num_params(&self) -> usize {
        self.params.len()
    }

    pub fn input_flow_count(&self) -> u32 {
        self.flows.iter().filter(|f| f.kind.is_input()).count() as u32
    }

    /// Formats `classname(p0,p1,...)` using the class's `key_to_string` hook,
    /// falling back to a generic formatter if none narrower was supplied.
    pub fn format_key(&self, params: &[i32]) -> String {
        (self.key_to_string)(params)
    }

    pub fn output_flows(&self) -> impl Iterator<Item = (FlowIndex, &FlowDesc)> {
        self.flows
            .iter()
            .enumerate()
            .filter(|(_, f)| f.kind.is_output())
            .map(|(i, f)| (FlowIndex(i as u8), f))
    }

    /// Translates `flow`'s raw position in `flows` to the compacted bit
    /// position `compute_deps_goal` assigned it in the mask encoding's
    /// readiness word (§4.3). The two coincide only when a class's input
    /// flows happen to be its leading flows; any reader or writer of the
    /// mask-encoded word must go through this rather than using a flow's
    /// declared index directly.
    ///
    /// # Panics
    /// Panics if `flow` does not name an input flow of this class (no
    /// `mask_bit` was assigned to it by `compute_deps_goal`).
    pub fn mask_bit(&self, flow: FlowIndex) -> FlowIndex {
        let bit = self.flows[flow.0 as usize].mask_bit.unwrap_or_else(|| {
            panic!("flow {flow:?} of class {:?} has no mask bit (not an input flow)", self.id)
        });
        FlowIndex(bit)
    }
}

/// A `produce` that writes the instance's locals, little-endian, to every
/// flow index in `output_flows` -- used by `client`'s builder as the default
/// when a task class doesn't care what bytes flow downstream, only that
/// something does.
pub fn locals_as_bytes_produce(output_flows: Vec<FlowIndex>) -> ProduceFn {
    Arc::new(move |locals: &[i32]| {
        let bytes: Vec<u8> = locals.iter().flat_map(|v| v.to_le_bytes()).collect();
        output_flows.iter().map(|&flow| (flow, bytes.clone())).collect()
    })
}

/// Derives `dependencies_goal` from a class's flow table (§10.6): one mask
/// bit per input flow, assigned in declaration order, and assigns each input
/// flow's `mask_bit`. Mutates `flows` in place and returns the goal bitmask.
///
/// Callers (the `client` builder) are expected to call this once, after all
/// flows have been added and before the class is registered, so that nobody
/// has to hand-compute the bitmask and get it wrong.
pub fn compute_deps_goal(flows: &mut [FlowDesc]) -> u32 {
    let mut goal = 0u32;
    let mut next_bit = 0u8;
    for flow in flows.iter_mut() {
        if flow.kind.is_input() {
            assert!(
                (next_bit as u32) < abi::MAX_MASK_FLOWS,
                "task class declares more input flows than the mask encoding can address"
            );
            flow.mask_bit = Some(next_bit);
            goal |= 1 << next_bit;
            next_bit += 1;
        } else {
            flow.mask_bit = None;
        }
    }
    goal
}

#[cfg(test)]
mod tests {
    use super::*;

    fn flow(kind: FlowKind) -> FlowDesc {
        FlowDesc {
            name: "f",
            kind,
            in_deps: Vec::new(),
            out_deps: Vec::new(),
            mask_bit: None,
        }
    }

    #[test]
    fn deps_goal_covers_only_input_flows() {
        let mut flows = vec![
            flow(FlowKind::Read),
            flow(FlowKind::Write),
            flow(FlowKind::ReadWrite),
            flow(FlowKind::Control),
        ];
        let goal = compute_deps_goal(&mut flows);
        assert_eq!(goal, 0b1011);
        assert_eq!(flows[0].mask_bit, Some(0));
        assert_eq!(flows[1].mask_bit, None);
        assert_eq!(flows[2].mask_bit, Some(1));
        assert_eq!(flows[3].mask_bit, Some(2));
    }

    #[test]
    fn expr_eval_respects_locals() {
        let e = Expr::BinaryOp(
            BinOp::Add,
            Box::new(Expr::inline(|ctx: EvalCtx| ctx.local(0))),
            Box::new(Expr::Const(1)),
        );
        let locals = [41];
        let ctx = EvalCtx { globals: &[], locals: &locals };
        assert_eq!(e.eval(ctx), 42);
    }

    /// A class whose output flow is declared ahead of its input flow: the
    /// input's raw position in `flows` (1) and its compacted mask bit (0)
    /// must not be conflated.
    #[test]
    fn mask_bit_translates_raw_flow_index_when_input_is_not_leading() {
        let mut flows = vec![flow(FlowKind::Write), flow(FlowKind::Read)];
        compute_deps_goal(&mut flows);

        let class = TaskClass {
            id: abi::TaskClassId(1),
            name: "t",
            params: Vec::new(),
            num_locals: 0,
            flows,
            dependencies_goal: 0b1,
            flags: abi::ClassFlags::default(),
            default_priority: abi::Priority(0),
            hook: Arc::new(|_, _| 0),
            data_affinity: Arc::new(|_| abi::Rank(0)),
            key_to_string: Arc::new(|p| format!("t({p:?})")),
            produce: locals_as_bytes_produce(Vec::new()),
        };

        assert_eq!(class.mask_bit(FlowIndex(1)), FlowIndex(0));
    }

    #[test]
    #[should_panic(expected = "not an input flow")]
    fn mask_bit_panics_for_an_output_flow() {
        let mut flows = vec![flow(FlowKind::Write), flow(FlowKind::Read)];
        compute_deps_goal(&mut flows);

        let class = TaskClass {
            id: abi::TaskClassId(1),
            name: "t",
            params: Vec::new(),
            num_locals: 0,
            flows,
            dependencies_goal: 0b1,
            flags: abi::ClassFlags::default(),
            default_priority: abi::Priority(0),
            hook: Arc::new(|_, _| 0),
            data_affinity: Arc::new(|_| abi::Rank(0)),
            key_to_string: Arc::new(|p| format!("t({p:?})")),
            produce: locals_as_bytes_produce(Vec::new()),
        };

        let _ = class.mask_bit(FlowIndex(0));
    }
}
