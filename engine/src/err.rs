// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Common error-handling support.
//!
//! Grounded on the teacher kernel's `err::UserError` split between
//! recoverable and unrecoverable conditions, but expressed with `thiserror`
//! instead of a hand-written `Display` impl: this crate targets a hosted
//! binary rather than `no_std` firmware, and `thiserror` is this codebase's
//! standard answer to "give me `Error`/`Display` for an enum" wherever a
//! crate is not `no_std` (see the teacher's own higher-level protocol
//! wrappers built atop its `no_std` wire types).

use abi::{HandleId, TaskClassId};

/// Errors raised by the engine, classified per §7 of the specification.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    /// An unparseable or out-of-range configuration value (vp-map, binding,
    /// core index). Recoverable: the caller is expected to log a warning and
    /// fall back to a default, which is why this variant carries the
    /// fallback that was substituted.
    #[error("config: {message} (falling back to {fallback})")]
    Config { message: String, fallback: String },

    /// Pool or handle-registry allocation failure. Fatal.
    #[error("resource exhausted: {0}")]
    Resource(String),

    /// A peer or transport failure. Fatal; never retried (§4.7 Failure
    /// semantics).
    #[error("transport error talking to rank {rank:?}: {message}")]
    Transport { rank: Option<abi::Rank>, message: String },

    /// A task hook returned a nonzero status. Surfaced to the handle's
    /// completion callback, not retried.
    #[error("task class {class:?} hook failed with status {status}")]
    User { class: TaskClassId, status: i32 },

    /// The handle named by a wire message or API call is not registered
    /// locally (yet, or ever).
    #[error("unknown handle {0:?}")]
    UnknownHandle(HandleId),

    /// The task class named by a wire message or API call does not exist on
    /// this handle.
    #[error("unknown task class {0:?}")]
    UnknownClass(TaskClassId),
}

pub type EngineResult<T> = Result<T, EngineError>;

/// Invariant violations (§7 "Invariant" kind) are never represented as
/// `EngineError`: per policy they are assertion failures, compiled in for
/// debug/test builds and compiled out for release, exactly like the teacher
/// kernel's `uassert!`. `debug_assert!`/`assert!` at the call site serve this
/// role directly; this marker type exists only so call sites can document
/// *which* invariant they are defending without inventing ad hoc comments.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum Invariant {
    /// The same `(instance, dest_flow)` bit was set twice in the mask
    /// encoding.
    DoubleActivation,
    /// `TASK_DONE` transitioned twice for the same instance.
    DoubleTaskDone,
    /// A counter-encoding word went negative.
    NegativeDependencyCount,
}

impl std::fmt::Display for Invariant {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let msg = match self {
            Invariant::DoubleActivation => "same (instance, dest_flow) activated twice",
            Invariant::DoubleTaskDone => "TASK_DONE set twice for the same instance",
            Invariant::NegativeDependencyCount => "dependency counter went negative",
        };
        f.write_str(msg)
    }
}
