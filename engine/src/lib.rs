// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The dependency-resolution and execution engine for parameterized task
//! graphs.
//!
//! Module map, mirrored from §2's component table:
//!
//! | Module | Component |
//! |---|---|
//! | [`sync`] | C1: atomics & barrier |
//! | [`pool`] | C2: memory pool |
//! | [`datarepo`] | C3: data-repo |
//! | [`depstore`] | C4: dependency store & readiness protocol |
//! | [`ready`] | C5: ready-list & scheduler interface |
//! | [`worker`] | C6: execution unit & virtual process |
//! | [`release`] | C7: release-deps engine |
//! | [`remote`] | C8: remote-dep protocol |
//! | [`registry`] | C9: handle registry |
//! | [`context`] | C10: context lifecycle |
//!
//! [`commthread`] is the optional dedicated-communication-thread progress
//! model for C8 (§4.7 model (b)); the default is polling C8 from worker
//! threads directly, inside [`worker`].
//! [`taskclass`] and [`instance`] hold the shared value types those
//! components operate on; [`err`] and [`vpmap`] are cross-cutting (error
//! handling and CLI-shaped configuration parsing, respectively).

pub mod commthread;
pub mod context;
pub mod datarepo;
pub mod depstore;
pub mod err;
pub mod handle;
pub mod instance;
pub mod pool;
pub mod ready;
pub mod registry;
pub mod release;
pub mod remote;
pub mod sync;
pub mod taskclass;
pub mod vpmap;
pub mod worker;

pub use context::{Context, ContextConfig};
pub use err::{EngineError, EngineResult};
pub use handle::Handle;
