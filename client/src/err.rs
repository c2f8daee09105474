// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Builder-time errors: a `TaskClassBuilder` caught a malformed class
//! before it ever reached the engine, rather than the engine discovering
//! the problem mid-run (§7's Config policy, applied to the one other place
//! this workspace parses translator-shaped input).

/// A `TaskClassBuilder::build()` precondition was not met.
#[derive(Debug, Clone, Copy, Eq, PartialEq, thiserror::Error)]
pub enum ClientError {
    #[error("task class {0:?} has no hook set")]
    MissingHook(&'static str),
    #[error("task class {0:?} has no data_affinity set")]
    MissingAffinity(&'static str),
    #[error("task class {0:?} has no produce set")]
    MissingProduce(&'static str),
    #[error("task class {0:?} declares fewer locals than parameters")]
    TooFewLocals(&'static str),
}
