// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Wire-stable ABI types.
//!
//! Everything in this crate is shared between the engine, the `client`
//! surface that a generated PTG module links against, and (for the types
//! that cross the network) peer nodes running a different build of the
//! engine. Keep this crate small and keep its types `Copy` where possible:
//! a change here is a wire format change.

use hubpack::SerializedSize;
use serde::{Deserialize, Serialize};
use zerocopy::{AsBytes, FromBytes, FromZeroes};

/// Maximum number of parameters (and, symmetrically, locals beyond the
/// parameters) any task class may declare. Chosen so that a `ParamTuple`
/// fits in two cache lines alongside the rest of `ActivateHeader`.
pub const MAX_PARAMS: usize = 10;

/// Width, in bits, of a dependency-store readiness word.
pub const DEP_WORD_BITS: u32 = 32;

/// Maximum number of input flows a class may gate on in the mask encoding:
/// one bit is reserved for `IN_DONE` and one for `TASK_DONE`.
pub const MAX_MASK_FLOWS: u32 = DEP_WORD_BITS - 2;

/// Identifies a task class within a handle. Stable for the lifetime of the
/// handle; assigned by the PTG translator (or, in tests, by the `client`
/// builder) at registration time.
#[derive(
    Copy, Clone, Debug, Eq, PartialEq, Hash, Ord, PartialOrd, Serialize, Deserialize,
)]
#[repr(transparent)]
pub struct TaskClassId(pub u32);

/// Index of a named flow (port) on a task class.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[repr(transparent)]
pub struct FlowIndex(pub u8);

/// Identifies a registered, in-flight task graph.
///
/// Mirrors `abi::TaskId`'s split of the teacher kernel: handle ids are
/// synchronized across ranks at enqueue time (§4.7) so the same `HandleId`
/// names the same graph on every node.
#[derive(
    Copy, Clone, Debug, Eq, PartialEq, Hash, Ord, PartialOrd, Serialize, Deserialize, Default,
)]
#[repr(transparent)]
pub struct HandleId(pub u32);

/// Rank of a node in the distributed run. Rank 0 has no special powers; it
/// is simply the rank that performed the all-reduce max during
/// `handle_sync_ids`.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash, Serialize, Deserialize, Default)]
#[repr(transparent)]
pub struct Rank(pub u32);

/// Priority of a task instance. Numerically larger is more important
/// (unlike the teacher kernel's `Priority`, which inverts this for
/// hardware-interrupt reasons that do not apply here).
#[derive(
    Copy, Clone, Debug, Eq, PartialEq, Ord, PartialOrd, Default, Serialize, Deserialize,
)]
#[repr(transparent)]
pub struct Priority(pub i32);

/// A task instance's bound parameter values, in declaration order.
///
/// Fixed-capacity so that it is `Copy` and so an `ActivateHeader` has a
/// compile-time-known size, matching the teacher's preference for
/// fixed-size, `zerocopy`-friendly wire records (`sys/abi`'s `TaskId`,
/// `Priority`, and friends are all `#[repr(transparent)]` PODs for the same
/// reason).
#[derive(Copy, Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct ParamTuple {
    len: u8,
    values: [i32; MAX_PARAMS],
}

impl ParamTuple {
    pub const EMPTY: Self = Self {
        len: 0,
        values: [0; MAX_PARAMS],
    };

    pub fn from_slice(values: &[i32]) -> Self {
        assert!(
            values.len() <= MAX_PARAMS,
            "task class declares more than MAX_PARAMS parameters"
        );
        let mut out = Self::EMPTY;
        out.len = values.len() as u8;
        out.values[..values.len()].copy_from_slice(values);
        out
    }

    pub fn as_slice(&self) -> &[i32] {
        &self.values[..self.len as usize]
    }
}

impl Default for ParamTuple {
    fn default() -> Self {
        Self::EMPTY
    }
}

/// Class-level behavior flags, carried on every `TaskClass` record.
///
/// Named identically to the spec so that a reader cross-referencing §3/§4.3
/// does not have to translate names.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Default, Serialize, Deserialize)]
pub struct ClassFlags {
    pub has_in_in_dependencies: bool,
    pub has_ctl_gather: bool,
    pub use_deps_mask: bool,
    pub immediate_task: bool,
}

/// Fixed-size header shipped as the payload of an `ACTIVATE` message.
///
/// This is the wire analogue of the teacher's `host-sp-messages::Header`:
/// a small `#[derive(Serialize, Deserialize, SerializedSize)]` struct,
/// encoded with `hubpack` for a deterministic, allocation-free wire size,
/// with a magic/version pair so a receiver can reject a header from an
/// incompatible build before trusting the rest of the bytes.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Serialize, Deserialize, SerializedSize)]
pub struct ActivateHeader {
    pub magic: u32,
    pub version: u32,
    pub handle: HandleId,
    pub dest_class: TaskClassId,
    pub dest_flow: FlowIndex,
    pub params: ParamTuple,
    pub priority: Priority,
    /// Bitmask, one bit per output flow, of which outputs the sender has
    /// produced and is willing to serve via `GET_DATA`.
    pub outputs_mask: u32,
}

impl ActivateHeader {
    pub const MAGIC: u32 = 0x5054_4701; // "PTG" + version nibble
    pub const VERSION: u32 = 1;
}

/// Opaque cookie identifying a source-side data-repo entry, carried in a
/// `GET_DATA` request and echoed back unexamined.
#[derive(
    Copy, Clone, Debug, Eq, PartialEq, Serialize, Deserialize, AsBytes, FromBytes, FromZeroes,
)]
#[repr(transparent)]
pub struct DataCookie(pub u64);

/// The three message tags of the remote-dep protocol (§4.7).
#[derive(Copy, Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub enum RemoteTag {
    Activate,
    GetData,
    PutData,
}

/// Stable error/status codes returned across the wire or from a task hook,
/// distinct from the in-process `EngineError` (`engine::err`) which carries
/// richer, non-`Copy` context. Kept numeric and `repr(u32)` so it can ride
/// along in a reply header the way the teacher's syscall return codes do.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[repr(u32)]
pub enum StatusCode {
    Ok = 0,
    UnknownHandle = 1,
    UnknownClass = 2,
    BadParams = 3,
    HookFailed = 4,
    TransportError = 5,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn param_tuple_round_trips_through_slice() {
        let pt = ParamTuple::from_slice(&[1, -2, 3]);
        assert_eq!(pt.as_slice(), &[1, -2, 3]);
    }

    #[test]
    fn activate_header_hubpack_round_trip() {
        let header = ActivateHeader {
            magic: ActivateHeader::MAGIC,
            version: ActivateHeader::VERSION,
            handle: HandleId(7),
            dest_class: TaskClassId(3),
            dest_flow: FlowIndex(1),
            params: ParamTuple::from_slice(&[10, 20]),
            priority: Priority(42),
            outputs_mask: 0b101,
        };

        let mut buf = [0u8; ActivateHeader::MAX_SIZE];
        let written = hubpack::serialize(&mut buf, &header).unwrap();
        let (decoded, rest): (ActivateHeader, _) =
            hubpack::deserialize(&buf[..written]).unwrap();
        assert!(rest.is_empty());
        assert_eq!(decoded, header);
        assert_eq!(decoded.params.as_slice(), header.params.as_slice());
        assert_eq!(decoded.priority, header.priority);
    }
}
