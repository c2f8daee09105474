// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! C8: the three-phase remote-dependency protocol (§4.7).
//!
//! A fixed-size `ACTIVATE` send, a `GET_DATA` reply that echoes back an
//! identifier taken from the activate payload, and a `PUT_DATA` send of the
//! raw chunk, each tag bounded by a fixed concurrency-window slot count.
//! `Transport` is this module's seam for the persistent-receive machinery;
//! the production transport would be an MPI (or equivalent) binding, kept
//! out of this workspace's scope since no real network I/O is exercised by
//! the tests here.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, trace};

use crate::datarepo::{DataRepo, DataRepoEntry};
use crate::err::{EngineError, EngineResult};
use crate::instance::InstanceKey;
use abi::{ActivateHeader, DataCookie, FlowIndex, HandleId, ParamTuple, Priority, Rank, TaskClassId};

/// One fully-formed remote message, at the Rust-API level rather than the
/// wire level. `Activate` bundles the wire-stable [`ActivateHeader`] with
/// the cookies of the outputs the sender is offering -- a real
/// implementation would size this as a variable-length array following the
/// fixed header in the same allocation, per §6's `execution_context_header`;
/// here the two are kept as separate fields for clarity, a documented
/// simplification of the wire shape.
#[derive(Clone, Debug)]
pub enum RemoteMessage {
    Activate {
        header: ActivateHeader,
        offered: Vec<(FlowIndex, DataCookie)>,
    },
    GetData {
        cookie: DataCookie,
    },
    PutData {
        cookie: DataCookie,
        bytes: Arc<[u8]>,
    },
}

/// Pluggable transport seam: send one message to a peer rank, or drain
/// whatever has arrived. Implementations own the K-slot persistent-receive
/// bookkeeping; this trait only sees completed messages.
pub trait Transport: Send + Sync {
    fn send(&self, to: Rank, message: RemoteMessage) -> EngineResult<()>;

    /// Non-blocking drain of inbound messages, each tagged with the sender.
    fn poll(&self) -> Vec<(Rank, RemoteMessage)>;
}

/// The shared delivery fabric behind [`LoopbackTransport`]: every rank in a
/// single-process simulation hands its sends to the same `Network`, each
/// keyed by destination rank, so independent `LoopbackTransport` handles
/// (one per simulated rank) observe each other's traffic without a real
/// socket.
#[derive(Default)]
pub struct Network {
    inboxes: Mutex<HashMap<Rank, Vec<(Rank, RemoteMessage)>>>,
}

impl Network {
    pub fn new() -> Arc<Self> {
        Arc::new(Network::default())
    }
}

/// An in-process transport used for tests and single-node runs: messages
/// posted to a rank land directly in that rank's inbox on the shared
/// [`Network`]. Concurrency window is enforced per tag to match §4.7's
/// "fixed concurrency window of K slots"; a send beyond the window is
/// queued rather than rejected, since delivery here is reliable and
/// in-order rather than subject to real backpressure.
pub struct LoopbackTransport {
    network: Arc<Network>,
    local_rank: Rank,
    window: usize,
}

impl LoopbackTransport {
    pub fn new(network: Arc<Network>, local_rank: Rank, window: usize) -> Self {
        LoopbackTransport { network, local_rank, window }
    }
}

impl Transport for LoopbackTransport {
    fn send(&self, to: Rank, message: RemoteMessage) -> EngineResult<()> {
        self.network
            .inboxes
            .lock()
            .entry(to)
            .or_default()
            .push((self.local_rank, message));
        Ok(())
    }

    fn poll(&self) -> Vec<(Rank, RemoteMessage)> {
        let mut inboxes = self.network.inboxes.lock();
        let mine = inboxes.entry(self.local_rank).or_default();
        let take = mine.len().min(self.window.max(1) * 3);
        mine.drain(..take).collect()
    }
}

struct PendingSend {
    entry: Arc<DataRepoEntry>,
    source_flow: FlowIndex,
}

/// What an inbound `ACTIVATE` named, kept around until the matching
/// `PUT_DATA` lands so step 4 of §4.7 knows which local instance to arrive
/// against. Recorded when we issue the `GET_DATA` reply (step 2); consumed
/// once, by whichever `PUT_DATA` echoes the same cookie.
struct InboundActivation {
    dest_key: InstanceKey,
    dest_flow: FlowIndex,
}

/// The remote-dep engine for one handle on one rank.
pub struct RemoteDep {
    local_rank: Rank,
    transport: Arc<dyn Transport>,
    next_cookie: AtomicU64,
    pending_sends: Mutex<HashMap<DataCookie, PendingSend>>,
    inbound: Mutex<HashMap<DataCookie, InboundActivation>>,
    datarepo: Arc<DataRepo>,
}

impl RemoteDep {
    pub fn new(local_rank: Rank, transport: Arc<dyn Transport>, datarepo: Arc<DataRepo>) -> Self {
        RemoteDep {
            local_rank,
            transport,
            next_cookie: AtomicU64::new(1),
            pending_sends: Mutex::new(HashMap::new()),
            inbound: Mutex::new(HashMap::new()),
            datarepo,
        }
    }

    fn mint_cookie(&self) -> DataCookie {
        DataCookie(self.next_cookie.fetch_add(1, Ordering::Relaxed))
    }

    /// Step 1: the source sends `ACTIVATE` to `dest_rank` for a successor
    /// instance, offering the output chunk it just produced.
    #[allow(clippy::too_many_arguments)]
    pub fn activate(
        &self,
        dest_rank: Rank,
        handle: HandleId,
        dest_class: TaskClassId,
        dest_flow: FlowIndex,
        params: ParamTuple,
        priority: Priority,
        source_entry: &Arc<DataRepoEntry>,
        source_flow: FlowIndex,
    ) -> EngineResult<()> {
        let cookie = self.mint_cookie();
        self.datarepo.retain(source_entry);
        self.pending_sends.lock().insert(
            cookie,
            PendingSend { entry: Arc::clone(source_entry), source_flow },
        );

        let header = ActivateHeader {
            magic: ActivateHeader::MAGIC,
            version: ActivateHeader::VERSION,
            handle,
            dest_class,
            dest_flow,
            params,
            priority,
            outputs_mask: 1 << source_flow.0,
        };
        trace!(?dest_rank, ?dest_class, "sending ACTIVATE");
        self.transport.send(
            dest_rank,
            RemoteMessage::Activate { header, offered: vec![(source_flow, cookie)] },
        )
    }

    /// Step 2: a peer, upon receiving `ACTIVATE`, asks for one of the
    /// offered chunks. `dest_key`/`dest_flow` are recorded against the
    /// cookie so the matching `PUT_DATA` (step 4) knows which local
    /// instance to arrive against once the bytes land.
    pub fn request(
        &self,
        source_rank: Rank,
        cookie: DataCookie,
        dest_key: InstanceKey,
        dest_flow: FlowIndex,
    ) -> EngineResult<()> {
        self.inbound.lock().insert(cookie, InboundActivation { dest_key, dest_flow });
        self.transport.send(source_rank, RemoteMessage::GetData { cookie })
    }

    /// Step 4: called once a `PUT_DATA` for `cookie` has landed, returning
    /// the destination this rank recorded for it at `request` time (and
    /// removing the record, since a cookie is only ever satisfied once).
    /// `None` means the cookie was never ours, or was already consumed.
    pub fn take_inbound(&self, cookie: DataCookie) -> Option<(InstanceKey, FlowIndex)> {
        self.inbound
            .lock()
            .remove(&cookie)
            .map(|inbound| (inbound.dest_key, inbound.dest_flow))
    }

    /// Step 3: the source, upon receiving `GET_DATA`, ships the chunk.
    pub fn serve(&self, requester: Rank, cookie: DataCookie) -> EngineResult<()> {
        let entry = {
            let pending = self.pending_sends.lock();
            pending
                .get(&cookie)
                .map(|p| (Arc::clone(&p.entry), p.source_flow))
        };
        let Some((entry, source_flow)) = entry else {
            return Err(EngineError::Transport {
                rank: Some(requester),
                message: format!("GET_DATA for unknown cookie {cookie:?}"),
            });
        };
        let chunk = entry.chunk(source_flow).ok_or_else(|| EngineError::Transport {
            rank: Some(requester),
            message: "requested output flow was never published".into(),
        })?;
        let bytes = match chunk.data {
            crate::instance::DataRef::Local(bytes) => bytes,
            crate::instance::DataRef::Remote { .. } => {
                return Err(EngineError::Transport {
                    rank: Some(requester),
                    message: "cannot serve a chunk we ourselves do not hold locally".into(),
                })
            }
        };
        self.transport.send(requester, RemoteMessage::PutData { cookie, bytes })
    }

    /// Called once the local send-completion for a `PUT_DATA` we issued is
    /// observed: drops our outstanding reference on the source entry.
    pub fn complete_send(&self, cookie: DataCookie) {
        if let Some(pending) = self.pending_sends.lock().remove(&cookie) {
            self.datarepo.release(&pending.entry);
        }
    }

    pub fn local_rank(&self) -> Rank {
        self.local_rank
    }

    /// Drains and returns whatever the transport has delivered, without
    /// otherwise interpreting it -- dispatch belongs to the worker loop
    /// (C6), which has the context needed to drive C7 for `PUT_DATA`
    /// completions.
    pub fn poll(&self) -> Vec<(Rank, RemoteMessage)> {
        let messages = self.transport.poll();
        if !messages.is_empty() {
            debug!(count = messages.len(), "remote-dep poll");
        }
        messages
    }
}

/// Derives an instance key for a remote `ACTIVATE`'s destination, so the
/// receiving rank can route into its own dependency store exactly as it
/// would for a local successor.
pub fn activated_instance_key(handle: HandleId, header: &ActivateHeader) -> InstanceKey {
    InstanceKey::new(handle, header.dest_class, header.params)
}

/// A reserved task-class id no real class may use, reserved for the
/// synthetic data-repo entries [`remote_source_key`] mints to hold a
/// landed remote chunk locally until the arrived instance consumes it.
const REMOTE_LANDING_CLASS: TaskClassId = TaskClassId(u32::MAX);

/// Mints a local, synthetic [`InstanceKey`] to stand in for a remote
/// producer once its chunk has landed via `PUT_DATA`: the real producer's
/// key lives on the sending rank and is never named on the wire, so the
/// receiving rank needs a key of its own to publish the bytes under before
/// building an [`InputBinding`](crate::instance::InputBinding) that points
/// at them, the same way [`crate::datarepo::DataRepo`] expects for any
/// other producer. Unique per cookie, since a cookie is unique per
/// in-flight chunk on this rank.
pub fn remote_source_key(handle: HandleId, cookie: DataCookie) -> InstanceKey {
    let hi = (cookie.0 >> 32) as i32;
    let lo = (cookie.0 & 0xffff_ffff) as i32;
    InstanceKey::new(handle, REMOTE_LANDING_CLASS, ParamTuple::from_slice(&[hi, lo]))
}

/// The all-reduce-max convention §4.7's failure semantics rely on for
/// keeping handle ids in agreement across ranks: every rank proposes the
/// next id it would otherwise assign locally, and all of them adopt the
/// largest proposal. `Transport` here models point-to-point delivery only,
/// so the actual collective (gathering every peer's proposal) is left to
/// the caller; this function is the reduction step itself.
pub fn handle_sync_ids(local_next_id: HandleId, peer_next_ids: &[HandleId]) -> HandleId {
    peer_next_ids
        .iter()
        .copied()
        .chain(std::iter::once(local_next_id))
        .max()
        .unwrap_or(local_next_id)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::instance::DataPair;
    use std::sync::Arc as StdArc;

    #[test]
    fn activate_get_put_round_trip_over_loopback() {
        let datarepo = Arc::new(DataRepo::new());
        let key = InstanceKey::new(HandleId(1), TaskClassId(1), ParamTuple::from_slice(&[0]));
        let entry = datarepo.lookup_or_create(key);
        entry.publish(DataPair {
            flow: FlowIndex(0),
            data: crate::instance::DataRef::Local(StdArc::from(vec![7u8, 8, 9])),
        });

        let network = Network::new();
        let transport_0 = Arc::new(LoopbackTransport::new(network.clone(), Rank(0), 16));
        let transport_1 = Arc::new(LoopbackTransport::new(network.clone(), Rank(1), 16));
        let rd0 = RemoteDep::new(Rank(0), transport_0.clone(), datarepo.clone());
        let rd1 = RemoteDep::new(Rank(1), transport_1.clone(), datarepo.clone());

        rd0.activate(
            Rank(1),
            HandleId(1),
            TaskClassId(2),
            FlowIndex(1),
            ParamTuple::from_slice(&[0]),
            Priority(0),
            &entry,
            FlowIndex(0),
        )
        .unwrap();

        let inbound = transport_1.poll();
        assert_eq!(inbound.len(), 1);
        let RemoteMessage::Activate { offered, .. } = &inbound[0].1 else {
            panic!("expected ACTIVATE");
        };
        let cookie = offered[0].1;

        let dest_key = InstanceKey::new(HandleId(1), TaskClassId(2), ParamTuple::from_slice(&[0]));
        rd1.request(Rank(0), cookie, dest_key, FlowIndex(1)).unwrap();
        let get = transport_0.poll();
        assert!(matches!(get[0].1, RemoteMessage::GetData { cookie: c } if c == cookie));

        rd0.serve(Rank(1), cookie).unwrap();
        let put = transport_1.poll();
        match &put[0].1 {
            RemoteMessage::PutData { bytes, .. } => assert_eq!(bytes.as_ref(), &[7, 8, 9]),
            _ => panic!("expected PUT_DATA"),
        }

        assert_eq!(entry.refcount(), 1);
        rd0.complete_send(cookie);
        assert_eq!(entry.refcount(), 0);

        let (landed_key, landed_flow) = rd1.take_inbound(cookie).expect("inbound record survives to PUT_DATA");
        assert_eq!(landed_key, dest_key);
        assert_eq!(landed_flow, FlowIndex(1));
        assert!(rd1.take_inbound(cookie).is_none(), "a cookie is consumed only once");
    }

    #[test]
    fn remote_source_key_is_stable_and_distinct_per_cookie() {
        let a = remote_source_key(HandleId(1), DataCookie(42));
        let b = remote_source_key(HandleId(1), DataCookie(42));
        let c = remote_source_key(HandleId(1), DataCookie(43));
        assert_eq!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn handle_sync_ids_adopts_the_largest_proposal() {
        let winner = handle_sync_ids(HandleId(3), &[HandleId(1), HandleId(7), HandleId(2)]);
        assert_eq!(winner, HandleId(7));

        let alone = handle_sync_ids(HandleId(5), &[]);
        assert_eq!(alone, HandleId(5));
    }
}
