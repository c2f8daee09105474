// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! §4.7 progress model (b): a dedicated communication thread, bound to its
//! own core, that drives remote-dep progress on a periodic timed wait and on
//! request from worker threads.
//!
//! §9's design note replaces the original's condvar-plus-two-mutexes
//! signaling with a single-producer/multiple-producer channel of three
//! variants -- `Send`, `Progress`, `Shutdown` -- plus a reply channel, for
//! the same semantics with explicit ownership. `crossbeam_channel` is this
//! workspace's answer to "an MPSC channel with a blocking, timeout-capable
//! receive," exactly the shape the comm thread's loop needs for its ~500 µs
//! periodic probe (§5 "Suspension points" (iii)).

use std::sync::Arc;
use std::time::Duration;

use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, Sender};
use tracing::{trace, warn};

use crate::handle::Handle;
use crate::ready::{ExecutionUnitId, Scheduler};
use crate::remote::RemoteDep;
use abi::Rank;

/// The execution unit the comm thread places freshly-ready remote-landed
/// instances under: VP 0, the same "master" convention `Context::enqueue`
/// uses for startup instances, since the comm thread is not itself a worker
/// occupying a VP slot.
const LANDING_EU: ExecutionUnitId = ExecutionUnitId { vp: 0, worker: 0 };

/// The ~500 µs periodic probe interval from §5's suspension-point list.
const IDLE_TICK: Duration = Duration::from_micros(500);

/// One request a worker thread can hand to the comm thread, mirroring §9's
/// `{Send(task, rank, data), Progress(eu), Shutdown}`. `Send` is folded into
/// `Progress` here: every request this engine issues to the comm thread ends
/// up as "please drain and dispatch," since the actual `ACTIVATE`/`GET_DATA`/
/// `PUT_DATA` sends already happened synchronously through [`RemoteDep`] by
/// the time a worker reaches for the comm thread -- the comm thread's own
/// job is purely to pump the transport on everyone's behalf.
enum Request {
    /// A worker wants at least one progress pump before it proceeds.
    WantProgress,
    Shutdown,
}

/// A handle workers use to ask the comm thread for progress without
/// themselves touching the transport -- the comm thread owns all mutable
/// remote-dep state exclusively while running model (b).
#[derive(Clone)]
pub struct CommThreadHandle {
    requests: Sender<Request>,
    /// Bounded to 1: a worker blocks until the *previous* progress pump
    /// finished, which is enough to guarantee its own send happened-before
    /// at least one subsequent drain.
    acked: Receiver<()>,
}

impl CommThreadHandle {
    /// `WANT_PROGRESS` (§4.7): ask the comm thread to pump at least once more
    /// and wait for it to do so.
    pub fn want_progress(&self) {
        if self.requests.send(Request::WantProgress).is_ok() {
            let _ = self.acked.recv();
        }
    }

    pub fn shutdown(&self) {
        let _ = self.requests.send(Request::Shutdown);
    }
}

/// Spawns the dedicated comm thread (§4.7 model (b)), bound to `core` if
/// given. `handle`/`scheduler`/`local_rank` give the comm thread everything
/// [`crate::worker::dispatch_remote_message`] needs to fully dispatch a
/// drained message itself -- ACTIVATE registration, GET_DATA replies, and
/// folding a landed PUT_DATA through the release-deps arrival protocol --
/// rather than merely draining the transport and discarding what it finds.
/// Returns a [`CommThreadHandle`] for workers and the thread's join handle
/// for `fini` (C10) to await.
pub fn spawn(
    remote: Arc<RemoteDep>,
    core: Option<usize>,
    handle: Arc<Handle>,
    scheduler: Arc<dyn Scheduler>,
    local_rank: Rank,
) -> (CommThreadHandle, std::thread::JoinHandle<()>) {
    let (req_tx, req_rx) = crossbeam_channel::unbounded();
    let (ack_tx, ack_rx) = bounded(0);

    let join = std::thread::Builder::new()
        .name("ptg-comm".to_string())
        .spawn(move || comm_loop(remote, core, handle, scheduler, local_rank, req_rx, ack_tx))
        .expect("failed to spawn comm thread");

    (CommThreadHandle { requests: req_tx, acked: ack_rx }, join)
}

#[allow(clippy::too_many_arguments)]
fn comm_loop(
    remote: Arc<RemoteDep>,
    core: Option<usize>,
    handle: Arc<Handle>,
    scheduler: Arc<dyn Scheduler>,
    local_rank: Rank,
    requests: Receiver<Request>,
    acked: Sender<()>,
) {
    if let Some(core_id) = core {
        if let Some(core) = core_affinity::get_core_ids().and_then(|cores| cores.into_iter().find(|c| c.id == core_id))
        {
            core_affinity::set_for_current(core);
        }
    }

    loop {
        match requests.recv_timeout(IDLE_TICK) {
            Ok(Request::WantProgress) => {
                pump(&remote, &handle, scheduler.as_ref(), local_rank);
                let _ = acked.send(());
            }
            Ok(Request::Shutdown) => {
                pump(&remote, &handle, scheduler.as_ref(), local_rank);
                return;
            }
            Err(RecvTimeoutError::Timeout) => {
                // The periodic probe: run even when nobody is waiting, so
                // inbound ACTIVATE/GET_DATA/PUT_DATA traffic makes progress
                // on an otherwise-idle node.
                pump(&remote, &handle, scheduler.as_ref(), local_rank);
            }
            Err(RecvTimeoutError::Disconnected) => return,
        }
    }
}

/// One drain-and-dispatch pass: drains whatever the transport delivered and
/// runs each message through the same dispatch path a worker's `tick_remote`
/// would. A landed PUT_DATA whose successor is `IMMEDIATE_TASK` is always
/// scheduled rather than run inline here -- the comm thread's job is to keep
/// the periodic probe responsive, not to execute task bodies, so immediate
/// placement is deferred to whichever worker next selects it.
fn pump(remote: &RemoteDep, handle: &Handle, scheduler: &dyn Scheduler, local_rank: Rank) {
    let drained = remote.poll();
    if drained.is_empty() {
        return;
    }
    trace!(count = drained.len(), "comm thread drained transport");
    for (from, message) in drained {
        let result = crate::worker::dispatch_remote_message(
            handle,
            scheduler,
            remote,
            local_rank,
            LANDING_EU,
            from,
            message,
            &|instance| scheduler.schedule(LANDING_EU, instance),
        );
        if let Err(err) = result {
            warn!(error = %err, ?from, "comm thread dispatch failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::datarepo::DataRepo;
    use crate::ready::DefaultScheduler;
    use crate::remote::{LoopbackTransport, Network};
    use std::collections::HashMap;

    #[test]
    fn want_progress_round_trips() {
        let network = Network::new();
        let transport = Arc::new(LoopbackTransport::new(network, Rank(0), 16));
        let remote = Arc::new(RemoteDep::new(Rank(0), transport, Arc::new(DataRepo::new())));
        let handle = Handle::new(HashMap::new());
        handle.assign_id(abi::HandleId(0));
        let scheduler: Arc<dyn Scheduler> = Arc::new(DefaultScheduler::new(1));
        let (comm, join) = spawn(remote, None, handle, scheduler, Rank(0));

        comm.want_progress();
        comm.want_progress();
        comm.shutdown();
        join.join().unwrap();
    }
}
