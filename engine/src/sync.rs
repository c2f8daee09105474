// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! C1: atomics and the N-party barrier.
//!
//! The dependency store and data-repo (C3/C4) touch their readiness words
//! only through the three primitives below: compare-and-swap, fetch-add, and
//! fetch-or on aligned 32-bit words. Plain `AtomicU32` helpers suffice here
//! since this runs on a hosted target with native atomic instructions.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Condvar, Mutex};

/// Atomically ORs `bits` into `word` and returns the value *after* the
/// update, since callers generally need to make a readiness decision in the
/// same breath and the old value `fetch_or` returns isn't useful for that.
#[inline]
pub fn fetch_or_word(word: &AtomicU32, bits: u32) -> u32 {
    word.fetch_or(bits, Ordering::AcqRel) | bits
}

/// Atomically adds a signed delta to `word`, returning the value after the
/// update. Used by the counter encoding (§4.3), where `delta` is always -1.
#[inline]
pub fn fetch_add_word(word: &AtomicU32, delta: i32) -> i32 {
    let prev = word.fetch_add(delta as u32, Ordering::AcqRel) as i32;
    prev.wrapping_add(delta)
}

/// Attempts to install `new` in `word` if it currently holds `current`.
/// Returns `true` on success. Used by the counter encoding's first-touch
/// install and the mask encoding's `TASK_DONE` transition.
#[inline]
pub fn cas_word(word: &AtomicU32, current: u32, new: u32) -> bool {
    word.compare_exchange(current, new, Ordering::AcqRel, Ordering::Acquire)
        .is_ok()
}

/// A reusable N-party rendezvous barrier.
///
/// Unlike `std::sync::Barrier`, this one can be released early by a party
/// that is not itself waiting -- `release_all` -- which the context
/// lifecycle (C10) uses during `fini` to drain any workers still blocked on
/// the startup barrier in degenerate shutdown-during-init paths, and during
/// normal shutdown to wake workers parked on the *next* generation of the
/// barrier so they can observe the finalization flag and exit. This callable-
/// from-outside release is the reason the barrier is hand-rolled here rather
/// than reusing the standard library's, whose contract has no such escape
/// hatch.
pub struct Barrier {
    state: Mutex<BarrierState>,
    condvar: Condvar,
    parties: usize,
}

struct BarrierState {
    generation: u64,
    waiting: usize,
    released: bool,
}

impl Barrier {
    pub fn new(parties: usize) -> Self {
        assert!(parties > 0, "a barrier needs at least one party");
        Barrier {
            state: Mutex::new(BarrierState {
                generation: 0,
                waiting: 0,
                released: false,
            }),
            condvar: Condvar::new(),
            parties,
        }
    }

    /// Blocks until `parties` callers have called `wait` on the current
    /// generation, or until `release_all` is called. Returns `true` if this
    /// call was the one that completed the rendezvous (mirroring the
    /// "leader" bit of `std::sync::BarrierWaitResult`).
    pub fn wait(&self) -> bool {
        let mut state = self.state.lock().unwrap();
        let my_generation = state.generation;
        state.waiting += 1;

        if state.waiting == self.parties {
            state.waiting = 0;
            state.generation = state.generation.wrapping_add(1);
            self.condvar.notify_all();
            return true;
        }

        while state.generation == my_generation && !state.released {
            state = self.condvar.wait(state).unwrap();
        }
        false
    }

    /// Forces every party currently blocked in `wait` to wake up and return
    /// `false`, regardless of how many parties have arrived. Used by
    /// finalization to unstick a barrier that will never otherwise complete
    /// (for example, a VP configured with a worker count that never spawned
    /// due to an earlier init error).
    pub fn release_all(&self) {
        let mut state = self.state.lock().unwrap();
        state.released = true;
        state.waiting = 0;
        self.condvar.notify_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn fetch_or_reads_back_combined_value() {
        let word = AtomicU32::new(0b0001);
        let new = fetch_or_word(&word, 0b0100);
        assert_eq!(new, 0b0101);
        assert_eq!(word.load(Ordering::Relaxed), 0b0101);
    }

    #[test]
    fn cas_word_only_succeeds_against_expected_current() {
        let word = AtomicU32::new(5);
        assert!(!cas_word(&word, 4, 10));
        assert!(cas_word(&word, 5, 10));
        assert_eq!(word.load(Ordering::Relaxed), 10);
    }

    #[test]
    fn barrier_releases_all_parties_together() {
        let barrier = Arc::new(Barrier::new(4));
        let mut handles = Vec::new();
        for _ in 0..4 {
            let barrier = Arc::clone(&barrier);
            handles.push(thread::spawn(move || barrier.wait()));
        }
        let leaders: usize = handles
            .into_iter()
            .map(|h| h.join().unwrap())
            .filter(|&was_leader| was_leader)
            .count();
        assert_eq!(leaders, 1);
    }

    #[test]
    fn release_all_unblocks_a_short_party() {
        let barrier = Arc::new(Barrier::new(3));
        let waiter = {
            let barrier = Arc::clone(&barrier);
            thread::spawn(move || barrier.wait())
        };
        // Give the waiter a chance to block before we force a release.
        thread::sleep(std::time::Duration::from_millis(20));
        barrier.release_all();
        assert_eq!(waiter.join().unwrap(), false);
    }
}
