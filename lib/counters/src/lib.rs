// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Lightweight atomic event counters.
//!
//! Adapted from the teacher kernel's `counters` crate. The teacher squeezes
//! counters into a handful of bytes of `no_std` RAM because they live on a
//! microcontroller; this runtime is a hosted, multi-threaded service, so the
//! same `Count` trait and `counters!` macro shape is kept but backed by
//! ordinary `AtomicU32` fields rather than the teacher's `armv6m_atomic_hack`
//! shim for pre-CAS cores.
//!
//! This is the engine's whole answer to "how do I know how many times X
//! happened without a lock": activation counts, schedule counts, and the
//! other tallies §8's testable properties ask for are all declared with
//! [`counters!`] and a `#[derive(Count)]` enum.

#[cfg(feature = "derive")]
pub use counters_derive::Count;

/// A countable event.
///
/// Generally derived for an `enum` with `#[derive(Count)]`.
pub trait Count {
    /// A struct with one `AtomicU32` field per variant.
    type Counters;

    /// Initializer for a new set of counters, all zero.
    const NEW_COUNTERS: Self::Counters;

    /// Increment the counter matching this event's variant.
    fn count(&self, counters: &Self::Counters);
}

/// Declares a set of event counters.
///
/// `counters!(NAME, Type)` creates a `static NAME` of `Type`'s generated
/// counters struct. If no name is given, the static is named `__COUNTERS`.
#[macro_export]
macro_rules! counters {
    ($name:ident, $Type:ident) => {
        static $name: <$Type as $crate::Count>::Counters =
            <$Type as $crate::Count>::NEW_COUNTERS;
    };
    ($Type:ident) => {
        $crate::counters!(__COUNTERS, $Type);
    };
}

#[cfg(test)]
mod tests {
    use super::*;
    use core::sync::atomic::Ordering;

    #[derive(Copy, Clone, Count)]
    enum Event {
        Scheduled,
        Activated(u32),
    }

    #[test]
    fn counts_per_variant() {
        counters!(EVENTS, Event);
        Event::Scheduled.count(&EVENTS);
        Event::Scheduled.count(&EVENTS);
        Event::Activated(7).count(&EVENTS);

        assert_eq!(EVENTS.Scheduled.load(Ordering::Relaxed), 2);
        assert_eq!(EVENTS.Activated.load(Ordering::Relaxed), 1);
    }
}
