// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! C9: the process-wide handle registry (§4.8).
//!
//! A single `parking_lot::Mutex`-guarded, geometrically-growing array
//! mapping handle id to handle. Contention is low -- registration is rare
//! relative to task execution -- so a plain lock suffices; per §9's design
//! note, finer-grained per-handle locking isn't warranted.

use std::sync::Arc;

use parking_lot::Mutex;

use crate::handle::Handle;
use abi::HandleId;

/// Process-wide mapping from handle id to handle. Most processes need at
/// most one of these (see [`global`]); it is a plain struct so tests can
/// construct their own isolated registry instead of sharing global state.
#[derive(Default)]
pub struct HandleRegistry {
    handles: Mutex<Vec<Option<Arc<Handle>>>>,
}

impl HandleRegistry {
    pub fn new() -> Self {
        HandleRegistry::default()
    }

    /// `handle_register`: assigns the next id, grows the backing array, and
    /// stores the handle. Ids are assigned in strictly increasing order,
    /// which is what [`crate::remote::handle_sync_ids`]'s all-reduce-max
    /// convention across ranks depends on.
    pub fn register(&self, handle: Arc<Handle>) -> HandleId {
        let mut handles = self.handles.lock();
        let id = HandleId(handles.len() as u32);
        handle.assign_id(id);
        handles.push(Some(handle));
        id
    }

    /// `handle_unregister`: drops this registry's reference to the handle.
    /// Idempotent; unregistering an already-unregistered or never-registered
    /// id is a no-op.
    pub fn unregister(&self, id: HandleId) {
        let mut handles = self.handles.lock();
        if let Some(slot) = handles.get_mut(id.0 as usize) {
            *slot = None;
        }
    }

    /// `handle_lookup`: `O(1)` by construction (direct index).
    pub fn lookup(&self, id: HandleId) -> Option<Arc<Handle>> {
        self.handles.lock().get(id.0 as usize).cloned().flatten()
    }

    pub fn len(&self) -> usize {
        self.handles.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// The process-wide registry instance. Obtained lazily; `Context::init`
/// (C10) is the only expected caller outside of tests.
pub fn global() -> &'static HandleRegistry {
    static REGISTRY: std::sync::OnceLock<HandleRegistry> = std::sync::OnceLock::new();
    REGISTRY.get_or_init(HandleRegistry::new)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn dummy_handle() -> Arc<Handle> {
        Handle::new(HashMap::new())
    }

    #[test]
    fn register_assigns_increasing_ids() {
        let registry = HandleRegistry::new();
        let a = registry.register(dummy_handle());
        let b = registry.register(dummy_handle());
        assert_eq!(a, HandleId(0));
        assert_eq!(b, HandleId(1));
    }

    #[test]
    fn lookup_after_register_returns_same_handle() {
        let registry = HandleRegistry::new();
        let handle = dummy_handle();
        let id = registry.register(Arc::clone(&handle));
        let found = registry.lookup(id).unwrap();
        assert!(Arc::ptr_eq(&handle, &found));
    }

    #[test]
    fn unregister_then_lookup_is_none() {
        let registry = HandleRegistry::new();
        let id = registry.register(dummy_handle());
        registry.unregister(id);
        assert!(registry.lookup(id).is_none());
    }

    #[test]
    fn lookup_of_never_registered_id_is_none() {
        let registry = HandleRegistry::new();
        assert!(registry.lookup(HandleId(99)).is_none());
    }
}
