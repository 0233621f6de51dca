//! User/quota accounting — out of scope per spec §1 beyond the contract
//! `new-connect`/teardown consume: a refcounted binding to the caller's UID,
//! shared across every peer that UID has connected, released when the last
//! peer unbinds.
//!
//! Grounded on `session.rs`'s `DashMap`-backed torrent registry: a shared
//! keyed table of refcounted entries, looked up and inserted under the same
//! `dashmap::DashMap` the teacher already depends on, rather than a
//! hand-rolled `Mutex<HashMap<..>>`.

use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};

use dashmap::DashMap;

/// A bound user identity. Dropping the last `Arc<User>` does not by itself
/// remove the registry entry — `UserRegistry::unbind` does that explicitly,
/// mirroring `bus1_user_release`'s explicit refcount decrement rather than
/// relying on incidental `Drop` timing.
pub struct User {
    pub uid: u32,
    refs: AtomicU32,
}

impl User {
    fn new(uid: u32) -> Self {
        Self {
            uid,
            refs: AtomicU32::new(1),
        }
    }
}

/// Domain-scoped table of bound users, keyed by UID. Quota accounting
/// itself (bytes/fds per user) is the transaction engine's concern, not
/// this layer's (spec §1 Non-goals) — this is only the binding lifetime
/// contract `new-connect`/teardown need.
#[derive(Default)]
pub struct UserRegistry {
    table: DashMap<u32, Arc<User>>,
}

impl UserRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Binds (or re-references) the user for `uid`.
    pub fn bind(&self, uid: u32) -> Arc<User> {
        let entry = self
            .table
            .entry(uid)
            .or_insert_with(|| Arc::new(User::new(uid)));
        entry.refs.fetch_add(1, Ordering::AcqRel);
        entry.value().clone()
    }

    /// Releases one reference to `user`, dropping the registry entry if it
    /// was the last one. Safe to call more than once only if each call
    /// corresponds to a prior `bind` — callers own that bookkeeping (in
    /// this crate, exactly `PeerInfo::free` and new-connect's unwind path).
    pub fn unbind(&self, user: &Arc<User>) {
        if user.refs.fetch_sub(1, Ordering::AcqRel) == 1 {
            self.table.remove_if(&user.uid, |_, v| Arc::ptr_eq(v, user));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bind_shares_entry_for_same_uid() {
        let reg = UserRegistry::new();
        let a = reg.bind(7);
        let b = reg.bind(7);
        assert!(Arc::ptr_eq(&a, &b));
    }

    #[test]
    fn unbind_removes_last_reference() {
        let reg = UserRegistry::new();
        let a = reg.bind(7);
        reg.unbind(&a);
        assert_eq!(reg.table.len(), 0);
    }

    #[test]
    fn unbind_keeps_entry_while_other_binding_remains() {
        let reg = UserRegistry::new();
        let a = reg.bind(7);
        let _b = reg.bind(7);
        reg.unbind(&a);
        assert_eq!(reg.table.len(), 1);
    }
}
