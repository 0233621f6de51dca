//! Peer — the outer, stable handle: reader-writer lock, wait set,
//! active-ref, and a replaceable pointer to the mutable `PeerInfo` (spec
//! §3/§4.4).

use std::sync::Arc;

use arc_swap::ArcSwapOption;
use parking_lot::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use crate::active_ref::{ActiveRef, Token};
use crate::error::{Error, Result};
use crate::peer_info::PeerInfo;
use crate::peer_name::PeerName;
use crate::wait_queue::WaitQueue;

pub struct Peer {
    /// Readers run send/receive/slice-release; writers run
    /// connect/reset/teardown (spec §3). Guards nothing by itself beyond
    /// serializing those call classes — `info` is read/written through
    /// `ArcSwapOption` so a reader never blocks on a concurrent `RESET`'s
    /// swap, only on the rwlock discipline spec's lock order names.
    rw: RwLock<()>,
    pub waitq: WaitQueue,
    active: ActiveRef,
    /// Single-writer (domain mutex held), multi-reader (active-ref held)
    /// per spec's design note; grounded on `ArcSwapOption<TorrentMetadata>`
    /// in `torrent_state/mod.rs`, which the same "replace under a stable
    /// published pointer, let `Arc` handle reclamation" pattern.
    info: ArcSwapOption<PeerInfo>,
    names: parking_lot::Mutex<Vec<Arc<PeerName>>>,
    pub span: tracing::Span,
}

impl Peer {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            rw: RwLock::new(()),
            waitq: WaitQueue::new(),
            active: ActiveRef::new(),
            info: ArcSwapOption::from(None),
            names: parking_lot::Mutex::new(Vec::new()),
            span: tracing::info_span!("peer", id = tracing::field::Empty),
        })
    }

    pub fn read_lock(&self) -> RwLockReadGuard<'_, ()> {
        self.rw.read()
    }

    pub fn write_lock(&self) -> RwLockWriteGuard<'_, ()> {
        self.rw.write()
    }

    pub fn is_new(&self) -> bool {
        self.active.is_new()
    }

    pub fn is_active(&self) -> bool {
        self.active.is_active()
    }

    pub fn is_deactivated(&self) -> bool {
        self.active.is_deactivated()
    }

    pub fn activate(&self) {
        self.active.activate();
    }

    pub fn deactivate(&self) {
        self.active.deactivate();
    }

    pub fn drain(&self) {
        self.active.drain();
    }

    pub fn cleanup<T>(&self, f: impl FnOnce(T), userdata: T) -> bool {
        self.active.cleanup(f, userdata)
    }

    /// Succeeds only while the peer is ACTIVE (spec §4.10: the read-side
    /// commands pin this before dispatching).
    pub fn active_acquire(&self) -> Option<Token> {
        self.active.acquire()
    }

    pub fn active_release(&self, token: Token) {
        self.active.release(token, &self.waitq);
    }

    pub fn wake(&self) {
        self.waitq.wake_all();
    }

    /// Returns the current `info`, or `None` if the peer has never
    /// connected or has torn down. Caller must hold an active-ref (or the
    /// write lock, for lifecycle operations) for the duration the returned
    /// `Arc` is used — spec §4.4's `dereference` contract.
    pub fn info_snapshot(&self) -> Option<Arc<PeerInfo>> {
        self.info.load_full()
    }

    pub fn set_info(&self, info: Option<Arc<PeerInfo>>) {
        self.info.store(info);
    }

    pub fn names(&self) -> Vec<Arc<PeerName>> {
        self.names.lock().clone()
    }

    pub fn set_names(&self, names: Vec<Arc<PeerName>>) {
        *self.names.lock() = names;
    }

    pub fn take_names(&self) -> Vec<Arc<PeerName>> {
        std::mem::take(&mut *self.names.lock())
    }

    /// Requires NEW or DEAD, not linked in any domain, no names, no info
    /// (spec §4.4). Since this crate relies on `Arc<Peer>` refcounting for
    /// deferred destruction rather than a manual `free`, this is a
    /// debug-only consistency check exposed for tests and callers that
    /// want to assert clean teardown before dropping their last handle.
    pub fn assert_freeable(&self) -> Result<()> {
        if !(self.active.is_new() || self.active.is_dead()) {
            return Err(Error::Bug);
        }
        if !self.names.lock().is_empty() {
            return Err(Error::Bug);
        }
        if self.info.load().is_some() {
            return Err(Error::Bug);
        }
        Ok(())
    }
}
