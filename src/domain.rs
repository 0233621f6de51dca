//! Domain — the container (consumed per spec §3/§4 as "Domain (consumed)")
//! that owns the peer list and the ordered, seqcount-guarded name index.
//! Implemented here to the depth `SPEC_FULL.md` §C calls for: enough for
//! `capbus`'s own dispatch/resolve/teardown logic to be exercised, not as
//! a standalone registry with its own feature surface.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;

use parking_lot::{Mutex, RwLock};

use crate::active_ref::ActiveRef;
use crate::error::{Error, Result};
use crate::limits::DomainConfig;
use crate::peer::Peer;
use crate::peer_name::PeerName;
use crate::seqcount::SeqCount;
use crate::user::UserRegistry;
use crate::wait_queue::WaitQueue;

pub struct Domain {
    pub config: DomainConfig,
    /// The "domain mutex" spec's lock order names first; guards structural
    /// mutation of `peers`/`id_index`/`n_peers` and, together with `seq`'s
    /// write section, the name index.
    mutex: Mutex<()>,
    seq: SeqCount,
    /// Readers take a shared lock here (never blocking each other) and
    /// pair it with `seq`'s retry convention for the lock-free-in-spirit
    /// `RESOLVE` path described in `seqcount.rs`'s module docs.
    names: RwLock<BTreeMap<Box<[u8]>, Arc<PeerName>>>,
    peers: Mutex<Vec<Arc<Peer>>>,
    id_index: Mutex<BTreeMap<u64, std::sync::Weak<Peer>>>,
    n_names: AtomicUsize,
    n_peers: AtomicUsize,
    next_peer_id: AtomicU64,
    active: ActiveRef,
    pub waitq: WaitQueue,
    pub users: UserRegistry,
}

impl Domain {
    pub fn new(config: DomainConfig) -> Arc<Self> {
        let d = Arc::new(Self {
            config,
            mutex: Mutex::new(()),
            seq: SeqCount::new(),
            names: RwLock::new(BTreeMap::new()),
            peers: Mutex::new(Vec::new()),
            id_index: Mutex::new(BTreeMap::new()),
            n_names: AtomicUsize::new(0),
            n_peers: AtomicUsize::new(0),
            next_peer_id: AtomicU64::new(1),
            active: ActiveRef::new(),
            waitq: WaitQueue::new(),
            users: UserRegistry::new(),
        });
        d.active.activate();
        d
    }

    /// Pins the domain's active-ref for the duration of a dispatched
    /// `CONNECT`/`RESOLVE` call (spec §4.10), or reports the domain is
    /// already tearing down.
    pub fn pin(&self) -> Result<crate::active_ref::Token> {
        self.active.acquire().ok_or(Error::AlreadyShutDown)
    }

    pub fn unpin(&self, token: crate::active_ref::Token) {
        self.active.release(token, &self.waitq);
    }

    pub fn next_peer_id(&self) -> u64 {
        self.next_peer_id.fetch_add(1, Ordering::AcqRel)
    }

    pub fn n_peers(&self) -> usize {
        self.n_peers.load(Ordering::Acquire)
    }

    pub fn n_names(&self) -> usize {
        self.n_names.load(Ordering::Acquire)
    }

    /// Must be called with `mutex` already held by the caller (connect
    /// dispatch holds it across the whole name-insertion sequence, spec
    /// §4.5).
    pub fn lock(&self) -> parking_lot::MutexGuard<'_, ()> {
        self.mutex.lock()
    }

    pub fn seq_write_begin(&self) {
        self.seq.write_begin();
    }

    pub fn seq_write_end(&self) {
        self.seq.write_end();
    }

    /// Inserts `name` into the ordered index; fails with `NameExists` on
    /// collision. Caller must already hold the domain mutex and be inside
    /// the seqcount write section (spec §4.2/§4.5).
    pub fn insert_name(&self, name: Arc<PeerName>) -> Result<()> {
        let mut names = self.names.write();
        if names.contains_key(&name.name) {
            return Err(Error::NameExists);
        }
        names.insert(name.name.clone(), name);
        self.n_names.fetch_add(1, Ordering::AcqRel);
        Ok(())
    }

    pub fn remove_name(&self, name: &[u8]) {
        if self.names.write().remove(name).is_some() {
            self.n_names.fetch_sub(1, Ordering::AcqRel);
        }
    }

    /// Sequence-locked retry lookup (spec §4.6). A name whose owner is not
    /// currently ACTIVE is treated as not found.
    pub fn resolve(&self, name: &[u8]) -> Result<u64> {
        loop {
            let start = self.seq.read_begin();
            let found = {
                let names = self.names.read();
                names.get(name).and_then(|n| {
                    let peer = n.peer()?;
                    if !peer.is_active() {
                        return None;
                    }
                    peer.info_snapshot().map(|info| info.id)
                })
            };
            if let Some(id) = found {
                return Ok(id);
            }
            if !self.seq.read_retry(start) {
                return Err(Error::NotFound);
            }
            // A writer raced us and we found nothing yet; retry.
        }
    }

    /// Links a newly activated peer into the domain's peer list and id
    /// index. Caller holds the domain mutex.
    pub fn link_peer(&self, peer: Arc<Peer>, id: u64) {
        self.id_index.lock().insert(id, Arc::downgrade(&peer));
        self.peers.lock().push(peer);
        self.n_peers.fetch_add(1, Ordering::AcqRel);
    }

    /// Unlinks a peer from the domain's peer list and id index. Used by
    /// plain teardown's cleanup callback, not by domain-assisted teardown
    /// (which resets the list in bulk instead, spec §4.9).
    pub fn unlink_peer(&self, peer: &Arc<Peer>, id: u64) {
        self.id_index.lock().remove(&id);
        let mut peers = self.peers.lock();
        if let Some(pos) = peers.iter().position(|p| Arc::ptr_eq(p, peer)) {
            peers.remove(pos);
            self.n_peers.fetch_sub(1, Ordering::AcqRel);
        }
    }

    /// Used only by domain-wide shutdown: clears the peer list and id
    /// index in bulk after every peer has already been deactivated,
    /// drained, and cleaned up individually (spec §4.9).
    pub fn clear_peer_list(&self) {
        let mut peers = self.peers.lock();
        let n = peers.len();
        peers.clear();
        self.id_index.lock().clear();
        self.n_peers.fetch_sub(n, Ordering::AcqRel);
    }

    pub fn peer_by_id(&self, id: u64) -> Option<Arc<Peer>> {
        self.id_index.lock().get(&id).and_then(|w| w.upgrade())
    }

    pub fn peers_snapshot(&self) -> Vec<Arc<Peer>> {
        self.peers.lock().clone()
    }

    /// Deactivates and drains every peer, then tears the domain itself
    /// down. Not named as its own dispatch command in spec §6 (domain
    /// shutdown is an external lifecycle event, not a per-peer command),
    /// but exercised by tests per spec §8 scenario 6.
    pub fn shutdown(&self) {
        let peers = self.peers_snapshot();
        for peer in &peers {
            peer.deactivate();
        }
        for peer in &peers {
            peer.drain();
        }
        {
            let _guard = self.mutex.lock();
            self.seq.write_begin();
            for peer in &peers {
                let snapshot = peer.info_snapshot();
                peer.cleanup(
                    |info_opt: Option<Arc<crate::peer_info::PeerInfo>>| {
                        if let Some(info) = info_opt {
                            crate::dispatch::run_cleanup(self, peer, &info);
                        }
                    },
                    snapshot,
                );
            }
            self.clear_peer_list();
            self.seq.write_end();
        }
        self.active.deactivate();
        self.active.drain();
    }

    pub fn wait_for_waitq(&self, timeout: Duration, pred: impl FnMut() -> bool) -> bool {
        self.waitq.wait_while(timeout, pred)
    }
}
