//! PeerInfo — the mutable interior of a connected peer: its pool, queue,
//! user binding, handle maps, and id (spec §3/§4.3).

use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;

use crate::error::{Error, Result};
use crate::limits::is_page_aligned;
use crate::pool::Pool;
use crate::queue::Queue;
use crate::seqcount::SeqCount;
use crate::user::User;

/// A capability handle exchanged between peers. Spec §3 names the
/// `handles-by-id`/`handles-by-node` maps as part of `PeerInfo`'s data
/// model but no dispatch operation in scope here populates or consumes
/// them (handle transfer rides along inside SEND payloads in the original,
/// which is explicitly out of scope per spec §1's "on-wire payload
/// encoding"); they're kept as the data-model placeholder spec describes
/// rather than dropped.
#[derive(Debug, Clone, Copy)]
pub struct Handle {
    pub id: u64,
    pub node: u64,
}

pub struct PeerInfo {
    /// Drawn from `Domain::next_peer_id` at activation (`SPEC_FULL.md`
    /// §B.1); lives on the info, not the outer `Peer`, so a `RESET` that
    /// swaps in a fresh `PeerInfo` naturally gives the peer a fresh id.
    pub id: u64,
    pub pool: Pool,
    pub queue: Queue,
    user: Mutex<Option<Arc<User>>>,
    handles_by_id: Mutex<BTreeMap<u64, Handle>>,
    handles_by_node: Mutex<BTreeMap<u64, Handle>>,
    next_handle_id: AtomicU64,
    handle_seq: SeqCount,
    /// Guards pool/queue/deallocation paths as a unit, per spec §3 ("a
    /// mutex guarding pool, queue, and deallocation paths"). `Pool` and
    /// `Queue` have their own internal locks for the fine-grained
    /// operations spec describes (alloc, commit, peek); this one
    /// serializes the coarser-grained `reset`/`free` sequences that must
    /// not interleave with each other.
    lock: Mutex<()>,
}

impl PeerInfo {
    /// Rejects a zero or non-page-aligned `pool_size` with `InvalidArg`.
    pub fn new(id: u64, pool_size: u64, page_size: usize, user: Arc<User>) -> Result<Self> {
        if !is_page_aligned(pool_size as usize, page_size) {
            return Err(Error::InvalidArg);
        }
        Ok(Self {
            id,
            pool: Pool::new(pool_size)?,
            queue: Queue::new(),
            user: Mutex::new(Some(user)),
            handles_by_id: Mutex::new(BTreeMap::new()),
            handles_by_node: Mutex::new(BTreeMap::new()),
            next_handle_id: AtomicU64::new(0),
            handle_seq: SeqCount::new(),
            lock: Mutex::new(()),
        })
    }

    pub fn alloc_handle_id(&self) -> u64 {
        self.next_handle_id.fetch_add(1, Ordering::AcqRel)
    }

    pub fn insert_handle(&self, handle: Handle) {
        self.handle_seq.write_begin();
        self.handles_by_id.lock().insert(handle.id, handle);
        self.handles_by_node.lock().insert(handle.node, handle);
        self.handle_seq.write_end();
    }

    /// Flush semantics used by `RESET` and by teardown's GC path (spec
    /// §4.3): deallocate every committed message, post a flush boundary so
    /// late in-flight commits self-discard, then release the pool.
    pub fn reset(&self) {
        let _guard = self.lock.lock();
        let drained = self.queue.flush();
        for msg in drained {
            self.pool.release(msg.slice);
        }
        self.pool.flush();
    }

    /// Preconditions: user already unbound, `reset` already executed.
    /// Takes `&self` rather than `self` because the caller (teardown)
    /// still needs the `Arc<PeerInfo>` alive for any trailing readers
    /// draining through their own active-ref; actual deallocation happens
    /// when the last `Arc` drops.
    pub fn free(&self) {
        debug_assert!(
            self.user.lock().is_none(),
            "free() called with user still bound"
        );
    }

    pub fn take_user(&self) -> Option<Arc<User>> {
        self.user.lock().take()
    }

    pub fn user(&self) -> Option<Arc<User>> {
        self.user.lock().clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::user::UserRegistry;

    fn make_info(pool_size: u64) -> PeerInfo {
        let users = UserRegistry::new();
        PeerInfo::new(1, pool_size, 4096, users.bind(0)).unwrap()
    }

    #[test]
    fn rejects_zero_pool_size() {
        let users = UserRegistry::new();
        assert_eq!(
            PeerInfo::new(1, 0, 4096, users.bind(0)).unwrap_err(),
            Error::InvalidArg
        );
    }

    #[test]
    fn rejects_unaligned_pool_size() {
        let users = UserRegistry::new();
        assert_eq!(
            PeerInfo::new(1, 100, 4096, users.bind(0)).unwrap_err(),
            Error::InvalidArg
        );
    }

    #[test]
    fn reset_flushes_queue_and_pool() {
        let info = make_info(4096);
        let epoch = info.queue.epoch();
        let slice = info.pool.publish(b"payload").unwrap();
        info.queue.try_commit(
            crate::queue::Message {
                slice,
                n_files: 0,
            },
            epoch,
        );
        info.reset();
        assert!(info.queue.is_empty());
        // pool should be reusable from offset 0 again
        let s2 = info.pool.publish(b"x").unwrap();
        assert_eq!(s2.offset, 0);
    }
}
