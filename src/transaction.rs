//! Transaction — the atomic multi-destination publishing unit `SEND`
//! builds and commits through. Out of scope per spec §1 beyond the
//! contract §4.7 names: a unicast fast path that commits directly, and a
//! multicast slow path that instantiates a pinned, epoch-tagged pending
//! publish per destination before committing any of them, so a mid-flight
//! failure aborts cleanly with nothing partially delivered (spec §5's
//! ordering guarantee).
//!
//! Grounded on `torrent_state/live/mod.rs`'s two-phase "reserve, then
//! commit" chunk-request bookkeeping: nothing becomes visible to a peer
//! until the whole batch is known to succeed.

use crate::active_ref;
use crate::domain::Domain;
use crate::error::{Error, Result};
use crate::peer::Peer;
use crate::peer_info::PeerInfo;
use crate::queue::Message;
use std::sync::Arc;

pub const IGNORE_UNKNOWN: u32 = 1 << 0;
pub const CONVEY_ERRORS: u32 = 1 << 1;
const KNOWN_SEND_FLAGS: u32 = IGNORE_UNKNOWN | CONVEY_ERRORS;

pub fn validate_send_flags(flags: u32) -> Result<()> {
    if flags & !KNOWN_SEND_FLAGS != 0 {
        return Err(Error::InvalidArg);
    }
    Ok(())
}

/// The imported, already-marshaled parameter block spec §4.7 describes.
/// `payload` stands in for the imported `n_vecs` scatter/gather buffers
/// concatenated into one byte string (the wire-level vector import itself
/// is explicitly out of scope, spec §1) and `n_files` for the attached fd
/// count.
pub struct SendParams {
    pub flags: u32,
    pub payload: Vec<u8>,
    pub n_files: u32,
}

/// One destination pinned and ready to receive `params`, produced by
/// [`Transaction::instantiate_for_id`] and consumed by
/// [`Transaction::commit`]. Holding the [`active_ref::Token`] keeps the
/// destination peer from tearing down between instantiate and commit.
pub struct PendingDest {
    peer: Arc<Peer>,
    token: Option<active_ref::Token>,
    info: Arc<PeerInfo>,
    epoch: u64,
}

/// Built once per `SEND` call and driven through either the unicast fast
/// path or the multicast slow path; never both.
pub struct Transaction<'d> {
    domain: &'d Domain,
    params: SendParams,
}

impl<'d> Transaction<'d> {
    pub fn build(domain: &'d Domain, params: SendParams) -> Result<Self> {
        validate_send_flags(params.flags)?;
        Ok(Self { domain, params })
    }

    /// Unicast fast path: resolve `id`, pin it, publish, release. No
    /// pre-instantiation needed since there's only one destination to
    /// roll back if something goes wrong.
    pub fn commit_for_id(&self, id: u64) -> Result<()> {
        let pending = self.instantiate_for_id(id)?;
        publish_to_pending(&pending, &self.params)
    }

    /// Multicast slow path, step one: pin `id` and snapshot its current
    /// info/epoch under that pin, so the later commit observes the same
    /// generation it validated against (spec's "id read and id compare
    /// happen within the same active-ref acquisition" design note).
    pub fn instantiate_for_id(&self, id: u64) -> Result<PendingDest> {
        let peer = self.domain.peer_by_id(id).ok_or(Error::InvalidArg)?;
        let token = peer.active_acquire().ok_or(Error::InvalidArg)?;
        let info = match peer.info_snapshot() {
            Some(info) => info,
            None => {
                peer.active_release(token);
                return Err(Error::InvalidArg);
            }
        };
        let epoch = info.queue.epoch();
        Ok(PendingDest {
            peer,
            token: Some(token),
            info,
            epoch,
        })
    }

    /// Multicast slow path, step two: publish to every pinned destination
    /// and release their pins. Called only after every
    /// `instantiate_for_id` in the batch succeeded.
    pub fn commit(&self, pending: Vec<PendingDest>) -> Result<()> {
        for p in pending {
            publish_to_pending(&p, &self.params)?;
        }
        Ok(())
    }
}

fn publish_to_pending(pending: &PendingDest, params: &SendParams) -> Result<()> {
    let slice = pending
        .info
        .pool
        .publish(&params.payload)
        .map_err(|_| Error::MsgTooBig)?;
    let msg = Message {
        slice,
        n_files: params.n_files,
    };
    if !pending.info.queue.try_commit(msg, pending.epoch) {
        // A RESET raced ahead of us; per spec this is a silent discard, not
        // an error surfaced to the sender.
        pending.info.pool.release(slice);
    } else {
        pending.peer.wake();
    }
    Ok(())
}

impl Drop for PendingDest {
    fn drop(&mut self) {
        if let Some(token) = self.token.take() {
            self.peer.active_release(token);
        }
    }
}
