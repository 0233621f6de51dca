//! Control dispatch — the command surface spec §4.10/§6 describes: per
//! operation lock ordering, capability checks, and in/out parameter
//! marshaling for `CONNECT`, `RESOLVE`, `DISCONNECT`, `SLICE_RELEASE`,
//! `SEND`, `RECV`.

use std::sync::Arc;

use tracing::{trace, warn};

use crate::domain::Domain;
use crate::error::{Error, Result};
use crate::fd::{FdAllocator, reserve_or_fault};
use crate::peer::Peer;
use crate::peer_info::PeerInfo;
use crate::peer_name::PeerName;
use crate::transaction::{self, SendParams, Transaction};

pub const CONNECT_PEER: u32 = 1 << 0;
pub const CONNECT_MONITOR: u32 = 1 << 1;
pub const CONNECT_QUERY: u32 = 1 << 2;
pub const CONNECT_RESET: u32 = 1 << 3;

pub const RECV_PEEK: u32 = 1 << 0;

pub struct ConnectParams {
    pub flags: u32,
    pub pool_size: u64,
    pub names_blob: Vec<u8>,
}

pub struct RecvReply {
    pub msg_offset: u64,
    pub msg_size: u64,
    pub msg_ids: u32,
    pub msg_fds: u32,
}

pub struct SendCmd {
    pub flags: u32,
    pub payload: Vec<u8>,
    pub n_files: u32,
    /// One element is the unicast fast path; more than one is the
    /// multicast slow path (spec §4.7).
    pub destinations: Vec<u64>,
}

pub enum Command {
    Connect { uid: u32, params: ConnectParams },
    Resolve { name: Vec<u8> },
    Disconnect,
    SliceRelease { offset: u64 },
    Send(SendCmd),
    Recv { flags: u32 },
    /// Any command code this crate doesn't recognize; the character-device
    /// ioctl-number-to-command mapping itself is out of scope (spec §1),
    /// but `NotSupported` is a specified error (spec §7) so dispatch needs
    /// somewhere to produce it from.
    Unknown,
}

pub enum Reply {
    Connect { pool_size: Option<u64> },
    Resolve { id: u64 },
    Disconnect,
    SliceRelease,
    Send,
    Recv(RecvReply),
}

/// Very small stand-in for the domain's administrative-capability check
/// (spec §4.5: "only a caller with administrative capability in the
/// domain's user namespace may claim names"). UID 0 plays the role the
/// kernel's `CAP_SYS_ADMIN`/namespace-owner check plays; this crate does
/// not model user namespaces (spec §1 Non-goals: "securing against
/// malicious handle forgery beyond UID checks").
fn caller_is_admin(uid: u32) -> bool {
    uid == 0
}

/// Entry point matching spec §4.10's lock-and-pin discipline per command
/// class.
pub fn dispatch(
    domain: &Arc<Domain>,
    peer: &Arc<Peer>,
    fd_alloc: &dyn FdAllocator,
    cmd: Command,
) -> Result<Reply> {
    match cmd {
        Command::Connect { uid, params } => {
            let query = params.flags & CONNECT_QUERY != 0;
            let token = domain.pin()?;
            let result = connect(domain, peer, uid, params);
            domain.unpin(token);
            let pool_size = result?;
            Ok(Reply::Connect {
                pool_size: query.then_some(pool_size),
            })
        }
        Command::Resolve { name } => {
            if name.is_empty() {
                return Err(Error::InvalidArg);
            }
            let token = domain.pin()?;
            let result = domain.resolve(&name);
            domain.unpin(token);
            Ok(Reply::Resolve { id: result? })
        }
        Command::Disconnect => {
            peer_teardown(domain, peer)?;
            Ok(Reply::Disconnect)
        }
        Command::SliceRelease { offset } => {
            let _rl = peer.read_lock();
            let token = peer.active_acquire().ok_or(Error::AlreadyShutDown)?;
            let result = slice_release(peer, offset);
            peer.active_release(token);
            result.map(|()| Reply::SliceRelease)
        }
        Command::Send(cmd) => {
            let _rl = peer.read_lock();
            let token = peer.active_acquire().ok_or(Error::AlreadyShutDown)?;
            let result = send(domain, cmd);
            peer.active_release(token);
            result.map(|()| Reply::Send)
        }
        Command::Recv { flags } => {
            let _rl = peer.read_lock();
            let token = peer.active_acquire().ok_or(Error::AlreadyShutDown)?;
            let result = recv(peer, fd_alloc, flags);
            peer.active_release(token);
            result.map(Reply::Recv)
        }
        Command::Unknown => Err(Error::NotSupported),
    }
}

/// Connect dispatch's three sub-operations (spec §4.5). Returns the
/// current `pool_size`, which the caller copies back only if `QUERY` was
/// set.
fn connect(domain: &Arc<Domain>, peer: &Arc<Peer>, uid: u32, params: ConnectParams) -> Result<u64> {
    let has_peer = params.flags & CONNECT_PEER != 0;
    let has_monitor = params.flags & CONNECT_MONITOR != 0;
    let has_reset = params.flags & CONNECT_RESET != 0;
    let has_query = params.flags & CONNECT_QUERY != 0;
    if [has_peer, has_monitor, has_reset]
        .iter()
        .filter(|b| **b)
        .count()
        > 1
    {
        return Err(Error::InvalidArg);
    }

    let _wl = peer.write_lock();

    if has_reset {
        return do_reset(peer, &params);
    }
    if has_peer || has_monitor {
        return do_new_connect(domain, peer, uid, &params);
    }
    if has_query {
        return do_query(peer);
    }
    Err(Error::InvalidArg)
}

fn do_new_connect(
    domain: &Arc<Domain>,
    peer: &Arc<Peer>,
    uid: u32,
    params: &ConnectParams,
) -> Result<u64> {
    if peer.is_active() {
        let info = peer.info_snapshot().ok_or_else(|| bug("active peer with no info"))?;
        let existing = peer.names();
        if info.pool.size() == params.pool_size {
            return if PeerName::names_match(&existing, &params.names_blob)? {
                Err(Error::AlreadyConnected)
            } else {
                Err(Error::RemoteChanged)
            };
        }
        // Surface a malformed blob as InvalidArg before the size mismatch.
        PeerName::parse_blob(&params.names_blob)?;
        return Err(Error::RemoteChanged);
    }
    if !peer.is_new() {
        return Err(Error::AlreadyShutDown);
    }

    let names = PeerName::parse_blob(&params.names_blob)?;
    if !names.is_empty() && !caller_is_admin(uid) {
        return Err(Error::NotPermitted);
    }

    let user = domain.users.bind(uid);
    let info = match PeerInfo::new(
        domain.next_peer_id(),
        params.pool_size,
        domain.config.page_size,
        user.clone(),
    ) {
        Ok(info) => Arc::new(info),
        Err(e) => {
            domain.users.unbind(&user);
            return Err(e);
        }
    };

    // Built in reverse order so insertion order matches the blob order at
    // the head of the peer's name list (spec §4.5).
    let mut peer_names = Vec::with_capacity(names.len());
    for raw in names.iter().rev() {
        match PeerName::new(raw, peer, domain.config.name_max) {
            Ok(pn) => peer_names.push(pn),
            Err(e) => {
                domain.users.unbind(&user);
                return Err(e);
            }
        }
    }

    {
        let _guard = domain.lock();
        domain.seq_write_begin();
        let mut inserted = Vec::with_capacity(peer_names.len());
        let mut failure = None;
        for pn in &peer_names {
            match domain.insert_name(pn.clone()) {
                Ok(()) => inserted.push(pn.clone()),
                Err(e) => {
                    failure = Some(e);
                    break;
                }
            }
        }
        if let Some(e) = failure {
            for pn in &inserted {
                domain.remove_name(&pn.name);
            }
            domain.seq_write_end();
            drop(_guard);
            domain.users.unbind(&user);
            return Err(e);
        }

        peer.set_names(peer_names);
        domain.link_peer(peer.clone(), info.id);
        peer.set_info(Some(info.clone()));
        peer.activate();
        domain.seq_write_end();
    }

    Ok(info.pool.size())
}

fn do_reset(peer: &Arc<Peer>, params: &ConnectParams) -> Result<u64> {
    if peer.is_new() {
        return Err(Error::NotConnected);
    }
    if params.pool_size != 0 || !params.names_blob.is_empty() {
        return Err(Error::InvalidArg);
    }
    let info = peer
        .info_snapshot()
        .ok_or_else(|| bug("active peer with no info"))?;
    let pool_size = info.pool.size();
    // No domain lock needed: existing senders pinned on `info` observe the
    // flush boundary through the queue's epoch, not through any lock we'd
    // need to take here (spec §4.5).
    info.reset();
    Ok(pool_size)
}

fn do_query(peer: &Arc<Peer>) -> Result<u64> {
    if peer.is_new() {
        return Err(Error::NotConnected);
    }
    let info = peer
        .info_snapshot()
        .ok_or_else(|| bug("active peer with no info"))?;
    Ok(info.pool.size())
}

/// Shared by `DISCONNECT` and domain-wide shutdown (spec §4.9's "Cleanup
/// callback"): detaches every `PeerName` and releases the user binding.
/// Does **not** touch the domain's peer list — callers do that themselves,
/// since the two teardown paths differ there (one unlinks immediately, the
/// other resets the list in bulk).
pub(crate) fn run_cleanup(domain: &Domain, peer: &Arc<Peer>, info: &Arc<PeerInfo>) {
    for name in peer.take_names() {
        domain.remove_name(&name.name);
    }
    if let Some(user) = info.take_user() {
        domain.users.unbind(&user);
    }
    peer.set_info(None);
}

/// Plain per-peer teardown (`DISCONNECT`, spec §4.9).
pub fn peer_teardown(domain: &Arc<Domain>, peer: &Arc<Peer>) -> Result<()> {
    let _wl = peer.write_lock();
    peer.deactivate();
    peer.drain();

    let mut captured: Option<Arc<PeerInfo>> = None;
    let fired = {
        let _guard = domain.lock();
        domain.seq_write_begin();
        let snapshot = peer.info_snapshot();
        let id = snapshot.as_ref().map(|i| i.id);
        let fired = peer.cleanup(
            |info_opt: Option<Arc<PeerInfo>>| {
                if let Some(info) = info_opt {
                    run_cleanup(domain, peer, &info);
                    if let Some(id) = id {
                        domain.unlink_peer(peer, id);
                    }
                    captured = Some(info);
                }
            },
            snapshot,
        );
        domain.seq_write_end();
        fired
    };

    if !fired {
        return Err(Error::AlreadyShutDown);
    }
    if let Some(info) = captured {
        info.reset();
        info.free();
    }
    Ok(())
}

fn slice_release(peer: &Arc<Peer>, offset: u64) -> Result<()> {
    let info = peer.info_snapshot().ok_or(Error::InvalidArg)?;
    info.pool.release_by_offset(offset)
}

fn send(domain: &Domain, cmd: SendCmd) -> Result<()> {
    if cmd.destinations.is_empty() || cmd.destinations.len() > domain.config.vec_max {
        return Err(Error::InvalidArg);
    }
    if cmd.n_files as usize > domain.config.fd_max {
        return Err(Error::InvalidArg);
    }
    let txn = Transaction::build(
        domain,
        SendParams {
            flags: cmd.flags,
            payload: cmd.payload,
            n_files: cmd.n_files,
        },
    )?;

    if cmd.destinations.len() == 1 {
        return txn.commit_for_id(cmd.destinations[0]);
    }

    let mut pending = Vec::with_capacity(cmd.destinations.len());
    for id in &cmd.destinations {
        match txn.instantiate_for_id(*id) {
            Ok(p) => pending.push(p),
            Err(e) => return Err(e), // dropping `pending` unpins what we already reserved
        }
    }
    txn.commit(pending)
}

/// Receive path (spec §4.8): `PEEK` publishes the head message's slice
/// without dequeuing or installing fds; default mode dequeues with
/// fd-count pre-allocation and a bounded retry against a racing sender.
fn recv(peer: &Arc<Peer>, fd_alloc: &dyn FdAllocator, flags: u32) -> Result<RecvReply> {
    let info = peer
        .info_snapshot()
        .ok_or_else(|| bug("active peer with no info"))?;

    if flags & RECV_PEEK != 0 {
        let msg = info.queue.peek_front().ok_or(Error::WouldBlock)?;
        return Ok(RecvReply {
            msg_offset: msg.slice.offset,
            msg_size: msg.slice.len,
            msg_ids: 0,
            msg_fds: msg.n_files,
        });
    }

    let mut wanted = match info.queue.peek_front_n_files() {
        Some(n) => n,
        None => return Err(Error::WouldBlock),
    };

    loop {
        let reserved = reserve_or_fault(fd_alloc, wanted as usize)?;
        trace!(wanted, "recv: reserved fds, re-peeking");

        let current = info.queue.peek_front_n_files();
        match current {
            None => {
                for fd in reserved {
                    fd_alloc.surrender(fd);
                }
                return Err(Error::WouldBlock);
            }
            Some(n) if n > reserved.len() as u32 => {
                for fd in reserved {
                    fd_alloc.surrender(fd);
                }
                wanted = n;
                continue;
            }
            Some(_) => {
                let msg = match info.queue.pop_front() {
                    Some(m) => m,
                    None => {
                        for fd in reserved {
                            fd_alloc.surrender(fd);
                        }
                        return Err(Error::WouldBlock);
                    }
                };
                let needed = msg.n_files as usize;
                for fd in reserved.iter().skip(needed) {
                    fd_alloc.surrender(*fd);
                }
                let used: Vec<_> = reserved.into_iter().take(needed).collect();

                if msg.n_files == 0 {
                    info.pool.release(msg.slice);
                    return Ok(RecvReply {
                        msg_offset: msg.slice.offset,
                        msg_size: msg.slice.len,
                        msg_ids: 0,
                        msg_fds: 0,
                    });
                }

                let mut tail = Vec::with_capacity(used.len() * 8);
                for fd in &used {
                    tail.extend_from_slice(&fd.0.to_le_bytes());
                }

                return match info.pool.append_tail(msg.slice, &tail) {
                    Ok(grown) => {
                        // `grown` may live at a relocated offset if the pool
                        // had no room to extend `msg.slice` in place; the fd
                        // tail and the payload both moved with it, so every
                        // fd is installed against `grown.offset`, and the
                        // offset handed back to the caller must be
                        // `grown.offset` too — never the pre-relocation
                        // `msg.slice.offset`, which may no longer hold
                        // anything live. `msg_size` stays the payload length
                        // (matching what PEEK already reported for this same
                        // message); the appended fd-number tail beyond it is
                        // not part of the message the caller reads. The
                        // slice stays published (not released here) until
                        // the caller's own `SLICE_RELEASE`, per spec §4.8.
                        for fd in &used {
                            let _ = fd_alloc.install(*fd, grown.offset);
                        }
                        Ok(RecvReply {
                            msg_offset: grown.offset,
                            msg_size: msg.slice.len,
                            msg_ids: 0,
                            msg_fds: used.len() as u32,
                        })
                    }
                    Err(_) => {
                        warn!("recv: OOM writing fd tail, dropping message silently");
                        for fd in &used {
                            fd_alloc.surrender(*fd);
                        }
                        Ok(RecvReply {
                            msg_offset: 0,
                            msg_size: 0,
                            msg_ids: 0,
                            msg_fds: 0,
                        })
                    }
                };
            }
        }
    }
}

fn bug(msg: &'static str) -> Error {
    tracing::error!(msg, "invariant violation");
    Error::Bug
}

// Re-exported so integration tests can build multicast send params without
// reaching into `transaction` directly.
pub use transaction::{CONVEY_ERRORS, IGNORE_UNKNOWN};
