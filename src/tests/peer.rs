use std::sync::Arc;

use crate::dispatch::{self, Command, ConnectParams, Reply, CONNECT_QUERY, CONNECT_RESET};
use crate::error::{Error, Result};
use crate::fd::TestFdAllocator;
use crate::peer::Peer;
use crate::tests::test_util::{connect_params, spawn_domain};

fn connect(domain: &Arc<crate::Domain>, peer: &Arc<Peer>, uid: u32, params: ConnectParams) -> Result<Reply> {
    let fds = TestFdAllocator::new();
    dispatch::dispatch(domain, peer, &fds, Command::Connect { uid, params })
}

#[test]
fn connect_resolve_disconnect_round_trip() {
    let domain = spawn_domain();
    let peer = Peer::new();
    let fds = TestFdAllocator::new();

    let reply = connect(&domain, &peer, 0, connect_params(64, &[b"alpha"])).unwrap();
    assert!(matches!(reply, Reply::Connect { pool_size: None }));

    let reply = dispatch::dispatch(
        &domain,
        &peer,
        &fds,
        Command::Resolve { name: b"alpha".to_vec() },
    )
    .unwrap();
    let id = match reply {
        Reply::Resolve { id } => id,
        _ => panic!("expected resolve reply"),
    };
    assert_ne!(id, 0);

    assert!(matches!(
        dispatch::dispatch(&domain, &peer, &fds, Command::Disconnect).unwrap(),
        Reply::Disconnect
    ));

    let err = dispatch::dispatch(
        &domain,
        &peer,
        &fds,
        Command::Resolve { name: b"alpha".to_vec() },
    )
    .unwrap_err();
    assert_eq!(err, Error::NotFound);
    assert_eq!(domain.n_names(), 0);
    assert_eq!(domain.n_peers(), 0);
}

#[test]
fn duplicate_name_is_rejected_and_not_indexed() {
    let domain = spawn_domain();
    let p1 = Peer::new();
    let p2 = Peer::new();

    connect(&domain, &p1, 0, connect_params(64, &[b"dup"])).unwrap();
    let err = connect(&domain, &p2, 0, connect_params(64, &[b"dup"])).unwrap_err();
    assert_eq!(err, Error::NameExists);
    assert_eq!(domain.n_names(), 1);
    assert!(p2.is_new());
}

#[test]
fn reconnect_mismatch_then_already_connected() {
    let domain = spawn_domain();
    let peer = Peer::new();
    connect(&domain, &peer, 0, connect_params(128, &[b"x"])).unwrap();

    let err = connect(&domain, &peer, 0, connect_params(64, &[b"x"])).unwrap_err();
    assert_eq!(err, Error::RemoteChanged);

    let err = connect(&domain, &peer, 0, connect_params(128, &[b"y"])).unwrap_err();
    assert_eq!(err, Error::RemoteChanged);

    let err = connect(&domain, &peer, 0, connect_params(128, &[b"x"])).unwrap_err();
    assert_eq!(err, Error::AlreadyConnected);
}

#[test]
fn reset_flushes_and_recv_then_would_block() {
    let domain = spawn_domain();
    let peer = Peer::new();
    let fds = TestFdAllocator::new();
    connect(&domain, &peer, 0, connect_params(64, &[])).unwrap();
    let dest_id = peer.info_snapshot().unwrap().id;

    dispatch::dispatch(
        &domain,
        &peer,
        &fds,
        Command::Send(dispatch::SendCmd {
            flags: 0,
            payload: b"hi".to_vec(),
            n_files: 0,
            destinations: vec![dest_id],
        }),
    )
    .unwrap();

    let reply = connect(
        &domain,
        &peer,
        0,
        ConnectParams {
            flags: CONNECT_RESET | CONNECT_QUERY,
            pool_size: 0,
            names_blob: Vec::new(),
        },
    )
    .unwrap();
    assert!(matches!(reply, Reply::Connect { pool_size: Some(64) }));

    let err = dispatch::dispatch(&domain, &peer, &fds, Command::Recv { flags: 0 }).unwrap_err();
    assert_eq!(err, Error::WouldBlock);
}

#[test]
fn peek_then_receive_installs_fds() {
    let domain = spawn_domain();
    let peer = Peer::new();
    let fds = TestFdAllocator::new();
    connect(&domain, &peer, 0, connect_params(4096, &[])).unwrap();
    let dest_id = peer.info_snapshot().unwrap().id;

    dispatch::dispatch(
        &domain,
        &peer,
        &fds,
        Command::Send(dispatch::SendCmd {
            flags: 0,
            payload: b"payload".to_vec(),
            n_files: 2,
            destinations: vec![dest_id],
        }),
    )
    .unwrap();

    let peeked = match dispatch::dispatch(&domain, &peer, &fds, Command::Recv { flags: dispatch::RECV_PEEK }).unwrap() {
        Reply::Recv(r) => r,
        _ => unreachable!(),
    };
    assert_eq!(peeked.msg_fds, 2);

    let received = match dispatch::dispatch(&domain, &peer, &fds, Command::Recv { flags: 0 }).unwrap() {
        Reply::Recv(r) => r,
        _ => unreachable!(),
    };
    assert_eq!(received.msg_offset, peeked.msg_offset);
    assert_eq!(received.msg_fds, 2);
}

#[test]
fn unknown_command_is_not_supported() {
    let domain = spawn_domain();
    let peer = Peer::new();
    let fds = TestFdAllocator::new();
    let err = dispatch::dispatch(&domain, &peer, &fds, Command::Unknown).unwrap_err();
    assert_eq!(err, Error::NotSupported);
}

#[test]
fn double_disconnect_is_already_shut_down() {
    let domain = spawn_domain();
    let peer = Peer::new();
    let fds = TestFdAllocator::new();
    connect(&domain, &peer, 0, connect_params(64, &[])).unwrap();
    dispatch::dispatch(&domain, &peer, &fds, Command::Disconnect).unwrap();
    let err = dispatch::dispatch(&domain, &peer, &fds, Command::Disconnect).unwrap_err();
    assert_eq!(err, Error::AlreadyShutDown);
}

#[test]
fn name_claim_without_admin_capability_is_rejected() {
    let domain = spawn_domain();
    let peer = Peer::new();
    let err = connect(&domain, &peer, 1000, connect_params(64, &[b"privileged"])).unwrap_err();
    assert_eq!(err, Error::NotPermitted);
}
