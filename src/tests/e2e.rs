//! Black-box scenarios exercising the concurrency guarantees spec §8 names
//! rather than any single module in isolation: a multicast `SEND` racing a
//! concurrent teardown of one of its destinations (§8 scenario 6), and two
//! `CONNECT`s racing to claim the same name (spec §5's lock-ordering
//! discipline applied to the domain name index).

use std::sync::Arc;

use crate::dispatch::{self, Command};
use crate::peer::Peer;
use crate::tests::test_util::{connect_params, spawn_domain};
use crate::transaction::{SendParams, Transaction};

#[test]
fn teardown_during_multicast_send_drops_pinned_destination_cleanly() {
    let domain = spawn_domain();
    let dest = Peer::new();
    let fds = crate::fd::TestFdAllocator::new();

    dispatch::dispatch(
        &domain,
        &dest,
        &fds,
        Command::Connect {
            uid: 0,
            params: connect_params(64, &[]),
        },
    )
    .unwrap();
    let dest_id = dest.info_snapshot().unwrap().id;

    // Pin the destination the way the multicast slow path does, before the
    // racing DISCONNECT runs.
    let txn = Transaction::build(
        &domain,
        SendParams {
            flags: 0,
            payload: b"hi".to_vec(),
            n_files: 0,
        },
    )
    .unwrap();
    let pending = txn.instantiate_for_id(dest_id).unwrap();

    // Thread B: DISCONNECT races ahead while the sender is still pinned.
    // `drain` inside peer_teardown does not need to wait here, since the
    // sender's pin is on `PeerInfo`/`Peer` via an active-ref token already
    // captured by `instantiate_for_id`, not a fresh acquire — the teardown
    // call below models B having already won the drain race.
    dispatch::peer_teardown(&domain, &dest).unwrap();
    assert!(dest.is_dead());
    assert!(dest.info_snapshot().is_none());

    // Thread A finishes its commit after the race: the destination's reset
    // (run as part of teardown) already bumped the queue epoch pinned by
    // `pending`, so the message is silently discarded rather than delivered
    // or causing an error — no partially-delivered message is observable,
    // and no PeerInfo/PeerName/user binding leaks past this point.
    txn.commit(vec![pending]).unwrap();

    assert_eq!(domain.n_peers(), 0);
    assert_eq!(domain.n_names(), 0);
}

#[test]
fn concurrent_connect_race_exactly_one_claims_the_name() {
    let domain = spawn_domain();
    let p1 = Peer::new();
    let p2 = Peer::new();
    let fds1 = Arc::new(crate::fd::TestFdAllocator::new());
    let fds2 = Arc::new(crate::fd::TestFdAllocator::new());

    let d1 = domain.clone();
    let d2 = domain.clone();
    let p1c = p1.clone();
    let p2c = p2.clone();

    let t1 = std::thread::spawn(move || {
        dispatch::dispatch(
            &d1,
            &p1c,
            fds1.as_ref(),
            Command::Connect {
                uid: 0,
                params: connect_params(64, &[b"race"]),
            },
        )
    });
    let t2 = std::thread::spawn(move || {
        dispatch::dispatch(
            &d2,
            &p2c,
            fds2.as_ref(),
            Command::Connect {
                uid: 0,
                params: connect_params(64, &[b"race"]),
            },
        )
    });

    let r1 = t1.join().unwrap();
    let r2 = t2.join().unwrap();

    let oks = [&r1, &r2].iter().filter(|r| r.is_ok()).count();
    assert_eq!(oks, 1, "exactly one of the two racing CONNECTs should win the name");
    assert_eq!(domain.n_names(), 1);
    assert_eq!(domain.n_peers(), 1);

    // The loser never activated and left no trace in the name index (spec
    // §4.5's unwind-on-collision path).
    let active_count = [&p1, &p2].iter().filter(|p| p.is_active()).count();
    assert_eq!(active_count, 1);
    let resolved = domain.resolve(b"race").unwrap();
    assert_ne!(resolved, 0);
}
