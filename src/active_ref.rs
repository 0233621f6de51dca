//! Drain-able refcount with a one-shot cleanup callback.
//!
//! Mirrors the role `librqbit`'s `ManagedTorrentHandle`/`CancellationToken`
//! pair plays around `torrent_state`: a handle that other threads can pin
//! for the duration of an operation, plus a coordinated, exactly-once
//! teardown that waits for every pinned holder to let go first. Here the
//! state machine is spelled out explicitly (spec §4.1) rather than composed
//! from `tokio_util::sync::CancellationToken`, since `capbus` has no async
//! runtime (see `SPEC_FULL.md` §B.4).

use parking_lot::{Condvar, Mutex};

use crate::wait_queue::WaitQueue;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    New,
    Active,
    Deactivating,
    Dead,
}

struct Inner {
    state: State,
    inflight: usize,
}

/// See module docs. All operations are the ones spec §4.1 names; callers
/// never see the raw state enum.
pub struct ActiveRef {
    inner: Mutex<Inner>,
    drain_cv: Condvar,
    cleanup_ran: Mutex<bool>,
}

/// Proof that an [`ActiveRef::acquire`] succeeded. Must be passed back to
/// [`ActiveRef::release`] exactly once; dropping it without releasing would
/// wedge `drain` forever, so it is `#[must_use]`.
#[must_use]
pub struct Token(());

impl Default for ActiveRef {
    fn default() -> Self {
        Self::new()
    }
}

impl ActiveRef {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner {
                state: State::New,
                inflight: 0,
            }),
            drain_cv: Condvar::new(),
            cleanup_ran: Mutex::new(false),
        }
    }

    pub fn is_new(&self) -> bool {
        self.inner.lock().state == State::New
    }

    pub fn is_active(&self) -> bool {
        self.inner.lock().state == State::Active
    }

    pub fn is_deactivated(&self) -> bool {
        matches!(self.inner.lock().state, State::Deactivating | State::Dead)
    }

    pub fn is_dead(&self) -> bool {
        self.inner.lock().state == State::Dead
    }

    /// NEW -> ACTIVE. Irreversible; panics if called twice, since that would
    /// indicate a lifecycle bug in the caller (spec's invariant 8.1 would
    /// already be violated by the time this is reachable twice).
    pub fn activate(&self) {
        let mut inner = self.inner.lock();
        debug_assert_eq!(inner.state, State::New, "activate called outside NEW");
        inner.state = State::Active;
    }

    /// Succeeds only in ACTIVE; increments the in-flight count and returns a
    /// token whose [`Self::release`] decrements it again.
    pub fn acquire(&self) -> Option<Token> {
        let mut inner = self.inner.lock();
        if inner.state != State::Active {
            return None;
        }
        inner.inflight += 1;
        Some(Token(()))
    }

    /// On the last release after [`Self::deactivate`], wakes `waitq` (spec
    /// §4.1) and unblocks any thread parked in [`Self::drain`].
    pub fn release(&self, token: Token, waitq: &WaitQueue) {
        let Token(()) = token;
        let mut inner = self.inner.lock();
        inner.inflight -= 1;
        let last_release = inner.inflight == 0 && inner.state != State::Active;
        drop(inner);
        self.drain_cv.notify_all();
        if last_release {
            waitq.wake_all();
        }
    }

    /// ACTIVE -> DEACTIVATING. Idempotent: deactivating an already
    /// deactivated ref is a no-op, matching `DISCONNECT` being safe to race
    /// against itself (the second caller sees `AlreadyShutDown` further up
    /// the stack via [`Self::cleanup`], not here).
    pub fn deactivate(&self) {
        let mut inner = self.inner.lock();
        if inner.state == State::Active {
            inner.state = State::Deactivating;
        }
        if inner.inflight == 0 {
            drop(inner);
            self.drain_cv.notify_all();
        }
    }

    /// Blocks the calling thread until the in-flight count reaches zero.
    /// Must be called after [`Self::deactivate`] or it would never return.
    pub fn drain(&self) {
        let mut inner = self.inner.lock();
        while inner.inflight != 0 {
            self.drain_cv.wait(&mut inner);
        }
    }

    /// Once-only. Returns `true` exactly once across all concurrent
    /// callers; on that call it runs `f(userdata)` before returning. Later
    /// callers (e.g. a racing `DISCONNECT` against domain-assisted
    /// teardown, spec §4.9) see `false` and must surface `AlreadyShutDown`.
    ///
    /// Precondition: the caller has already drained (`inflight == 0`);
    /// this is not re-checked here since both call sites in this crate
    /// always drain first.
    pub fn cleanup<T>(&self, f: impl FnOnce(T), userdata: T) -> bool {
        let mut ran = self.cleanup_ran.lock();
        if *ran {
            return false;
        }
        *ran = true;
        drop(ran);
        f(userdata);
        self.inner.lock().state = State::Dead;
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::thread;

    #[test]
    fn acquire_fails_before_activate() {
        let a = ActiveRef::new();
        assert!(a.acquire().is_none());
    }

    #[test]
    fn acquire_succeeds_once_active() {
        let a = ActiveRef::new();
        a.activate();
        let wq = WaitQueue::new();
        let tok = a.acquire().expect("active");
        a.release(tok, &wq);
    }

    #[test]
    fn acquire_fails_after_deactivate() {
        let a = ActiveRef::new();
        a.activate();
        a.deactivate();
        assert!(a.acquire().is_none());
    }

    #[test]
    fn cleanup_runs_exactly_once() {
        let a = ActiveRef::new();
        a.activate();
        a.deactivate();
        a.drain();
        let runs = Arc::new(AtomicUsize::new(0));
        let r1 = {
            let runs = runs.clone();
            a.cleanup(move |_| { runs.fetch_add(1, Ordering::SeqCst); }, ())
        };
        let r2 = a.cleanup(|_| unreachable!("cleanup must not re-run"), ());
        assert!(r1);
        assert!(!r2);
        assert_eq!(runs.load(Ordering::SeqCst), 1);
        assert!(a.is_dead());
    }

    #[test]
    fn drain_waits_for_outstanding_acquires() {
        let a = Arc::new(ActiveRef::new());
        a.activate();
        let wq = Arc::new(WaitQueue::new());
        let tok = a.acquire().unwrap();
        a.deactivate();

        let a2 = a.clone();
        let wq2 = wq.clone();
        let releaser = thread::spawn(move || {
            thread::sleep(std::time::Duration::from_millis(20));
            a2.release(tok, &wq2);
        });
        a.drain();
        releaser.join().unwrap();
    }
}
