//! Minimal wait set used for poll wakeups and drain coordination (spec's
//! `waitq`). Stands in for the kernel `wait_queue_head_t` the original
//! drives with `wake_up_interruptible`; here a generation counter plus
//! `parking_lot::Condvar` gives the same "wake everyone parked right now"
//! semantics without pulling in an async runtime (see `SPEC_FULL.md` §B.4).

use std::time::Duration;

use parking_lot::{Condvar, Mutex};

#[derive(Default)]
pub struct WaitQueue {
    generation: Mutex<u64>,
    cv: Condvar,
}

impl WaitQueue {
    pub fn new() -> Self {
        Self {
            generation: Mutex::new(0),
            cv: Condvar::new(),
        }
    }

    /// Wakes every thread currently parked in [`Self::wait_while`].
    pub fn wake_all(&self) {
        let mut g = self.generation.lock();
        *g = g.wrapping_add(1);
        drop(g);
        self.cv.notify_all();
    }

    /// Blocks while `pred()` is true, bounded by `timeout`. Returns `true`
    /// if `pred()` became false before the timeout elapsed.
    pub fn wait_while(&self, timeout: Duration, mut pred: impl FnMut() -> bool) -> bool {
        let mut g = self.generation.lock();
        let deadline = std::time::Instant::now() + timeout;
        while pred() {
            let remaining = deadline.saturating_duration_since(std::time::Instant::now());
            if remaining.is_zero() {
                return false;
            }
            let result = self.cv.wait_for(&mut g, remaining);
            if result.timed_out() && pred() {
                return false;
            }
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::thread;

    #[test]
    fn wake_all_unblocks_waiter() {
        let wq = Arc::new(WaitQueue::new());
        let flag = Arc::new(AtomicBool::new(true));

        let wq2 = wq.clone();
        let flag2 = flag.clone();
        let waiter = thread::spawn(move || {
            wq2.wait_while(Duration::from_secs(5), || flag2.load(Ordering::SeqCst))
        });

        thread::sleep(Duration::from_millis(20));
        flag.store(false, Ordering::SeqCst);
        wq.wake_all();
        assert!(waiter.join().unwrap());
    }

    #[test]
    fn wait_while_times_out() {
        let wq = WaitQueue::new();
        let woke = wq.wait_while(Duration::from_millis(20), || true);
        assert!(!woke);
    }
}
