//! Queue — the per-`PeerInfo` committed/staged priority queue of message
//! nodes. Out of scope per spec §1 beyond the contract SEND/RECV need: FIFO
//! delivery order (spec §8's "Queue order preservation" law), a flush
//! boundary that makes late, reset-straddling commits self-discard (spec
//! §4.3 `reset`, design note "Tagged operations under reset"), and
//! peek/dequeue with fd-count visibility ahead of the actual payload.
//!
//! Grounded on the staged/committed split `torrent_state/live/mod.rs` uses
//! for in-flight piece requests versus confirmed completions — a value
//! isn't final until it crosses a commit point, and anything staged before
//! a generation boundary is abandoned rather than retried out of order.

use std::collections::VecDeque;

use parking_lot::Mutex;

use crate::pool::Slice;

/// One delivered message. `epoch` is the invalidation token described in
/// spec's "Tagged operations under reset" design note: it's compared
/// against the queue's current epoch at commit time, and a mismatch means a
/// `RESET` happened between the sender starting the send and finishing it.
#[derive(Debug, Clone)]
pub struct Message {
    pub slice: Slice,
    pub n_files: u32,
}

struct State {
    messages: VecDeque<Message>,
    /// Bumped by `flush`; `try_commit` compares against the epoch the
    /// sender captured when it started the send.
    epoch: u64,
}

pub struct Queue {
    state: Mutex<State>,
}

impl Queue {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(State {
                messages: VecDeque::new(),
                epoch: 0,
            }),
        }
    }

    /// The epoch a sender must capture before building its message, and
    /// present back to [`Self::try_commit`]. Capturing and comparing within
    /// the same destination active-ref acquisition is what spec's design
    /// note requires ("id read and id compare happen within the same
    /// active-ref acquisition on the destination").
    pub fn epoch(&self) -> u64 {
        self.state.lock().epoch
    }

    /// Commits `msg` if `expected_epoch` still matches. Returns `false`
    /// (silently, per spec) if a `RESET` raced ahead of this commit — the
    /// caller must not treat that as an error.
    pub fn try_commit(&self, msg: Message, expected_epoch: u64) -> bool {
        let mut st = self.state.lock();
        if st.epoch != expected_epoch {
            return false;
        }
        st.messages.push_back(msg);
        true
    }

    /// Fd count of the head message without dequeuing it. `None` if empty.
    pub fn peek_front_n_files(&self) -> Option<u32> {
        self.state.lock().messages.front().map(|m| m.n_files)
    }

    /// Full head message without dequeuing (spec's `PEEK` mode).
    pub fn peek_front(&self) -> Option<Message> {
        self.state.lock().messages.front().cloned()
    }

    /// Dequeues the head message if present.
    pub fn pop_front(&self) -> Option<Message> {
        self.state.lock().messages.pop_front()
    }

    pub fn is_empty(&self) -> bool {
        self.state.lock().messages.is_empty()
    }

    /// Drains every committed message (caller releases their pool slices),
    /// then bumps the epoch so in-flight staged commits from before the
    /// flush self-discard (spec §4.3 step 1-2).
    pub fn flush(&self) -> Vec<Message> {
        let mut st = self.state.lock();
        st.epoch += 1;
        st.messages.drain(..).collect()
    }
}

impl Default for Queue {
    fn default() -> Self {
        Self::new()
    }
}
