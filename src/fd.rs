//! File-descriptor pre-allocation — out of scope per spec §1 ("the
//! kernel/user ABI marshaling helpers, and the character-device bindings").
//! `RECV`'s dequeue path (spec §4.8) composes the queue lock and an
//! FD-table allocation; this module is the narrow contract that
//! composition needs: reserve N close-on-exec fd numbers ahead of the
//! lock, install a file behind a reserved number, or give numbers back
//! unused.
//!
//! Grounded on `storage::BoxStorageFactory`'s trait-object seam in
//! `storage/mod.rs`: the rest of the crate depends only on the trait, so
//! a host embedding `capbus` can swap in its own fd table (real ioctl/fd
//! install) without touching the receive-path logic.

use crate::error::{Error, Result};

/// One pre-reserved, not-yet-installed fd number.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReservedFd(pub u64);

pub trait FdAllocator: Send + Sync {
    /// Reserves `count` fresh fd numbers with close-on-exec set, ahead of
    /// any lock (spec §4.8 step 2).
    fn reserve(&self, count: usize) -> Result<Vec<ReservedFd>>;

    /// Installs `fd` as a reference to the file identified by opaque
    /// `content` (in this crate, the pool slice offset the fd's payload
    /// lives at — see `dispatch::recv`).
    fn install(&self, fd: ReservedFd, content: u64) -> Result<()>;

    /// Surrenders an unused reservation (spec §4.8 step 4 and the exit
    /// path's "any still-unused pre-reserved fd numbers are released").
    fn surrender(&self, fd: ReservedFd);
}

/// In-process stand-in used by tests and by any embedder that doesn't
/// need real OS fd installation — tracks reservations and installs in a
/// plain table instead of a real fd table.
#[derive(Default)]
pub struct TestFdAllocator {
    next: std::sync::atomic::AtomicU64,
    installed: parking_lot::Mutex<std::collections::BTreeMap<u64, u64>>,
}

impl TestFdAllocator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn installed_content(&self, fd: u64) -> Option<u64> {
        self.installed.lock().get(&fd).copied()
    }
}

impl FdAllocator for TestFdAllocator {
    fn reserve(&self, count: usize) -> Result<Vec<ReservedFd>> {
        if count == 0 {
            return Ok(Vec::new());
        }
        let mut out = Vec::with_capacity(count);
        for _ in 0..count {
            let n = self
                .next
                .fetch_add(1, std::sync::atomic::Ordering::AcqRel);
            out.push(ReservedFd(n));
        }
        Ok(out)
    }

    fn install(&self, fd: ReservedFd, content: u64) -> Result<()> {
        self.installed.lock().insert(fd.0, content);
        Ok(())
    }

    fn surrender(&self, _fd: ReservedFd) {
        // Nothing to release in the test table; a real allocator would
        // return the fd number to its free pool here.
    }
}

pub fn reserve_or_fault(alloc: &dyn FdAllocator, count: usize) -> Result<Vec<ReservedFd>> {
    alloc.reserve(count).map_err(|_| Error::Fault)
}
