//! Pool — the mmap-backed slab allocator a `Peer` publishes payloads
//! through. Out of scope per spec §1 ("the pool... only the contracts we
//! consume from them are specified"); this is that contract, implemented
//! deep enough for `SEND`/`RECV`/`SLICE_RELEASE` to be exercised end to end.
//!
//! Grounded on `storage/filesystem/mmap.rs`, which backs torrent storage
//! with an anonymous `memmap2::MmapMut` behind a `parking_lot::RwLock`; the
//! same shape fits a pool slab, just carved into offset/length slices
//! instead of piece-indexed files.

use parking_lot::Mutex;

use crate::error::{Error, Result};

/// An offset/length pair into a [`Pool`]'s backing mapping. Cheap to copy
/// and pass to user space as the `(offset, size)` pair spec's RECV/PEEK
/// write back.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Slice {
    pub offset: u64,
    pub len: u64,
}

struct PoolState {
    mmap: memmap2::MmapMut,
    /// Byte ranges currently handed out, keyed by offset, so `flush`/`release`
    /// know what's still live without a moving-GC slab structure.
    live: std::collections::BTreeMap<u64, u64>,
    /// First byte past the highest-ever allocation; bump pointer for the
    /// common case of a pool that's never wrapped around.
    bump: u64,
    /// Freed ranges below `bump`, available for first-fit reuse once the
    /// bump pointer would otherwise overrun `size`.
    free: Vec<(u64, u64)>,
}

/// A peer's private slab of shared memory. `size` is fixed at construction
/// (spec §4.5: `pool_size` must be a positive page multiple) and never
/// grows.
pub struct Pool {
    size: u64,
    state: Mutex<PoolState>,
}

impl Pool {
    pub fn new(size: u64) -> Result<Self> {
        let mmap = memmap2::MmapOptions::new()
            .len(size as usize)
            .map_anon()
            .map_err(|_| Error::OutOfMemory)?;
        Ok(Self {
            size,
            state: Mutex::new(PoolState {
                mmap,
                live: std::collections::BTreeMap::new(),
                bump: 0,
                free: Vec::new(),
            }),
        })
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    /// Allocates a slice of `len` bytes and copies `payload` into it.
    /// Returns `OutOfMemory` if the pool has no room (first-fit over freed
    /// ranges, then bump from the high-water mark).
    pub fn publish(&self, payload: &[u8]) -> Result<Slice> {
        let len = payload.len() as u64;
        let mut st = self.state.lock();
        let offset = st.alloc(len, self.size)?;
        st.mmap[offset as usize..(offset + len) as usize].copy_from_slice(payload);
        Ok(Slice { offset, len })
    }

    /// Appends `extra` bytes to the tail of an already-published slice,
    /// growing it in place if room remains immediately after it, otherwise
    /// relocating to a fresh, larger allocation. Used by RECV to write the
    /// fd-number tail onto a message's slice (spec §4.8 step 5).
    pub fn append_tail(&self, slice: Slice, extra: &[u8]) -> Result<Slice> {
        let mut st = self.state.lock();
        let new_len = slice.len + extra.len() as u64;
        if st.live.get(&slice.offset) == Some(&slice.len)
            && !st.range_overlaps_live(slice.offset + slice.len, extra.len() as u64, slice.offset)
            && slice.offset + new_len <= self.size
        {
            st.mmap[(slice.offset + slice.len) as usize..(slice.offset + new_len) as usize]
                .copy_from_slice(extra);
            st.live.remove(&slice.offset);
            st.live.insert(slice.offset, new_len);
            return Ok(Slice {
                offset: slice.offset,
                len: new_len,
            });
        }
        // Relocate: allocate fresh, copy both parts, release the old slice.
        let mut buf = vec![0u8; new_len as usize];
        buf[..slice.len as usize].copy_from_slice(&st.mmap[slice.offset as usize..(slice.offset + slice.len) as usize]);
        buf[slice.len as usize..].copy_from_slice(extra);
        st.release(slice);
        let offset = st.alloc(new_len, self.size)?;
        st.mmap[offset as usize..(offset + new_len) as usize].copy_from_slice(&buf);
        Ok(Slice { offset, len: new_len })
    }

    pub fn read(&self, slice: Slice) -> Vec<u8> {
        let st = self.state.lock();
        st.mmap[slice.offset as usize..(slice.offset + slice.len) as usize].to_vec()
    }

    /// Releases one previously published slice (`SLICE_RELEASE`, and the
    /// zero-fd fast path inside RECV dequeue).
    pub fn release(&self, slice: Slice) {
        self.state.lock().release(slice);
    }

    /// `SLICE_RELEASE`'s entry point: the command carries only an offset,
    /// so the pool itself must know the matching length. `InvalidArg` if
    /// nothing is live at that offset (already released, or never
    /// allocated).
    pub fn release_by_offset(&self, offset: u64) -> Result<()> {
        let mut st = self.state.lock();
        match st.live.remove(&offset) {
            Some(len) => {
                st.free.push((offset, len));
                Ok(())
            }
            None => Err(Error::InvalidArg),
        }
    }

    /// Releases every live slice and resets the allocator, used by
    /// `PeerInfo::reset`'s pool-flush step.
    pub fn flush(&self) {
        let mut st = self.state.lock();
        st.live.clear();
        st.free.clear();
        st.bump = 0;
    }
}

impl PoolState {
    fn alloc(&mut self, len: u64, cap: u64) -> Result<u64> {
        if len == 0 {
            return Err(Error::InvalidArg);
        }
        if let Some(pos) = self.free.iter().position(|&(_, flen)| flen >= len) {
            let (offset, flen) = self.free.remove(pos);
            if flen > len {
                self.free.push((offset + len, flen - len));
            }
            self.live.insert(offset, len);
            return Ok(offset);
        }
        if self.bump + len > cap {
            return Err(Error::OutOfMemory);
        }
        let offset = self.bump;
        self.bump += len;
        self.live.insert(offset, len);
        Ok(offset)
    }

    fn release(&mut self, slice: Slice) {
        if self.live.remove(&slice.offset).is_some() {
            self.free.push((slice.offset, slice.len));
        }
    }

    fn range_overlaps_live(&self, start: u64, len: u64, ignore_offset: u64) -> bool {
        if len == 0 {
            return false;
        }
        self.live
            .iter()
            .any(|(&off, &l)| off != ignore_offset && off < start + len && start < off + l)
    }
}
