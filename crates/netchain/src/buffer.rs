//! Growable receive/send buffers carved from the `jiukun` allocator.
//!
//! `spec.md`'s data flow requires framing buffers to come "through the
//! slab/page stack" rather than the process heap. [`JiukunBuffer`] wraps a
//! single `jiukun_slab::Jiukun::alloc_memory` allocation with begin/end
//! cursors matching the asocket receive-buffer contract (`spec.md §4.C`):
//! compacting slide when `begin > 0`, doubling growth capped at a
//! configured maximum.

use std::ptr::NonNull;
use std::slice;
use std::sync::Arc;

use jiukun_slab::Jiukun;

/// A single growable buffer whose storage is owned by a `Jiukun` allocator.
///
/// # Safety
///
/// `ptr` is always a live allocation of exactly `cap` bytes obtained from
/// `pool`; it is freed exactly once, in `Drop`.
pub struct JiukunBuffer {
    pool: Arc<Jiukun>,
    ptr: NonNull<u8>,
    cap: usize,
    /// Index of the first unconsumed byte.
    begin: usize,
    /// Index one past the last written byte.
    end: usize,
    max_cap: usize,
}

impl JiukunBuffer {
    pub fn new(pool: Arc<Jiukun>, initial_cap: usize, max_cap: usize) -> Self {
        let ptr = pool
            .alloc_memory(initial_cap)
            .expect("initial buffer allocation must succeed");
        Self {
            pool,
            ptr,
            cap: initial_cap,
            begin: 0,
            end: 0,
            max_cap,
        }
    }

    #[must_use]
    pub fn begin(&self) -> usize {
        self.begin
    }

    #[must_use]
    pub fn end(&self) -> usize {
        self.end
    }

    #[must_use]
    pub fn capacity(&self) -> usize {
        self.cap
    }

    /// Bytes available for the next non-blocking read to be written into,
    /// i.e. `[end, cap)`.
    pub fn spare_mut(&mut self) -> &mut [u8] {
        let end = self.end;
        &mut self.as_mut_slice()[end..]
    }

    /// The unconsumed region `[begin, end)`.
    #[must_use]
    pub fn filled(&self) -> &[u8] {
        &self.as_slice()[self.begin..self.end]
    }

    /// Record that `n` more bytes were written at `end`.
    pub fn advance_end(&mut self, n: usize) {
        self.end += n;
        debug_assert!(self.end <= self.cap);
    }

    /// Record that the data callback consumed `n` bytes from `begin`.
    pub fn consume(&mut self, n: usize) {
        self.begin += n;
        debug_assert!(self.begin <= self.end);
    }

    /// Compact unconsumed bytes to the front when `begin > 0`, and double
    /// capacity (up to `max_cap`) when the buffer is full with nothing
    /// consumed. Returns `true` if the buffer grew.
    pub fn reclaim(&mut self) -> bool {
        if self.begin > 0 {
            let filled_len = self.end - self.begin;
            if filled_len > 0 {
                let base = self.ptr.as_ptr();
                // SAFETY: `base..base+cap` is one live allocation; source
                // and destination ranges both fall within it. `copy`
                // tolerates the overlap between `[begin, end)` and
                // `[0, filled_len)`.
                unsafe {
                    std::ptr::copy(base.add(self.begin), base, filled_len);
                }
            }
            self.end = filled_len;
            self.begin = 0;
        }

        if self.end == self.cap && self.cap < self.max_cap {
            let new_cap = (self.cap * 2).min(self.max_cap);
            self.grow_to(new_cap);
            return true;
        }
        false
    }

    fn grow_to(&mut self, new_cap: usize) {
        let new_ptr = self
            .pool
            .alloc_memory(new_cap)
            .expect("buffer growth allocation must succeed");
        // SAFETY: `new_ptr` is freshly allocated with `new_cap >= self.end`
        // bytes; copying `self.end` live bytes from the old allocation is
        // in-bounds on both sides.
        unsafe {
            std::ptr::copy_nonoverlapping(self.ptr.as_ptr(), new_ptr.as_ptr(), self.end);
        }
        self.pool.free_memory(self.ptr);
        self.ptr = new_ptr;
        self.cap = new_cap;
    }

    fn as_slice(&self) -> &[u8] {
        // SAFETY: `ptr`/`cap` describe a live allocation owned exclusively
        // by this buffer.
        unsafe { slice::from_raw_parts(self.ptr.as_ptr(), self.cap) }
    }

    fn as_mut_slice(&mut self) -> &mut [u8] {
        // SAFETY: see `as_slice`; `&mut self` guarantees exclusive access.
        unsafe { slice::from_raw_parts_mut(self.ptr.as_ptr(), self.cap) }
    }
}

impl Drop for JiukunBuffer {
    fn drop(&mut self) {
        self.pool.free_memory(self.ptr);
    }
}
