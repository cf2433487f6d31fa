//! Byte Rings
//!
//! This is a specialized single-producer, single-consumer circular byte
//! buffer. It is optimized and opinionated for the following cases:
//!
//! * Use where one role (an application task) queues length-prefixed
//!   messages, and another role (a transport tick, possibly running in an
//!   interrupt) drains them
//! * Use in cases where the target may not have CAS atomics, so only
//!   `load` and `store` are used for synchronization
//!
//! The write index is ONLY ever stored by the [Producer], and the read
//! index is ONLY ever stored by the [Consumer]. One byte of capacity is
//! always left unused, so `wind == rind` unambiguously means "empty".
//!
//! Messages stored in a ring use the same framing as the drop payload
//! stream: `[len][tag][body...]`, where `len` counts the tag byte plus the
//! body. A `len` of zero never appears in a ring.

use core::{
    cell::UnsafeCell,
    ptr,
    sync::atomic::{AtomicBool, AtomicUsize, Ordering},
};

/// Bytes of framing in front of every message body: length and tag
pub const MSG_HEADER: usize = 2;

/// Largest body that can be described by a one byte length prefix
pub const MAX_MSG_BODY: usize = u8::MAX as usize - 1;

/// Storage for a ring of exactly `N` bytes
///
/// `N` must be a power of two, which is checked when the ring is created.
pub struct ByteRing<const N: usize> {
    buf: UnsafeCell<[u8; N]>,
    wind: AtomicUsize,
    rind: AtomicUsize,
    once: AtomicBool,
}

// SAFETY: the producer and consumer handles only ever touch disjoint regions
// of `buf`, and hand over ownership of a region with a Release store of their
// own index, observed with an Acquire load by the other side.
unsafe impl<const N: usize> Sync for ByteRing<N> {}

impl<const N: usize> ByteRing<N> {
    const MASK: usize = {
        assert!(N.is_power_of_two(), "ring capacity must be a power of two");
        assert!(N >= 4, "ring capacity is too small");
        N - 1
    };

    /// Create a new, empty ring
    ///
    /// Intended for static usage.
    pub const fn new() -> Self {
        let _ = Self::MASK;
        Self {
            buf: UnsafeCell::new([0u8; N]),
            wind: AtomicUsize::new(0),
            rind: AtomicUsize::new(0),
            once: AtomicBool::new(false),
        }
    }

    /// Attempt to take the producer and consumer halves of a static ring
    ///
    /// The first call will return Some, all later calls will return None.
    /// Uses a [critical section][critical_section::with] to ensure it only
    /// works once, even on targets without atomics.
    pub fn take(&'static self) -> Option<(Producer<'static, N>, Consumer<'static, N>)> {
        critical_section::with(|_| {
            let old = self.once.load(Ordering::Acquire);
            self.once.store(true, Ordering::Release);
            !old
        })
        .then(|| self.halves())
    }

    /// Split an exclusively borrowed ring into its two halves
    pub fn split(&mut self) -> (Producer<'_, N>, Consumer<'_, N>) {
        self.halves()
    }

    /// Discard all contents
    pub fn reset(&mut self) {
        self.wind.store(0, Ordering::Relaxed);
        self.rind.store(0, Ordering::Relaxed);
    }

    /// Number of bytes currently queued
    pub fn used(&self) -> usize {
        let wind = self.wind.load(Ordering::Acquire);
        let rind = self.rind.load(Ordering::Acquire);
        wind.wrapping_sub(rind) & Self::MASK
    }

    /// Usable capacity, which is one less than the storage size
    pub const fn capacity(&self) -> usize {
        N - 1
    }

    fn halves(&self) -> (Producer<'_, N>, Consumer<'_, N>) {
        (Producer { ring: self }, Consumer { ring: self })
    }

    /// Copies `data` into the ring starting at `at`, wrapping as needed.
    ///
    /// ## Safety
    ///
    /// The caller must own the `data.len()` bytes starting at `at`.
    unsafe fn copy_in(&self, at: usize, data: &[u8]) {
        let base: *mut u8 = self.buf.get().cast();
        let first = (N - at).min(data.len());
        ptr::copy_nonoverlapping(data.as_ptr(), base.add(at), first);
        ptr::copy_nonoverlapping(data.as_ptr().add(first), base, data.len() - first);
    }

    /// Copies `dst.len()` bytes out of the ring starting at `at`.
    ///
    /// ## Safety
    ///
    /// The caller must own the `dst.len()` bytes starting at `at`.
    unsafe fn copy_out(&self, at: usize, dst: &mut [u8]) {
        let base: *const u8 = self.buf.get().cast();
        let first = (N - at).min(dst.len());
        ptr::copy_nonoverlapping(base.add(at), dst.as_mut_ptr(), first);
        ptr::copy_nonoverlapping(base, dst.as_mut_ptr().add(first), dst.len() - first);
    }
}

impl<const N: usize> Default for ByteRing<N> {
    fn default() -> Self {
        Self::new()
    }
}

/// The writing half of a [ByteRing]
pub struct Producer<'a, const N: usize> {
    ring: &'a ByteRing<N>,
}

impl<const N: usize> Producer<'_, N> {
    /// Bytes that can currently be written
    pub fn free(&self) -> usize {
        N - 1 - self.ring.used()
    }

    /// Write all `parts` as one unit
    ///
    /// Either every part is written and published with a single store of
    /// the write index, or nothing is written and `false` is returned.
    pub fn push_parts(&mut self, parts: &[&[u8]]) -> bool {
        let total: usize = parts.iter().map(|p| p.len()).sum();
        if total > self.free() {
            return false;
        }
        let mut wind = self.ring.wind.load(Ordering::Relaxed);
        for part in parts {
            // SAFETY: `total <= free`, so every byte from wind up to
            // wind + total belongs to the producer until published.
            unsafe { self.ring.copy_in(wind, part) };
            wind = (wind + part.len()) & ByteRing::<N>::MASK;
        }
        self.ring.wind.store(wind, Ordering::Release);
        true
    }

    /// Queue a framed message: `[len][tag][body...]`
    pub fn push_message(&mut self, tag: u8, body: &[u8]) -> bool {
        if body.len() > MAX_MSG_BODY {
            return false;
        }
        let hdr = [(body.len() + 1) as u8, tag];
        self.push_parts(&[&hdr, body])
    }
}

/// The reading half of a [ByteRing]
pub struct Consumer<'a, const N: usize> {
    ring: &'a ByteRing<N>,
}

impl<const N: usize> Consumer<'_, N> {
    /// Bytes that are currently readable
    pub fn used(&self) -> usize {
        self.ring.used()
    }

    /// Is the ring empty?
    pub fn is_empty(&self) -> bool {
        self.used() == 0
    }

    /// Look at a single byte `offset` bytes past the read index
    pub fn peek(&self, offset: usize) -> Option<u8> {
        let mut b = [0u8; 1];
        self.peek_into(offset, &mut b).then_some(b[0])
    }

    /// Copy bytes starting `offset` bytes past the read index, without
    /// consuming them
    pub fn peek_into(&self, offset: usize, dst: &mut [u8]) -> bool {
        if offset + dst.len() > self.used() {
            return false;
        }
        let rind = self.ring.rind.load(Ordering::Relaxed);
        // SAFETY: the range lies within the published, unconsumed region,
        // which the producer will not touch until we advance rind.
        unsafe {
            self.ring
                .copy_out((rind + offset) & ByteRing::<N>::MASK, dst)
        };
        true
    }

    /// Release `n` bytes back to the producer
    ///
    /// Consumes at most everything currently readable.
    pub fn consume(&mut self, n: usize) {
        let n = n.min(self.used());
        let rind = self.ring.rind.load(Ordering::Relaxed);
        self.ring
            .rind
            .store((rind + n) & ByteRing::<N>::MASK, Ordering::Release);
    }

    /// Header of the next framed message, as `(tag, body_len)`
    ///
    /// Returns None if no complete message is readable.
    pub fn peek_message(&self) -> Option<(u8, usize)> {
        let mut hdr = [0u8; MSG_HEADER];
        if !self.peek_into(0, &mut hdr) || hdr[0] == 0 {
            return None;
        }
        let body_len = hdr[0] as usize - 1;
        (self.used() >= MSG_HEADER + body_len).then_some((hdr[1], body_len))
    }

    /// Copy the next message's body into `dst` and consume it
    ///
    /// Returns the tag and body length, or None if there is no complete
    /// message or it does not fit `dst`. A message that does not fit is
    /// left in place.
    pub fn pop_message(&mut self, dst: &mut [u8]) -> Option<(u8, usize)> {
        let (tag, len) = self.peek_message()?;
        let dst = dst.get_mut(..len)?;
        self.peek_into(MSG_HEADER, dst);
        self.consume(MSG_HEADER + len);
        Some((tag, len))
    }

    /// Drop the next message without reading its body
    ///
    /// Returns the number of ring bytes released.
    pub fn skip_message(&mut self) -> usize {
        match self.peek_message() {
            Some((_tag, len)) => {
                self.consume(MSG_HEADER + len);
                MSG_HEADER + len
            }
            None => 0,
        }
    }
}
