//  Copyright 2025 Daxcache Project Authors
//
//  Licensed under the Apache License, Version 2.0 (the "License");
//  you may not use this file except in compliance with the License.
//  You may obtain a copy of the License at
//
//  http://www.apache.org/licenses/LICENSE-2.0
//
//  Unless required by applicable law or agreed to in writing, software
//  distributed under the License is distributed on an "AS IS" BASIS,
//  WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
//  See the License for the specific language governing permissions and
//  limitations under the License.

//! Extent heap: a coalescing linear allocator over the backing region.
//!
//! The heap carves the mapped region into variable-sized extents. Every
//! extent carries an in-band header (size-plus-flag word followed by two
//! link words) and a footer (size-plus-flag copy). The footer lets `free`
//! inspect the immediately preceding extent without a side index, which is
//! what makes neighbor coalescing O(1). Free extents use the link words as
//! a doubly-linked free list; allocated extents use them to chain the
//! extents of one value.
//!
//! In-region layout of one extent of `span` bytes:
//!
//! ```text
//! +------------+--------+--------+--- ... ---+------------+
//! | size|flag  |  prev  |  next  |  payload  | size|flag  |
//! +------------+--------+--------+--- ... ---+------------+
//! 0            8        16       24          span-8
//! ```
//!
//! One guard word below the interior and one above it are pre-marked
//! "allocated" so the merge logic never walks off the region.

use std::{
    ptr::NonNull,
    sync::atomic::{AtomicUsize, Ordering},
};

use parking_lot::Mutex;

use crate::{
    bits,
    error::{Error, Result},
    strict_assert_eq,
};

const WORD: usize = std::mem::size_of::<usize>();
const HEADER_SIZE: usize = 3 * WORD;
const FOOTER_SIZE: usize = WORD;
const HFER_SIZE: usize = HEADER_SIZE + FOOTER_SIZE;

const FLAG_ALLOCATED: usize = 1 << (usize::BITS - 1);
const SIZE_MASK: usize = !FLAG_ALLOCATED;

/// Offset sentinel for "no extent".
const NIL: usize = usize::MAX;

/// Head of an entry's chain of value extents. Offsets index into the backing
/// region; the chain links live inside the extent headers.
pub(crate) struct ExtentChain {
    head: usize,
}

impl Default for ExtentChain {
    fn default() -> Self {
        Self { head: NIL }
    }
}

impl std::fmt::Debug for ExtentChain {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.head == NIL {
            write!(f, "ExtentChain(empty)")
        } else {
            write!(f, "ExtentChain(head: {})", self.head)
        }
    }
}

impl ExtentChain {
    pub(crate) fn is_empty(&self) -> bool {
        self.head == NIL
    }
}

/// A one-extent-sized fragment remembered across the allocation loop of a
/// single value, so an over-granting later iteration can give it back.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct SmallExtent(usize);

struct FreeList {
    head: usize,
    len: usize,
}

pub(crate) struct Heap {
    addr: NonNull<u8>,
    extent_size: usize,
    /// Usable interior, `[lo, hi)`; guard words sit at `lo - WORD` and `hi`.
    lo: usize,
    hi: usize,
    free: Mutex<FreeList>,
    /// Usable (payload) bytes of all allocated extents.
    used: AtomicUsize,
}

// SAFETY: the free list and all structural header words are mutated under
// the heap mutex only; payload bytes belong to exactly one live entry at a
// time, enforced by the entry refcounts.
unsafe impl Send for Heap {}
unsafe impl Sync for Heap {}

impl Heap {
    pub(crate) fn new(addr: NonNull<u8>, size: usize, extent_size: usize) -> Result<Self> {
        let lo = bits::round_up(extent_size, FOOTER_SIZE);
        let hi = size.saturating_sub(FOOTER_SIZE);
        if hi <= lo || hi - lo < extent_size + HFER_SIZE {
            return Err(Error::invalid_argument(format!(
                "pool of {size} bytes cannot hold a single {extent_size}-byte extent"
            )));
        }

        let heap = Self {
            addr,
            extent_size,
            lo,
            hi,
            free: Mutex::new(FreeList { head: NIL, len: 0 }),
            used: AtomicUsize::new(0),
        };

        // Guards, then one free extent spanning the whole interior.
        heap.set_word(lo - WORD, FLAG_ALLOCATED);
        heap.set_word(hi, FLAG_ALLOCATED);
        heap.write_size(lo, hi - lo, false);
        {
            let mut list = heap.free.lock();
            heap.push_free(&mut list, lo);
        }

        Ok(heap)
    }

    /// Append extents to `chain` until at least `wanted` more payload bytes
    /// are covered, or the free list runs dry. Returns the net number of
    /// payload bytes added to the chain; 0 means the caller has to evict
    /// something and retry.
    pub(crate) fn allocate(
        &self,
        wanted: usize,
        chain: &mut ExtentChain,
        small: &mut Option<SmallExtent>,
    ) -> usize {
        debug_assert!(wanted > 0);

        let mut list = self.free.lock();

        let mut remaining = wanted;
        let mut allocated = 0usize;

        while remaining > 0 {
            let Some(e) = self.pop_free(&mut list) else {
                break;
            };

            let mut span = self.span_of(e);
            let want_span = bits::round_up(self.extent_size, remaining) + HFER_SIZE;
            let min_span = self.extent_size + HFER_SIZE;

            if span >= want_span + min_span {
                // Enough left over for at least one more extent: split.
                let rest = e + want_span;
                self.write_size(rest, span - want_span, false);
                self.push_free(&mut list, rest);
                span = want_span;
            }

            self.write_size(e, span, true);
            self.chain_push_front(chain, e);

            let usable = span - HFER_SIZE;
            allocated += usable;

            if usable <= remaining {
                remaining -= usable;
                if usable == self.extent_size {
                    *small = Some(SmallExtent(e));
                }
            } else {
                let overgrant = usable - remaining;
                remaining = 0;
                if overgrant >= self.extent_size {
                    // The over-grant covers the recorded small fragment;
                    // give the fragment back to improve later packing.
                    if let Some(SmallExtent(s)) = small.take() {
                        debug_assert_ne!(s, e);
                        self.chain_unlink(chain, s);
                        allocated -= self.usable_of(s);
                        let span = self.span_of(s);
                        self.merge_and_insert(&mut list, s, span);
                    }
                }
            }
        }

        self.used.fetch_add(allocated, Ordering::Relaxed);
        allocated
    }

    /// Return every extent of `chain` to the free list, coalescing with
    /// adjacent free neighbors. The chain is left empty.
    pub(crate) fn free(&self, chain: &mut ExtentChain) {
        let mut list = self.free.lock();

        let mut freed = 0;
        let mut e = chain.head;
        while e != NIL {
            let next = self.next_of(e);
            let span = self.span_of(e);
            self.verify_extent(e, true);
            freed += span - HFER_SIZE;
            self.merge_and_insert(&mut list, e, span);
            e = next;
        }
        chain.head = NIL;

        self.used.fetch_sub(freed, Ordering::Relaxed);
    }

    /// Copy `value` into the chain, contiguously across extents.
    ///
    /// The chain must cover at least `value.len()` payload bytes. No lock is
    /// taken: the chain belongs exclusively to the caller until the entry is
    /// published.
    pub(crate) fn write_value(&self, chain: &ExtentChain, value: &[u8]) {
        let mut copied = 0;
        let mut e = chain.head;
        while e != NIL && copied < value.len() {
            let n = self.usable_of(e).min(value.len() - copied);
            // SAFETY: the extent payload is owned by this chain and does not
            // overlap `value`.
            unsafe {
                std::ptr::copy_nonoverlapping(value.as_ptr().add(copied), self.payload_ptr(e), n);
            }
            copied += n;
            e = self.next_of(e);
        }
        debug_assert_eq!(copied, value.len());
    }

    /// Copy up to `buf.len()` bytes of the value starting at `offset` into
    /// `buf`. Returns the number of bytes copied, which is
    /// `min(buf.len(), value_size - offset)` (0 when `offset >= value_size`).
    pub(crate) fn read_value(
        &self,
        chain: &ExtentChain,
        value_size: usize,
        offset: usize,
        buf: &mut [u8],
    ) -> usize {
        if offset >= value_size {
            return 0;
        }
        let mut want = buf.len().min(value_size - offset);
        let mut skip = offset;
        let mut copied = 0;

        let mut e = chain.head;
        while e != NIL && want > 0 {
            let usable = self.usable_of(e);
            if skip >= usable {
                skip -= usable;
                e = self.next_of(e);
                continue;
            }
            let n = (usable - skip).min(want);
            // SAFETY: the caller holds a reference on the owning entry, so
            // the payload cannot be recycled while we copy.
            unsafe {
                std::ptr::copy_nonoverlapping(
                    self.payload_ptr(e).add(skip),
                    buf.as_mut_ptr().add(copied),
                    n,
                );
            }
            skip = 0;
            copied += n;
            want -= n;
            e = self.next_of(e);
        }
        copied
    }

    /// Payload bytes currently allocated (the pool-used statistic).
    pub(crate) fn used_bytes(&self) -> usize {
        self.used.load(Ordering::Relaxed)
    }

    /// Number of extents on the free list. A fully drained heap holds
    /// exactly one, spanning the whole interior.
    pub(crate) fn free_extents(&self) -> usize {
        self.free.lock().len
    }

    // ---- word-level access -------------------------------------------------

    fn word(&self, off: usize) -> usize {
        debug_assert!(off + WORD <= self.hi + WORD);
        // SAFETY: `off` stays within the mapping; extents need not be
        // word-aligned for arbitrary extent sizes, hence unaligned reads.
        unsafe { (self.addr.as_ptr().add(off) as *const usize).read_unaligned() }
    }

    fn set_word(&self, off: usize, v: usize) {
        debug_assert!(off + WORD <= self.hi + WORD);
        // SAFETY: as in `word`.
        unsafe { (self.addr.as_ptr().add(off) as *mut usize).write_unaligned(v) }
    }

    fn span_of(&self, e: usize) -> usize {
        self.word(e) & SIZE_MASK
    }

    fn usable_of(&self, e: usize) -> usize {
        self.span_of(e) - HFER_SIZE
    }

    fn prev_of(&self, e: usize) -> usize {
        self.word(e + WORD)
    }

    fn next_of(&self, e: usize) -> usize {
        self.word(e + 2 * WORD)
    }

    fn set_prev(&self, e: usize, v: usize) {
        self.set_word(e + WORD, v);
    }

    fn set_next(&self, e: usize, v: usize) {
        self.set_word(e + 2 * WORD, v);
    }

    fn payload_ptr(&self, e: usize) -> *mut u8 {
        debug_assert!(e + self.span_of(e) <= self.hi);
        // SAFETY: within the mapping.
        unsafe { self.addr.as_ptr().add(e + HEADER_SIZE) }
    }

    /// Stamp header and footer with `span` and the allocated flag.
    fn write_size(&self, e: usize, span: usize, allocated: bool) {
        debug_assert!(span & FLAG_ALLOCATED == 0);
        let v = if allocated { span | FLAG_ALLOCATED } else { span };
        self.set_word(e, v);
        self.set_word(e + span - FOOTER_SIZE, v);
    }

    fn verify_extent(&self, e: usize, allocated: bool) {
        let header = self.word(e);
        let span = header & SIZE_MASK;
        let footer = self.word(e + span - FOOTER_SIZE);
        strict_assert_eq!(header, footer, "extent header/footer mismatch at {e}");
        strict_assert_eq!(
            header & FLAG_ALLOCATED != 0,
            allocated,
            "extent allocation flag mismatch at {e}"
        );
    }

    // ---- free list ---------------------------------------------------------

    fn push_free(&self, list: &mut FreeList, e: usize) {
        self.set_prev(e, NIL);
        self.set_next(e, list.head);
        if list.head != NIL {
            self.set_prev(list.head, e);
        }
        list.head = e;
        list.len += 1;
    }

    fn pop_free(&self, list: &mut FreeList) -> Option<usize> {
        if list.head == NIL {
            return None;
        }
        let e = list.head;
        self.verify_extent(e, false);
        let next = self.next_of(e);
        if next != NIL {
            self.set_prev(next, NIL);
        }
        list.head = next;
        list.len -= 1;
        Some(e)
    }

    fn unlink_free(&self, list: &mut FreeList, e: usize) {
        let prev = self.prev_of(e);
        let next = self.next_of(e);
        if prev != NIL {
            self.set_next(prev, next);
        } else {
            debug_assert_eq!(list.head, e);
            list.head = next;
        }
        if next != NIL {
            self.set_prev(next, prev);
        }
        list.len -= 1;
    }

    /// Absorb free neighbors on both sides of `[e, e + span)` and put the
    /// merged range at the head of the free list.
    fn merge_and_insert(&self, list: &mut FreeList, mut e: usize, mut span: usize) {
        // The word right below the header is the previous extent's footer,
        // or the low guard.
        let prev_footer = self.word(e - WORD);
        if prev_footer & FLAG_ALLOCATED == 0 {
            let prev = e - prev_footer;
            self.unlink_free(list, prev);
            e = prev;
            span += prev_footer;
        }

        // The word right past the footer is the next extent's header, or the
        // high guard.
        let next_header = self.word(e + span);
        if next_header & FLAG_ALLOCATED == 0 {
            self.unlink_free(list, e + span);
            span += next_header;
        }

        self.write_size(e, span, false);
        self.push_free(list, e);
    }

    // ---- value chains ------------------------------------------------------

    fn chain_push_front(&self, chain: &mut ExtentChain, e: usize) {
        self.set_prev(e, NIL);
        self.set_next(e, chain.head);
        if chain.head != NIL {
            self.set_prev(chain.head, e);
        }
        chain.head = e;
    }

    fn chain_unlink(&self, chain: &mut ExtentChain, e: usize) {
        let prev = self.prev_of(e);
        let next = self.next_of(e);
        if prev != NIL {
            self.set_next(prev, next);
        } else {
            debug_assert_eq!(chain.head, e);
            chain.head = next;
        }
        if next != NIL {
            self.set_prev(next, prev);
        }
    }

    #[cfg(test)]
    fn chain_len(&self, chain: &ExtentChain) -> usize {
        let mut n = 0;
        let mut e = chain.head;
        while e != NIL {
            n += 1;
            e = self.next_of(e);
        }
        n
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const EXTENT: usize = 256;

    struct TestRegion {
        _mem: Box<[u8]>,
        heap: Heap,
    }

    fn region(size: usize) -> TestRegion {
        let mut mem = vec![0u8; size].into_boxed_slice();
        let addr = NonNull::new(mem.as_mut_ptr()).unwrap();
        let heap = Heap::new(addr, size, EXTENT).unwrap();
        TestRegion { _mem: mem, heap }
    }

    fn alloc_all(heap: &Heap, wanted: usize) -> ExtentChain {
        let mut chain = ExtentChain::default();
        let mut small = None;
        let mut covered = 0;
        while covered < wanted {
            let n = heap.allocate(wanted - covered, &mut chain, &mut small);
            assert_ne!(n, 0, "heap exhausted while covering {wanted}");
            covered += n;
        }
        chain
    }

    #[test]
    fn test_initial_state() {
        let r = region(64 << 10);
        assert_eq!(r.heap.free_extents(), 1);
        assert_eq!(r.heap.used_bytes(), 0);
    }

    #[test]
    fn test_too_small_region() {
        let mut mem = vec![0u8; 300].into_boxed_slice();
        let addr = NonNull::new(mem.as_mut_ptr()).unwrap();
        assert!(Heap::new(addr, 300, EXTENT).is_err());
    }

    #[test]
    fn test_allocate_free_round_trip() {
        let r = region(64 << 10);

        let mut chain = alloc_all(&r.heap, 1000);
        assert_eq!(r.heap.used_bytes(), bits::round_up(EXTENT, 1000));
        assert_eq!(r.heap.chain_len(&chain), 1);

        r.heap.free(&mut chain);
        assert!(chain.is_empty());
        assert_eq!(r.heap.used_bytes(), 0);
        assert_eq!(r.heap.free_extents(), 1);
    }

    #[test]
    fn test_value_round_trip() {
        let r = region(64 << 10);

        let value: Vec<u8> = (0..5000).map(|i| (i % 251) as u8).collect();
        let mut chain = alloc_all(&r.heap, value.len());
        r.heap.write_value(&chain, &value);

        let mut buf = vec![0u8; value.len()];
        let n = r.heap.read_value(&chain, value.len(), 0, &mut buf);
        assert_eq!(n, value.len());
        assert_eq!(buf, value);

        // Sliced reads at every alignment-odd offset.
        for offset in [0usize, 1, 255, 256, 257, 4999, 5000, 6000] {
            let mut buf = vec![0u8; 512];
            let n = r.heap.read_value(&chain, value.len(), offset, &mut buf);
            let expected = 512.min(value.len().saturating_sub(offset));
            assert_eq!(n, expected);
            assert_eq!(&buf[..n], &value[offset..offset + n]);
        }

        r.heap.free(&mut chain);
    }

    #[test]
    fn test_chained_allocation_from_fragments() {
        let r = region(64 << 10);

        // Punch two holes of different sizes, separated by live allocations.
        let mut a = alloc_all(&r.heap, 256);
        let _b = alloc_all(&r.heap, 256);
        let mut c = alloc_all(&r.heap, 512);
        let _d = alloc_all(&r.heap, 256);
        r.heap.free(&mut a);
        r.heap.free(&mut c);
        assert_eq!(r.heap.free_extents(), 3);

        // Neither hole alone covers the request, so the allocation chains.
        let value: Vec<u8> = (0..700).map(|i| (i * 7 % 256) as u8).collect();
        let mut chain = alloc_all(&r.heap, value.len());
        assert!(r.heap.chain_len(&chain) >= 2);

        r.heap.write_value(&chain, &value);
        let mut buf = vec![0u8; value.len()];
        assert_eq!(r.heap.read_value(&chain, value.len(), 0, &mut buf), value.len());
        assert_eq!(buf, value);

        r.heap.free(&mut chain);
    }

    #[test]
    fn test_coalescing_restores_single_extent() {
        let r = region(64 << 10);

        let mut chains: Vec<_> = (0..16).map(|i| alloc_all(&r.heap, 100 + i * 50)).collect();
        // Free in an interleaved order to exercise both merge directions.
        for i in (0..16).step_by(2) {
            r.heap.free(&mut chains[i]);
        }
        for i in (1..16).step_by(2) {
            r.heap.free(&mut chains[i]);
        }

        assert_eq!(r.heap.used_bytes(), 0);
        assert_eq!(r.heap.free_extents(), 1);
    }

    #[test]
    fn test_small_extent_heuristic() {
        let r = region(64 << 10);

        // Layout: A(256) B(256) C(512) D(256), then free C and A so the free
        // list is [A(256-usable), C(512-usable), remainder].
        let mut a = alloc_all(&r.heap, 256);
        let _b = alloc_all(&r.heap, 256);
        let mut c = alloc_all(&r.heap, 512);
        let _d = alloc_all(&r.heap, 256);
        r.heap.free(&mut c);
        r.heap.free(&mut a);
        assert_eq!(r.heap.free_extents(), 3);

        // First iteration grabs the one-extent fragment A and records it;
        // the second grabs C whole (too small to split for the 44-byte
        // remainder) and over-grants by more than one extent, so A goes
        // back to the free list.
        let mut chain = ExtentChain::default();
        let mut small = None;
        let n = r.heap.allocate(300, &mut chain, &mut small);
        assert_eq!(n, 512);
        assert!(small.is_none());
        assert_eq!(r.heap.chain_len(&chain), 1);
        assert_eq!(r.heap.free_extents(), 2);

        r.heap.free(&mut chain);
    }
}
