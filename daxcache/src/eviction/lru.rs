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

//! Approximate LRU.
//!
//! A mutex-guarded doubly-linked recency list (head = least recently used)
//! plus a fixed-capacity lock-free promotion ring. A read does not touch the
//! list lock: it locks the entry's node out of concurrent use/evict by
//! nulling the entry's policy slot with a CAS and enqueues the node on the
//! ring; whoever next drains the ring applies the deferred tail moves in
//! drain order and re-publishes the slots.
//!
//! A node stays linked in the list while it sits in the ring; ring
//! membership only means "slot is null, a promotion is pending". An entry
//! leaves the list exclusively through the thread that won its begin-evict
//! gate, which is what keeps the slot-retry loops here finite.

use std::{
    ptr::NonNull,
    sync::atomic::Ordering,
};

use crossbeam::queue::ArrayQueue;
use parking_lot::Mutex;

use crate::{
    entry::CacheEntry,
    error::{Error, Result},
    strict_assert,
};

/// Promotion ring capacity.
const RING_CAPACITY: usize = 1 << 12;

pub(crate) struct LruNode {
    entry: NonNull<CacheEntry>,
    prev: *mut LruNode,
    next: *mut LruNode,
}

struct NodePtr(*mut LruNode);

// SAFETY: nodes are plain heap allocations whose linkage is only mutated
// under the list mutex; the ring merely carries the pointers between
// threads.
unsafe impl Send for NodePtr {}
unsafe impl Sync for NodePtr {}

struct LruList {
    head: *mut LruNode,
    tail: *mut LruNode,
}

// SAFETY: see `NodePtr`.
unsafe impl Send for LruList {}

impl LruList {
    /// Append at the most-recently-used end.
    ///
    /// # Safety
    ///
    /// `node` must be valid and unlinked.
    unsafe fn push_tail(&mut self, node: *mut LruNode) {
        unsafe {
            (*node).prev = self.tail;
            (*node).next = std::ptr::null_mut();
            if self.tail.is_null() {
                self.head = node;
            } else {
                (*self.tail).next = node;
            }
            self.tail = node;
        }
    }

    /// # Safety
    ///
    /// `node` must be linked in this list.
    unsafe fn unlink(&mut self, node: *mut LruNode) {
        unsafe {
            let prev = (*node).prev;
            let next = (*node).next;
            if prev.is_null() {
                self.head = next;
            } else {
                (*prev).next = next;
            }
            if next.is_null() {
                self.tail = prev;
            } else {
                (*next).prev = prev;
            }
        }
    }
}

pub(crate) struct LruEviction {
    list: Mutex<LruList>,
    ring: ArrayQueue<NodePtr>,
}

impl LruEviction {
    pub(crate) fn new() -> Self {
        Self {
            list: Mutex::new(LruList {
                head: std::ptr::null_mut(),
                tail: std::ptr::null_mut(),
            }),
            ring: ArrayQueue::new(RING_CAPACITY),
        }
    }

    pub(crate) fn insert(&self, ptr: NonNull<CacheEntry>) {
        let node = Box::into_raw(Box::new(LruNode {
            entry: ptr,
            prev: std::ptr::null_mut(),
            next: std::ptr::null_mut(),
        }));

        // SAFETY: the entry was just indexed and is alive.
        let entry = unsafe { ptr.as_ref() };

        let mut list = self.list.lock();
        entry.acquire();
        // SAFETY: freshly allocated node, not linked anywhere.
        unsafe { list.push_tail(node) };
        // Publish the slot only after the node is linked, so an evictor that
        // wins the slot always finds a linked node.
        let prev = entry.policy_slot().swap(node, Ordering::Release);
        strict_assert!(prev.is_null(), "policy slot initialized twice");
    }

    pub(crate) fn touch(&self, entry: &CacheEntry) {
        let node = entry.policy_slot().load(Ordering::Acquire);
        if node.is_null() {
            return;
        }
        // Lock the node out of concurrent use and eviction. Losing the race
        // means someone else is already promoting or evicting it.
        if entry
            .policy_slot()
            .compare_exchange(node, std::ptr::null_mut(), Ordering::AcqRel, Ordering::Relaxed)
            .is_err()
        {
            return;
        }

        let mut item = NodePtr(node);
        while let Err(rejected) = self.ring.push(item) {
            item = rejected;
            let mut list = self.list.lock();
            self.drain_ring(&mut list);
        }
    }

    pub(crate) fn evict_lru(&self) -> Result<NonNull<CacheEntry>> {
        let mut list = self.list.lock();

        // Walk candidates from the LRU end. A candidate whose slot is
        // parked in the ring triggers one drain, after which the walk
        // restarts from the (then current) head so pending promotions are
        // honored before a victim is picked.
        let mut drained = false;
        let mut cand = list.head;
        while !cand.is_null() {
            let node = cand;
            // SAFETY: nodes are only freed under this lock, which we hold.
            let next = unsafe { (*node).next };
            let ptr = unsafe { (*node).entry };
            let entry = unsafe { ptr.as_ref() };

            let slot = entry.policy_slot();
            if slot
                .compare_exchange(node, std::ptr::null_mut(), Ordering::AcqRel, Ordering::Relaxed)
                .is_ok()
            {
                if entry.try_begin_evict() {
                    // SAFETY: the node is linked and now exclusively ours.
                    unsafe {
                        list.unlink(node);
                        drop(Box::from_raw(node));
                    }
                    return Ok(ptr);
                }
                // Another thread is running this entry's eviction; hand
                // the slot back and move on.
                slot.store(node, Ordering::Release);
            } else if !drained {
                drained = true;
                self.drain_ring(&mut list);
                cand = list.head;
                continue;
            }
            cand = next;
        }

        // Every listed candidate is locked or mid-eviction. Last chance:
        // pull promotion hints straight out of the ring.
        for _ in 0..RING_CAPACITY {
            let Some(NodePtr(node)) = self.ring.pop() else {
                break;
            };
            // SAFETY: ring nodes are linked list members with a null slot.
            let ptr = unsafe { (*node).entry };
            let entry = unsafe { ptr.as_ref() };
            if entry.try_begin_evict() {
                unsafe {
                    list.unlink(node);
                    drop(Box::from_raw(node));
                }
                return Ok(ptr);
            }
            unsafe {
                list.unlink(node);
                list.push_tail(node);
            }
            entry.policy_slot().store(node, Ordering::Release);
        }

        Err(Error::NoEvictableEntry)
    }

    /// Detach the node of an entry whose begin-evict gate the caller holds.
    /// Spins until the node can be locked: the only contenders are pending
    /// promotions, which drains resolve, and a `touch` between its CAS and
    /// its ring push, which is a few instructions long.
    pub(crate) fn remove(&self, entry: &CacheEntry) -> bool {
        loop {
            {
                let mut list = self.list.lock();
                for _ in 0..2 {
                    let node = entry.policy_slot().load(Ordering::Acquire);
                    if !node.is_null()
                        && entry
                            .policy_slot()
                            .compare_exchange(
                                node,
                                std::ptr::null_mut(),
                                Ordering::AcqRel,
                                Ordering::Relaxed,
                            )
                            .is_ok()
                    {
                        // SAFETY: slot won under the list lock; the node is
                        // linked.
                        unsafe {
                            list.unlink(node);
                            drop(Box::from_raw(node));
                        }
                        return true;
                    }
                    self.drain_ring(&mut list);
                }
            }
            std::thread::yield_now();
        }
    }

    /// Apply pending promotions: move each ringed node to the tail in drain
    /// order and re-publish its slot. Bounded, because other threads keep
    /// enqueueing while we drain.
    fn drain_ring(&self, list: &mut LruList) {
        for _ in 0..RING_CAPACITY {
            let Some(NodePtr(node)) = self.ring.pop() else {
                break;
            };
            // SAFETY: ring nodes are linked; we hold the list lock.
            unsafe {
                list.unlink(node);
                list.push_tail(node);
                (*node).entry.as_ref().policy_slot().store(node, Ordering::Release);
            }
        }
    }
}

impl Drop for LruEviction {
    fn drop(&mut self) {
        // Ring members are list members too; discarding the hints leaves
        // every node reachable from the list.
        while self.ring.pop().is_some() {}

        let list = self.list.get_mut();
        let mut cur = list.head;
        while !cur.is_null() {
            // SAFETY: exclusive access during drop.
            unsafe {
                let next = (*cur).next;
                drop(Box::from_raw(cur));
                cur = next;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::heap::ExtentChain;

    fn leak_entry(key: &[u8]) -> NonNull<CacheEntry> {
        let e = CacheEntry::new(key, 0, ExtentChain::default());
        let ptr = NonNull::from(Box::leak(Box::new(e)));
        // Simulate the indexed reference so the policy can acquire.
        unsafe { ptr.as_ref() }.make_indexed();
        ptr
    }

    fn free_entry(ptr: NonNull<CacheEntry>) {
        // SAFETY: test-owned pointer created by `leak_entry`.
        unsafe { drop(Box::from_raw(ptr.as_ptr())) };
    }

    /// Wrapper letting a slice of leaked test pointers cross the thread
    /// boundary in `std::thread::scope` closures below.
    ///
    /// SAFETY: the pointers are only ever dereferenced through
    /// `CacheEntry`'s own synchronized API, which is what these tests are
    /// exercising concurrently.
    #[derive(Clone, Copy)]
    struct SyncPtrs<'a>(&'a [NonNull<CacheEntry>]);
    unsafe impl Send for SyncPtrs<'_> {}
    unsafe impl Sync for SyncPtrs<'_> {}
    impl std::ops::Deref for SyncPtrs<'_> {
        type Target = [NonNull<CacheEntry>];
        fn deref(&self) -> &Self::Target {
            self.0
        }
    }

    fn evict_key(lru: &LruEviction) -> Vec<u8> {
        let victim = lru.evict_lru().unwrap();
        let key = unsafe { victim.as_ref() }.key().to_vec();
        // Drop the policy reference that was transferred to us.
        unsafe { victim.as_ref() }.release();
        key
    }

    #[test]
    fn test_lru_order() {
        let lru = LruEviction::new();
        let ptrs: Vec<_> = (0..4u8).map(|i| leak_entry(&[i])).collect();
        for ptr in &ptrs {
            lru.insert(*ptr);
        }

        assert_eq!(evict_key(&lru), vec![0]);
        assert_eq!(evict_key(&lru), vec![1]);

        // Touch 2 so 3 becomes the least recently used.
        lru.touch(unsafe { ptrs[2].as_ref() });
        assert_eq!(evict_key(&lru), vec![3]);
        assert_eq!(evict_key(&lru), vec![2]);

        assert!(matches!(lru.evict_lru(), Err(Error::NoEvictableEntry)));

        for ptr in ptrs {
            free_entry(ptr);
        }
    }

    #[test]
    fn test_remove_by_entry() {
        let lru = LruEviction::new();
        let ptrs: Vec<_> = (0..3u8).map(|i| leak_entry(&[i])).collect();
        for ptr in &ptrs {
            lru.insert(*ptr);
        }

        let target = unsafe { ptrs[1].as_ref() };
        assert!(target.try_begin_evict());
        assert!(lru.remove(target));
        target.release();

        assert_eq!(evict_key(&lru), vec![0]);
        assert_eq!(evict_key(&lru), vec![2]);

        for ptr in ptrs {
            free_entry(ptr);
        }
    }

    #[test]
    fn test_touch_survives_ring_pressure() {
        // More distinct promotions than the ring holds, so the full-ring
        // drain path in `touch` has to run.
        let count = RING_CAPACITY + 8;
        let lru = LruEviction::new();
        let ptrs: Vec<_> = (0..count)
            .map(|i| leak_entry(&(i as u32).to_le_bytes()))
            .collect();
        for ptr in &ptrs {
            lru.insert(*ptr);
        }
        for ptr in &ptrs {
            lru.touch(unsafe { ptr.as_ref() });
        }

        let mut evicted = 0;
        while lru.evict_lru().map(|v| unsafe { v.as_ref() }.release()).is_ok() {
            evicted += 1;
        }
        assert_eq!(evicted, count);

        for ptr in ptrs {
            free_entry(ptr);
        }
    }

    #[test]
    fn test_remove_races_touch() {
        // Keyed removal must converge even while another thread keeps
        // parking the node in the ring.
        let lru = LruEviction::new();
        let ptrs: Vec<_> = (0..8u8).map(|i| leak_entry(&[i])).collect();
        for ptr in &ptrs {
            lru.insert(*ptr);
        }

        std::thread::scope(|s| {
            let lru = &lru;
            let ptrs = SyncPtrs(&ptrs);
            s.spawn(move || {
                for i in 0..50_000usize {
                    lru.touch(unsafe { ptrs[i % ptrs.len()].as_ref() });
                }
            });
            s.spawn(move || {
                for ptr in ptrs.iter() {
                    let entry = unsafe { ptr.as_ref() };
                    assert!(entry.try_begin_evict());
                    assert!(lru.remove(entry));
                    entry.release();
                }
            });
        });

        assert!(matches!(lru.evict_lru(), Err(Error::NoEvictableEntry)));

        for ptr in ptrs {
            free_entry(ptr);
        }
    }

    #[test]
    fn test_concurrent_touch_and_evict() {
        let lru = LruEviction::new();
        let ptrs: Vec<_> = (0..64u8).map(|i| leak_entry(&[i])).collect();
        for ptr in &ptrs {
            lru.insert(*ptr);
        }

        std::thread::scope(|s| {
            let lru = &lru;
            let ptrs = SyncPtrs(&ptrs);
            for t in 0..4usize {
                s.spawn(move || {
                    for i in 0..10_000usize {
                        let ptr = ptrs[(i * 7 + t) % ptrs.len()];
                        lru.touch(unsafe { ptr.as_ref() });
                    }
                });
            }
            s.spawn(move || {
                for _ in 0..16 {
                    let victim = lru.evict_lru().unwrap();
                    unsafe { victim.as_ref() }.release();
                }
            });
        });

        // 16 evicted, 48 still governed by the policy.
        let mut left = 0;
        while lru.evict_lru().is_ok() {
            left += 1;
        }
        assert_eq!(left, 48);

        for ptr in ptrs {
            free_entry(ptr);
        }
    }
}
