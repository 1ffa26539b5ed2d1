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

//! Cache entry and its concurrency state.
//!
//! An entry is shared between the index, the replacement policy and any
//! number of in-flight `get`s. Lifetime is governed by an atomic refcount;
//! the "evicting" flag is a CAS gate electing the single thread that runs
//! the eviction steps for the entry.

use std::sync::atomic::{fence, AtomicBool, AtomicPtr, AtomicU64, Ordering};

use crate::{eviction::lru::LruNode, heap::ExtentChain, strict_assert_eq, strict_assert_ne};

pub(crate) struct CacheEntry {
    /// Number of live references: one for the index while the entry is
    /// indexed, one for the replacement policy, one per in-flight user.
    refcount: AtomicU64,
    /// 0/1 gate; the thread that flips it owns the destruction path.
    evicting: AtomicBool,
    /// Back-pointer into the policy: the address of this entry's node in the
    /// LRU list, or null. CAS on this slot is how `use` and `evict`
    /// serialize on the same entry.
    policy_slot: AtomicPtr<LruNode>,
    value_size: usize,
    extents: ExtentChain,
    key: Box<[u8]>,
}

impl CacheEntry {
    pub(crate) fn new(key: &[u8], value_size: usize, extents: ExtentChain) -> Self {
        Self {
            refcount: AtomicU64::new(0),
            evicting: AtomicBool::new(false),
            policy_slot: AtomicPtr::new(std::ptr::null_mut()),
            value_size,
            extents,
            key: key.into(),
        }
    }

    pub(crate) fn key(&self) -> &[u8] {
        &self.key
    }

    pub(crate) fn value_size(&self) -> usize {
        self.value_size
    }

    pub(crate) fn extents(&self) -> &ExtentChain {
        &self.extents
    }

    pub(crate) fn extents_mut(&mut self) -> &mut ExtentChain {
        &mut self.extents
    }

    pub(crate) fn policy_slot(&self) -> &AtomicPtr<LruNode> {
        &self.policy_slot
    }

    /// DRAM charged to this entry, mirrored into the DRAM-used statistic.
    pub(crate) fn dram_weight(&self) -> usize {
        std::mem::size_of::<Self>() + self.key.len()
    }

    /// Publish the first (indexed) reference. Called under the shard write
    /// lock right after the entry becomes reachable from the index.
    pub(crate) fn make_indexed(&self) {
        let prev = self.refcount.swap(1, Ordering::Release);
        strict_assert_eq!(prev, 0, "entry indexed twice");
    }

    /// Take an additional reference. The caller must already hold one live
    /// reference (it just found the entry in the index or the policy under a
    /// lock); observing a zero refcount here is a use-after-free.
    pub(crate) fn acquire(&self) {
        let prev = self.refcount.fetch_add(1, Ordering::Relaxed);
        strict_assert_ne!(prev, 0, "acquire of an expired entry");
    }

    /// Drop a reference. Returns `true` when the caller held the last one;
    /// the entry has then logically expired and the caller owns its
    /// destruction (returning the extent chain to the heap and freeing the
    /// entry memory).
    pub(crate) fn release(&self) -> bool {
        let prev = self.refcount.fetch_sub(1, Ordering::Release);
        strict_assert_ne!(prev, 0, "refcount underflow");
        if prev == 1 {
            // Pairs with the Release above: the freeing thread must observe
            // every store made while the entry was shared.
            fence(Ordering::Acquire);
            true
        } else {
            false
        }
    }

    /// Try to become the unique evictor of this entry.
    pub(crate) fn try_begin_evict(&self) -> bool {
        self.evicting
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Relaxed)
            .is_ok()
    }

    #[cfg(test)]
    pub(crate) fn refs(&self) -> u64 {
        self.refcount.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry() -> CacheEntry {
        CacheEntry::new(b"key", 0, ExtentChain::default())
    }

    #[test]
    fn test_refcount() {
        let e = entry();
        e.make_indexed();
        e.acquire();
        assert_eq!(e.refs(), 2);
        assert!(!e.release());
        assert!(e.release());
    }

    #[test]
    fn test_begin_evict_is_exclusive() {
        let e = entry();
        assert!(e.try_begin_evict());
        assert!(!e.try_begin_evict());
    }

    #[test]
    #[should_panic(expected = "acquire of an expired entry")]
    fn test_acquire_expired() {
        entry().acquire();
    }
}
