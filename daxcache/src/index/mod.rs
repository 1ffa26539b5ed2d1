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

//! Sharded key→entry index.
//!
//! Keys are hashed into one of 256 critnib shards, each guarded by its own
//! two-tier reader/writer lock. `DAXCACHE_SHARDING=0` collapses the index to
//! a single shard for test determinism.

mod critnib;
mod xlock;

use std::{hash::BuildHasher, ptr::NonNull};

use crate::{
    entry::CacheEntry,
    error::Result,
    metrics::ShardMetrics,
};

use self::{
    critnib::{Critnib, FramedKey},
    xlock::XLock,
};

/// Number of shards; must be a power of two.
const NSHARDS: usize = 256;

const SHARDING_ENV: &str = "DAXCACHE_SHARDING";

struct Shard {
    tree: XLock<Critnib>,
    metrics: ShardMetrics,
}

pub(crate) struct Index {
    shards: Box<[Shard]>,
    hash_builder: ahash::RandomState,
}

impl Index {
    pub(crate) fn new() -> Self {
        let sharding = std::env::var(SHARDING_ENV)
            .map(|v| v != "0")
            .unwrap_or(true);
        let n = if sharding { NSHARDS } else { 1 };
        if !sharding {
            tracing::debug!("index sharding disabled via {SHARDING_ENV}");
        }

        let shards = (0..n)
            .map(|_| Shard {
                tree: XLock::new(Critnib::default()),
                metrics: ShardMetrics::default(),
            })
            .collect();

        Self {
            shards,
            hash_builder: ahash::RandomState::new(),
        }
    }

    fn shard(&self, key: &[u8]) -> &Shard {
        let hash = self.hash_builder.hash_one(key);
        &self.shards[hash as usize & (self.shards.len() - 1)]
    }

    /// Insert the entry under its key. On success the entry's refcount is
    /// set to 1 (the indexed reference) and `register` runs before the entry
    /// becomes visible to other threads, so lookups never observe an entry
    /// the replacement policy does not know yet.
    pub(crate) fn insert(&self, ptr: NonNull<CacheEntry>, register: impl FnOnce()) -> Result<()> {
        // SAFETY: the entry is alive; it was just built by the caller.
        let entry = unsafe { ptr.as_ref() };
        let shard = self.shard(entry.key());

        let mut tree = shard.tree.write();
        tree.insert(ptr)?;
        entry.make_indexed();
        register();
        shard.metrics.put.add(1);
        shard.metrics.entries.add(1);
        Ok(())
    }

    /// Exact-match lookup. A hit acquires the entry for the caller.
    /// `bump_stat` governs whether the hit/miss counters tick (`exists` and
    /// targeted eviction look up without counting).
    pub(crate) fn get(&self, key: &[u8], bump_stat: bool) -> Option<NonNull<CacheEntry>> {
        let shard = self.shard(key);

        let tree = shard.tree.read();
        let found = tree.get(&FramedKey::new(key));
        match &found {
            Some(ptr) => {
                // SAFETY: the indexed reference keeps the entry alive while
                // the shard lock is held.
                unsafe { ptr.as_ref() }.acquire();
                if bump_stat {
                    shard.metrics.hit.add(1);
                }
            }
            None => {
                if bump_stat {
                    shard.metrics.miss.add(1);
                }
            }
        }
        found
    }

    /// Remove the entry by its exact key. The indexed reference is *not*
    /// dropped here; the caller releases it outside the shard lock.
    pub(crate) fn remove(&self, ptr: NonNull<CacheEntry>) -> Option<NonNull<CacheEntry>> {
        // SAFETY: the caller holds a reference.
        let entry = unsafe { ptr.as_ref() };
        let shard = self.shard(entry.key());

        let mut tree = shard.tree.write();
        let removed = tree.remove(&FramedKey::new(entry.key()));
        if let Some(removed) = removed {
            debug_assert_eq!(removed, ptr);
            shard.metrics.evict.add(1);
            shard.metrics.entries.sub(1);
        }
        removed
    }

    /// Tear down every shard, handing each leaf to `f`.
    pub(crate) fn drain(&self, f: &mut dyn FnMut(NonNull<CacheEntry>)) {
        for shard in self.shards.iter() {
            let mut tree = shard.tree.write();
            tree.drain(&mut |ptr| {
                shard.metrics.entries.sub(1);
                f(ptr);
            });
        }
    }

    pub(crate) fn puts(&self) -> u64 {
        self.sum(|m| m.put.get())
    }

    pub(crate) fn hits(&self) -> u64 {
        self.sum(|m| m.hit.get())
    }

    pub(crate) fn misses(&self) -> u64 {
        self.sum(|m| m.miss.get())
    }

    pub(crate) fn evicts(&self) -> u64 {
        self.sum(|m| m.evict.get())
    }

    pub(crate) fn entries(&self) -> u64 {
        self.sum(|m| m.entries.get())
    }

    fn sum(&self, f: impl Fn(&ShardMetrics) -> u64) -> u64 {
        self.shards.iter().map(|s| f(&s.metrics)).sum()
    }
}

#[cfg(test)]
mod tests {
    use itertools::Itertools;

    use super::*;
    use crate::heap::ExtentChain;

    fn leak_entry(key: &[u8]) -> NonNull<CacheEntry> {
        NonNull::from(Box::leak(Box::new(CacheEntry::new(
            key,
            0,
            ExtentChain::default(),
        ))))
    }

    fn free_entry(ptr: NonNull<CacheEntry>) {
        // SAFETY: test-owned pointer created by `leak_entry`.
        unsafe { drop(Box::from_raw(ptr.as_ptr())) };
    }

    #[test]
    fn test_sharded_insert_get_remove() {
        let index = Index::new();
        let ptrs = (0..512u32)
            .map(|i| leak_entry(&i.to_le_bytes()))
            .collect_vec();

        for ptr in &ptrs {
            index.insert(*ptr, || {}).unwrap();
        }
        assert_eq!(index.entries(), 512);
        assert_eq!(index.puts(), 512);

        for (i, ptr) in ptrs.iter().enumerate() {
            let found = index.get(&(i as u32).to_le_bytes(), true).unwrap();
            assert_eq!(found, *ptr);
            // Undo the acquire from the lookup.
            // SAFETY: refcount stays above zero (indexed reference remains).
            assert!(!unsafe { found.as_ref() }.release());
        }
        assert_eq!(index.hits(), 512);
        assert_eq!(index.misses(), 0);

        assert!(index.get(b"missing", true).is_none());
        assert_eq!(index.misses(), 1);

        for ptr in &ptrs {
            assert_eq!(index.remove(*ptr), Some(*ptr));
        }
        assert_eq!(index.entries(), 0);
        assert_eq!(index.evicts(), 512);

        for ptr in ptrs {
            free_entry(ptr);
        }
    }

    #[test]
    fn test_duplicate_put_fails() {
        let index = Index::new();
        let a = leak_entry(b"dup");
        let b = leak_entry(b"dup");
        index.insert(a, || {}).unwrap();
        assert!(index.insert(b, || {}).is_err());
        assert_eq!(index.entries(), 1);
        assert_eq!(index.remove(a), Some(a));
        free_entry(a);
        free_entry(b);
    }
}
