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

//! Statistics counters.
//!
//! Counters compile away entirely without the `stats` feature; reads then
//! return 0 but every query keeps working, so benchmarks and tests can rely
//! on a stable interface either way.

#[cfg(feature = "stats")]
use std::sync::atomic::{AtomicU64, Ordering};

/// The statistics a cache exposes through [`crate::Cache::stat`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Statistic {
    /// Total number of successful puts.
    Put,
    /// Total number of gets (hits plus misses).
    Get,
    /// Total number of gets that found the key.
    Hit,
    /// Total number of gets that missed.
    Miss,
    /// Total number of evictions.
    Evict,
    /// Current number of indexed entries.
    Entries,
    /// Current bytes of process heap charged to entries and keys.
    DramUsed,
    /// Current payload bytes allocated from the pool.
    PoolUsed,
    /// Current number of extents on the allocator free list.
    HeapEntries,
}

#[derive(Debug, Default)]
pub(crate) struct Counter {
    #[cfg(feature = "stats")]
    value: AtomicU64,
}

impl Counter {
    pub(crate) fn add(&self, v: u64) {
        #[cfg(feature = "stats")]
        self.value.fetch_add(v, Ordering::Relaxed);
        #[cfg(not(feature = "stats"))]
        let _ = v;
    }

    pub(crate) fn sub(&self, v: u64) {
        #[cfg(feature = "stats")]
        self.value.fetch_sub(v, Ordering::Relaxed);
        #[cfg(not(feature = "stats"))]
        let _ = v;
    }

    pub(crate) fn get(&self) -> u64 {
        #[cfg(feature = "stats")]
        {
            self.value.load(Ordering::Relaxed)
        }
        #[cfg(not(feature = "stats"))]
        {
            0
        }
    }
}

/// Counters owned by one index shard, ticked under its lock.
#[derive(Debug, Default)]
pub(crate) struct ShardMetrics {
    pub(crate) put: Counter,
    pub(crate) evict: Counter,
    pub(crate) hit: Counter,
    pub(crate) miss: Counter,
    pub(crate) entries: Counter,
}
