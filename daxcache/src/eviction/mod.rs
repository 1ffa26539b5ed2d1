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

//! Replacement policies.

pub(crate) mod lru;
pub(crate) mod none;

use std::ptr::NonNull;

use crate::{entry::CacheEntry, error::Result};

use self::{lru::LruEviction, none::NoEviction};

/// Which replacement policy a cache runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum EvictionPolicy {
    /// Entries are never selected for eviction; only targeted eviction by
    /// key works. `evict(None)` reports nothing evictable.
    None,
    /// Approximate least-recently-used. Recency updates are batched through
    /// a lock-free promotion ring, so list order may lag real access order
    /// under read pressure.
    #[default]
    Lru,
}

pub(crate) enum PolicyEngine {
    None(NoEviction),
    Lru(LruEviction),
}

impl PolicyEngine {
    pub(crate) fn new(policy: EvictionPolicy) -> Self {
        match policy {
            EvictionPolicy::None => Self::None(NoEviction),
            EvictionPolicy::Lru => Self::Lru(LruEviction::new()),
        }
    }

    /// Register a freshly indexed entry with the policy. Takes one reference
    /// on the entry, released when the entry leaves the policy.
    pub(crate) fn insert(&self, ptr: NonNull<CacheEntry>) {
        match self {
            Self::None(p) => p.insert(ptr),
            Self::Lru(p) => p.insert(ptr),
        }
    }

    /// Record a use of the entry.
    pub(crate) fn touch(&self, entry: &CacheEntry) {
        match self {
            Self::None(p) => p.touch(entry),
            Self::Lru(p) => p.touch(entry),
        }
    }

    /// Pick a victim, win its begin-evict gate and detach it from the
    /// policy. On success the policy's reference is transferred to the
    /// caller, who owns the remaining eviction steps.
    pub(crate) fn evict_lru(&self) -> Result<NonNull<CacheEntry>> {
        match self {
            Self::None(p) => p.evict_lru(),
            Self::Lru(p) => p.evict_lru(),
        }
    }

    /// Detach an entry whose begin-evict gate the caller has already won.
    /// Returns `true` when a policy reference was handed back to the caller
    /// to release.
    pub(crate) fn remove(&self, entry: &CacheEntry) -> bool {
        match self {
            Self::None(p) => p.remove(entry),
            Self::Lru(p) => p.remove(entry),
        }
    }
}
