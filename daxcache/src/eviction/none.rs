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

//! The "no policy" policy.
//!
//! Holds a pseudo-reference on every entry so the lifecycle is uniform with
//! the LRU variant, but never selects victims; eviction works by key only.

use std::ptr::NonNull;

use crate::{
    entry::CacheEntry,
    error::{Error, Result},
};

pub(crate) struct NoEviction;

impl NoEviction {
    pub(crate) fn insert(&self, ptr: NonNull<CacheEntry>) {
        // SAFETY: the caller just indexed the entry; it is alive.
        unsafe { ptr.as_ref() }.acquire();
    }

    pub(crate) fn touch(&self, _entry: &CacheEntry) {}

    pub(crate) fn evict_lru(&self) -> Result<NonNull<CacheEntry>> {
        Err(Error::NoEvictableEntry)
    }

    pub(crate) fn remove(&self, _entry: &CacheEntry) -> bool {
        true
    }
}
