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

//! Cache façade: lifecycle, the put/get/evict/exists protocol, callbacks and
//! statistics.

use std::{cell::RefCell, path::Path, ptr::NonNull, sync::Arc};

use parking_lot::RwLock;

use crate::{
    device::PoolDevice,
    entry::CacheEntry,
    error::{Error, Result},
    eviction::{EvictionPolicy, PolicyEngine},
    heap::{ExtentChain, Heap},
    index::Index,
    metrics::{Counter, Statistic},
    strict_assert,
};

/// Minimum pool size: 1 MiB.
pub const MIN_POOL: usize = 1 << 20;

/// Minimum (and default) extent size: 256 bytes.
pub const MIN_EXTENT: usize = 256;

/// Callback fired while an entry is being evicted. The entry is still
/// indexed, so the callback may read it with [`Cache::get`]; it must not
/// call [`Cache::evict`] or [`Cache::put`].
pub type EvictCallback = dyn Fn(&Cache, &[u8]) + Send + Sync;

/// Callback fired when a get misses. It may call [`Cache::put`]; a put of
/// the missing key satisfies the outer get in-line, which then returns the
/// freshly stored value without a second lookup.
pub type MissCallback = dyn Fn(&Cache, &[u8]) + Send + Sync;

/// Outcome of a successful [`Cache::get`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GetResult {
    /// Bytes copied into the caller's buffer.
    pub bytes: usize,
    /// True size of the stored value.
    pub value_size: usize,
}

/// Configuration for a cache. The knobs are immutable once the cache is
/// armed by [`CacheBuilder::open`].
#[derive(Debug, Clone)]
pub struct CacheBuilder {
    capacity: Option<usize>,
    extent_size: usize,
    policy: EvictionPolicy,
}

impl Default for CacheBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl CacheBuilder {
    pub fn new() -> Self {
        Self {
            capacity: None,
            extent_size: MIN_EXTENT,
            policy: EvictionPolicy::default(),
        }
    }

    /// Pool capacity in bytes. Mandatory; at least [`MIN_POOL`].
    pub fn with_capacity(mut self, bytes: usize) -> Self {
        self.capacity = Some(bytes);
        self
    }

    /// Allocation granularity in bytes. At least [`MIN_EXTENT`], which is
    /// also the default.
    pub fn with_extent_size(mut self, bytes: usize) -> Self {
        self.extent_size = bytes;
        self
    }

    pub fn with_eviction_policy(mut self, policy: EvictionPolicy) -> Self {
        self.policy = policy;
        self
    }

    fn verify(&self) -> Result<usize> {
        let capacity = self
            .capacity
            .ok_or_else(|| Error::invalid_argument("pool capacity is mandatory"))?;
        if capacity < MIN_POOL {
            return Err(Error::invalid_argument(format!(
                "pool capacity {capacity} is smaller than the minimum {MIN_POOL}"
            )));
        }
        if self.extent_size < MIN_EXTENT {
            return Err(Error::invalid_argument(format!(
                "extent size {extent_size} is smaller than the minimum {MIN_EXTENT}",
                extent_size = self.extent_size,
            )));
        }
        if self.extent_size > capacity {
            return Err(Error::invalid_argument(format!(
                "extent size {extent_size} is larger than the pool capacity {capacity}",
                extent_size = self.extent_size,
            )));
        }
        Ok(capacity)
    }

    /// Arm the cache on `path`: a directory (an anonymous unlinked file is
    /// reserved in it) or a DAX / block device (mapped whole).
    pub fn open(self, path: impl AsRef<Path>) -> Result<Cache> {
        let path = path.as_ref();
        let capacity = self.verify()?;

        let device = PoolDevice::open(path, capacity)?;
        let heap = Heap::new(device.addr(), device.capacity(), self.extent_size)?;
        let index = Index::new();
        let policy = PolicyEngine::new(self.policy);

        tracing::debug!(
            "cache armed on {path:?}: capacity {capacity}, extent size {extent_size}, policy {policy:?}",
            capacity = device.capacity(),
            extent_size = self.extent_size,
            policy = self.policy,
        );

        Ok(Cache {
            heap,
            index,
            policy,
            capacity: device.capacity(),
            extent_size: self.extent_size,
            evict_cb: RwLock::new(None),
            miss_cb: RwLock::new(None),
            dram_used: Counter::default(),
            device,
        })
    }
}

/// A volatile key→value cache whose values live in one large memory-mapped
/// region. Entry metadata and keys live on the process heap; value bytes
/// never do.
///
/// All methods take `&self` and may be called from any number of threads
/// once the cache is armed. Dropping the cache evicts every entry (firing
/// the on-evict callback), tears the subsystems down and unmaps the region.
pub struct Cache {
    heap: Heap,
    index: Index,
    policy: PolicyEngine,
    capacity: usize,
    extent_size: usize,
    evict_cb: RwLock<Option<Arc<EvictCallback>>>,
    miss_cb: RwLock<Option<Arc<MissCallback>>>,
    dram_used: Counter,
    /// Keep the mapping alive until everything above is gone.
    #[allow(dead_code)]
    device: PoolDevice,
}

impl std::fmt::Debug for Cache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Cache")
            .field("capacity", &self.capacity)
            .field("extent_size", &self.extent_size)
            .finish()
    }
}

/// Snapshot of the innermost in-flight get, consulted by `put` so an
/// on-miss callback can satisfy its triggering get without a second lookup.
struct PendingGet {
    key: *const u8,
    key_len: usize,
    buf: *mut u8,
    buf_len: usize,
    offset: usize,
}

enum MissState {
    Idle,
    Pending(PendingGet),
    Satisfied { bytes: usize, value_size: usize },
}

thread_local! {
    static MISS_STATE: RefCell<MissState> = const { RefCell::new(MissState::Idle) };
}

impl Cache {
    /// Store `value` under `key`.
    ///
    /// Fails with [`Error::AlreadyExists`] for a duplicate key, with
    /// [`Error::NoSpace`] when the value cannot fit even after evicting
    /// everything evictable.
    pub fn put(&self, key: &[u8], value: &[u8]) -> Result<()> {
        try_satisfy_pending_get(key, value);

        if value.len() > self.capacity {
            return Err(Error::NoSpace);
        }

        let mut chain = ExtentChain::default();
        let mut small = None;
        let mut covered = 0;
        while covered < value.len() {
            let n = self.heap.allocate(value.len() - covered, &mut chain, &mut small);
            if n > 0 {
                covered += n;
                continue;
            }
            // The free list is dry: make room and retry.
            if let Err(e) = self.evict(None) {
                self.heap.free(&mut chain);
                return Err(match e {
                    Error::NoEvictableEntry => Error::NoSpace,
                    other => other,
                });
            }
        }
        self.heap.write_value(&chain, value);

        let entry = Box::new(CacheEntry::new(key, value.len(), chain));
        self.dram_used.add(entry.dram_weight() as u64);
        let ptr = NonNull::from(Box::leak(entry));

        // Policy registration happens under the shard write lock that makes
        // the entry visible: a concurrent evictor can then always find the
        // entry in the policy.
        if let Err(e) = self.index.insert(ptr, || self.policy.insert(ptr)) {
            // SAFETY: never published; we are the only owner.
            unsafe { self.destroy_entry(ptr) };
            return Err(e);
        }
        Ok(())
    }

    /// Copy up to `buf.len()` bytes of the value stored under `key`,
    /// starting at `offset`, into `buf`.
    ///
    /// On a miss with an on-miss callback registered, the callback runs
    /// first; if it puts the missing key, the get returns the fresh value.
    pub fn get(&self, key: &[u8], buf: &mut [u8], offset: usize) -> Result<GetResult> {
        match self.index.get(key, true) {
            Some(ptr) => {
                // SAFETY: the lookup acquired a reference for us.
                let entry = unsafe { ptr.as_ref() };
                self.policy.touch(entry);
                let value_size = entry.value_size();
                let bytes = self.heap.read_value(entry.extents(), value_size, offset, buf);
                unsafe { self.release(ptr) };
                Ok(GetResult { bytes, value_size })
            }
            None => {
                let Some(cb) = self.miss_cb.read().clone() else {
                    return Err(Error::NotFound);
                };

                MISS_STATE.with(|s| {
                    *s.borrow_mut() = MissState::Pending(PendingGet {
                        key: key.as_ptr(),
                        key_len: key.len(),
                        buf: buf.as_mut_ptr(),
                        buf_len: buf.len(),
                        offset,
                    });
                });
                cb(self, key);
                let state =
                    MISS_STATE.with(|s| std::mem::replace(&mut *s.borrow_mut(), MissState::Idle));

                match state {
                    MissState::Satisfied { bytes, value_size } => Ok(GetResult { bytes, value_size }),
                    _ => Err(Error::NotFound),
                }
            }
        }
    }

    /// Whether `key` is present. No policy side effects: does not count as
    /// a hit and does not promote the entry.
    pub fn exists(&self, key: &[u8]) -> bool {
        match self.index.get(key, false) {
            Some(ptr) => {
                // SAFETY: the lookup acquired a reference; the indexed
                // reference outlives it.
                unsafe { self.release(ptr) };
                true
            }
            None => false,
        }
    }

    /// Evict the entry under `key`, or the policy's victim when `key` is
    /// `None`.
    ///
    /// A keyed evict racing another evictor of the same key returns `Ok`:
    /// the other thread is doing the work. `evict(None)` on an empty (or
    /// fully pinned) cache fails with [`Error::NoEvictableEntry`].
    pub fn evict(&self, key: Option<&[u8]>) -> Result<()> {
        match key {
            None => {
                let victim = self.policy.evict_lru()?;
                self.finish_evict(victim, true, false)
            }
            Some(key) => {
                let Some(ptr) = self.index.get(key, false) else {
                    return Err(Error::NotFound);
                };
                // SAFETY: the lookup acquired a reference.
                if !unsafe { ptr.as_ref() }.try_begin_evict() {
                    unsafe { self.release(ptr) };
                    return Ok(());
                }
                self.finish_evict(ptr, false, true)
            }
        }
    }

    /// Run the eviction steps for an entry whose begin-evict gate we own.
    fn finish_evict(
        &self,
        ptr: NonNull<CacheEntry>,
        detached_from_policy: bool,
        holds_lookup_ref: bool,
    ) -> Result<()> {
        // SAFETY: we hold at least one reference.
        let entry = unsafe { ptr.as_ref() };

        if let Some(cb) = self.evict_cb.read().clone() {
            // The entry is still indexed; the callback may read it.
            cb(self, entry.key());
        }

        if detached_from_policy {
            // evict_lru handed us the policy's reference.
            unsafe { self.release(ptr) };
        } else if self.policy.remove(entry) {
            unsafe { self.release(ptr) };
        }

        let removed = self.index.remove(ptr);
        strict_assert!(removed.is_some(), "evicting entry vanished from the index");
        // The indexed reference.
        unsafe { self.release(ptr) };

        if holds_lookup_ref {
            unsafe { self.release(ptr) };
        }
        Ok(())
    }

    /// Install the on-evict callback.
    pub fn on_evict(&self, f: impl Fn(&Cache, &[u8]) + Send + Sync + 'static) {
        *self.evict_cb.write() = Some(Arc::new(f));
    }

    /// Install the on-miss callback.
    pub fn on_miss(&self, f: impl Fn(&Cache, &[u8]) + Send + Sync + 'static) {
        *self.miss_cb.write() = Some(Arc::new(f));
    }

    /// Read one statistic. Statistics are eventually consistent across
    /// shards; with the `stats` feature disabled every statistic reads 0.
    pub fn stat(&self, stat: Statistic) -> u64 {
        #[cfg(feature = "stats")]
        {
            match stat {
                Statistic::Put => self.index.puts(),
                Statistic::Get => self.index.hits() + self.index.misses(),
                Statistic::Hit => self.index.hits(),
                Statistic::Miss => self.index.misses(),
                Statistic::Evict => self.index.evicts(),
                Statistic::Entries => self.index.entries(),
                Statistic::DramUsed => self.dram_used.get(),
                Statistic::PoolUsed => self.heap.used_bytes() as u64,
                Statistic::HeapEntries => self.heap.free_extents() as u64,
            }
        }
        #[cfg(not(feature = "stats"))]
        {
            let _ = stat;
            0
        }
    }

    /// Effective pool capacity in bytes.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Allocation granularity in bytes.
    pub fn extent_size(&self) -> usize {
        self.extent_size
    }

    /// Drop a reference; destroy the entry when it was the last one.
    ///
    /// # Safety
    ///
    /// The caller must own one reference on the entry.
    unsafe fn release(&self, ptr: NonNull<CacheEntry>) {
        // SAFETY: per contract.
        if unsafe { ptr.as_ref() }.release() {
            unsafe { self.destroy_entry(ptr) };
        }
    }

    /// Return the extent chain to the heap and free the entry memory.
    ///
    /// # Safety
    ///
    /// The entry must be unreachable: last reference dropped, or never
    /// published.
    unsafe fn destroy_entry(&self, ptr: NonNull<CacheEntry>) {
        // SAFETY: per contract, we are the sole owner now.
        let mut entry = unsafe { Box::from_raw(ptr.as_ptr()) };
        self.heap.free(entry.extents_mut());
        self.dram_used.sub(entry.dram_weight() as u64);
    }
}

impl Drop for Cache {
    fn drop(&mut self) {
        // Evict through the normal path so callbacks fire and the
        // statistics settle.
        while self.evict(None).is_ok() {}

        // Whatever the policy could not offer (policy "none", or entries
        // pinned at the time) is torn down directly.
        let mut leftovers = vec![];
        self.index.drain(&mut |ptr| leftovers.push(ptr));
        for ptr in leftovers {
            // SAFETY: no concurrent users during drop.
            unsafe { self.destroy_entry(ptr) };
        }

        tracing::debug!("cache torn down");
    }
}

fn try_satisfy_pending_get(key: &[u8], value: &[u8]) {
    MISS_STATE.with(|state| {
        let mut state = state.borrow_mut();
        let MissState::Pending(req) = &*state else {
            return;
        };
        // SAFETY: the snapshot points at the arguments of a get further down
        // this thread's stack.
        let req_key = unsafe { std::slice::from_raw_parts(req.key, req.key_len) };
        if req_key != key {
            return;
        }

        let (bytes, value_size) = if req.offset >= value.len() {
            (0, value.len())
        } else {
            let n = req.buf_len.min(value.len() - req.offset);
            // SAFETY: as above; the outer get does not touch its buffer
            // while the callback runs.
            unsafe { std::ptr::copy_nonoverlapping(value.as_ptr().add(req.offset), req.buf, n) };
            (n, value.len())
        };
        *state = MissState::Satisfied { bytes, value_size };
    });
}
