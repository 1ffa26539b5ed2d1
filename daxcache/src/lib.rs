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

//! daxcache: an embeddable, volatile key→value cache whose value bytes live
//! in a single large memory-mapped region (a file on a DAX/pmem filesystem,
//! a DAX device, or any mmappable file). Keys and bookkeeping stay on the
//! process heap, so the cache scales with the mapping, not with DRAM.
//!
//! The cache is built from a sharded critbit-nibble index with wait-free
//! readers on the uncontended path, a coalescing extent heap carving the
//! mapping into variable-sized allocations, and an approximate-LRU policy
//! that batches promotions through a lock-free ring.
//!
//! ```
//! use daxcache::{CacheBuilder, EvictionPolicy};
//!
//! let dir = tempfile::tempdir()?;
//! let cache = CacheBuilder::new()
//!     .with_capacity(daxcache::MIN_POOL)
//!     .with_eviction_policy(EvictionPolicy::Lru)
//!     .open(dir.path())?;
//!
//! cache.put(b"KEY", b"VALUE")?;
//!
//! let mut buf = [0u8; 16];
//! let got = cache.get(b"KEY", &mut buf, 0)?;
//! assert_eq!(got.value_size, 5);
//! assert_eq!(&buf[..got.bytes], b"VALUE");
//!
//! cache.evict(Some(b"KEY".as_slice()))?;
//! assert!(!cache.exists(b"KEY"));
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```

mod assert;
mod bits;
mod cache;
mod device;
mod entry;
mod error;
mod eviction;
mod heap;
mod index;
mod metrics;

pub use cache::{Cache, CacheBuilder, EvictCallback, GetResult, MissCallback, MIN_EXTENT, MIN_POOL};
pub use error::{Error, Result};
pub use eviction::EvictionPolicy;
pub use metrics::Statistic;
