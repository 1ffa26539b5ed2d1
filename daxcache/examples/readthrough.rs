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

//! Read-through caching in front of a slow origin: misses fetch from the
//! origin inside the on-miss callback, and the triggering get returns the
//! freshly stored value in one call.
//!
//! ```bash
//! cargo run --example readthrough [pool-dir]
//! ```

use daxcache::{CacheBuilder, EvictionPolicy};

/// Stand-in for a database or remote store.
fn fetch_from_origin(key: &[u8]) -> Vec<u8> {
    let mut value = b"origin:".to_vec();
    value.extend_from_slice(key);
    value
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let tmp;
    let dir = match std::env::args().nth(1) {
        Some(dir) => std::path::PathBuf::from(dir),
        None => {
            tmp = tempfile::tempdir()?;
            tmp.path().to_path_buf()
        }
    };

    let cache = CacheBuilder::new()
        .with_capacity(64 << 20)
        .with_eviction_policy(EvictionPolicy::Lru)
        .open(&dir)?;

    cache.on_miss(|cache, key| {
        let value = fetch_from_origin(key);
        let _ = cache.put(key, &value);
    });

    let mut buf = [0u8; 64];

    // Cold: the callback fetches and the get still succeeds.
    let got = cache.get(b"answer", &mut buf, 0)?;
    println!(
        "first get:  {} ({} bytes)",
        String::from_utf8_lossy(&buf[..got.bytes]),
        got.bytes
    );

    // Warm: served straight from the pool.
    let got = cache.get(b"answer", &mut buf, 0)?;
    println!(
        "second get: {} ({} bytes)",
        String::from_utf8_lossy(&buf[..got.bytes]),
        got.bytes
    );

    println!(
        "hits: {}, misses: {}",
        cache.stat(daxcache::Statistic::Hit),
        cache.stat(daxcache::Statistic::Miss),
    );

    Ok(())
}
