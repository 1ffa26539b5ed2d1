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

//! Space-utilization bound: once the pool is full enough that evictions
//! fire, the allocator keeps at least 95% of the pool in use despite
//! random-sized values churning through it.

use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};

use daxcache::{CacheBuilder, Statistic};
use rand::{rngs::SmallRng, Rng, SeedableRng};

const ALLOWED_RATIO: f64 = 0.95;

#[test_log::test]
fn test_utilization_stays_high_under_churn() {
    let dir = tempfile::tempdir().unwrap();
    let cache = CacheBuilder::new()
        .with_capacity(4 << 20)
        .open(dir.path())
        .unwrap();

    let evicted = Arc::new(AtomicBool::new(false));
    {
        let evicted = evicted.clone();
        cache.on_evict(move |_, _| {
            evicted.store(true, Ordering::Relaxed);
        });
    }

    let mut rng = SmallRng::seed_from_u64(42);
    let mut key = 0u64;
    let mut churn_after_full = 0;

    while churn_after_full < 500 {
        let len = rng.gen_range(4096..=32768);
        let value = vec![0xa5u8; len];
        cache.put(&key.to_le_bytes(), &value).unwrap();
        key += 1;

        if evicted.load(Ordering::Relaxed) {
            churn_after_full += 1;
            let used = cache.stat(Statistic::PoolUsed) as f64;
            let ratio = used / cache.capacity() as f64;
            assert!(
                ratio >= ALLOWED_RATIO,
                "pool utilization dropped to {ratio:.3} after {key} puts"
            );
        }
    }

    while cache.evict(None).is_ok() {}
    assert_eq!(cache.stat(Statistic::PoolUsed), 0);
    assert_eq!(cache.stat(Statistic::HeapEntries), 1);
}
