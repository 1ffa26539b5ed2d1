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

//! Two-level cache composition: a small front cache backed by a larger one
//! through the miss and evict callbacks. Misses promote values up, LRU
//! evictions demote them down, and no value is ever lost between the tiers.

use std::sync::Arc;

use daxcache::{Cache, CacheBuilder, Statistic, MIN_POOL};

// Sized so the whole key set overflows the 1 MiB front tier several times
// over while fitting comfortably into the back tier.
fn value_for(key: u32) -> Vec<u8> {
    let len = 2048 + (key as usize * 131) % 8192;
    (0..len).map(|i| (key as usize * 13 + i) as u8).collect()
}

fn read(cache: &Cache, key: u32) -> Option<Vec<u8>> {
    let mut buf = vec![0u8; 16384];
    match cache.get(&key.to_le_bytes(), &mut buf, 0) {
        Ok(got) => {
            buf.truncate(got.bytes);
            Some(buf)
        }
        Err(_) => None,
    }
}

#[test_log::test]
fn test_two_level_promote_and_demote() {
    const KEYS: u32 = 200;

    let front_dir = tempfile::tempdir().unwrap();
    let back_dir = tempfile::tempdir().unwrap();

    let back = Arc::new(
        CacheBuilder::new()
            .with_capacity(8 << 20)
            .open(back_dir.path())
            .unwrap(),
    );
    let front = CacheBuilder::new()
        .with_capacity(MIN_POOL)
        .open(front_dir.path())
        .unwrap();

    for key in 0..KEYS {
        back.put(&key.to_le_bytes(), &value_for(key)).unwrap();
    }

    // Promote on miss: pull the value out of the back tier and put it into
    // the front tier, satisfying the outer get in-line.
    {
        let back = back.clone();
        front.on_miss(move |front, key| {
            let mut buf = vec![0u8; 16384];
            if let Ok(got) = back.get(key, &mut buf, 0) {
                let _ = front.put(key, &buf[..got.bytes]);
            }
        });
    }

    // Demote on evict: read the dying value (the entry is still indexed)
    // and push it down. The back tier may still hold an older copy.
    {
        let back = back.clone();
        front.on_evict(move |front, key| {
            let mut buf = vec![0u8; 16384];
            if let Ok(got) = front.get(key, &mut buf, 0) {
                let _ = back.put(key, &buf[..got.bytes]);
            }
        });
    }

    // Every key is readable through the front cache, hot or not; the front
    // tier churns hard because it is far smaller than the working set.
    for key in 0..KEYS {
        assert_eq!(read(&front, key).as_deref(), Some(value_for(key).as_slice()));
    }
    for key in (0..KEYS).rev() {
        assert_eq!(read(&front, key).as_deref(), Some(value_for(key).as_slice()));
    }

    assert!(front.stat(Statistic::Miss) > 0);
    assert!(front.stat(Statistic::Evict) > 0);
    assert!(front.stat(Statistic::Entries) < u64::from(KEYS));

    // Nothing fell through the cracks: every key is in at least one tier.
    for key in 0..KEYS {
        let in_front = front.exists(&key.to_le_bytes());
        let in_back = back.exists(&key.to_le_bytes());
        assert!(in_front || in_back, "key {key} lost between tiers");
    }
}
