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

//! Multi-threaded get/put churn benchmark against a real pool.
//!
//! ```bash
//! daxcache-bench --path /mnt/pmem0 --capacity 16GiB --threads 32 --seconds 30
//! ```

use std::{
    path::PathBuf,
    sync::{
        atomic::{AtomicU64, Ordering},
        Barrier,
    },
    time::{Duration, Instant},
};

use bytesize::ByteSize;
use clap::Parser;
use daxcache::{Cache, CacheBuilder, Error, Statistic};
use hdrhistogram::Histogram;
use rand::{rngs::SmallRng, Rng, SeedableRng};

#[derive(Parser, Debug)]
#[command(author, version, about)]
struct Args {
    /// Directory on a (DAX) filesystem, or a DAX/block device.
    #[arg(short, long)]
    path: PathBuf,

    /// Pool capacity.
    #[arg(long, default_value = "1GiB")]
    capacity: ByteSize,

    /// Allocation granularity in bytes.
    #[arg(long, default_value_t = 256)]
    extent_size: usize,

    /// Number of worker threads.
    #[arg(long, default_value_t = 8)]
    threads: u64,

    /// Benchmark duration in seconds.
    #[arg(long, default_value_t = 10)]
    seconds: u64,

    /// Number of distinct keys.
    #[arg(long, default_value_t = 100_000)]
    key_space: u64,

    /// Minimum value size in bytes.
    #[arg(long, default_value_t = 1024)]
    value_size_min: usize,

    /// Maximum value size in bytes.
    #[arg(long, default_value_t = 64 * 1024)]
    value_size_max: usize,

    /// Fraction of operations that are gets (the rest are puts).
    #[arg(long, default_value_t = 0.9)]
    get_ratio: f64,

    /// RNG seed.
    #[arg(long, default_value_t = 42)]
    seed: u64,
}

#[derive(Default)]
struct Totals {
    gets: AtomicU64,
    hits: AtomicU64,
    puts: AtomicU64,
    conflicts: AtomicU64,
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let args = Args::parse();
    anyhow::ensure!(
        args.value_size_min <= args.value_size_max,
        "value size range is empty"
    );

    tracing::info!("{args:?}");

    let cache = CacheBuilder::new()
        .with_capacity(args.capacity.as_u64() as usize)
        .with_extent_size(args.extent_size)
        .open(&args.path)?;

    let payload: Vec<u8> = (0..args.value_size_max)
        .map(|i| (i * 31 % 251) as u8)
        .collect();

    let totals = Totals::default();
    let barrier = Barrier::new(args.threads as usize);
    let deadline = Duration::from_secs(args.seconds);

    let start = Instant::now();
    let (get_hist, put_hist) = std::thread::scope(|s| {
        let handles: Vec<_> = (0..args.threads)
            .map(|t| {
                let (cache, args, payload) = (&cache, &args, &payload);
                let (totals, barrier) = (&totals, &barrier);
                s.spawn(move || worker(t, cache, args, payload, totals, barrier, deadline))
            })
            .collect();

        let mut get_hist = Histogram::<u64>::new(3).unwrap();
        let mut put_hist = Histogram::<u64>::new(3).unwrap();
        for handle in handles {
            let (g, p) = handle.join().unwrap();
            get_hist.add(g).unwrap();
            put_hist.add(p).unwrap();
        }
        (get_hist, put_hist)
    });
    let elapsed = start.elapsed();

    let gets = totals.gets.load(Ordering::Relaxed);
    let hits = totals.hits.load(Ordering::Relaxed);
    let puts = totals.puts.load(Ordering::Relaxed);
    let conflicts = totals.conflicts.load(Ordering::Relaxed);
    let ops = gets + puts;

    println!("elapsed:        {elapsed:.2?}");
    println!(
        "throughput:     {:.0} ops/s ({gets} gets, {puts} puts, {conflicts} put conflicts)",
        ops as f64 / elapsed.as_secs_f64()
    );
    println!(
        "hit ratio:      {:.2}%",
        100.0 * hits as f64 / gets.max(1) as f64
    );
    for (name, hist) in [("get", &get_hist), ("put", &put_hist)] {
        println!(
            "{name} latency:    p50 {}us  p99 {}us  p999 {}us  max {}us",
            hist.value_at_quantile(0.5),
            hist.value_at_quantile(0.99),
            hist.value_at_quantile(0.999),
            hist.max(),
        );
    }
    println!(
        "cache:          entries {}  pool used {}  dram used {}  heap entries {}",
        cache.stat(Statistic::Entries),
        ByteSize(cache.stat(Statistic::PoolUsed)),
        ByteSize(cache.stat(Statistic::DramUsed)),
        cache.stat(Statistic::HeapEntries),
    );

    Ok(())
}

fn worker(
    t: u64,
    cache: &Cache,
    args: &Args,
    payload: &[u8],
    totals: &Totals,
    barrier: &Barrier,
    deadline: Duration,
) -> (Histogram<u64>, Histogram<u64>) {
    let mut rng = SmallRng::seed_from_u64(args.seed.wrapping_add(t));
    let mut get_hist = Histogram::<u64>::new(3).unwrap();
    let mut put_hist = Histogram::<u64>::new(3).unwrap();
    let mut buf = vec![0u8; args.value_size_max];

    barrier.wait();
    let start = Instant::now();

    while start.elapsed() < deadline {
        let key = rng.gen_range(0..args.key_space).to_le_bytes();

        if rng.gen_bool(args.get_ratio) {
            let op = Instant::now();
            let res = cache.get(&key, &mut buf, 0);
            get_hist
                .record(op.elapsed().as_micros() as u64)
                .unwrap_or_default();
            totals.gets.fetch_add(1, Ordering::Relaxed);
            match res {
                Ok(_) => {
                    totals.hits.fetch_add(1, Ordering::Relaxed);
                }
                Err(Error::NotFound) => {}
                Err(e) => panic!("get failed: {e}"),
            }
        } else {
            let len = rng.gen_range(args.value_size_min..=args.value_size_max);
            let op = Instant::now();
            let res = cache.put(&key, &payload[..len]);
            put_hist
                .record(op.elapsed().as_micros() as u64)
                .unwrap_or_default();
            totals.puts.fetch_add(1, Ordering::Relaxed);
            match res {
                Ok(()) => {}
                Err(Error::AlreadyExists) => {
                    totals.conflicts.fetch_add(1, Ordering::Relaxed);
                }
                Err(e) => panic!("put failed: {e}"),
            }
        }
    }

    (get_hist, put_hist)
}
