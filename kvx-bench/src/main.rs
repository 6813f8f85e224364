//! # Client Benchmark Harness
//!
//! Purpose: Drive a live backend through the pooled executor so command
//! throughput and lock contention can be compared over time.
//!
//! Usage: `kvx-bench [threads] [ops_per_thread] [value_size]`. The connection
//! profile is read from the JSON file named by `KVX_PROFILE`, falling back to
//! `127.0.0.1:6379` with a pool sized to the thread count.
//!
//! ## Design Principles
//! 1. **Shared Pool**: Every worker clones one `Executor`, so the numbers
//!    include borrow/return costs.
//! 2. **Deterministic Workload**: Keys and tokens are derived from worker and
//!    iteration indices only.
//! 3. **Outcome Accounting**: Lock contention is reported as acquired/held
//!    counts, never as errors.

use std::env;
use std::fs;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{bail, Context, Result};
use kvx_client::{Acquire, Executor, Release};
use kvx_common::{Profile, ProfileFields};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

const DEFAULT_THREADS: usize = 8;
const DEFAULT_OPS: usize = 10_000;
const DEFAULT_VALUE_SIZE: usize = 128;
const LOCK_NAME: &str = "kvx-bench:lock";
const LOCK_TTL_SECONDS: u64 = 5;

struct BenchConfig {
    threads: usize,
    ops: usize,
    value_size: usize,
}

impl BenchConfig {
    fn from_args() -> Self {
        let mut args = env::args().skip(1);
        BenchConfig {
            threads: parse_usize(args.next(), DEFAULT_THREADS).max(1),
            ops: parse_usize(args.next(), DEFAULT_OPS).max(1),
            value_size: parse_usize(args.next(), DEFAULT_VALUE_SIZE),
        }
    }
}

fn parse_usize(value: Option<String>, fallback: usize) -> usize {
    value.and_then(|raw| raw.parse().ok()).unwrap_or(fallback)
}

fn load_profile(threads: usize) -> Result<Profile> {
    let fields = match env::var("KVX_PROFILE") {
        Ok(path) => {
            let raw = fs::read_to_string(&path)
                .with_context(|| format!("reading profile {path}"))?;
            serde_json::from_str::<ProfileFields>(&raw)
                .with_context(|| format!("parsing profile {path}"))?
        }
        Err(_) => ProfileFields {
            host: "127.0.0.1".to_string(),
            connect_timeout: 1_000,
            read_timeout: 5_000,
            write_timeout: 5_000,
            max_active: threads as i64,
            max_idle: threads as i64,
            wait: true,
            ..ProfileFields::default()
        },
    };
    Ok(Profile::from_fields(fields)?)
}

fn report(label: &str, ops: usize, elapsed: Duration) {
    let secs = elapsed.as_secs_f64();
    let ops_per_sec = (ops as f64) / secs;
    let micros_per_op = (secs * 1e6) / (ops as f64);
    println!("{label}: {ops} ops in {secs:.3}s ({ops_per_sec:.0} ops/s, {micros_per_op:.1} us/op)");
}

/// Runs `work(worker, iteration)` on every worker thread and reports the total.
fn run_phase<F>(label: &str, config: &BenchConfig, work: F) -> Result<()>
where
    F: Fn(usize, usize) -> Result<()> + Send + Sync + 'static,
{
    let work = Arc::new(work);
    let ops = config.ops;
    let start = Instant::now();

    let handles: Vec<_> = (0..config.threads)
        .map(|worker| {
            let work = work.clone();
            thread::spawn(move || -> Result<()> {
                for iteration in 0..ops {
                    work(worker, iteration)?;
                }
                Ok(())
            })
        })
        .collect();

    for handle in handles {
        match handle.join() {
            Ok(result) => result?,
            Err(_) => bail!("{label} worker panicked"),
        }
    }
    report(label, config.threads * ops, start.elapsed());
    Ok(())
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_target(false)
        .with_thread_ids(true)
        .init();

    if let Err(err) = run() {
        eprintln!("kvx-bench failed: {err:#}");
        std::process::exit(1);
    }
}

fn run() -> Result<()> {
    let config = BenchConfig::from_args();
    let profile = load_profile(config.threads)?;
    info!(profile = %profile, threads = config.threads, ops = config.ops, "starting benchmark");

    let executor = Executor::new(profile);
    executor
        .execute("PING", &[])
        .into_result()
        .context("backend unreachable")?;

    let value = Arc::new(vec![b'x'; config.value_size]);

    let set_executor = executor.clone();
    let set_value = value.clone();
    run_phase("SET", &config, move |worker, iteration| {
        let key = format!("kvx-bench:{worker}:{}", iteration % 1024);
        set_executor
            .set(key.as_bytes(), &set_value)
            .into_result()?;
        Ok(())
    })?;

    let get_executor = executor.clone();
    run_phase("GET", &config, move |worker, iteration| {
        let key = format!("kvx-bench:{worker}:{}", iteration % 1024);
        get_executor.get(key.as_bytes()).into_result()?;
        Ok(())
    })?;

    let acquired = Arc::new(AtomicU64::new(0));
    let held = Arc::new(AtomicU64::new(0));
    let lock_executor = executor.clone();
    let (acquired_count, held_count) = (acquired.clone(), held.clone());
    run_phase("LOCK", &config, move |worker, iteration| {
        let token = format!("{worker}-{iteration}");
        match lock_executor
            .acquire_lock(LOCK_NAME, &token, LOCK_TTL_SECONDS)
            .into_result()?
        {
            Acquire::Acquired => {
                acquired_count.fetch_add(1, Ordering::Relaxed);
                if lock_executor.release_lock(LOCK_NAME, &token).into_result()? == Release::NotHeld {
                    warn!(token = %token, "lock expired before release");
                }
            }
            Acquire::Held => {
                held_count.fetch_add(1, Ordering::Relaxed);
            }
        }
        Ok(())
    })?;
    println!(
        "LOCK outcomes: acquired={}, held={}",
        acquired.load(Ordering::Relaxed),
        held.load(Ordering::Relaxed)
    );

    let stats = executor.pool().stats();
    info!(open = stats.open, idle = stats.idle, in_use = stats.in_use, "pool after run");
    if let Err(err) = executor.pool().close() {
        warn!(error = %err, "pool close reported a failure");
    }
    Ok(())
}
