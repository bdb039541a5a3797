//! Benchmark utilities.

use meshkv_core::KeyChange;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::thread;
use std::time::{Duration, Instant};

/// Installs a log subscriber driven by `RUST_LOG`, once.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .try_init();
}

/// Generate a payload of the specified size.
pub fn payload(size: usize) -> Vec<u8> {
    (0..size).map(|i| (i % 256) as u8).collect()
}

/// Generate `count` inserts with `value_size`-byte values.
pub fn inserts(count: usize, value_size: usize) -> Vec<KeyChange> {
    (0..count)
        .map(|i| KeyChange::insert(format!("key-{i:06}"), payload(value_size)))
        .collect()
}

/// Spin until `counter` reaches `target`. Returns false on timeout.
pub fn wait_count(counter: &AtomicUsize, target: usize, timeout: Duration) -> bool {
    let deadline = Instant::now() + timeout;
    while counter.load(Ordering::Acquire) < target {
        if Instant::now() >= deadline {
            return false;
        }
        thread::yield_now();
    }
    true
}
