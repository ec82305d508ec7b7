//! Process-wide cached storage usage, per spec.md §4.10 "Storage-usage
//! cache": the one piece of shared in-memory mutable state the design
//! allows (spec.md §5). Backed by two atomics so C-STORE never takes a
//! lock to read or bump it.

use camino::Utf8Path;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use walkdir::WalkDir;

pub struct StorageCache {
    bytes: AtomicU64,
    updated_at_millis: AtomicI64,
}

impl StorageCache {
    pub fn new(initial_bytes: u64) -> Self {
        Self {
            bytes: AtomicU64::new(initial_bytes),
            updated_at_millis: AtomicI64::new(now_millis()),
        }
    }

    pub fn bytes(&self) -> u64 {
        self.bytes.load(Ordering::Relaxed)
    }

    pub fn age(&self) -> Duration {
        let updated = self.updated_at_millis.load(Ordering::Relaxed);
        let elapsed_millis = (now_millis() - updated).max(0);
        Duration::from_millis(elapsed_millis as u64)
    }

    pub fn is_stale(&self, max_age: Duration) -> bool {
        self.age() >= max_age
    }

    /// Atomically add `delta` (may be negative after a cleanup) to the
    /// cached byte count, per spec.md §4.10's "atomically add file_size"
    /// instruction.
    pub fn add(&self, delta: i64) {
        if delta >= 0 {
            self.bytes.fetch_add(delta as u64, Ordering::Relaxed);
        } else {
            self.bytes.fetch_sub(delta.unsigned_abs(), Ordering::Relaxed);
        }
        self.updated_at_millis.store(now_millis(), Ordering::Relaxed);
    }

    pub fn set(&self, actual_bytes: u64) {
        self.bytes.store(actual_bytes, Ordering::Relaxed);
        self.updated_at_millis.store(now_millis(), Ordering::Relaxed);
    }
}

fn now_millis() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

/// Full filesystem rescan to correct drift, per spec.md §4.10: "periodically
/// (≤ 5 min), fully rescan to correct drift". MUST NOT run in the C-STORE
/// hot path; callers schedule this on its own timer.
pub fn rescan_disk_usage(root: &Utf8Path) -> u64 {
    WalkDir::new(root.as_std_path())
        .into_iter()
        .filter_map(|e| e.ok())
        .filter(|e| e.file_type().is_file())
        .filter_map(|e| e.metadata().ok())
        .map(|m| m.len())
        .sum()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn add_and_subtract() {
        let cache = StorageCache::new(100);
        cache.add(50);
        assert_eq!(cache.bytes(), 150);
        cache.add(-30);
        assert_eq!(cache.bytes(), 120);
    }

    #[test]
    fn fresh_cache_is_not_stale() {
        let cache = StorageCache::new(0);
        assert!(!cache.is_stale(Duration::from_secs(30)));
    }
}
