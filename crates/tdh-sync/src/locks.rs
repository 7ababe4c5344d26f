//! Per-record-id serialization for concurrent imports.
//!
//! Every key also remembers the sequence number of its last write, so a
//! reader that prefetched rows at some earlier point can tell under the lock
//! whether its copy is still current.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tokio::sync::{Mutex, OwnedMutexGuard};

const PRUNE_THRESHOLD: usize = 1024;

/// Held while working on one key; carries the key's last write sequence.
pub type KeyGuard = OwnedMutexGuard<u64>;

#[derive(Debug, Default)]
struct LockTable {
    entries: HashMap<String, Arc<Mutex<u64>>>,
    // highest write sequence among pruned keys
    floor: u64,
}

#[derive(Debug, Default)]
pub struct KeyedLocks {
    table: Mutex<LockTable>,
    writes: AtomicU64,
}

impl KeyedLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Current write sequence; take it before prefetching.
    pub fn epoch(&self) -> u64 {
        self.writes.load(Ordering::SeqCst)
    }

    /// Waits until no other holder of `key` remains.
    pub async fn lock(&self, key: &str) -> KeyGuard {
        let lock = {
            let mut table = self.table.lock().await;
            if table.entries.len() >= PRUNE_THRESHOLD {
                let mut floor = table.floor;
                table.entries.retain(|_, lock| {
                    if Arc::strong_count(lock) > 1 {
                        return true;
                    }
                    if let Ok(last) = lock.try_lock() {
                        floor = floor.max(*last);
                    }
                    false
                });
                table.floor = floor;
            }
            let floor = table.floor;
            table
                .entries
                .entry(key.to_string())
                .or_insert_with(|| Arc::new(Mutex::new(floor)))
                .clone()
        };
        lock.lock_owned().await
    }

    /// True when `key` may have been written after `epoch` was taken.
    pub fn written_since(guard: &KeyGuard, epoch: u64) -> bool {
        **guard > epoch
    }

    /// Call after any write attempt made under `guard`.
    pub fn mark_written(&self, guard: &mut KeyGuard) {
        **guard = self.writes.fetch_add(1, Ordering::SeqCst) + 1;
    }

    pub async fn len(&self) -> usize {
        self.table.lock().await.entries.len()
    }
}
