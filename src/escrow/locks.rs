//! Keyed mutual exclusion within one process
//!
//! A payout's attempt, the outcome of that attempt and any manual override must
//! not interleave. Every such code path takes the payout's lock first; holding a
//! `PayoutGuard` is the proof that it did. The same lock table keyed by
//! provider serializes recipient creation.

use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{Mutex, OwnedMutexGuard};
use uuid::Uuid;

#[derive(Clone, Default)]
pub struct KeyedLocks {
    inner: Arc<Mutex<HashMap<Uuid, Arc<Mutex<()>>>>>,
}

/// Exclusive access to one key, released on drop
pub struct KeyGuard {
    key: Uuid,
    locks: KeyedLocks,
    guard: Option<OwnedMutexGuard<()>>,
}

impl KeyGuard {
    pub fn key(&self) -> Uuid {
        self.key
    }
}

impl Drop for KeyGuard {
    fn drop(&mut self) {
        // unlock before pruning so the strong count below is accurate
        self.guard.take();
        self.locks.prune(self.key);
    }
}

/// Exclusive access to one payout
pub struct PayoutGuard(KeyGuard);

impl PayoutGuard {
    pub(super) fn new(guard: KeyGuard) -> Self {
        Self(guard)
    }

    pub fn payout_id(&self) -> Uuid {
        self.0.key()
    }
}

impl KeyedLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Wait for exclusive access to `key`
    pub async fn acquire(&self, key: Uuid) -> KeyGuard {
        let slot = {
            let mut map = self.inner.lock().await;
            map.entry(key)
                .or_insert_with(|| Arc::new(Mutex::new(())))
                .clone()
        };

        let guard = slot.lock_owned().await;
        KeyGuard {
            key,
            locks: self.clone(),
            guard: Some(guard),
        }
    }

    fn prune(&self, key: Uuid) {
        // Drop runs synchronously; if the map is busy the entry is left in place
        // until the next release of this key.
        if let Ok(mut map) = self.inner.try_lock() {
            if map
                .get(&key)
                .map_or(false, |slot| Arc::strong_count(slot) == 1)
            {
                map.remove(&key);
            }
        }
    }

    /// Number of keys with a live lock entry
    pub async fn tracked(&self) -> usize {
        self.inner.lock().await.len()
    }
}
