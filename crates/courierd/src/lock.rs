//! Keyed async mutex arena.
//!
//! One `tokio::sync::Mutex` per key, created lazily on first use and
//! dropped from the arena when the last holder or waiter lets go. Waiters
//! on the same key are served in FIFO order; different keys never
//! contend.

use std::collections::HashMap;
use std::future::Future;
use std::hash::Hash;
use std::sync::{Arc, Mutex, MutexGuard};

use tokio::sync::OwnedMutexGuard;

/// Arena of per-key async locks.
pub struct KeyedMutex<K> {
    slots: Arc<Mutex<HashMap<K, Arc<tokio::sync::Mutex<()>>>>>,
}

impl<K> Clone for KeyedMutex<K> {
    fn clone(&self) -> Self {
        Self {
            slots: Arc::clone(&self.slots),
        }
    }
}

impl<K> Default for KeyedMutex<K> {
    fn default() -> Self {
        Self {
            slots: Arc::new(Mutex::new(HashMap::new())),
        }
    }
}

impl<K> std::fmt::Debug for KeyedMutex<K> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeyedMutex")
            .field("slots", &lock_slots(&self.slots).len())
            .finish()
    }
}

impl<K> KeyedMutex<K>
where
    K: Eq + Hash + Clone,
{
    pub fn new() -> Self {
        Self::default()
    }

    /// Waits for exclusive access to `key`.
    ///
    /// The returned guard releases the lock when dropped, on every exit
    /// path including early returns and panics.
    pub async fn lock(&self, key: K) -> KeyedGuard<K> {
        let slot = {
            let mut slots = lock_slots(&self.slots);
            Arc::clone(slots.entry(key.clone()).or_default())
        };

        let guard = slot.lock_owned().await;

        KeyedGuard {
            key: Some(key),
            guard: Some(guard),
            slots: Arc::clone(&self.slots),
        }
    }

    /// Runs `fut` while holding the lock for `key`.
    pub async fn with_lock<F, T>(&self, key: K, fut: F) -> T
    where
        F: Future<Output = T>,
    {
        let _guard = self.lock(key).await;
        fut.await
    }

    /// Number of keys currently held or awaited.
    pub fn len(&self) -> usize {
        lock_slots(&self.slots).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Exclusive access to one key of a [`KeyedMutex`].
pub struct KeyedGuard<K: Eq + Hash> {
    key: Option<K>,
    guard: Option<OwnedMutexGuard<()>>,
    slots: Arc<Mutex<HashMap<K, Arc<tokio::sync::Mutex<()>>>>>,
}

impl<K: Eq + Hash> Drop for KeyedGuard<K> {
    fn drop(&mut self) {
        // Release first so the next waiter can proceed.
        drop(self.guard.take());

        let Some(key) = self.key.take() else {
            return;
        };

        let mut slots = lock_slots(&self.slots);
        // The arena's own reference is the only one left: nobody holds or
        // waits on this key any more.
        let idle = slots
            .get(&key)
            .map(|slot| Arc::strong_count(slot) == 1)
            .unwrap_or(false);
        if idle {
            slots.remove(&key);
        }
    }
}

fn lock_slots<K>(
    slots: &Mutex<HashMap<K, Arc<tokio::sync::Mutex<()>>>>,
) -> MutexGuard<'_, HashMap<K, Arc<tokio::sync::Mutex<()>>>> {
    slots.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}
