//! Bounded-wait key locks.
//!
//! A caller acquires its whole key set at once or nothing: partial sets are
//! never held while waiting, and keys are taken in sorted order.

use std::collections::{BTreeSet, HashSet};
use std::hash::Hash;
use std::sync::{Condvar, Mutex};
use std::time::{Duration, Instant};

use forgeledger_core::LedgerResult;

use crate::error::{StoreError, poisoned};

#[derive(Debug)]
pub struct KeyLocks<K> {
    held: Mutex<HashSet<K>>,
    released: Condvar,
}

/// Releases its keys on drop.
#[derive(Debug)]
pub struct KeyGuard<'a, K: Eq + Hash> {
    locks: &'a KeyLocks<K>,
    keys: Vec<K>,
}

impl<K> KeyLocks<K>
where
    K: Ord + Hash + Clone,
{
    pub fn new() -> Self {
        Self {
            held: Mutex::new(HashSet::new()),
            released: Condvar::new(),
        }
    }

    /// Wait up to `timeout` for every key in `keys` to be free, then hold them all.
    pub fn acquire(
        &self,
        keys: impl IntoIterator<Item = K>,
        timeout: Duration,
    ) -> LedgerResult<KeyGuard<'_, K>> {
        let keys: Vec<K> = keys.into_iter().collect::<BTreeSet<_>>().into_iter().collect();
        let started = Instant::now();
        let deadline = started.checked_add(timeout);

        let mut held = self.held.lock().map_err(|_| poisoned("key locks"))?;
        loop {
            if keys.iter().all(|k| !held.contains(k)) {
                for k in &keys {
                    held.insert(k.clone());
                }
                return Ok(KeyGuard { locks: self, keys });
            }

            let remaining = match deadline {
                Some(deadline) => deadline.saturating_duration_since(Instant::now()),
                None => Duration::from_secs(3600),
            };
            if remaining.is_zero() {
                return Err(StoreError::LockTimeout {
                    waited_ms: started.elapsed().as_millis() as u64,
                }
                .into());
            }
            let (next, _) = self
                .released
                .wait_timeout(held, remaining)
                .map_err(|_| poisoned("key locks"))?;
            held = next;
        }
    }

    pub fn is_held(&self, key: &K) -> bool {
        self.held.lock().map(|held| held.contains(key)).unwrap_or(true)
    }
}

impl<K: Eq + Hash> KeyGuard<'_, K> {
    pub fn keys(&self) -> &[K] {
        &self.keys
    }
}

impl<K: Eq + Hash> Drop for KeyGuard<'_, K> {
    fn drop(&mut self) {
        let mut held = match self.locks.held.lock() {
            Ok(held) => held,
            Err(poison) => poison.into_inner(),
        };
        for k in &self.keys {
            held.remove(k);
        }
        drop(held);
        self.locks.released.notify_all();
    }
}
