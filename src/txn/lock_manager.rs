//! Slot Lock Manager
//!
//! Short-lived shared/exclusive locks on cache slots, keyed by `EntityKey`.
//! Writers hold an exclusive lock on a key while they commit and update the
//! slot; read pins hold shared locks. Eviction treats any locked key as pinned.
//!
//! Deadlock freedom comes from ordering: multi-key acquisition always locks
//! keys in ascending `EntityKey` order.

use crate::types::EntityKey;
use crate::{CacheError, Result};
use ahash::{AHashMap, AHashSet, RandomState};
use dashmap::DashMap;
use parking_lot::{Condvar, Mutex};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Lock holder (one per write / pin)
pub type HolderId = u64;

/// Lock mode
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockMode {
    /// Shared lock (read pin)
    Shared,
    /// Exclusive lock (write)
    Exclusive,
}

/// Lock entry for a single slot
struct LockEntry {
    /// Current lock holders: (holder, lock_mode)
    holders: Mutex<Vec<(HolderId, LockMode)>>,
    /// Signalled whenever a holder leaves
    released: Condvar,
}

impl LockEntry {
    fn new() -> Self {
        Self {
            holders: Mutex::new(Vec::new()),
            released: Condvar::new(),
        }
    }

    /// Check if a lock can be granted
    fn can_grant(holders: &[(HolderId, LockMode)], mode: LockMode, holder: HolderId) -> bool {
        match mode {
            LockMode::Shared => {
                // Shared lock: OK if no exclusive locks held (except by self)
                !holders
                    .iter()
                    .any(|(h, m)| *m == LockMode::Exclusive && *h != holder)
            }
            LockMode::Exclusive => {
                // Exclusive lock: OK if no locks held, or only held by self
                holders.iter().all(|(h, _)| *h == holder)
            }
        }
    }

    fn holds(holders: &[(HolderId, LockMode)], holder: HolderId) -> Option<LockMode> {
        holders.iter().find(|(h, _)| *h == holder).map(|(_, m)| *m)
    }
}

/// Slot Lock Manager - manages per-key cache slot locks
pub struct SlotLockManager {
    /// Slot locks: key -> LockEntry
    locks: DashMap<EntityKey, Arc<LockEntry>, RandomState>,

    /// Holder lock tracking: holder -> set of locked keys
    holder_locks: Mutex<AHashMap<HolderId, AHashSet<EntityKey>>>,

    holder_gen: AtomicU64,
}

impl SlotLockManager {
    /// Create a new lock manager
    pub fn new() -> Self {
        Self {
            locks: DashMap::with_hasher(RandomState::new()),
            holder_locks: Mutex::new(AHashMap::new()),
            holder_gen: AtomicU64::new(1),
        }
    }

    /// Allocate a fresh holder id
    pub fn new_holder(&self) -> HolderId {
        self.holder_gen.fetch_add(1, Ordering::SeqCst)
    }

    /// Acquire a shared (read) lock
    pub fn acquire_shared(&self, holder: HolderId, key: &EntityKey, wait: Option<Duration>) -> Result<()> {
        self.acquire(holder, key, LockMode::Shared, wait)
    }

    /// Acquire an exclusive (write) lock
    pub fn acquire_exclusive(&self, holder: HolderId, key: &EntityKey, wait: Option<Duration>) -> Result<()> {
        self.acquire(holder, key, LockMode::Exclusive, wait)
    }

    /// Acquire a lock, waiting up to `wait` (None = fail fast)
    ///
    /// A shared lock already held by `holder` is upgraded in place.
    pub fn acquire(
        &self,
        holder: HolderId,
        key: &EntityKey,
        mode: LockMode,
        wait: Option<Duration>,
    ) -> Result<()> {
        // Get or create lock entry
        let entry = self
            .locks
            .entry(key.clone())
            .or_insert_with(|| Arc::new(LockEntry::new()))
            .clone();

        let started = Instant::now();
        let deadline = wait.map(|w| started + w);

        let mut holders = entry.holders.lock();
        loop {
            if let Some(current) = LockEntry::holds(&holders, holder) {
                if current == LockMode::Exclusive || mode == LockMode::Shared {
                    // Already have sufficient lock
                    return Ok(());
                }
            }

            if LockEntry::can_grant(&holders, mode, holder) {
                holders.retain(|(h, _)| *h != holder);
                holders.push((holder, mode));
                drop(holders);

                self.holder_locks
                    .lock()
                    .entry(holder)
                    .or_default()
                    .insert(key.clone());
                return Ok(());
            }

            let timed_out = match deadline {
                Some(deadline) => entry.released.wait_until(&mut holders, deadline).timed_out(),
                None => true,
            };

            if timed_out && !LockEntry::can_grant(&holders, mode, holder) {
                drop(holders);
                drop(entry);
                self.cleanup(key);
                return Err(CacheError::LockTimeout {
                    key: key.clone(),
                    waited: started.elapsed(),
                });
            }
        }
    }

    /// Lock several keys in ascending order; all-or-nothing
    pub fn acquire_all(
        &self,
        holder: HolderId,
        keys: &[EntityKey],
        mode: LockMode,
        wait: Option<Duration>,
    ) -> Result<()> {
        let mut ordered: Vec<&EntityKey> = keys.iter().collect();
        ordered.sort();
        ordered.dedup();

        for key in ordered {
            if let Err(e) = self.acquire(holder, key, mode, wait) {
                self.release_all(holder);
                return Err(e);
            }
        }
        Ok(())
    }

    /// Release one lock held by `holder`
    pub fn release(&self, holder: HolderId, key: &EntityKey) {
        {
            let mut holder_locks = self.holder_locks.lock();
            if let Some(keys) = holder_locks.get_mut(&holder) {
                keys.remove(key);
                if keys.is_empty() {
                    holder_locks.remove(&holder);
                }
            }
        }
        self.release_slot(holder, key);
    }

    /// Release all locks held by `holder`
    pub fn release_all(&self, holder: HolderId) {
        let keys = self
            .holder_locks
            .lock()
            .remove(&holder)
            .unwrap_or_default();

        for key in keys {
            self.release_slot(holder, &key);
        }
    }

    fn release_slot(&self, holder: HolderId, key: &EntityKey) {
        let entry = match self.locks.get(key) {
            Some(entry) => Arc::clone(entry.value()),
            None => return,
        };

        entry.holders.lock().retain(|(h, _)| *h != holder);
        entry.released.notify_all();
        drop(entry);

        self.cleanup(key);
    }

    /// Drop an idle entry nobody else references
    fn cleanup(&self, key: &EntityKey) {
        // strong_count == 1 under the shard lock: no waiter can be holding it
        self.locks.remove_if(key, |_, entry| {
            Arc::strong_count(entry) == 1 && entry.holders.lock().is_empty()
        });
    }

    /// Wait until no writer holds the slot; false on timeout
    pub fn wait_unlocked(&self, key: &EntityKey, timeout: Duration) -> bool {
        let entry = match self.locks.get(key) {
            Some(entry) => Arc::clone(entry.value()),
            None => return true,
        };

        let deadline = Instant::now() + timeout;
        let mut holders = entry.holders.lock();
        while holders.iter().any(|(_, m)| *m == LockMode::Exclusive) {
            if entry.released.wait_until(&mut holders, deadline).timed_out() {
                return !holders.iter().any(|(_, m)| *m == LockMode::Exclusive);
            }
        }
        true
    }

    /// Any lock (shared or exclusive) held on the key
    pub fn is_locked(&self, key: &EntityKey) -> bool {
        self.locks
            .get(key)
            .map(|entry| !entry.holders.lock().is_empty())
            .unwrap_or(false)
    }

    /// A writer holds the key
    pub fn is_exclusively_locked(&self, key: &EntityKey) -> bool {
        self.locks
            .get(key)
            .map(|entry| {
                entry
                    .holders
                    .lock()
                    .iter()
                    .any(|(_, m)| *m == LockMode::Exclusive)
            })
            .unwrap_or(false)
    }

    /// Get statistics
    pub fn stats(&self) -> LockManagerStats {
        let holder_locks = self.holder_locks.lock();

        LockManagerStats {
            lock_entries: self.locks.len() as u64,
            active_holders: holder_locks.len() as u64,
            total_locked_slots: holder_locks.values().map(|s| s.len() as u64).sum(),
        }
    }
}

impl Default for SlotLockManager {
    fn default() -> Self {
        Self::new()
    }
}

/// Releases every lock of its holder on drop
pub struct SlotGuard<'a> {
    manager: &'a SlotLockManager,
    holder: HolderId,
}

impl<'a> SlotGuard<'a> {
    pub fn new(manager: &'a SlotLockManager) -> Self {
        Self {
            holder: manager.new_holder(),
            manager,
        }
    }

    pub fn holder(&self) -> HolderId {
        self.holder
    }
}

impl Drop for SlotGuard<'_> {
    fn drop(&mut self) {
        self.manager.release_all(self.holder);
    }
}

/// Lock manager statistics
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LockManagerStats {
    pub lock_entries: u64,
    pub active_holders: u64,
    pub total_locked_slots: u64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    fn key(id: i64) -> EntityKey {
        EntityKey::new("User", id)
    }

    #[test]
    fn test_shared_lock_compatibility() {
        let lm = SlotLockManager::new();

        // Multiple holders can hold shared locks
        lm.acquire_shared(1, &key(100), None).unwrap();
        lm.acquire_shared(2, &key(100), None).unwrap();
        lm.acquire_shared(3, &key(100), None).unwrap();

        let stats = lm.stats();
        assert_eq!(stats.active_holders, 3);
        assert!(lm.is_locked(&key(100)));
        assert!(!lm.is_exclusively_locked(&key(100)));
    }

    #[test]
    fn test_exclusive_lock_blocks() {
        let lm = SlotLockManager::new();

        lm.acquire_exclusive(1, &key(100), None).unwrap();

        // Holder 2 cannot acquire any lock on same slot
        assert!(lm.acquire_shared(2, &key(100), None).is_err());
        assert!(matches!(
            lm.acquire_exclusive(2, &key(100), Some(Duration::from_millis(5))),
            Err(CacheError::LockTimeout { .. })
        ));
    }

    #[test]
    fn test_shared_blocks_exclusive() {
        let lm = SlotLockManager::new();

        lm.acquire_shared(1, &key(100), None).unwrap();
        assert!(lm.acquire_exclusive(2, &key(100), None).is_err());
    }

    #[test]
    fn test_lock_release() {
        let lm = SlotLockManager::new();

        lm.acquire_exclusive(1, &key(100), None).unwrap();
        lm.release_all(1);

        // Now holder 2 can acquire lock
        lm.acquire_exclusive(2, &key(100), None).unwrap();
        lm.release(2, &key(100));

        assert!(!lm.is_locked(&key(100)));
        assert_eq!(lm.stats().lock_entries, 0);
    }

    #[test]
    fn test_lock_upgrade() {
        let lm = SlotLockManager::new();

        lm.acquire_shared(1, &key(100), None).unwrap();
        lm.acquire_exclusive(1, &key(100), None).unwrap(); // Upgrade
        assert!(lm.is_exclusively_locked(&key(100)));

        // Upgrade blocked by a second reader
        lm.acquire_shared(2, &key(200), None).unwrap();
        lm.acquire_shared(3, &key(200), None).unwrap();
        assert!(lm.acquire_exclusive(2, &key(200), None).is_err());
    }

    #[test]
    fn test_waiter_wakes_on_release() {
        let lm = Arc::new(SlotLockManager::new());
        lm.acquire_exclusive(1, &key(100), None).unwrap();

        let waiter = {
            let lm = Arc::clone(&lm);
            thread::spawn(move || lm.acquire_exclusive(2, &key(100), Some(Duration::from_secs(5))))
        };

        thread::sleep(Duration::from_millis(20));
        lm.release_all(1);

        waiter.join().unwrap().unwrap();
        assert!(lm.is_exclusively_locked(&key(100)));
    }

    #[test]
    fn test_wait_unlocked() {
        let lm = Arc::new(SlotLockManager::new());
        assert!(lm.wait_unlocked(&key(100), Duration::from_millis(1)));

        lm.acquire_exclusive(1, &key(100), None).unwrap();
        assert!(!lm.wait_unlocked(&key(100), Duration::from_millis(5)));

        let releaser = {
            let lm = Arc::clone(&lm);
            thread::spawn(move || {
                thread::sleep(Duration::from_millis(10));
                lm.release_all(1);
            })
        };
        assert!(lm.wait_unlocked(&key(100), Duration::from_secs(5)));
        releaser.join().unwrap();
    }

    #[test]
    fn test_acquire_all_is_all_or_nothing() {
        let lm = SlotLockManager::new();
        lm.acquire_exclusive(9, &key(3), None).unwrap();

        let keys = vec![key(3), key(1), key(2), key(1)];
        assert!(lm.acquire_all(1, &keys, LockMode::Exclusive, None).is_err());
        assert!(!lm.is_locked(&key(1)));
        assert!(!lm.is_locked(&key(2)));

        lm.release_all(9);
        lm.acquire_all(1, &keys, LockMode::Exclusive, None).unwrap();
        assert_eq!(lm.stats().total_locked_slots, 3);
    }

    #[test]
    fn test_guard_releases_on_drop() {
        let lm = SlotLockManager::new();
        {
            let guard = SlotGuard::new(&lm);
            lm.acquire_exclusive(guard.holder(), &key(1), None).unwrap();
            assert!(lm.is_locked(&key(1)));
        }
        assert!(!lm.is_locked(&key(1)));
    }

    #[test]
    fn test_concurrent_exclusive_serializes() {
        let lm = Arc::new(SlotLockManager::new());
        let counter = Arc::new(Mutex::new(0u32));
        let mut handles = vec![];

        for _ in 0..8 {
            let lm = Arc::clone(&lm);
            let counter = Arc::clone(&counter);
            handles.push(thread::spawn(move || {
                let holder = lm.new_holder();
                lm.acquire_exclusive(holder, &key(100), Some(Duration::from_secs(5)))
                    .unwrap();
                *counter.lock() += 1;
                lm.release_all(holder);
            }));
        }

        for handle in handles {
            handle.join().unwrap();
        }

        assert_eq!(*counter.lock(), 8);
        assert_eq!(lm.stats().active_holders, 0);
    }
}
