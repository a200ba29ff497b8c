//! Read/Write Gateway - public entry point of the entity cache
//!
//! ## Read path
//! 1. keys in non-cacheable, suspect or bypassed regions are read straight
//!    through (the result is not cached)
//! 2. a slot held by a writer follows `LockedSlotPolicy` (wait or miss)
//! 3. hit: decode the snapshot
//! 4. miss: run the loader (cancellable, bounded by the load timeout), then
//!    insert at the loaded version; the store rejects the insert if a commit
//!    invalidated the key in the meantime
//!
//! ## Write path
//! 1. exclusive slot locks on every key of the batch (ascending key order)
//! 2. mark the resident entries dirty
//! 3. commit to the database; the coherence coordinator invalidates the keys
//!    and bumps the invalidation sequence before the commit returns
//! 4. write the committed snapshots through to the cache
//! 5. release the locks

use crate::cache::eviction::build_policy;
use crate::cache::query_cache::{QueryCache, QueryCacheStats, QueryKey};
use crate::cache::store::{CacheEntry, CacheStats, CacheStore, PutOutcome};
use crate::config::{CacheConfig, LockedSlotPolicy};
use crate::database::{Commit, Database, WriteBatch};
use crate::txn::coordinator::{CoherenceCoordinator, CoherenceStats, InvalidationListener};
use crate::txn::lock_manager::{LockManagerStats, LockMode, SlotGuard, SlotLockManager};
use crate::types::{decode, encode, EntityKey, Row, Versioned, Version};
use crate::{CacheError, Result};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info};

/// Cancels an in-flight read-through load
#[derive(Debug, Clone, Default)]
pub struct CancelHandle(Arc<AtomicBool>);

impl CancelHandle {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Per-read options
#[derive(Debug, Clone, Default)]
pub struct ReadOptions {
    /// Overrides `load_timeout_ms`, capped at `coherence.tombstone_ttl_ms`
    pub timeout: Option<Duration>,
    pub cancel: Option<CancelHandle>,
}

impl ReadOptions {
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn with_cancel(mut self, cancel: CancelHandle) -> Self {
        self.cancel = Some(cancel);
        self
    }
}

/// Handed to loaders so long loads can stop early
pub struct LoadContext<'a> {
    key: &'a EntityKey,
    started: Instant,
    deadline: Option<Instant>,
    cancel: Option<&'a CancelHandle>,
}

impl<'a> LoadContext<'a> {
    fn new(key: &'a EntityKey, timeout: Option<Duration>, cancel: Option<&'a CancelHandle>) -> Self {
        let started = Instant::now();
        Self {
            key,
            started,
            deadline: timeout.map(|timeout| started + timeout),
            cancel,
        }
    }

    pub fn key(&self) -> &EntityKey {
        self.key
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.map_or(false, CancelHandle::is_cancelled)
    }

    /// Time left before the load times out
    pub fn remaining(&self) -> Option<Duration> {
        self.deadline
            .map(|deadline| deadline.saturating_duration_since(Instant::now()))
    }

    /// Err if the load was cancelled or ran past its deadline
    pub fn check(&self) -> Result<()> {
        if self.is_cancelled() {
            return Err(CacheError::LoadCancelled(self.key.clone()));
        }
        if let Some(deadline) = self.deadline {
            if Instant::now() >= deadline {
                return Err(CacheError::LoadTimedOut {
                    key: self.key.clone(),
                    elapsed: self.started.elapsed(),
                });
            }
        }
        Ok(())
    }
}

/// Keeps a key resident (shared slot lock) until dropped
pub struct PinGuard<'a> {
    key: EntityKey,
    _guard: SlotGuard<'a>,
}

impl PinGuard<'_> {
    pub fn key(&self) -> &EntityKey {
        &self.key
    }
}

/// Result of one maintenance tick
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TickReport {
    pub expired: usize,
    pub evicted: usize,
    pub tombstones_purged: usize,
}

#[derive(Default)]
struct Counters {
    loads: AtomicU64,
    bypassed_reads: AtomicU64,
    locked_slot_misses: AtomicU64,
    writes: AtomicU64,
    failed_writes: AtomicU64,
}

/// Gateway statistics
#[derive(Debug, Clone, PartialEq)]
pub struct GatewayStats {
    pub cache: CacheStats,
    pub coherence: CoherenceStats,
    pub queries: QueryCacheStats,
    pub locks: LockManagerStats,
    /// Loader invocations
    pub loads: u64,
    /// Reads served without the cache (non-cacheable, suspect or bypassed)
    pub bypassed_reads: u64,
    /// Reads that met a writer-held slot and went to the database
    pub locked_slot_misses: u64,
    pub writes: u64,
    pub failed_writes: u64,
}

/// Read-through / write-through entity cache in front of a `Database`
pub struct Gateway {
    config: CacheConfig,
    db: Arc<dyn Database>,
    store: Arc<CacheStore>,
    locks: SlotLockManager,
    coordinator: Arc<CoherenceCoordinator>,
    queries: Arc<QueryCache>,
    counters: Counters,
}

impl Gateway {
    /// Build the cache and subscribe its coordinator to `db` commits
    pub fn new(db: Arc<dyn Database>, config: CacheConfig) -> Result<Self> {
        config.validate()?;

        let store = Arc::new(CacheStore::new(
            config.max_entries,
            build_policy(config.eviction_policy),
        ));
        let coordinator = Arc::new(CoherenceCoordinator::new(
            Arc::clone(&store),
            config.coherence.clone(),
        ));
        let queries = Arc::new(QueryCache::new(config.query_cache_size));

        coordinator.add_listener(queries.clone());
        db.subscribe(coordinator.clone());

        info!(
            max_entries = config.max_entries,
            policy = config.eviction_policy.description(),
            query_cache_size = config.query_cache_size,
            "entity cache ready"
        );

        Ok(Self {
            config,
            db,
            store,
            locks: SlotLockManager::new(),
            coordinator,
            queries,
            counters: Counters::default(),
        })
    }

    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    pub fn database(&self) -> &Arc<dyn Database> {
        &self.db
    }

    pub fn store(&self) -> &CacheStore {
        &self.store
    }

    pub fn locks(&self) -> &SlotLockManager {
        &self.locks
    }

    pub fn coordinator(&self) -> &CoherenceCoordinator {
        &self.coordinator
    }

    pub fn query_cache(&self) -> &QueryCache {
        &self.queries
    }

    /// Register an additional invalidation listener (e.g. a peer node)
    pub fn add_listener(&self, listener: Arc<dyn InvalidationListener>) {
        self.coordinator.add_listener(listener);
    }

    /// Whether the cache may serve or store this key right now
    fn caches(&self, key: &EntityKey) -> bool {
        self.config.is_cacheable(key.entity()) && self.coordinator.admits(key)
    }

    fn is_pinned(&self, key: &EntityKey) -> bool {
        self.locks.is_locked(key)
    }

    // ==================== Reads ====================

    /// Cached value, or the loader's result cached at its version
    pub fn read<T, F>(&self, key: &EntityKey, loader: F) -> Result<Option<T>>
    where
        T: Serialize + DeserializeOwned,
        F: FnOnce() -> Result<Option<Versioned<T>>>,
    {
        self.read_with(key, ReadOptions::default(), |_| loader())
    }

    /// `read` with timeout / cancellation
    pub fn read_with<T, F>(&self, key: &EntityKey, options: ReadOptions, loader: F) -> Result<Option<T>>
    where
        T: Serialize + DeserializeOwned,
        F: FnOnce(&LoadContext<'_>) -> Result<Option<Versioned<T>>>,
    {
        Ok(self
            .read_versioned_with(key, options, loader)?
            .map(|versioned| versioned.value))
    }

    /// Like `read_with` but also returns the version the value was read at
    pub fn read_versioned_with<T, F>(
        &self,
        key: &EntityKey,
        options: ReadOptions,
        loader: F,
    ) -> Result<Option<Versioned<T>>>
    where
        T: Serialize + DeserializeOwned,
        F: FnOnce(&LoadContext<'_>) -> Result<Option<Versioned<T>>>,
    {
        let row = self.read_row(key, &options, |ctx| match loader(ctx)? {
            Some(loaded) => Ok(Some(Row::new(loaded.version, encode(&loaded.value)?))),
            None => Ok(None),
        })?;
        decode_row(row)
    }

    /// Read with the database as loader
    pub fn get<T: DeserializeOwned>(&self, key: &EntityKey) -> Result<Option<T>> {
        Ok(self.get_versioned(key)?.map(|versioned| versioned.value))
    }

    pub fn get_versioned<T: DeserializeOwned>(&self, key: &EntityKey) -> Result<Option<Versioned<T>>> {
        let row = self.read_row(key, &ReadOptions::default(), |_| self.db.load(key))?;
        decode_row(row)
    }

    fn read_row<F>(&self, key: &EntityKey, options: &ReadOptions, loader: F) -> Result<Option<Row>>
    where
        F: FnOnce(&LoadContext<'_>) -> Result<Option<Row>>,
    {
        if !self.caches(key) {
            self.counters.bypassed_reads.fetch_add(1, Ordering::Relaxed);
            debug!(%key, "read bypasses cache");
            return self.load(key, options, loader);
        }

        let mut cache_result = true;
        if self.locks.is_exclusively_locked(key) {
            cache_result = match self.config.locked_slot_policy {
                LockedSlotPolicy::Block => self.locks.wait_unlocked(key, self.config.read_wait()),
                LockedSlotPolicy::Miss => false,
            };
        }

        if cache_result {
            if let Some(entry) = self.store.get(key) {
                if !entry.dirty {
                    return Ok(Some(Row::new(entry.version, entry.value)));
                }
                // Write in flight
                cache_result = false;
            }
        }

        if !cache_result {
            self.counters.locked_slot_misses.fetch_add(1, Ordering::Relaxed);
            debug!(%key, "slot held by writer, reading through");
        }

        let loaded = self.load(key, options, loader)?;

        if cache_result {
            if let Some(row) = &loaded {
                self.populate(key, row);
            }
        }

        Ok(loaded)
    }

    fn load<F>(&self, key: &EntityKey, options: &ReadOptions, loader: F) -> Result<Option<Row>>
    where
        F: FnOnce(&LoadContext<'_>) -> Result<Option<Row>>,
    {
        // A load must end before the tombstone it races against is purged
        let tombstone_ttl = self.config.coherence.tombstone_ttl();
        let timeout = options
            .timeout
            .or_else(|| self.config.load_timeout())
            .map_or(tombstone_ttl, |timeout| timeout.min(tombstone_ttl));
        let ctx = LoadContext::new(key, Some(timeout), options.cancel.as_ref());
        ctx.check()?;

        self.counters.loads.fetch_add(1, Ordering::Relaxed);
        let loaded = loader(&ctx)?;

        // A cancelled or late load is discarded, never cached
        ctx.check()?;
        Ok(loaded)
    }

    /// Insert a freshly loaded row unless a writer holds the slot
    fn populate(&self, key: &EntityKey, row: &Row) {
        let guard = SlotGuard::new(&self.locks);
        if self
            .locks
            .acquire(guard.holder(), key, LockMode::Shared, None)
            .is_err()
        {
            return;
        }

        let entry = CacheEntry::new(key.clone(), row.data.clone(), row.version)
            .with_ttl(self.config.ttl_for(key.entity()));
        let outcome = self.store.put(key, entry);
        drop(guard);

        if outcome.is_accepted() {
            self.store.evict_overflow(&|k: &EntityKey| self.is_pinned(k));
        }
    }

    // ==================== Writes ====================

    /// Apply `mutator` to the entity in a database transaction and write the
    /// result through; returns the committed version
    pub fn write<T, F>(&self, key: &EntityKey, mutator: F) -> Result<Version>
    where
        T: Serialize + DeserializeOwned,
        F: FnOnce(Option<T>) -> Result<T>,
    {
        self.write_inner(key, None, mutator)
    }

    /// Optimistic `write`: fails with `StaleWriteRejected` unless the row is
    /// at `expected_version` (0 = absent)
    pub fn write_expecting<T, F>(&self, key: &EntityKey, expected_version: Version, mutator: F) -> Result<Version>
    where
        T: Serialize + DeserializeOwned,
        F: FnOnce(Option<T>) -> Result<T>,
    {
        self.write_inner(key, Some(expected_version), mutator)
    }

    fn write_inner<T, F>(&self, key: &EntityKey, expected_version: Option<Version>, mutator: F) -> Result<Version>
    where
        T: Serialize + DeserializeOwned,
        F: FnOnce(Option<T>) -> Result<T>,
    {
        let mutation = move |current: Option<&[u8]>| -> Result<Option<Vec<u8>>> {
            let current = current.map(decode::<T>).transpose()?;
            let next = mutator(current)?;
            Ok(Some(bincode::serialize(&next)?))
        };

        let batch = match expected_version {
            Some(expected) => WriteBatch::new().modify_expecting(key.clone(), expected, mutation),
            None => WriteBatch::new().modify(key.clone(), mutation),
        };

        let commit = self.write_batch(batch)?;
        committed_version(&commit, key)
    }

    /// Delete the entity; returns the version of the deletion
    pub fn delete(&self, key: &EntityKey) -> Result<Version> {
        let commit = self.write_batch(WriteBatch::new().delete(key.clone()))?;
        committed_version(&commit, key)
    }

    /// Commit a multi-key transaction and write every change through
    ///
    /// A `CoherenceViolation` means the batch *is* committed but some
    /// invalidation went unconfirmed; the affected keys are in bypass mode.
    pub fn write_batch(&self, batch: WriteBatch<'_>) -> Result<Commit> {
        let keys = batch.keys();
        let guard = SlotGuard::new(&self.locks);
        self.locks.acquire_all(
            guard.holder(),
            &keys,
            LockMode::Exclusive,
            Some(self.config.lock_timeout()),
        )?;

        for key in &keys {
            self.store.mark_dirty(key);
        }

        let commit = match self.db.commit(batch) {
            Ok(commit) => commit,
            Err(e) => {
                for key in &keys {
                    self.store.clear_dirty(key);
                }
                self.counters.failed_writes.fetch_add(1, Ordering::Relaxed);
                debug!(keys = keys.len(), error = %e, "write failed");
                return Err(e);
            }
        };
        self.counters.writes.fetch_add(1, Ordering::Relaxed);

        // Usually already done by the commit notification
        let confirmed = self.coordinator.confirm(&commit);

        for change in &commit.changes {
            match &change.data {
                Some(data) if self.caches(&change.key) => {
                    let entry = CacheEntry::new(change.key.clone(), data.clone(), change.version)
                        .with_ttl(self.config.ttl_for(change.key.entity()));
                    self.store.install(&change.key, entry);
                }
                _ => {
                    self.store.retire_committed(&change.key, change.version);
                }
            }
        }
        for key in &keys {
            if commit.change(key).is_none() {
                self.store.clear_dirty(key);
            }
        }

        drop(guard);
        self.store.evict_overflow(&|k: &EntityKey| self.is_pinned(k));

        confirmed?;
        Ok(commit)
    }

    // ==================== Direct cache access ====================

    /// Put a value at `version` without touching the database
    ///
    /// `version` must be a version the database has committed. Rejected if not
    /// newer than what the cache already knows, if a writer holds the slot, or
    /// if the key is not cacheable right now. A later committed write replaces
    /// the entry even when its version is lower.
    pub fn put<T: Serialize>(&self, key: &EntityKey, value: &T, version: Version) -> Result<PutOutcome> {
        let rejected = || PutOutcome::Rejected {
            current: self.store.version_of(key).unwrap_or(0),
        };
        if !self.caches(key) {
            return Ok(rejected());
        }

        let entry = CacheEntry::new(key.clone(), encode(value)?, version)
            .with_ttl(self.config.ttl_for(key.entity()));

        let guard = SlotGuard::new(&self.locks);
        if self
            .locks
            .acquire(guard.holder(), key, LockMode::Shared, None)
            .is_err()
        {
            return Ok(rejected());
        }
        let outcome = self.store.put(key, entry);
        drop(guard);
        if outcome.is_accepted() {
            self.store.evict_overflow(&|k: &EntityKey| self.is_pinned(k));
        }
        Ok(outcome)
    }

    /// Drop the cached entry for a key
    pub fn invalidate(&self, key: &EntityKey) -> bool {
        self.store.discard(key)
    }

    /// Drop every cached entry and query result of an entity type
    pub fn invalidate_region(&self, entity: &str) -> usize {
        let dropped = self.store.invalidate_region(entity);
        let queries = self.queries.invalidate_space(entity);
        info!(entity, dropped, queries, "region invalidated");
        dropped
    }

    /// Keep a key from being evicted (and from being written) while the guard lives
    pub fn pin(&self, key: &EntityKey) -> Result<PinGuard<'_>> {
        let guard = SlotGuard::new(&self.locks);
        self.locks
            .acquire_shared(guard.holder(), key, Some(self.config.lock_timeout()))?;
        Ok(PinGuard {
            key: key.clone(),
            _guard: guard,
        })
    }

    /// Run expiry, overflow eviction and tombstone / coordinator housekeeping
    pub fn tick(&self) -> TickReport {
        let now = Instant::now();
        let is_pinned = |k: &EntityKey| self.is_pinned(k);

        let report = TickReport {
            expired: self.store.expire(now, &is_pinned),
            evicted: self.store.evict_overflow(&is_pinned),
            tombstones_purged: self
                .store
                .purge_tombstones(self.config.coherence.tombstone_ttl()),
        };
        self.coordinator.maintain(now);

        if report != TickReport::default() {
            debug!(?report, "tick");
        }
        report
    }

    // ==================== Queries ====================

    /// Run a cacheable query
    ///
    /// `spaces` are the entity types the query reads; a commit to any of them
    /// invalidates the cached result. The loader returns matching rows.
    pub fn query<T, F>(&self, query: &QueryKey, spaces: &[&str], loader: F) -> Result<Vec<T>>
    where
        T: DeserializeOwned,
        F: FnOnce(&dyn Database) -> Result<Vec<(EntityKey, Row)>>,
    {
        let cacheable = self.queries.is_enabled()
            && spaces.iter().all(|space| {
                self.config.is_cacheable(space) && !self.coordinator.is_suspect(space)
            });

        if cacheable {
            if let Some(keys) = self.queries.get(query) {
                if let Some(values) = self.assemble(&keys)? {
                    return Ok(values);
                }
                debug!(%query, "query result incomplete in entity cache, re-running");
            }
        }

        let seq = self.coordinator.current_seq();
        let rows = loader(self.db.as_ref())?;

        let mut keys = Vec::with_capacity(rows.len());
        let mut values = Vec::with_capacity(rows.len());
        for (key, row) in rows {
            values.push(decode(&row.data)?);
            if self.caches(&key) {
                self.populate(&key, &row);
            }
            keys.push(key);
        }

        if cacheable {
            let spaces = spaces.iter().map(|space| space.to_string()).collect();
            self.queries.put(query.clone(), keys, spaces, seq);
        }
        Ok(values)
    }

    /// Entities of a cached query result, or None if any is not servable
    fn assemble<T: DeserializeOwned>(&self, keys: &[EntityKey]) -> Result<Option<Vec<T>>> {
        let mut values = Vec::with_capacity(keys.len());
        for key in keys {
            if !self.caches(key) || self.locks.is_exclusively_locked(key) {
                return Ok(None);
            }
            match self.store.get(key) {
                Some(entry) if !entry.dirty => values.push(decode(&entry.value)?),
                _ => return Ok(None),
            }
        }
        Ok(Some(values))
    }

    // ==================== Stats ====================

    pub fn stats(&self) -> GatewayStats {
        GatewayStats {
            cache: self.store.stats(),
            coherence: self.coordinator.stats(),
            queries: self.queries.stats(),
            locks: self.locks.stats(),
            loads: self.counters.loads.load(Ordering::Relaxed),
            bypassed_reads: self.counters.bypassed_reads.load(Ordering::Relaxed),
            locked_slot_misses: self.counters.locked_slot_misses.load(Ordering::Relaxed),
            writes: self.counters.writes.load(Ordering::Relaxed),
            failed_writes: self.counters.failed_writes.load(Ordering::Relaxed),
        }
    }
}

fn decode_row<T: DeserializeOwned>(row: Option<Row>) -> Result<Option<Versioned<T>>> {
    match row {
        Some(row) => Ok(Some(Versioned::new(row.version, decode(&row.data)?))),
        None => Ok(None),
    }
}

fn committed_version(commit: &Commit, key: &EntityKey) -> Result<Version> {
    commit
        .change(key)
        .map(|change| change.version)
        .ok_or_else(|| CacheError::Database(format!("commit {} carries no change for {}", commit.seq, key)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{EvictionPolicyKind, RegionConfig};
    use crate::database::MemoryDatabase;
    use crate::txn::coordinator::InvalidationMessage;
    use serde::Deserialize;
    use std::sync::atomic::AtomicUsize;
    use std::thread;

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct User {
        name: String,
    }

    fn user(name: &str) -> User {
        User {
            name: name.to_string(),
        }
    }

    fn key(id: i64) -> EntityKey {
        EntityKey::new("User", id)
    }

    fn setup_with(config: CacheConfig) -> (Arc<MemoryDatabase>, Gateway) {
        let db = Arc::new(MemoryDatabase::new());
        let gateway = Gateway::new(db.clone(), config).unwrap();
        (db, gateway)
    }

    fn setup() -> (Arc<MemoryDatabase>, Gateway) {
        setup_with(CacheConfig::for_testing())
    }

    fn set_name(name: &'static str) -> impl FnOnce(Option<User>) -> Result<User> {
        move |_| Ok(user(name))
    }

    struct Unreachable;

    impl InvalidationListener for Unreachable {
        fn name(&self) -> &str {
            "unreachable-peer"
        }

        fn invalidate(&self, _message: &InvalidationMessage) -> Result<()> {
            Err(CacheError::Database("connection refused".into()))
        }
    }

    #[test]
    fn test_write_then_read_skips_loader() {
        let (_db, gateway) = setup();
        let calls = AtomicUsize::new(0);

        let version = gateway.write(&key(1), set_name("Alice")).unwrap();
        assert_eq!(version, 1);

        let read: Option<User> = gateway
            .read(&key(1), || {
                calls.fetch_add(1, Ordering::SeqCst);
                Ok(None)
            })
            .unwrap();

        assert_eq!(read, Some(user("Alice")));
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_no_stale_read_after_write() {
        let (db, gateway) = setup();
        gateway.write(&key(1), set_name("Alice")).unwrap();
        assert_eq!(gateway.get::<User>(&key(1)).unwrap(), Some(user("Alice")));

        gateway
            .write(&key(1), |current: Option<User>| {
                let mut user = current.unwrap_or_else(|| user("?"));
                user.name.push_str(" Smith");
                Ok(user)
            })
            .unwrap();

        let loads = db.stats().loads;
        assert_eq!(
            gateway.get::<User>(&key(1)).unwrap(),
            Some(user("Alice Smith"))
        );
        assert_eq!(db.stats().loads, loads);
        assert_eq!(gateway.store().peek(&key(1)).unwrap().version, 2);
        assert_eq!(gateway.coordinator().current_seq(), 2);
    }

    #[test]
    fn test_read_through_caches_at_loaded_version() {
        let (db, gateway) = setup();
        db.commit(WriteBatch::new().put(key(1), bincode::serialize(&user("Bob")).unwrap()))
            .unwrap();

        assert_eq!(gateway.get::<User>(&key(1)).unwrap(), Some(user("Bob")));
        assert_eq!(gateway.get::<User>(&key(1)).unwrap(), Some(user("Bob")));
        assert_eq!(db.stats().loads, 1);

        // Missing rows are not cached
        assert_eq!(gateway.get::<User>(&key(2)).unwrap(), None);
        assert!(gateway.store().peek(&key(2)).is_none());

        let stats = gateway.stats();
        assert_eq!(stats.cache.hits, 1);
        assert_eq!(stats.loads, 2);
    }

    #[test]
    fn test_commit_during_load_is_not_cached() {
        let (db, gateway) = setup();
        db.commit(WriteBatch::new().put(key(1), bincode::serialize(&user("v1")).unwrap()))
            .unwrap();

        // The loader reads v1, then a concurrent commit installs v2
        let stale: Option<User> = gateway
            .read(&key(1), || {
                let row = db.load(&key(1))?.unwrap();
                db.commit(WriteBatch::new().put(key(1), bincode::serialize(&user("v2")).unwrap()))?;
                Ok(Some(Versioned::new(row.version, decode(&row.data)?)))
            })
            .unwrap();
        assert_eq!(stale, Some(user("v1")));
        assert!(gateway.store().peek(&key(1)).is_none());

        assert_eq!(gateway.get::<User>(&key(1)).unwrap(), Some(user("v2")));
        assert_eq!(gateway.store().peek(&key(1)).unwrap().version, 2);
    }

    #[test]
    fn test_concurrent_writers_versions_are_monotonic() {
        let (_db, gateway) = setup();
        let gateway = Arc::new(gateway);
        let counter = EntityKey::new("Counter", 1);

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let gateway = Arc::clone(&gateway);
                let counter = counter.clone();
                thread::spawn(move || {
                    for _ in 0..25 {
                        gateway
                            .write(&counter, |current: Option<u64>| Ok(current.unwrap_or(0) + 1))
                            .unwrap();
                    }
                })
            })
            .collect();

        for handle in handles {
            handle.join().unwrap();
        }

        let cached = gateway.store().peek(&counter).unwrap();
        assert_eq!(cached.version, 200);
        assert_eq!(gateway.get::<u64>(&counter).unwrap(), Some(200));
        assert_eq!(gateway.stats().writes, 200);
    }

    #[test]
    fn test_optimistic_write() {
        let (_db, gateway) = setup();
        let v1 = gateway.write_expecting(&key(1), 0, set_name("Alice")).unwrap();

        let err = gateway
            .write_expecting(&key(1), 0, set_name("Mallory"))
            .unwrap_err();
        assert!(matches!(
            err,
            CacheError::StaleWriteRejected { expected: 0, actual: 1, .. }
        ));

        // Failed write leaves the cached entry usable
        let cached = gateway.store().peek(&key(1)).unwrap();
        assert!(!cached.dirty);
        assert_eq!(gateway.get::<User>(&key(1)).unwrap(), Some(user("Alice")));

        gateway.write_expecting(&key(1), v1, set_name("Carol")).unwrap();
        assert_eq!(gateway.stats().failed_writes, 1);
    }

    #[test]
    fn test_delete_removes_entry() {
        let (_db, gateway) = setup();
        gateway.write(&key(1), set_name("Alice")).unwrap();
        assert_eq!(gateway.delete(&key(1)).unwrap(), 2);

        assert!(gateway.store().peek(&key(1)).is_none());
        assert_eq!(gateway.get::<User>(&key(1)).unwrap(), None);
    }

    #[test]
    fn test_write_batch_is_atomic() {
        let (_db, gateway) = setup();
        gateway.write(&key(1), set_name("Alice")).unwrap();

        let result = gateway.write_batch(
            WriteBatch::new()
                .put(key(1), bincode::serialize(&user("Eve")).unwrap())
                .modify(key(2), |_| Err(CacheError::Database("constraint violation".into()))),
        );
        assert!(result.is_err());
        assert_eq!(gateway.get::<User>(&key(1)).unwrap(), Some(user("Alice")));

        let commit = gateway
            .write_batch(
                WriteBatch::new()
                    .put(key(2), bincode::serialize(&user("Bob")).unwrap())
                    .put(key(1), bincode::serialize(&user("Eve")).unwrap()),
            )
            .unwrap();
        assert_eq!(commit.changes.len(), 2);
        assert_eq!(gateway.get::<User>(&key(1)).unwrap(), Some(user("Eve")));
        assert_eq!(gateway.store().peek(&key(2)).unwrap().version, 1);
    }

    #[test]
    fn test_put_respects_versions() {
        let (_db, gateway) = setup();
        assert_eq!(
            gateway.put(&key(1), &user("v5"), 5).unwrap(),
            PutOutcome::Inserted
        );
        assert!(!gateway.put(&key(1), &user("v4"), 4).unwrap().is_accepted());
        assert!(!gateway.put(&key(1), &user("v5'"), 5).unwrap().is_accepted());

        let read: Option<User> = gateway.read(&key(1), || Ok(None)).unwrap();
        assert_eq!(read, Some(user("v5")));
    }

    #[test]
    fn test_eviction_skips_locked_keys() {
        let mut config = CacheConfig::for_testing();
        config.max_entries = 2;
        let (_db, gateway) = setup_with(config);

        gateway.put(&key(1), &user("oldest"), 1).unwrap();

        // In-flight writer on key 1
        let holder = gateway.locks().new_holder();
        gateway
            .locks()
            .acquire_exclusive(holder, &key(1), None)
            .unwrap();

        for id in 2..=4 {
            gateway.put(&key(id), &user("u"), 1).unwrap();
        }
        gateway.tick();

        assert!(gateway.store().peek(&key(1)).is_some());
        assert_eq!(gateway.store().size(), 2);

        gateway.locks().release_all(holder);

        // Pins hold keys the same way
        let pin = gateway.pin(&key(4)).unwrap();
        assert_eq!(pin.key(), &key(4));
        for id in 5..=7 {
            gateway.put(&key(id), &user("u"), 1).unwrap();
        }
        assert!(gateway.store().peek(&key(4)).is_some());
        drop(pin);
        assert!(!gateway.locks().is_locked(&key(4)));
    }

    #[test]
    fn test_zero_ttl_expires_on_tick() {
        let mut config = CacheConfig::for_testing();
        config.default_ttl_ms = Some(0);
        config.eviction_policy = EvictionPolicyKind::LruTtl;
        let (_db, gateway) = setup_with(config);

        gateway.put(&key(1), &user("Alice"), 1).unwrap();
        let report = gateway.tick();
        assert_eq!(report.expired, 1);

        assert!(gateway.store().get(&key(1)).is_none());
        let calls = AtomicUsize::new(0);
        let _: Option<User> = gateway
            .read(&key(1), || {
                calls.fetch_add(1, Ordering::SeqCst);
                Ok(None)
            })
            .unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_expired_entry_is_cached_again_on_reload() {
        let mut config = CacheConfig::for_testing();
        config.default_ttl_ms = Some(20);
        config.eviction_policy = EvictionPolicyKind::LruTtl;
        let (db, gateway) = setup_with(config);

        gateway.write(&key(1), set_name("Alice")).unwrap();
        thread::sleep(Duration::from_millis(40));

        // No tick: the reload at the same version replaces the expired entry
        let loads = db.stats().loads;
        for _ in 0..5 {
            assert_eq!(gateway.get::<User>(&key(1)).unwrap(), Some(user("Alice")));
        }
        assert_eq!(db.stats().loads, loads + 1);
        assert_eq!(gateway.stats().cache.stale_rejected, 0);
    }

    #[test]
    fn test_write_replaces_entry_put_ahead_of_database() {
        let (_db, gateway) = setup();
        assert_eq!(
            gateway.put(&key(1), &user("Ghost"), 5).unwrap(),
            PutOutcome::Inserted
        );

        assert_eq!(gateway.write(&key(1), set_name("Alice")).unwrap(), 1);

        let calls = AtomicUsize::new(0);
        let read: Option<User> = gateway
            .read(&key(1), || {
                calls.fetch_add(1, Ordering::SeqCst);
                Ok(None)
            })
            .unwrap();
        assert_eq!(read, Some(user("Alice")));
        assert_eq!(calls.load(Ordering::SeqCst), 0);

        let cached = gateway.store().peek(&key(1)).unwrap();
        assert_eq!(cached.version, 1);
        assert!(!cached.dirty);

        // Deletes drop such an entry too
        gateway.put(&key(2), &user("Ghost"), 5).unwrap();
        assert_eq!(gateway.delete(&key(2)).unwrap(), 1);
        assert!(gateway.store().peek(&key(2)).is_none());
        assert_eq!(gateway.get::<User>(&key(2)).unwrap(), None);
    }

    #[test]
    fn test_put_rejected_while_writer_holds_slot() {
        let (_db, gateway) = setup();
        let holder = gateway.locks().new_holder();
        gateway
            .locks()
            .acquire_exclusive(holder, &key(1), None)
            .unwrap();

        assert!(!gateway.put(&key(1), &user("Ghost"), 5).unwrap().is_accepted());
        assert!(gateway.store().peek(&key(1)).is_none());
        gateway.locks().release_all(holder);
    }

    #[test]
    fn test_read_timeout_capped_by_tombstone_lifetime() {
        let mut config = CacheConfig::for_testing();
        config.load_timeout_ms = Some(30);
        config.coherence.tombstone_ttl_ms = 30;
        let (_db, gateway) = setup_with(config);

        let result: Result<Option<User>> = gateway.read_with(
            &key(1),
            ReadOptions::default().with_timeout(Duration::from_secs(10)),
            |ctx| {
                assert!(ctx.remaining().unwrap() <= Duration::from_millis(30));
                thread::sleep(Duration::from_millis(60));
                Ok(Some(Versioned::new(1, user("Alice"))))
            },
        );
        assert!(matches!(result, Err(CacheError::LoadTimedOut { .. })));
        assert!(gateway.store().peek(&key(1)).is_none());
    }

    #[test]
    fn test_unset_load_timeout_cannot_outlive_tombstone() {
        let mut config = CacheConfig::for_testing();
        config.load_timeout_ms = None;
        config.coherence.tombstone_ttl_ms = 30;
        let (db, gateway) = setup_with(config);
        db.commit(WriteBatch::new().put(key(1), bincode::serialize(&user("v1")).unwrap()))
            .unwrap();

        // Reads v1, a commit outside the cache installs v2, the tombstone is purged
        let result: Result<Option<User>> = gateway.read_with(&key(1), ReadOptions::default(), |_| {
            let row = db.load(&key(1))?.unwrap();
            db.commit(WriteBatch::new().put(key(1), bincode::serialize(&user("v2")).unwrap()))?;
            thread::sleep(Duration::from_millis(60));
            assert_eq!(gateway.tick().tombstones_purged, 1);
            Ok(Some(Versioned::new(row.version, decode(&row.data)?)))
        });
        assert!(matches!(result, Err(CacheError::LoadTimedOut { .. })));
        assert!(gateway.store().peek(&key(1)).is_none());

        assert_eq!(gateway.get::<User>(&key(1)).unwrap(), Some(user("v2")));
        assert_eq!(db.version_of(&key(1)), 2);
    }

    #[test]
    fn test_dropped_gateway_unsubscribes() {
        let (db, gateway) = setup();
        assert_eq!(db.listener_count(), 1);
        let second = Gateway::new(db.clone(), CacheConfig::for_testing()).unwrap();
        assert_eq!(db.listener_count(), 2);

        drop(second);
        assert_eq!(db.listener_count(), 1);

        gateway.write(&key(1), set_name("Alice")).unwrap();
        assert_eq!(gateway.coordinator().current_seq(), 1);
    }

    #[test]
    fn test_cancelled_load_inserts_nothing() {
        let (_db, gateway) = setup();
        let cancel = CancelHandle::new();

        let result: Result<Option<User>> = gateway.read_with(
            &key(1),
            ReadOptions::default().with_cancel(cancel.clone()),
            |_| {
                cancel.cancel();
                Ok(Some(Versioned::new(1, user("Alice"))))
            },
        );
        assert!(matches!(result, Err(CacheError::LoadCancelled(_))));
        assert!(gateway.store().peek(&key(1)).is_none());

        // Already cancelled: the loader never runs
        let result: Result<Option<User>> = gateway.read_with(
            &key(1),
            ReadOptions::default().with_cancel(cancel),
            |_| panic!("loader must not run"),
        );
        assert!(matches!(result, Err(CacheError::LoadCancelled(_))));
    }

    #[test]
    fn test_timed_out_load_inserts_nothing() {
        let (_db, gateway) = setup();

        let result: Result<Option<User>> = gateway.read_with(
            &key(1),
            ReadOptions::default().with_timeout(Duration::from_millis(5)),
            |ctx| {
                assert!(ctx.remaining().is_some());
                thread::sleep(Duration::from_millis(20));
                Ok(Some(Versioned::new(1, user("Alice"))))
            },
        );
        assert!(matches!(result, Err(CacheError::LoadTimedOut { .. })));
        assert!(gateway.store().peek(&key(1)).is_none());
    }

    #[test]
    fn test_database_unavailable_propagates() {
        let (db, gateway) = setup();
        gateway.write(&key(1), set_name("Alice")).unwrap();
        db.set_available(false);

        assert!(matches!(
            gateway.get::<User>(&key(2)),
            Err(CacheError::DatabaseUnavailable(_))
        ));
        let err = gateway.write(&key(1), set_name("Bob")).unwrap_err();
        assert!(err.is_database());

        // Loader failures are never masked
        let result: Result<Option<User>> =
            gateway.read(&key(3), || Err(CacheError::DatabaseUnavailable("down".into())));
        assert!(result.is_err());
        assert!(gateway.store().peek(&key(3)).is_none());

        // The committed value is still served
        assert_eq!(gateway.get::<User>(&key(1)).unwrap(), Some(user("Alice")));
    }

    #[test]
    fn test_coherence_violation_enters_bypass() {
        let (db, gateway) = setup();
        gateway.write(&key(2), set_name("Bob")).unwrap();
        gateway.add_listener(Arc::new(Unreachable));

        let err = gateway.write(&key(1), set_name("Alice")).unwrap_err();
        assert!(matches!(err, CacheError::CoherenceViolation { version: 1, .. }));

        // Committed anyway, but neither cached nor served from cache
        assert_eq!(db.version_of(&key(1)), 1);
        assert!(gateway.store().peek(&key(1)).is_none());
        assert!(gateway.store().peek(&key(2)).is_none());

        let loads = db.stats().loads;
        assert_eq!(gateway.get::<User>(&key(1)).unwrap(), Some(user("Alice")));
        assert_eq!(gateway.get::<User>(&key(1)).unwrap(), Some(user("Alice")));
        assert_eq!(db.stats().loads, loads + 2);

        let stats = gateway.stats();
        assert_eq!(stats.coherence.violations, 1);
        assert_eq!(stats.bypassed_reads, 2);
        assert!(gateway.store().peek(&key(1)).is_none());
    }

    #[test]
    fn test_locked_slot_miss_policy() {
        let mut config = CacheConfig::for_testing();
        config.locked_slot_policy = LockedSlotPolicy::Miss;
        let (_db, gateway) = setup_with(config);
        gateway.put(&key(1), &user("cached"), 1).unwrap();

        let holder = gateway.locks().new_holder();
        gateway
            .locks()
            .acquire_exclusive(holder, &key(1), None)
            .unwrap();

        let read: Option<User> = gateway
            .read(&key(1), || Ok(Some(Versioned::new(1, user("from db")))))
            .unwrap();
        assert_eq!(read, Some(user("from db")));
        assert_eq!(gateway.stats().locked_slot_misses, 1);

        gateway.locks().release_all(holder);
        let read: Option<User> = gateway.read(&key(1), || Ok(None)).unwrap();
        assert_eq!(read, Some(user("cached")));
    }

    #[test]
    fn test_locked_slot_block_policy_waits_for_writer() {
        let mut config = CacheConfig::for_testing();
        config.locked_slot_policy = LockedSlotPolicy::Block;
        config.read_wait_ms = 2_000;
        let (_db, gateway) = setup_with(config);
        let gateway = Arc::new(gateway);
        gateway.put(&key(1), &user("cached"), 1).unwrap();

        let holder = gateway.locks().new_holder();
        gateway
            .locks()
            .acquire_exclusive(holder, &key(1), None)
            .unwrap();

        let releaser = {
            let gateway = Arc::clone(&gateway);
            thread::spawn(move || {
                thread::sleep(Duration::from_millis(20));
                gateway.locks().release_all(holder);
            })
        };

        let read: Option<User> = gateway
            .read(&key(1), || panic!("loader must not run"))
            .unwrap();
        assert_eq!(read, Some(user("cached")));
        releaser.join().unwrap();
        assert_eq!(gateway.stats().locked_slot_misses, 0);
    }

    #[test]
    fn test_locked_slot_block_policy_falls_through_on_timeout() {
        let mut config = CacheConfig::for_testing();
        config.locked_slot_policy = LockedSlotPolicy::Block;
        config.read_wait_ms = 10;
        let (_db, gateway) = setup_with(config);
        gateway.put(&key(1), &user("cached"), 1).unwrap();

        let holder = gateway.locks().new_holder();
        gateway
            .locks()
            .acquire_exclusive(holder, &key(1), None)
            .unwrap();

        let calls = AtomicUsize::new(0);
        let started = Instant::now();
        let read: Option<User> = gateway
            .read(&key(1), || {
                calls.fetch_add(1, Ordering::SeqCst);
                Ok(Some(Versioned::new(2, user("from db"))))
            })
            .unwrap();

        assert!(started.elapsed() >= Duration::from_millis(10));
        assert_eq!(read, Some(user("from db")));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(gateway.stats().locked_slot_misses, 1);

        // The read-through result was not cached
        let cached = gateway.store().peek(&key(1)).unwrap();
        assert_eq!(cached.version, 1);
        gateway.locks().release_all(holder);
    }

    #[test]
    fn test_non_cacheable_region_reads_through() {
        let mut config = CacheConfig::for_testing();
        config.regions.insert(
            "AuditLog".to_string(),
            RegionConfig {
                ttl_ms: None,
                cacheable: false,
            },
        );
        let (db, gateway) = setup_with(config);
        let entry = EntityKey::new("AuditLog", 1);

        gateway
            .write(&entry, |_: Option<String>| Ok("login".to_string()))
            .unwrap();
        assert!(gateway.store().peek(&entry).is_none());

        let loads = db.stats().loads;
        assert_eq!(gateway.get::<String>(&entry).unwrap(), Some("login".to_string()));
        assert_eq!(db.stats().loads, loads + 1);
        assert!(!gateway.put(&entry, &"x".to_string(), 9).unwrap().is_accepted());
    }

    #[test]
    fn test_invalidate_forces_reload() {
        let (db, gateway) = setup();
        gateway.write(&key(1), set_name("Alice")).unwrap();
        gateway.write(&key(2), set_name("Bob")).unwrap();

        assert!(gateway.invalidate(&key(1)));
        let loads = db.stats().loads;
        assert_eq!(gateway.get::<User>(&key(1)).unwrap(), Some(user("Alice")));
        assert_eq!(db.stats().loads, loads + 1);

        assert_eq!(gateway.invalidate_region("User"), 2);
        assert!(gateway.store().is_empty());
    }

    #[test]
    fn test_query_cache_invalidated_by_commit() {
        let (_db, gateway) = setup();
        gateway.write(&key(1), set_name("Alice")).unwrap();
        gateway.write(&key(2), set_name("Bob")).unwrap();

        let all_users = QueryKey::new("query.findAllUsers", "findAll");
        let runs = AtomicUsize::new(0);
        let run = |db: &dyn Database| {
            runs.fetch_add(1, Ordering::SeqCst);
            db.scan("User")
        };

        let users: Vec<User> = gateway.query(&all_users, &["User"], run).unwrap();
        assert_eq!(users, vec![user("Alice"), user("Bob")]);
        let users: Vec<User> = gateway.query(&all_users, &["User"], run).unwrap();
        assert_eq!(users.len(), 2);
        assert_eq!(runs.load(Ordering::SeqCst), 1);

        gateway.write(&key(3), set_name("Carol")).unwrap();
        let users: Vec<User> = gateway.query(&all_users, &["User"], run).unwrap();
        assert_eq!(users.len(), 3);
        assert_eq!(runs.load(Ordering::SeqCst), 2);

        // Evicted member entity: the query is re-run
        gateway.invalidate(&key(2));
        let _: Vec<User> = gateway.query(&all_users, &["User"], run).unwrap();
        assert_eq!(runs.load(Ordering::SeqCst), 3);

        let stats = gateway.stats().queries;
        assert_eq!(stats.stale, 1);
    }
}
