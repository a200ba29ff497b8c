//! Cache Store - concurrent keyed container of entity snapshots
//!
//! **Versioning**: every slot carries the version it was loaded or committed at.
//! A put never goes backwards: an entry whose version is <= the resident one is
//! rejected, and an invalidation leaves a tombstone that rejects anything older
//! than the invalidating commit.
//!
//! **Concurrency**: sharded map, so readers only take shard read locks and
//! recency updates go through the (non-blocking) eviction policy.

use crate::cache::eviction::{EvictionPolicy, PinnedFn};
use crate::types::{EntityKey, Snapshot, Version};
use ahash::RandomState;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// Cached entity snapshot with metadata
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheEntry {
    pub key: EntityKey,
    pub value: Snapshot,
    pub version: Version,
    pub last_access: Instant,
    pub expires_at: Option<Instant>,
    /// A write on this key is in flight; readers must not trust the snapshot
    pub dirty: bool,
}

impl CacheEntry {
    pub fn new(key: EntityKey, value: Snapshot, version: Version) -> Self {
        Self {
            key,
            value,
            version,
            last_access: Instant::now(),
            expires_at: None,
            dirty: false,
        }
    }

    /// Set the expiry deadline `ttl` from now
    pub fn with_ttl(mut self, ttl: Option<Duration>) -> Self {
        self.expires_at = ttl.map(|ttl| Instant::now() + ttl);
        self
    }

    pub fn is_expired(&self, now: Instant) -> bool {
        self.expires_at.map_or(false, |deadline| now >= deadline)
    }
}

/// Result of a put
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PutOutcome {
    /// Key had no live entry
    Inserted,
    /// Replaced an older live entry
    Replaced { previous: Version },
    /// Version not newer than the resident entry / tombstone; store unchanged
    Rejected { current: Version },
}

impl PutOutcome {
    pub fn is_accepted(&self) -> bool {
        !matches!(self, PutOutcome::Rejected { .. })
    }
}

/// Cache statistics
#[derive(Debug, Default, Clone, PartialEq)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub puts: u64,
    pub stale_rejected: u64,
    pub evictions: u64,
    pub expirations: u64,
    pub invalidations: u64,
    /// Current live entries
    pub size: usize,
    pub tombstones: usize,
    pub capacity: usize,
}

impl CacheStats {
    /// Calculate hit rate
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            self.hits as f64 / total as f64
        }
    }
}

struct Resident {
    value: Snapshot,
    version: Version,
    expires_at: Option<Instant>,
    dirty: AtomicBool,
    /// Nanos since the store epoch
    last_access: AtomicU64,
}

impl Resident {
    fn is_expired(&self, now: Instant) -> bool {
        self.expires_at.map_or(false, |deadline| now >= deadline)
    }
}

enum Slot {
    Live(Resident),
    Tombstone { version: Version, since: Instant },
}

#[derive(Default)]
struct Counters {
    hits: AtomicU64,
    misses: AtomicU64,
    puts: AtomicU64,
    stale_rejected: AtomicU64,
    evictions: AtomicU64,
    expirations: AtomicU64,
    invalidations: AtomicU64,
}

/// Concurrent entity snapshot store
pub struct CacheStore {
    slots: DashMap<EntityKey, Slot, RandomState>,
    policy: Box<dyn EvictionPolicy>,
    /// Live (non-tombstone) slot count
    live: AtomicUsize,
    capacity: usize,
    epoch: Instant,
    counters: Counters,
}

impl CacheStore {
    /// Create a new store
    ///
    /// `capacity` is enforced by `evict_overflow`, not by `put`, so writers never
    /// block on eviction.
    pub fn new(capacity: usize, policy: Box<dyn EvictionPolicy>) -> Self {
        Self {
            slots: DashMap::with_hasher(RandomState::new()),
            policy,
            live: AtomicUsize::new(0),
            capacity: capacity.max(1),
            epoch: Instant::now(),
            counters: Counters::default(),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn policy(&self) -> &dyn EvictionPolicy {
        self.policy.as_ref()
    }

    fn nanos_since_epoch(&self, now: Instant) -> u64 {
        now.saturating_duration_since(self.epoch).as_nanos() as u64
    }

    fn to_entry(&self, key: &EntityKey, resident: &Resident) -> CacheEntry {
        CacheEntry {
            key: key.clone(),
            value: resident.value.clone(),
            version: resident.version,
            last_access: self.epoch
                + Duration::from_nanos(resident.last_access.load(Ordering::Relaxed)),
            expires_at: resident.expires_at,
            dirty: resident.dirty.load(Ordering::Acquire),
        }
    }

    /// Get a live, unexpired entry
    ///
    /// Returns None on miss (absent, tombstoned or expired)
    pub fn get(&self, key: &EntityKey) -> Option<CacheEntry> {
        let now = Instant::now();

        let found = match self.slots.get(key) {
            Some(slot) => match slot.value() {
                Slot::Live(resident) if !resident.is_expired(now) => {
                    resident
                        .last_access
                        .store(self.nanos_since_epoch(now), Ordering::Relaxed);
                    Some(self.to_entry(key, resident))
                }
                _ => None,
            },
            None => None,
        };

        match found {
            Some(entry) => {
                self.counters.hits.fetch_add(1, Ordering::Relaxed);
                self.policy.on_access(key);
                Some(entry)
            }
            None => {
                self.counters.misses.fetch_add(1, Ordering::Relaxed);
                None
            }
        }
    }

    /// Like `get` but without touching statistics or recency
    pub fn peek(&self, key: &EntityKey) -> Option<CacheEntry> {
        let slot = self.slots.get(key)?;
        match slot.value() {
            Slot::Live(resident) => Some(self.to_entry(key, resident)),
            Slot::Tombstone { .. } => None,
        }
    }

    /// Highest version known for the key (live entry or tombstone)
    pub fn version_of(&self, key: &EntityKey) -> Option<Version> {
        self.slots.get(key).map(|slot| match slot.value() {
            Slot::Live(resident) => resident.version,
            Slot::Tombstone { version, .. } => *version,
        })
    }

    /// Put an entry into the store
    ///
    /// No-op (`Rejected`) when `entry.version` is not newer than the live entry,
    /// or older than an invalidation tombstone. An expired live entry counts as
    /// a tombstone at its version, so a reload of the same version is accepted.
    pub fn put(&self, key: &EntityKey, entry: CacheEntry) -> PutOutcome {
        let now = Instant::now();
        let expires_at = entry.expires_at;
        let resident = Resident {
            value: entry.value,
            version: entry.version,
            expires_at,
            dirty: AtomicBool::new(entry.dirty),
            last_access: AtomicU64::new(self.nanos_since_epoch(now)),
        };

        let outcome = match self.slots.entry(key.clone()) {
            Entry::Occupied(mut occupied) => {
                let outcome = match occupied.get() {
                    Slot::Live(current)
                        if current.is_expired(now) && resident.version < current.version =>
                    {
                        PutOutcome::Rejected {
                            current: current.version,
                        }
                    }
                    Slot::Live(current)
                        if !current.is_expired(now) && resident.version <= current.version =>
                    {
                        PutOutcome::Rejected {
                            current: current.version,
                        }
                    }
                    Slot::Tombstone { version, .. } if resident.version < *version => {
                        PutOutcome::Rejected { current: *version }
                    }
                    Slot::Live(current) => PutOutcome::Replaced {
                        previous: current.version,
                    },
                    Slot::Tombstone { .. } => PutOutcome::Inserted,
                };

                if outcome.is_accepted() {
                    if outcome == PutOutcome::Inserted {
                        self.live.fetch_add(1, Ordering::AcqRel);
                    }
                    occupied.insert(Slot::Live(resident));
                    self.policy.on_insert(key, expires_at);
                }
                outcome
            }
            Entry::Vacant(vacant) => {
                let _slot = vacant.insert(Slot::Live(resident));
                self.live.fetch_add(1, Ordering::AcqRel);
                self.policy.on_insert(key, expires_at);
                PutOutcome::Inserted
            }
        };

        self.record_put(key, entry.version, outcome);
        outcome
    }

    /// Write through a commit at `entry.version` made under the key's
    /// exclusive slot lock
    ///
    /// Replaces a live entry whatever its version: no read-through can
    /// populate the slot while it is held, so a newer live entry can only be a
    /// direct `put` that ran ahead of the database. A tombstone newer than the
    /// commit (a later commit made outside the cache) still wins.
    pub fn install(&self, key: &EntityKey, entry: CacheEntry) -> PutOutcome {
        let now = Instant::now();
        let expires_at = entry.expires_at;
        let resident = Resident {
            value: entry.value,
            version: entry.version,
            expires_at,
            dirty: AtomicBool::new(false),
            last_access: AtomicU64::new(self.nanos_since_epoch(now)),
        };

        let outcome = match self.slots.entry(key.clone()) {
            Entry::Occupied(mut occupied) => {
                let outcome = match occupied.get() {
                    Slot::Tombstone { version, .. } if resident.version < *version => {
                        PutOutcome::Rejected { current: *version }
                    }
                    Slot::Tombstone { .. } => PutOutcome::Inserted,
                    Slot::Live(current) => PutOutcome::Replaced {
                        previous: current.version,
                    },
                };

                if outcome.is_accepted() {
                    if outcome == PutOutcome::Inserted {
                        self.live.fetch_add(1, Ordering::AcqRel);
                    }
                    occupied.insert(Slot::Live(resident));
                    self.policy.on_insert(key, expires_at);
                }
                outcome
            }
            Entry::Vacant(vacant) => {
                let _slot = vacant.insert(Slot::Live(resident));
                self.live.fetch_add(1, Ordering::AcqRel);
                self.policy.on_insert(key, expires_at);
                PutOutcome::Inserted
            }
        };

        self.record_put(key, entry.version, outcome);
        outcome
    }

    fn record_put(&self, key: &EntityKey, version: Version, outcome: PutOutcome) {
        match outcome {
            PutOutcome::Rejected { current } => {
                self.counters.stale_rejected.fetch_add(1, Ordering::Relaxed);
                debug!(%key, version, current, "stale put rejected");
            }
            _ => {
                self.counters.puts.fetch_add(1, Ordering::Relaxed);
            }
        }
    }

    /// Remove a live entry without leaving a tombstone
    pub fn remove(&self, key: &EntityKey) -> Option<CacheEntry> {
        let occupied = match self.slots.entry(key.clone()) {
            Entry::Occupied(occupied) if matches!(occupied.get(), Slot::Live(_)) => occupied,
            _ => return None,
        };
        self.policy.on_remove(key);
        let (key, slot) = occupied.remove_entry();
        self.live.fetch_sub(1, Ordering::AcqRel);

        match slot {
            Slot::Live(resident) => Some(self.to_entry(&key, &resident)),
            Slot::Tombstone { .. } => None,
        }
    }

    /// Invalidate a key on behalf of a commit at `version`
    ///
    /// Leaves a tombstone at `version` unless a live entry at that version or
    /// newer is already resident (write-through won the race). Returns true if a
    /// live entry was dropped.
    pub fn invalidate(&self, key: &EntityKey, version: Version) -> bool {
        let now = Instant::now();

        let dropped = match self.slots.entry(key.clone()) {
            Entry::Occupied(mut occupied) => {
                let replace = match occupied.get_mut() {
                    Slot::Live(current) => current.version < version,
                    Slot::Tombstone { version: tomb, since } => {
                        if *tomb < version {
                            *tomb = version;
                            *since = now;
                        }
                        false
                    }
                };
                if replace {
                    occupied.insert(Slot::Tombstone {
                        version,
                        since: now,
                    });
                    self.live.fetch_sub(1, Ordering::AcqRel);
                    self.policy.on_remove(key);
                }
                replace
            }
            Entry::Vacant(vacant) => {
                vacant.insert(Slot::Tombstone {
                    version,
                    since: now,
                });
                false
            }
        };

        if dropped {
            self.counters.invalidations.fetch_add(1, Ordering::Relaxed);
            debug!(%key, version, "invalidated");
        }
        dropped
    }

    /// Tombstone every live entry of an entity type at its current version
    pub fn invalidate_region(&self, entity: &str) -> usize {
        let now = Instant::now();
        let mut dropped = Vec::new();

        for mut slot in self.slots.iter_mut() {
            if slot.key().entity() != entity {
                continue;
            }
            let live_version = match slot.value() {
                Slot::Live(resident) => Some(resident.version),
                Slot::Tombstone { .. } => None,
            };
            if let Some(version) = live_version {
                *slot.value_mut() = Slot::Tombstone {
                    version,
                    since: now,
                };
                self.policy.on_remove(slot.key());
                dropped.push(slot.key().clone());
            }
        }

        self.live.fetch_sub(dropped.len(), Ordering::AcqRel);
        self.counters
            .invalidations
            .fetch_add(dropped.len() as u64, Ordering::Relaxed);

        debug!(entity, count = dropped.len(), "region invalidated");
        dropped.len()
    }

    /// Mark a live entry dirty (write in flight). Returns false if not resident.
    pub fn mark_dirty(&self, key: &EntityKey) -> bool {
        self.set_dirty(key, true)
    }

    pub fn clear_dirty(&self, key: &EntityKey) -> bool {
        self.set_dirty(key, false)
    }

    fn set_dirty(&self, key: &EntityKey, dirty: bool) -> bool {
        match self.slots.get(key) {
            Some(slot) => match slot.value() {
                Slot::Live(resident) => {
                    resident.dirty.store(dirty, Ordering::Release);
                    true
                }
                Slot::Tombstone { .. } => false,
            },
            None => false,
        }
    }

    /// Turn a live entry into a tombstone at its own version
    ///
    /// The tombstone keeps rejecting loads that started before the entry left.
    /// `pred` runs under the slot's shard lock. A policy record for a key with
    /// no live entry is dropped.
    fn retire(&self, key: &EntityKey, now: Instant, pred: impl Fn(&Resident) -> bool) -> bool {
        let retired = match self.slots.entry(key.clone()) {
            Entry::Occupied(mut occupied) => {
                let live = match occupied.get() {
                    Slot::Live(resident) => Some((resident.version, pred(resident))),
                    Slot::Tombstone { .. } => None,
                };
                match live {
                    Some((version, true)) => {
                        occupied.insert(Slot::Tombstone {
                            version,
                            since: now,
                        });
                        self.policy.on_remove(key);
                        true
                    }
                    Some((_, false)) => false,
                    None => {
                        self.policy.on_remove(key);
                        false
                    }
                }
            }
            Entry::Vacant(_) => {
                self.policy.on_remove(key);
                false
            }
        };

        if retired {
            self.live.fetch_sub(1, Ordering::AcqRel);
        }
        retired
    }

    /// Drop a live entry, keeping its version as the watermark. Returns false
    /// if nothing was resident.
    pub fn discard(&self, key: &EntityKey) -> bool {
        let discarded = self.retire(key, Instant::now(), |_| true);
        if discarded {
            self.counters.invalidations.fetch_add(1, Ordering::Relaxed);
            debug!(%key, "discarded");
        }
        discarded
    }

    /// Tombstone a key at a committed `version`, dropping any live entry
    ///
    /// For commits that leave nothing to write through (deletes, keys the
    /// cache must not hold). Returns true if a live entry was dropped.
    pub fn retire_committed(&self, key: &EntityKey, version: Version) -> bool {
        let now = Instant::now();

        let dropped = match self.slots.entry(key.clone()) {
            Entry::Occupied(mut occupied) => {
                let (was_live, watermark) = match occupied.get() {
                    Slot::Live(_) => (true, version),
                    Slot::Tombstone { version: tomb, .. } => (false, version.max(*tomb)),
                };
                occupied.insert(Slot::Tombstone {
                    version: watermark,
                    since: now,
                });
                if was_live {
                    self.live.fetch_sub(1, Ordering::AcqRel);
                    self.policy.on_remove(key);
                }
                was_live
            }
            Entry::Vacant(vacant) => {
                vacant.insert(Slot::Tombstone {
                    version,
                    since: now,
                });
                false
            }
        };

        if dropped {
            self.counters.invalidations.fetch_add(1, Ordering::Relaxed);
            debug!(%key, version, "retired at committed version");
        }
        dropped
    }

    /// Evict down to `capacity`, never touching pinned keys
    ///
    /// `is_pinned` is checked again under the slot's shard lock, so a key
    /// locked after victim selection stays resident.
    pub fn evict_overflow(&self, is_pinned: PinnedFn<'_>) -> usize {
        let size = self.size();
        if size <= self.capacity {
            return 0;
        }

        let needed = size - self.capacity;
        let victims = self
            .policy
            .select_victims(needed, Instant::now(), is_pinned);

        let now = Instant::now();
        let evicted = victims
            .iter()
            .filter(|key: &&EntityKey| self.retire(key, now, |_| !is_pinned(*key)))
            .count();
        self.counters
            .evictions
            .fetch_add(evicted as u64, Ordering::Relaxed);

        if evicted < needed {
            warn!(
                needed,
                evicted,
                size = self.size(),
                capacity = self.capacity,
                "cache over capacity, remaining entries pinned"
            );
        } else {
            debug!(evicted, "evicted overflow");
        }
        evicted
    }

    /// Remove expired entries, never touching pinned keys
    pub fn expire(&self, now: Instant, is_pinned: PinnedFn<'_>) -> usize {
        let expired = self
            .policy
            .expired(now, is_pinned)
            .iter()
            .filter(|key: &&EntityKey| {
                self.retire(key, now, |resident| {
                    resident.is_expired(now) && !is_pinned(*key)
                })
            })
            .count();

        self.counters
            .expirations
            .fetch_add(expired as u64, Ordering::Relaxed);
        expired
    }

    /// Drop tombstones older than `max_age`
    pub fn purge_tombstones(&self, max_age: Duration) -> usize {
        let before = self.slots.len();
        self.slots.retain(|_, slot| match slot {
            Slot::Tombstone { since, .. } => since.elapsed() < max_age,
            Slot::Live(_) => true,
        });
        before.saturating_sub(self.slots.len())
    }

    /// Number of live entries
    pub fn size(&self) -> usize {
        self.live.load(Ordering::Acquire)
    }

    pub fn is_empty(&self) -> bool {
        self.size() == 0
    }

    pub fn tombstones(&self) -> usize {
        self.slots.len().saturating_sub(self.size())
    }

    /// Live keys of one entity type
    pub fn keys_of(&self, entity: &str) -> Vec<EntityKey> {
        self.slots
            .iter()
            .filter(|slot| slot.key().entity() == entity && matches!(slot.value(), Slot::Live(_)))
            .map(|slot| slot.key().clone())
            .collect()
    }

    /// Clear entire store, including tombstones and statistics
    pub fn clear(&self) {
        self.slots.clear();
        self.policy.clear();
        self.live.store(0, Ordering::Release);

        for counter in [
            &self.counters.hits,
            &self.counters.misses,
            &self.counters.puts,
            &self.counters.stale_rejected,
            &self.counters.evictions,
            &self.counters.expirations,
            &self.counters.invalidations,
        ] {
            counter.store(0, Ordering::Relaxed);
        }
    }

    /// Get cache statistics
    pub fn stats(&self) -> CacheStats {
        CacheStats {
            hits: self.counters.hits.load(Ordering::Relaxed),
            misses: self.counters.misses.load(Ordering::Relaxed),
            puts: self.counters.puts.load(Ordering::Relaxed),
            stale_rejected: self.counters.stale_rejected.load(Ordering::Relaxed),
            evictions: self.counters.evictions.load(Ordering::Relaxed),
            expirations: self.counters.expirations.load(Ordering::Relaxed),
            invalidations: self.counters.invalidations.load(Ordering::Relaxed),
            size: self.size(),
            tombstones: self.tombstones(),
            capacity: self.capacity,
        }
    }
}
