//! Query result cache
//!
//! Caches the *keys* a query returned, not the entities: on a hit the gateway
//! assembles the entities from the entity cache. Every cached result remembers
//! the entity types it spans (query spaces) and the invalidation sequence it was
//! loaded at; an invalidation of any of those types after that point makes the
//! result stale.

use crate::txn::coordinator::{InvalidationListener, InvalidationMessage};
use crate::types::{EntityKey, Sequence};
use crate::Result;
use ahash::RandomState;
use dashmap::DashMap;
use lru::LruCache;
use parking_lot::Mutex;
use std::fmt;
use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::debug;

/// Cached query identity: region + query name + bound parameters
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct QueryKey {
    region: String,
    query: String,
    params: Vec<String>,
}

impl QueryKey {
    pub fn new(region: impl Into<String>, query: impl Into<String>) -> Self {
        Self {
            region: region.into(),
            query: query.into(),
            params: Vec::new(),
        }
    }

    /// Bind the next parameter
    pub fn param(mut self, value: impl fmt::Display) -> Self {
        self.params.push(value.to_string());
        self
    }

    pub fn region(&self) -> &str {
        &self.region
    }

    pub fn query(&self) -> &str {
        &self.query
    }

    pub fn params(&self) -> &[String] {
        &self.params
    }
}

impl fmt::Display for QueryKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}({})", self.region, self.query, self.params.join(", "))
    }
}

#[derive(Debug, Clone)]
struct CachedQuery {
    keys: Vec<EntityKey>,
    spaces: Vec<String>,
    cached_at_seq: Sequence,
}

/// Query cache statistics
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct QueryCacheStats {
    pub hits: u64,
    pub misses: u64,
    /// Results dropped because a query space was invalidated after caching
    pub stale: u64,
    pub size: usize,
    pub capacity: usize,
}

/// LRU-bounded query result cache
pub struct QueryCache {
    /// None when disabled (capacity 0)
    results: Option<Mutex<LruCache<QueryKey, CachedQuery>>>,

    /// entity type -> last invalidation sequence
    type_stamps: DashMap<String, Sequence, RandomState>,

    capacity: usize,
    hits: AtomicU64,
    misses: AtomicU64,
    stale: AtomicU64,
}

impl QueryCache {
    /// Create a query cache holding up to `capacity` results (0 disables it)
    pub fn new(capacity: usize) -> Self {
        Self {
            results: NonZeroUsize::new(capacity).map(|cap| Mutex::new(LruCache::new(cap))),
            type_stamps: DashMap::with_hasher(RandomState::new()),
            capacity,
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            stale: AtomicU64::new(0),
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.results.is_some()
    }

    fn stamp(&self, space: &str) -> Sequence {
        self.type_stamps.get(space).map(|seq| *seq).unwrap_or(0)
    }

    fn is_fresh(&self, spaces: &[String], seq: Sequence) -> bool {
        spaces.iter().all(|space| self.stamp(space) <= seq)
    }

    /// Keys of a cached, still-valid result
    pub fn get(&self, key: &QueryKey) -> Option<Vec<EntityKey>> {
        let results = self.results.as_ref()?;
        let mut results = results.lock();

        let fresh = results
            .get(key)
            .map(|cached| self.is_fresh(&cached.spaces, cached.cached_at_seq));

        match fresh {
            Some(true) => {
                self.hits.fetch_add(1, Ordering::Relaxed);
                results.get(key).map(|cached| cached.keys.clone())
            }
            Some(false) => {
                results.pop(key);
                self.stale.fetch_add(1, Ordering::Relaxed);
                self.misses.fetch_add(1, Ordering::Relaxed);
                debug!(query = %key, "stale query result dropped");
                None
            }
            None => {
                self.misses.fetch_add(1, Ordering::Relaxed);
                None
            }
        }
    }

    /// Cache a result loaded at invalidation sequence `seq`
    ///
    /// Skipped if one of `spaces` was invalidated after `seq` (the result may
    /// already be outdated). Returns whether the result was cached.
    pub fn put(&self, key: QueryKey, keys: Vec<EntityKey>, spaces: Vec<String>, seq: Sequence) -> bool {
        let results = match self.results.as_ref() {
            Some(results) => results,
            None => return false,
        };

        if !self.is_fresh(&spaces, seq) {
            debug!(query = %key, seq, "query result outdated before caching");
            return false;
        }

        results.lock().put(
            key,
            CachedQuery {
                keys,
                spaces,
                cached_at_seq: seq,
            },
        );
        true
    }

    /// Record an invalidation of `space` at `seq`
    pub fn touch_space(&self, space: &str, seq: Sequence) {
        let mut stamp = self.type_stamps.entry(space.to_string()).or_insert(0);
        if *stamp < seq {
            *stamp = seq;
        }
    }

    /// Drop every cached result spanning `space`
    pub fn invalidate_space(&self, space: &str) -> usize {
        let results = match self.results.as_ref() {
            Some(results) => results,
            None => return 0,
        };

        let mut results = results.lock();
        let doomed: Vec<QueryKey> = results
            .iter()
            .filter(|(_, cached)| cached.spaces.iter().any(|s| s == space))
            .map(|(key, _)| key.clone())
            .collect();
        for key in &doomed {
            results.pop(key);
        }
        doomed.len()
    }

    pub fn len(&self) -> usize {
        self.results.as_ref().map_or(0, |results| results.lock().len())
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&self) {
        if let Some(results) = self.results.as_ref() {
            results.lock().clear();
        }
    }

    pub fn stats(&self) -> QueryCacheStats {
        QueryCacheStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            stale: self.stale.load(Ordering::Relaxed),
            size: self.len(),
            capacity: self.capacity,
        }
    }
}

impl InvalidationListener for QueryCache {
    fn name(&self) -> &str {
        "query-cache"
    }

    fn invalidate(&self, message: &InvalidationMessage) -> Result<()> {
        self.touch_space(message.key.entity(), message.seq);
        Ok(())
    }
}
