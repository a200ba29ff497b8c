//! Eviction policies: LRU, TTL and LRU+TTL
//!
//! Policies only *track* keys and *recommend* victims; the store performs the
//! removal and reports it back through `on_remove`. A key for which the caller's
//! `is_pinned` predicate holds (slot locked by a writer or a read pin) is never
//! recommended.

use crate::config::EvictionPolicyKind;
use crate::types::EntityKey;
use ahash::{AHashMap, AHashSet};
use crossbeam::queue::SegQueue;
use lru::LruCache;
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::time::Instant;

/// Predicate telling the policy which keys must stay resident
pub type PinnedFn<'a> = &'a dyn Fn(&EntityKey) -> bool;

/// Upper bound on buffered (not yet applied) access records
const ACCESS_BUFFER_LIMIT: usize = 4096;

pub trait EvictionPolicy: Send + Sync {
    fn kind(&self) -> EvictionPolicyKind;

    /// A resident key was read
    fn on_access(&self, key: &EntityKey);

    /// A key was inserted or replaced, with its (new) expiry deadline
    fn on_insert(&self, key: &EntityKey, expires_at: Option<Instant>);

    /// A key left the store (eviction, expiry or invalidation)
    fn on_remove(&self, key: &EntityKey);

    /// Pick up to `target_free_count` keys to evict, skipping pinned keys
    fn select_victims(
        &self,
        target_free_count: usize,
        now: Instant,
        is_pinned: PinnedFn<'_>,
    ) -> AHashSet<EntityKey>;

    /// Keys whose deadline has passed, skipping pinned keys
    fn expired(&self, now: Instant, is_pinned: PinnedFn<'_>) -> Vec<EntityKey>;

    /// Number of tracked keys
    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn clear(&self);
}

/// Build the policy selected in the config
pub fn build_policy(kind: EvictionPolicyKind) -> Box<dyn EvictionPolicy> {
    match kind {
        EvictionPolicyKind::Lru => Box::new(LruPolicy::new()),
        EvictionPolicyKind::Ttl => Box::new(TtlPolicy::new()),
        EvictionPolicyKind::LruTtl => Box::new(LruTtlPolicy::new()),
    }
}

/// Least-recently-used tracking
///
/// 🚀 Reads never wait on the recency list: when it is contended the access is
/// pushed onto a lock-free buffer and replayed by the next lock holder.
pub struct LruPolicy {
    order: Mutex<LruCache<EntityKey, ()>>,
    pending: SegQueue<EntityKey>,
}

impl LruPolicy {
    pub fn new() -> Self {
        Self {
            order: Mutex::new(LruCache::unbounded()),
            pending: SegQueue::new(),
        }
    }

    /// Replay buffered accesses; only promotes keys still tracked
    fn drain_pending(&self, order: &mut LruCache<EntityKey, ()>) {
        while let Some(key) = self.pending.pop() {
            order.promote(&key);
        }
    }
}

impl Default for LruPolicy {
    fn default() -> Self {
        Self::new()
    }
}

impl EvictionPolicy for LruPolicy {
    fn kind(&self) -> EvictionPolicyKind {
        EvictionPolicyKind::Lru
    }

    fn on_access(&self, key: &EntityKey) {
        match self.order.try_lock() {
            Some(mut order) => {
                self.drain_pending(&mut order);
                order.promote(key);
            }
            None => {
                // Lossy under extreme contention, recency is a hint
                if self.pending.len() < ACCESS_BUFFER_LIMIT {
                    self.pending.push(key.clone());
                }
            }
        }
    }

    fn on_insert(&self, key: &EntityKey, _expires_at: Option<Instant>) {
        let mut order = self.order.lock();
        self.drain_pending(&mut order);
        order.put(key.clone(), ());
    }

    fn on_remove(&self, key: &EntityKey) {
        self.order.lock().pop(key);
    }

    fn select_victims(
        &self,
        target_free_count: usize,
        _now: Instant,
        is_pinned: PinnedFn<'_>,
    ) -> AHashSet<EntityKey> {
        let mut order = self.order.lock();
        self.drain_pending(&mut order);

        // iter() runs most -> least recent
        order
            .iter()
            .rev()
            .map(|(key, _)| key)
            .filter(|key| !is_pinned(key))
            .take(target_free_count)
            .cloned()
            .collect()
    }

    fn expired(&self, _now: Instant, _is_pinned: PinnedFn<'_>) -> Vec<EntityKey> {
        Vec::new()
    }

    fn len(&self) -> usize {
        self.order.lock().len()
    }

    fn clear(&self) {
        self.order.lock().clear();
        while self.pending.pop().is_some() {}
    }
}

/// Expiry deadline; `Never` sorts after every concrete instant
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
enum Deadline {
    At(Instant),
    Never,
}

#[derive(Default)]
struct TtlIndex {
    /// (deadline, insertion seq) -> key, soonest first
    by_deadline: BTreeMap<(Deadline, u64), EntityKey>,
    /// key -> its slot in `by_deadline`
    slots: AHashMap<EntityKey, (Deadline, u64)>,
    next_seq: u64,
}

impl TtlIndex {
    fn remove(&mut self, key: &EntityKey) {
        if let Some(slot) = self.slots.remove(key) {
            self.by_deadline.remove(&slot);
        }
    }
}

/// Time-to-live tracking; under pressure evicts the soonest deadlines first
pub struct TtlPolicy {
    index: Mutex<TtlIndex>,
}

impl TtlPolicy {
    pub fn new() -> Self {
        Self {
            index: Mutex::new(TtlIndex::default()),
        }
    }
}

impl Default for TtlPolicy {
    fn default() -> Self {
        Self::new()
    }
}

impl EvictionPolicy for TtlPolicy {
    fn kind(&self) -> EvictionPolicyKind {
        EvictionPolicyKind::Ttl
    }

    fn on_access(&self, _key: &EntityKey) {}

    fn on_insert(&self, key: &EntityKey, expires_at: Option<Instant>) {
        let deadline = expires_at.map(Deadline::At).unwrap_or(Deadline::Never);

        let mut index = self.index.lock();
        index.remove(key);
        let seq = index.next_seq;
        index.next_seq += 1;
        index.by_deadline.insert((deadline, seq), key.clone());
        index.slots.insert(key.clone(), (deadline, seq));
    }

    fn on_remove(&self, key: &EntityKey) {
        self.index.lock().remove(key);
    }

    fn select_victims(
        &self,
        target_free_count: usize,
        _now: Instant,
        is_pinned: PinnedFn<'_>,
    ) -> AHashSet<EntityKey> {
        let index = self.index.lock();
        index
            .by_deadline
            .values()
            .filter(|key| !is_pinned(key))
            .take(target_free_count)
            .cloned()
            .collect()
    }

    fn expired(&self, now: Instant, is_pinned: PinnedFn<'_>) -> Vec<EntityKey> {
        let index = self.index.lock();
        index
            .by_deadline
            .iter()
            .take_while(|((deadline, _), _)| *deadline <= Deadline::At(now))
            .map(|(_, key)| key)
            .filter(|key| !is_pinned(key))
            .cloned()
            .collect()
    }

    fn len(&self) -> usize {
        self.index.lock().slots.len()
    }

    fn clear(&self) {
        let mut index = self.index.lock();
        index.by_deadline.clear();
        index.slots.clear();
    }
}

/// LRU + TTL: expired entries go first, then least recently used
pub struct LruTtlPolicy {
    lru: LruPolicy,
    ttl: TtlPolicy,
}

impl LruTtlPolicy {
    pub fn new() -> Self {
        Self {
            lru: LruPolicy::new(),
            ttl: TtlPolicy::new(),
        }
    }
}

impl Default for LruTtlPolicy {
    fn default() -> Self {
        Self::new()
    }
}

impl EvictionPolicy for LruTtlPolicy {
    fn kind(&self) -> EvictionPolicyKind {
        EvictionPolicyKind::LruTtl
    }

    fn on_access(&self, key: &EntityKey) {
        self.lru.on_access(key);
    }

    fn on_insert(&self, key: &EntityKey, expires_at: Option<Instant>) {
        self.lru.on_insert(key, expires_at);
        self.ttl.on_insert(key, expires_at);
    }

    fn on_remove(&self, key: &EntityKey) {
        self.lru.on_remove(key);
        self.ttl.on_remove(key);
    }

    fn select_victims(
        &self,
        target_free_count: usize,
        now: Instant,
        is_pinned: PinnedFn<'_>,
    ) -> AHashSet<EntityKey> {
        let mut victims: AHashSet<EntityKey> = self
            .ttl
            .expired(now, is_pinned)
            .into_iter()
            .take(target_free_count)
            .collect();

        if victims.len() < target_free_count {
            let already = |key: &EntityKey| is_pinned(key) || victims.contains(key);
            let more = self
                .lru
                .select_victims(target_free_count - victims.len(), now, &already);
            victims.extend(more);
        }

        victims
    }

    fn expired(&self, now: Instant, is_pinned: PinnedFn<'_>) -> Vec<EntityKey> {
        self.ttl.expired(now, is_pinned)
    }

    fn len(&self) -> usize {
        self.lru.len()
    }

    fn clear(&self) {
        self.lru.clear();
        self.ttl.clear();
    }
}
