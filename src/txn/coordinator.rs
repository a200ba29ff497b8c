//! Coherence Coordinator
//!
//! Turns database commits into cache invalidations:
//! 1. every committed change bumps the global invalidation sequence
//! 2. the key is tombstoned in the store at the committed version
//! 3. an `InvalidationMessage` is delivered to every registered listener,
//!    at least once, with exponential backoff inside a bounded retry window
//!
//! Degradation: the first failed delivery marks the key's region *suspect*
//! (its entries are dropped and reads go straight to the database). If delivery
//! is still unconfirmed when the attempts or the window run out, the change is
//! recorded as a coherence violation and the key enters *bypass mode*.

use crate::cache::store::CacheStore;
use crate::config::CoherenceConfig;
use crate::database::{Change, Commit, CommitListener};
use crate::types::{EntityKey, Sequence, Version};
use crate::{CacheError, Result};
use ahash::RandomState;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use parking_lot::RwLock;
use rand::Rng;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Invalidation emitted for one committed change
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InvalidationMessage {
    pub key: EntityKey,
    /// Version after the commit
    pub version: Version,
    /// Global invalidation sequence assigned to this change
    pub seq: Sequence,
    /// The row was deleted
    pub deleted: bool,
}

/// Receiver of invalidation messages (query cache, peer nodes, ...)
///
/// Returning Ok confirms the invalidation. Delivery is at-least-once, so
/// implementations must tolerate duplicates.
pub trait InvalidationListener: Send + Sync {
    fn name(&self) -> &str;

    fn invalidate(&self, message: &InvalidationMessage) -> Result<()>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Outcome {
    Confirmed,
    Violated { attempts: u32 },
}

struct Applied {
    version: Version,
    outcome: Outcome,
    at: Instant,
}

#[derive(Default)]
struct Counters {
    changes: AtomicU64,
    delivered: AtomicU64,
    retries: AtomicU64,
    suspect_marks: AtomicU64,
    violations: AtomicU64,
}

/// Coordinator statistics
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CoherenceStats {
    /// Global invalidation sequence
    pub sequence: Sequence,
    pub changes_processed: u64,
    pub messages_delivered: u64,
    pub retries: u64,
    pub suspect_marks: u64,
    pub violations: u64,
    /// Regions currently suspect
    pub suspect_regions: usize,
    /// Keys currently in bypass mode
    pub bypassed_keys: usize,
}

/// Coherence Coordinator
pub struct CoherenceCoordinator {
    store: Arc<CacheStore>,
    config: CoherenceConfig,
    listeners: RwLock<Vec<Arc<dyn InvalidationListener>>>,

    /// Global invalidation sequence
    seq: AtomicU64,

    /// Last processed change per key (idempotency + recorded outcome)
    applied: DashMap<EntityKey, Applied, RandomState>,

    /// entity -> suspect until
    suspect_regions: DashMap<String, Instant, RandomState>,

    /// key -> bypass until
    bypassed: DashMap<EntityKey, Instant, RandomState>,

    counters: Counters,
}

impl CoherenceCoordinator {
    /// Create a new coordinator over `store`
    pub fn new(store: Arc<CacheStore>, config: CoherenceConfig) -> Self {
        Self {
            store,
            config,
            listeners: RwLock::new(Vec::new()),
            seq: AtomicU64::new(0),
            applied: DashMap::with_hasher(RandomState::new()),
            suspect_regions: DashMap::with_hasher(RandomState::new()),
            bypassed: DashMap::with_hasher(RandomState::new()),
            counters: Counters::default(),
        }
    }

    pub fn add_listener(&self, listener: Arc<dyn InvalidationListener>) {
        info!(listener = listener.name(), "invalidation listener registered");
        self.listeners.write().push(listener);
    }

    /// Last assigned invalidation sequence
    pub fn current_seq(&self) -> Sequence {
        self.seq.load(Ordering::SeqCst)
    }

    /// Process a commit (idempotent per key and version)
    ///
    /// Returns the first `CoherenceViolation` among its changes, after every
    /// change has been processed.
    pub fn process(&self, commit: &Commit) -> Result<()> {
        let mut first_err = None;
        for change in &commit.changes {
            if let Err(e) = self.process_change(change) {
                first_err.get_or_insert(e);
            }
        }
        match first_err {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Confirm that a commit's invalidations went through
    ///
    /// Normally the commit notification already did the work and this only
    /// reads the recorded outcome; otherwise the commit is processed here.
    pub fn confirm(&self, commit: &Commit) -> Result<()> {
        self.process(commit)
    }

    fn process_change(&self, change: &Change) -> Result<()> {
        if let Some(applied) = self.applied.get(&change.key) {
            if applied.version > change.version {
                // Superseded by a later commit
                return Ok(());
            }
            if applied.version == change.version {
                return self.outcome_to_result(&change.key, change.version, applied.outcome);
            }
        }

        let seq = self.seq.fetch_add(1, Ordering::SeqCst) + 1;
        self.counters.changes.fetch_add(1, Ordering::Relaxed);
        self.store.invalidate(&change.key, change.version);

        let message = InvalidationMessage {
            key: change.key.clone(),
            version: change.version,
            seq,
            deleted: change.data.is_none(),
        };
        let outcome = self.deliver(&message);

        if let Outcome::Violated { attempts } = outcome {
            let until = Instant::now() + self.config.bypass_period();
            self.bypassed.insert(change.key.clone(), until);
            self.counters.violations.fetch_add(1, Ordering::Relaxed);
            warn!(
                key = %change.key,
                version = change.version,
                attempts,
                "invalidation unconfirmed, key in bypass mode"
            );
        }

        match self.applied.entry(change.key.clone()) {
            Entry::Occupied(mut occupied) => {
                if occupied.get().version < change.version {
                    occupied.insert(Applied {
                        version: change.version,
                        outcome,
                        at: Instant::now(),
                    });
                }
            }
            Entry::Vacant(vacant) => {
                vacant.insert(Applied {
                    version: change.version,
                    outcome,
                    at: Instant::now(),
                });
            }
        }

        self.outcome_to_result(&change.key, change.version, outcome)
    }

    fn outcome_to_result(&self, key: &EntityKey, version: Version, outcome: Outcome) -> Result<()> {
        match outcome {
            Outcome::Confirmed => Ok(()),
            Outcome::Violated { attempts } => Err(CacheError::CoherenceViolation {
                key: key.clone(),
                version,
                attempts,
            }),
        }
    }

    /// Deliver to every listener; Violated if any listener stays unconfirmed
    fn deliver(&self, message: &InvalidationMessage) -> Outcome {
        let listeners: Vec<Arc<dyn InvalidationListener>> = self.listeners.read().clone();
        let mut outcome = Outcome::Confirmed;

        for listener in listeners {
            if let Outcome::Violated { attempts } = self.deliver_to(listener.as_ref(), message) {
                outcome = match outcome {
                    Outcome::Violated { attempts: prev } => Outcome::Violated {
                        attempts: prev.max(attempts),
                    },
                    Outcome::Confirmed => Outcome::Violated { attempts },
                };
            }
        }

        outcome
    }

    fn deliver_to(&self, listener: &dyn InvalidationListener, message: &InvalidationMessage) -> Outcome {
        let started = Instant::now();
        let window = self.config.retry_window();
        let mut attempt = 0;

        loop {
            attempt += 1;
            let err = match listener.invalidate(message) {
                Ok(()) => {
                    self.counters.delivered.fetch_add(1, Ordering::Relaxed);
                    return Outcome::Confirmed;
                }
                Err(e) => e,
            };

            debug!(
                listener = listener.name(),
                key = %message.key,
                attempt,
                error = %err,
                "invalidation delivery failed"
            );

            if attempt == 1 {
                self.mark_suspect(message.key.entity());
            }

            let backoff = self.jittered_backoff(attempt);
            if attempt >= self.config.max_attempts || started.elapsed() + backoff > window {
                return Outcome::Violated { attempts: attempt };
            }

            self.counters.retries.fetch_add(1, Ordering::Relaxed);
            std::thread::sleep(backoff);
        }
    }

    fn jittered_backoff(&self, attempt: u32) -> Duration {
        let base = self.config.backoff(attempt);
        let jitter_ms = base.as_millis() as u64 / 2;
        if jitter_ms == 0 {
            return base;
        }
        base + Duration::from_millis(rand::thread_rng().gen_range(0..=jitter_ms))
    }

    /// Mark a region suspect: drop its entries and read through until the
    /// suspect period lapses
    pub fn mark_suspect(&self, entity: &str) {
        let until = Instant::now() + self.config.suspect_period();
        self.suspect_regions.insert(entity.to_string(), until);
        self.counters.suspect_marks.fetch_add(1, Ordering::Relaxed);

        let dropped = self.store.invalidate_region(entity);
        warn!(entity, dropped, "region marked suspect");
    }

    pub fn is_suspect(&self, entity: &str) -> bool {
        self.suspect_regions
            .get(entity)
            .map_or(false, |until| Instant::now() < *until)
    }

    pub fn is_bypassed(&self, key: &EntityKey) -> bool {
        self.bypassed
            .get(key)
            .map_or(false, |until| Instant::now() < *until)
    }

    /// Whether the cache may serve or store this key right now
    pub fn admits(&self, key: &EntityKey) -> bool {
        !self.is_suspect(key.entity()) && !self.is_bypassed(key)
    }

    /// Clear every suspect and bypass mark
    pub fn recover(&self) {
        self.suspect_regions.clear();
        self.bypassed.clear();
        info!("coherence marks cleared");
    }

    /// Drop lapsed marks and outcomes older than the tombstone TTL
    pub fn maintain(&self, now: Instant) {
        self.suspect_regions.retain(|_, until| now < *until);
        self.bypassed.retain(|_, until| now < *until);

        let ttl = self.config.tombstone_ttl();
        self.applied
            .retain(|_, applied| now.saturating_duration_since(applied.at) < ttl);
    }

    pub fn config(&self) -> &CoherenceConfig {
        &self.config
    }

    pub fn stats(&self) -> CoherenceStats {
        let now = Instant::now();
        CoherenceStats {
            sequence: self.current_seq(),
            changes_processed: self.counters.changes.load(Ordering::Relaxed),
            messages_delivered: self.counters.delivered.load(Ordering::Relaxed),
            retries: self.counters.retries.load(Ordering::Relaxed),
            suspect_marks: self.counters.suspect_marks.load(Ordering::Relaxed),
            violations: self.counters.violations.load(Ordering::Relaxed),
            suspect_regions: self
                .suspect_regions
                .iter()
                .filter(|mark| now < *mark.value())
                .count(),
            bypassed_keys: self
                .bypassed
                .iter()
                .filter(|mark| now < *mark.value())
                .count(),
        }
    }
}

impl CommitListener for CoherenceCoordinator {
    fn on_commit(&self, commit: &Commit) {
        if let Err(e) = self.process(commit) {
            warn!(seq = commit.seq, error = %e, "commit processed with coherence violation");
        }
    }
}
