//! Cache configuration, eviction policies and coherence tuning
//!
//! Provides presets for balancing hit rate against staleness exposure.

use crate::{CacheError, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

/// Eviction policy
///
/// - Lru: evict least recently used entries under memory pressure, no expiry
/// - Ttl: entries expire `default_ttl_ms` after insertion; pressure evicts the
///   soonest-expiring entries first
/// - LruTtl: expiry plus LRU under pressure (expired entries always go first)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum EvictionPolicyKind {
    #[serde(rename = "LRU")]
    Lru,
    #[serde(rename = "TTL")]
    Ttl,
    #[default]
    #[serde(rename = "LRU+TTL")]
    LruTtl,
}

impl EvictionPolicyKind {
    /// Whether entries carry an expiry deadline under this policy
    pub fn uses_ttl(&self) -> bool {
        matches!(self, Self::Ttl | Self::LruTtl)
    }

    pub fn description(&self) -> &'static str {
        match self {
            Self::Lru => "least-recently-used",
            Self::Ttl => "time-to-live",
            Self::LruTtl => "least-recently-used + time-to-live",
        }
    }
}

/// What a reader does when the key's slot is exclusively locked by a writer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum LockedSlotPolicy {
    /// Wait up to `read_wait_ms` for the writer, then fall through to the database
    #[default]
    Block,
    /// Fall through to the database immediately, without caching the result
    Miss,
}

/// Per-region (entity type) overrides
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RegionConfig {
    /// TTL override for this region (None = use `default_ttl_ms`)
    pub ttl_ms: Option<u64>,

    /// Regions marked non-cacheable are always read through
    pub cacheable: bool,
}

impl Default for RegionConfig {
    fn default() -> Self {
        Self {
            ttl_ms: None,
            cacheable: true,
        }
    }
}

/// Invalidation delivery and degradation tuning
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CoherenceConfig {
    /// Delivery attempts per listener before declaring a violation
    pub max_attempts: u32,

    /// First retry delay (doubled on every retry)
    pub initial_backoff_ms: u64,

    /// Retry delay cap
    pub max_backoff_ms: u64,

    /// Total time budget for confirming one invalidation
    pub retry_window_ms: u64,

    /// How long a region stays suspect (full read-through) after a failed delivery
    pub suspect_period_ms: u64,

    /// How long a key stays in bypass mode after a coherence violation
    pub bypass_period_ms: u64,

    /// How long invalidation tombstones are retained.
    ///
    /// Must cover `load_timeout_ms`: a load that started before a commit can
    /// never outlive the tombstone that rejects it.
    pub tombstone_ttl_ms: u64,
}

impl Default for CoherenceConfig {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            initial_backoff_ms: 2,
            max_backoff_ms: 50,
            retry_window_ms: 200,
            suspect_period_ms: 1_000,
            bypass_period_ms: 5_000,
            tombstone_ttl_ms: 60_000,
        }
    }
}

impl CoherenceConfig {
    pub fn retry_window(&self) -> Duration {
        Duration::from_millis(self.retry_window_ms)
    }

    pub fn suspect_period(&self) -> Duration {
        Duration::from_millis(self.suspect_period_ms)
    }

    pub fn bypass_period(&self) -> Duration {
        Duration::from_millis(self.bypass_period_ms)
    }

    pub fn tombstone_ttl(&self) -> Duration {
        Duration::from_millis(self.tombstone_ttl_ms)
    }

    /// Backoff before retry number `attempt` (1-based), capped at `max_backoff_ms`
    pub fn backoff(&self, attempt: u32) -> Duration {
        let shift = attempt.saturating_sub(1).min(16);
        let ms = self
            .initial_backoff_ms
            .saturating_mul(1u64 << shift)
            .min(self.max_backoff_ms);
        Duration::from_millis(ms)
    }
}

/// Cache configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Maximum number of live entries
    pub max_entries: usize,

    /// Default entry TTL (None = no expiry). `Some(0)` expires entries immediately.
    pub default_ttl_ms: Option<u64>,

    pub eviction_policy: EvictionPolicyKind,

    pub locked_slot_policy: LockedSlotPolicy,

    /// Max wait for a locked slot under `LockedSlotPolicy::Block`
    pub read_wait_ms: u64,

    /// Max wait for a writer to acquire its exclusive slot locks
    pub lock_timeout_ms: u64,

    /// Read-through load timeout (None = `coherence.tombstone_ttl_ms`)
    pub load_timeout_ms: Option<u64>,

    /// Maximum cached query results (0 disables the query cache)
    pub query_cache_size: usize,

    /// Per-region overrides keyed by entity type
    pub regions: HashMap<String, RegionConfig>,

    pub coherence: CoherenceConfig,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            max_entries: 10_000,
            default_ttl_ms: Some(10 * 60 * 1000), // 10 min
            eviction_policy: EvictionPolicyKind::default(),
            locked_slot_policy: LockedSlotPolicy::default(),
            read_wait_ms: 20,
            lock_timeout_ms: 1_000,
            load_timeout_ms: Some(5_000),
            query_cache_size: 256,
            regions: HashMap::new(),
            coherence: CoherenceConfig::default(),
        }
    }
}

impl CacheConfig {
    /// Small cache with short windows, for tests
    pub fn for_testing() -> Self {
        Self {
            max_entries: 128,
            read_wait_ms: 5,
            lock_timeout_ms: 2_000,
            load_timeout_ms: Some(1_000),
            query_cache_size: 32,
            coherence: CoherenceConfig {
                max_attempts: 3,
                initial_backoff_ms: 1,
                max_backoff_ms: 4,
                retry_window_ms: 50,
                suspect_period_ms: 100,
                bypass_period_ms: 200,
                tombstone_ttl_ms: 5_000,
            },
            ..Default::default()
        }
    }

    /// Large LRU cache without expiry, for read-mostly reference data
    pub fn for_read_heavy() -> Self {
        Self {
            max_entries: 100_000,
            default_ttl_ms: None,
            eviction_policy: EvictionPolicyKind::Lru,
            query_cache_size: 4_096,
            ..Default::default()
        }
    }

    /// Short TTL, readers never wait on writers, long bypass after a violation
    pub fn for_strict_coherence() -> Self {
        Self {
            default_ttl_ms: Some(30_000),
            eviction_policy: EvictionPolicyKind::LruTtl,
            locked_slot_policy: LockedSlotPolicy::Miss,
            coherence: CoherenceConfig {
                max_attempts: 8,
                bypass_period_ms: 60_000,
                ..Default::default()
            },
            ..Default::default()
        }
    }

    /// Parse a JSON config; missing fields take their defaults
    pub fn from_json_str(json: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let json = std::fs::read_to_string(path)?;
        Self::from_json_str(&json)
    }

    pub fn to_json_pretty(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    pub fn validate(&self) -> Result<()> {
        if self.max_entries == 0 {
            return Err(CacheError::InvalidConfig("max_entries must be > 0".into()));
        }
        if self.coherence.max_attempts == 0 {
            return Err(CacheError::InvalidConfig(
                "coherence.max_attempts must be > 0".into(),
            ));
        }
        if self.coherence.tombstone_ttl_ms == 0 {
            return Err(CacheError::InvalidConfig(
                "coherence.tombstone_ttl_ms must be > 0".into(),
            ));
        }
        if let Some(load_timeout) = self.load_timeout_ms {
            if self.coherence.tombstone_ttl_ms < load_timeout {
                return Err(CacheError::InvalidConfig(format!(
                    "coherence.tombstone_ttl_ms ({}) must be >= load_timeout_ms ({})",
                    self.coherence.tombstone_ttl_ms, load_timeout
                )));
            }
        }
        Ok(())
    }

    /// Effective TTL for an entity type, or None when entries never expire
    pub fn ttl_for(&self, entity: &str) -> Option<Duration> {
        if !self.eviction_policy.uses_ttl() {
            return None;
        }
        self.regions
            .get(entity)
            .and_then(|region| region.ttl_ms)
            .or(self.default_ttl_ms)
            .map(Duration::from_millis)
    }

    pub fn is_cacheable(&self, entity: &str) -> bool {
        self.regions
            .get(entity)
            .map(|region| region.cacheable)
            .unwrap_or(true)
    }

    pub fn read_wait(&self) -> Duration {
        Duration::from_millis(self.read_wait_ms)
    }

    pub fn lock_timeout(&self) -> Duration {
        Duration::from_millis(self.lock_timeout_ms)
    }

    pub fn load_timeout(&self) -> Option<Duration> {
        self.load_timeout_ms.map(Duration::from_millis)
    }
}
