//! entitycache - read-through / write-through entity cache
//!
//! Sits in front of a relational database and keeps entity snapshots coherent
//! with committed state.
//!
//! ## Features
//! - Versioned snapshots: a put never overwrites a newer version
//! - LRU / TTL / LRU+TTL eviction that never evicts locked or pinned keys
//! - Per-key slot locks for writers, non-blocking reads
//! - Commit-driven invalidation with at-least-once delivery, suspect regions
//!   and bypass mode instead of stale reads
//! - Query result cache invalidated per entity type
//!
//! ## Architecture
//! - Cache layer: `CacheStore` + `EvictionPolicy` + `QueryCache`
//! - Coherence layer: `SlotLockManager` + `CoherenceCoordinator`
//! - Entry point: `Gateway` (read / write / invalidate)
//! - Database collaborator: `Database` trait, `MemoryDatabase`
//!
//! ```
//! use entitycache::{CacheConfig, EntityKey, Gateway, MemoryDatabase};
//! use std::sync::Arc;
//!
//! let db = Arc::new(MemoryDatabase::new());
//! let gateway = Gateway::new(db, CacheConfig::default()).unwrap();
//!
//! let key: EntityKey = "User#1".parse().unwrap();
//! gateway.write(&key, |_: Option<String>| Ok("Alice".to_string())).unwrap();
//! assert_eq!(gateway.get::<String>(&key).unwrap(), Some("Alice".to_string()));
//! ```

pub mod cache;
pub mod config;
pub mod database;
pub mod gateway;
pub mod notes;
pub mod txn;
pub mod types;

mod error;

pub use config::{CacheConfig, CoherenceConfig, EvictionPolicyKind, LockedSlotPolicy, RegionConfig};
pub use error::{CacheError, Result};

// Main API
pub use cache::{CacheEntry, CacheStats, CacheStore, PutOutcome, QueryCache, QueryKey};
pub use database::{Change, Commit, CommitListener, Database, MemoryDatabase, WriteBatch};
pub use gateway::{CancelHandle, Gateway, GatewayStats, LoadContext, PinGuard, ReadOptions, TickReport};
pub use notes::NoteService;
pub use txn::{CoherenceCoordinator, CoherenceStats, InvalidationListener, InvalidationMessage};
pub use types::{EntityKey, Note, PrimaryKey, Row, Version, Versioned};
