//! Cache module - entity snapshot store, eviction policies, query results

pub mod eviction;
pub mod query_cache;
pub mod store;

pub use eviction::{build_policy, EvictionPolicy, LruPolicy, LruTtlPolicy, TtlPolicy};
pub use query_cache::{QueryCache, QueryCacheStats, QueryKey};
pub use store::{CacheEntry, CacheStats, CacheStore, PutOutcome};
