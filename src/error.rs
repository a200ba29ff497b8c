//! Error types for the entity cache

use crate::types::{EntityKey, Version};
use std::time::Duration;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, CacheError>;

#[derive(Error, Debug)]
pub enum CacheError {
    /// Optimistic write against an outdated version; re-read and retry
    #[error("Stale write rejected for {key}: expected version {expected}, current {actual}")]
    StaleWriteRejected {
        key: EntityKey,
        expected: Version,
        actual: Version,
    },

    /// Invalidation for a committed write could not be confirmed.
    /// The write itself is committed at `version`; the key is in bypass mode.
    #[error("Coherence violation for {key} at version {version} after {attempts} attempts")]
    CoherenceViolation {
        key: EntityKey,
        version: Version,
        attempts: u32,
    },

    #[error("Database unavailable: {0}")]
    DatabaseUnavailable(String),

    #[error("Database error: {0}")]
    Database(String),

    #[error("Load cancelled for {0}")]
    LoadCancelled(EntityKey),

    #[error("Load timed out for {key} after {elapsed:?}")]
    LoadTimedOut { key: EntityKey, elapsed: Duration },

    #[error("Lock timeout on {key} after {waited:?}")]
    LockTimeout { key: EntityKey, waited: Duration },

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Invalid config: {0}")]
    InvalidConfig(String),

    #[error("Invalid key: {0}")]
    InvalidKey(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl CacheError {
    /// True for errors raised by the database collaborator
    pub fn is_database(&self) -> bool {
        matches!(
            self,
            CacheError::Database(_) | CacheError::DatabaseUnavailable(_)
        )
    }
}

impl From<bincode::Error> for CacheError {
    fn from(err: bincode::Error) -> Self {
        CacheError::Serialization(err.to_string())
    }
}

impl From<serde_json::Error> for CacheError {
    fn from(err: serde_json::Error) -> Self {
        CacheError::Serialization(err.to_string())
    }
}
