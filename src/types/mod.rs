//! Core data types shared by the cache, the coordinator and the database layer

mod key;

pub use key::{EntityKey, PrimaryKey};

use crate::Result;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Row version (optimistic-lock counter, monotonically increasing per key)
pub type Version = u64;

/// Global invalidation sequence number
pub type Sequence = u64;

/// Serialized entity snapshot
///
/// Using Arc<[u8]> so cache hits hand out snapshots without copying
pub type Snapshot = Arc<[u8]>;

/// A committed database row: version + encoded entity
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Row {
    pub version: Version,
    pub data: Snapshot,
}

impl Row {
    pub fn new(version: Version, data: impl Into<Snapshot>) -> Self {
        Self {
            version,
            data: data.into(),
        }
    }
}

/// A typed value together with the version it was read at
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Versioned<T> {
    pub version: Version,
    pub value: T,
}

impl<T> Versioned<T> {
    pub fn new(version: Version, value: T) -> Self {
        Self { version, value }
    }
}

/// Encode an entity into a snapshot
pub fn encode<T: Serialize>(value: &T) -> Result<Snapshot> {
    let bytes = bincode::serialize(value)?;
    Ok(Arc::from(bytes))
}

/// Decode an entity from a snapshot
pub fn decode<T: DeserializeOwned>(data: &[u8]) -> Result<T> {
    Ok(bincode::deserialize(data)?)
}

/// The entity of the demo workload (`notes` table)
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Note {
    pub id: i64,
    pub title: String,
    pub content: String,
    pub archived: bool,
}

impl Note {
    pub const ENTITY: &'static str = "Note";

    pub fn key(id: i64) -> EntityKey {
        EntityKey::new(Self::ENTITY, id)
    }
}
