//! Entity keys: entity type name + primary key value

use crate::{CacheError, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Primary key value of a cached entity
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum PrimaryKey {
    /// Numeric identity column (the common `BIGINT AUTO_INCREMENT` case)
    Int(i64),
    /// Natural / string key
    Text(String),
}

impl fmt::Display for PrimaryKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PrimaryKey::Int(id) => write!(f, "{}", id),
            PrimaryKey::Text(id) => f.write_str(id),
        }
    }
}

impl From<i64> for PrimaryKey {
    fn from(id: i64) -> Self {
        PrimaryKey::Int(id)
    }
}

impl From<i32> for PrimaryKey {
    fn from(id: i32) -> Self {
        PrimaryKey::Int(id as i64)
    }
}

impl From<&str> for PrimaryKey {
    fn from(id: &str) -> Self {
        PrimaryKey::Text(id.to_string())
    }
}

impl From<String> for PrimaryKey {
    fn from(id: String) -> Self {
        PrimaryKey::Text(id)
    }
}

/// Cache key: (entity type, primary key)
///
/// The entity type doubles as the cache *region*: region-wide invalidation and
/// suspect marking operate on every key sharing it.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct EntityKey {
    entity: String,
    id: PrimaryKey,
}

impl EntityKey {
    pub fn new(entity: impl Into<String>, id: impl Into<PrimaryKey>) -> Self {
        Self {
            entity: entity.into(),
            id: id.into(),
        }
    }

    /// Entity type name (region)
    pub fn entity(&self) -> &str {
        &self.entity
    }

    pub fn id(&self) -> &PrimaryKey {
        &self.id
    }
}

impl fmt::Display for EntityKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}", self.entity, self.id)
    }
}

impl FromStr for EntityKey {
    type Err = CacheError;

    /// Parses `"User#1"` (numeric id) or `"Tag#rust"` (text id)
    fn from_str(s: &str) -> Result<Self> {
        let (entity, id) = s
            .split_once('#')
            .ok_or_else(|| CacheError::InvalidKey(format!("missing '#' in '{}'", s)))?;

        if entity.is_empty() || id.is_empty() {
            return Err(CacheError::InvalidKey(format!(
                "empty entity or id in '{}'",
                s
            )));
        }

        let id = match id.parse::<i64>() {
            Ok(n) => PrimaryKey::Int(n),
            Err(_) => PrimaryKey::Text(id.to_string()),
        };

        Ok(Self::new(entity, id))
    }
}
