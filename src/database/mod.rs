//! Database collaborator
//!
//! The cache treats the relational database as an external collaborator behind
//! the `Database` trait: versioned row reads, transactional batch commits and
//! commit notifications. `MemoryDatabase` is the in-process implementation.

mod memory;

pub use memory::{MemoryDatabase, MemoryDatabaseStats};

use crate::types::{EntityKey, Row, Snapshot, Version};
use crate::Result;
use std::fmt;
use std::sync::Arc;

/// Row mutation: current snapshot (None = absent) -> new snapshot (None = delete)
pub type Mutation<'a> = Box<dyn FnOnce(Option<&[u8]>) -> Result<Option<Vec<u8>>> + 'a>;

/// One keyed write inside a batch
pub struct WriteOp<'a> {
    pub key: EntityKey,
    /// Optimistic check: the row must currently be at this version (0 = absent)
    pub expected_version: Option<Version>,
    pub mutation: Mutation<'a>,
}

impl fmt::Debug for WriteOp<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WriteOp")
            .field("key", &self.key)
            .field("expected_version", &self.expected_version)
            .finish_non_exhaustive()
    }
}

/// Transactional write batch (all ops commit or none do)
#[derive(Debug, Default)]
pub struct WriteBatch<'a> {
    ops: Vec<WriteOp<'a>>,
}

impl<'a> WriteBatch<'a> {
    pub fn new() -> Self {
        Self { ops: Vec::new() }
    }

    /// Overwrite the row with `data`
    pub fn put(self, key: EntityKey, data: Vec<u8>) -> Self {
        self.modify(key, move |_| Ok(Some(data)))
    }

    /// Delete the row
    pub fn delete(self, key: EntityKey) -> Self {
        self.modify(key, |_| Ok(None))
    }

    /// Apply `mutation` to the current row
    pub fn modify<F>(self, key: EntityKey, mutation: F) -> Self
    where
        F: FnOnce(Option<&[u8]>) -> Result<Option<Vec<u8>>> + 'a,
    {
        self.push(key, None, mutation)
    }

    /// Apply `mutation` only if the row is at `expected_version`
    pub fn modify_expecting<F>(self, key: EntityKey, expected_version: Version, mutation: F) -> Self
    where
        F: FnOnce(Option<&[u8]>) -> Result<Option<Vec<u8>>> + 'a,
    {
        self.push(key, Some(expected_version), mutation)
    }

    fn push<F>(mut self, key: EntityKey, expected_version: Option<Version>, mutation: F) -> Self
    where
        F: FnOnce(Option<&[u8]>) -> Result<Option<Vec<u8>>> + 'a,
    {
        self.ops.push(WriteOp {
            key,
            expected_version,
            mutation: Box::new(mutation),
        });
        self
    }

    /// Keys touched by the batch (may repeat)
    pub fn keys(&self) -> Vec<EntityKey> {
        self.ops.iter().map(|op| op.key.clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.ops.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    pub fn into_ops(self) -> Vec<WriteOp<'a>> {
        self.ops
    }
}

/// One committed row change
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Change {
    pub key: EntityKey,
    /// Version after the commit
    pub version: Version,
    /// New snapshot, None when the row was deleted
    pub data: Option<Snapshot>,
}

/// A committed transaction
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Commit {
    /// Database commit sequence
    pub seq: u64,
    /// Final state of every touched key, one change per key
    pub changes: Vec<Change>,
}

impl Commit {
    pub fn change(&self, key: &EntityKey) -> Option<&Change> {
        self.changes.iter().find(|change| &change.key == key)
    }
}

/// Receives commit notifications, in commit order per key
pub trait CommitListener: Send + Sync {
    fn on_commit(&self, commit: &Commit);
}

/// Database collaborator
pub trait Database: Send + Sync {
    /// Read the committed row (None = absent or deleted)
    fn load(&self, key: &EntityKey) -> Result<Option<Row>>;

    /// All committed rows of an entity type, ordered by key
    fn scan(&self, entity: &str) -> Result<Vec<(EntityKey, Row)>>;

    /// Commit a batch atomically; listeners are notified before this returns
    fn commit(&self, batch: WriteBatch<'_>) -> Result<Commit>;

    /// Register a commit listener
    ///
    /// Implementations hold the listener weakly; it stays registered while the
    /// caller keeps it alive.
    fn subscribe(&self, listener: Arc<dyn CommitListener>);
}
