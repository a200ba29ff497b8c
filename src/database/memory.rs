//! In-memory database with versioned rows and commit notifications
//!
//! Commits are serialized by a commit mutex and listeners run while it is held,
//! so notifications for the same key always arrive in commit order.

use super::{Change, Commit, CommitListener, Database, WriteBatch};
use crate::types::{EntityKey, Row, Snapshot, Version};
use crate::{CacheError, Result};
use ahash::{AHashMap, RandomState};
use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use tracing::debug;

/// Stored row; deleted rows keep their version so re-inserts stay monotonic
#[derive(Debug, Clone)]
struct StoredRow {
    version: Version,
    data: Option<Snapshot>,
}

/// Database statistics
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MemoryDatabaseStats {
    pub loads: u64,
    pub scans: u64,
    pub commits: u64,
    pub rows: usize,
}

/// In-memory `Database`
pub struct MemoryDatabase {
    rows: DashMap<EntityKey, StoredRow, RandomState>,
    /// Held weakly: a dropped subscriber stops receiving commits
    listeners: RwLock<Vec<Weak<dyn CommitListener>>>,
    commit_lock: Mutex<()>,
    commit_seq: AtomicU64,
    available: AtomicBool,
    loads: AtomicU64,
    scans: AtomicU64,
}

impl MemoryDatabase {
    pub fn new() -> Self {
        Self {
            rows: DashMap::with_hasher(RandomState::new()),
            listeners: RwLock::new(Vec::new()),
            commit_lock: Mutex::new(()),
            commit_seq: AtomicU64::new(0),
            available: AtomicBool::new(true),
            loads: AtomicU64::new(0),
            scans: AtomicU64::new(0),
        }
    }

    /// Simulate an outage (false) or recovery (true)
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    fn ensure_available(&self) -> Result<()> {
        if self.available.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(CacheError::DatabaseUnavailable(
                "memory database is offline".to_string(),
            ))
        }
    }

    /// Current version of a row (0 = never written)
    pub fn version_of(&self, key: &EntityKey) -> Version {
        self.rows.get(key).map(|row| row.version).unwrap_or(0)
    }

    /// Subscribers still alive
    pub fn listener_count(&self) -> usize {
        self.listeners
            .read()
            .iter()
            .filter(|listener| listener.strong_count() > 0)
            .count()
    }

    pub fn stats(&self) -> MemoryDatabaseStats {
        MemoryDatabaseStats {
            loads: self.loads.load(Ordering::Relaxed),
            scans: self.scans.load(Ordering::Relaxed),
            commits: self.commit_seq.load(Ordering::Relaxed),
            rows: self.rows.iter().filter(|row| row.data.is_some()).count(),
        }
    }
}

impl Default for MemoryDatabase {
    fn default() -> Self {
        Self::new()
    }
}

impl Database for MemoryDatabase {
    fn load(&self, key: &EntityKey) -> Result<Option<Row>> {
        self.ensure_available()?;
        self.loads.fetch_add(1, Ordering::Relaxed);

        Ok(self.rows.get(key).and_then(|row| {
            row.data
                .as_ref()
                .map(|data| Row::new(row.version, Arc::clone(data)))
        }))
    }

    fn scan(&self, entity: &str) -> Result<Vec<(EntityKey, Row)>> {
        self.ensure_available()?;
        self.scans.fetch_add(1, Ordering::Relaxed);

        let mut rows: Vec<(EntityKey, Row)> = self
            .rows
            .iter()
            .filter(|row| row.key().entity() == entity)
            .filter_map(|row| {
                row.data
                    .as_ref()
                    .map(|data| (row.key().clone(), Row::new(row.version, Arc::clone(data))))
            })
            .collect();
        rows.sort_by(|a, b| a.0.cmp(&b.0));
        Ok(rows)
    }

    fn commit(&self, batch: WriteBatch<'_>) -> Result<Commit> {
        self.ensure_available()?;
        let _guard = self.commit_lock.lock();

        // Stage every op first so a failing mutation leaves no trace
        let mut staged: AHashMap<EntityKey, StoredRow> = AHashMap::new();
        let mut order: Vec<EntityKey> = Vec::new();

        for op in batch.into_ops() {
            let current = match staged.get(&op.key) {
                Some(row) => row.clone(),
                None => self
                    .rows
                    .get(&op.key)
                    .map(|row| row.clone())
                    .unwrap_or(StoredRow {
                        version: 0,
                        data: None,
                    }),
            };

            if let Some(expected) = op.expected_version {
                if expected != current.version {
                    return Err(CacheError::StaleWriteRejected {
                        key: op.key,
                        expected,
                        actual: current.version,
                    });
                }
            }

            let data = (op.mutation)(current.data.as_deref())?.map(Snapshot::from);
            if !staged.contains_key(&op.key) {
                order.push(op.key.clone());
            }
            staged.insert(
                op.key,
                StoredRow {
                    version: current.version + 1,
                    data,
                },
            );
        }

        let mut changes = Vec::with_capacity(order.len());
        for key in order {
            if let Some(row) = staged.remove(&key) {
                self.rows.insert(key.clone(), row.clone());
                changes.push(Change {
                    key,
                    version: row.version,
                    data: row.data,
                });
            }
        }

        let seq = self.commit_seq.fetch_add(1, Ordering::SeqCst) + 1;
        let commit = Commit { seq, changes };
        debug!(seq, changes = commit.changes.len(), "committed");

        // Snapshot so listeners may subscribe others without deadlocking
        let listeners: Vec<Arc<dyn CommitListener>> = self
            .listeners
            .read()
            .iter()
            .filter_map(Weak::upgrade)
            .collect();
        for listener in &listeners {
            listener.on_commit(&commit);
        }

        let mut registered = self.listeners.write();
        let before = registered.len();
        registered.retain(|listener| listener.strong_count() > 0);
        if registered.len() < before {
            debug!(dropped = before - registered.len(), "pruned dropped commit listeners");
        }
        drop(registered);

        Ok(commit)
    }

    fn subscribe(&self, listener: Arc<dyn CommitListener>) {
        self.listeners.write().push(Arc::downgrade(&listener));
    }
}
