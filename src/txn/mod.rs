//! Coherence layer: slot locks and commit-driven invalidation

pub mod coordinator;
pub mod lock_manager;

pub use coordinator::{CoherenceCoordinator, CoherenceStats, InvalidationListener, InvalidationMessage};
pub use lock_manager::{HolderId, LockManagerStats, LockMode, SlotGuard, SlotLockManager};
