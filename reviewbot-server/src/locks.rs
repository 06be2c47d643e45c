//! Per-PR lock registry.
//!
//! Every pull request gets its own async mutex, created the first time the
//! PR is referenced. Two callers asking for the same PR always receive the same
//! mutex; different PRs never contend.

use std::collections::HashMap;
use std::sync::Arc;

use reviewbot_core::PullRequestId;
use tokio::sync::{Mutex, RwLock};
use tracing::debug;

/// Handle to one PR's mutex. Lock it with `handle.lock().await`.
pub type PrLock = Arc<Mutex<()>>;

#[derive(Default)]
pub struct LockRegistry {
    locks: RwLock<HashMap<PullRequestId, PrLock>>,
}

impl LockRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Get or create the lock for a PR.
    ///
    /// The create path re-checks under the write lock, so two callers racing
    /// on a new PR still end up sharing one mutex.
    pub async fn acquire_lock(&self, pr: &PullRequestId) -> PrLock {
        {
            let locks = self.locks.read().await;
            if let Some(lock) = locks.get(pr) {
                return lock.clone();
            }
        }

        let mut locks = self.locks.write().await;
        locks
            .entry(pr.clone())
            .or_insert_with(|| {
                debug!("Creating lock for {}", pr);
                Arc::new(Mutex::new(()))
            })
            .clone()
    }

    /// Number of PRs with a lock entry.
    pub async fn len(&self) -> usize {
        self.locks.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.locks.read().await.is_empty()
    }

    /// Drop entries that only the registry still references.
    ///
    /// A task that holds or waits on a lock owns a clone of its `Arc`, so those
    /// entries are kept. Removal happens under the write lock, which also
    /// guards `acquire_lock`'s create path, so no caller can be handed a mutex
    /// that has just been dropped from the map.
    pub async fn prune_idle(&self) -> usize {
        let mut locks = self.locks.write().await;
        let before = locks.len();
        locks.retain(|_, lock| Arc::strong_count(lock) > 1);
        before - locks.len()
    }
}
