//! Per-entity async locks.

use dashmap::DashMap;
use std::sync::Arc;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::debug;

type Slots = DashMap<String, Arc<Mutex<()>>>;

/// Async mutex per entity id, created on first use and dropped once no
/// holder or waiter is left.
///
/// Callers that need both an alert and a responder lock take the alert's
/// first.
#[derive(Debug, Default)]
pub struct LockTable {
    kind: &'static str,
    locks: Arc<Slots>,
}

/// Exclusive access to one entity until dropped.
#[derive(Debug)]
pub struct EntityGuard {
    id: String,
    guard: Option<OwnedMutexGuard<()>>,
    locks: Arc<Slots>,
}

impl Drop for EntityGuard {
    fn drop(&mut self) {
        drop(self.guard.take());
        // Waiters hold their own clone, so a count of one means the map is
        // the only owner left.
        self.locks
            .remove_if(&self.id, |_, mutex| Arc::strong_count(mutex) == 1);
    }
}

impl LockTable {
    pub fn new(kind: &'static str) -> Self {
        Self {
            kind,
            locks: Arc::new(DashMap::new()),
        }
    }

    /// Wait for exclusive access to `id`.
    pub async fn lock(&self, id: &str) -> EntityGuard {
        let mutex = self
            .locks
            .entry(id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone();
        let guard = mutex.lock_owned().await;
        debug!(kind = self.kind, id, "Entity lock acquired");
        EntityGuard {
            id: id.to_string(),
            guard: Some(guard),
            locks: Arc::clone(&self.locks),
        }
    }

    /// Ids with a live holder or waiter.
    pub fn len(&self) -> usize {
        self.locks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.locks.is_empty()
    }
}
