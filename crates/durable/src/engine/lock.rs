//! Per-instance mutual exclusion

use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::{Mutex, OwnedMutexGuard};
use uuid::Uuid;

/// In-process lock table keyed by instance id
///
/// Serializes work on one instance inside a process. The engine uses it in
/// front of the store lease, and the in-memory store uses it as the lease.
#[derive(Debug, Default)]
pub struct InstanceLocks {
    locks: DashMap<Uuid, Arc<Mutex<()>>>,
}

/// Held while an instance is being advanced
#[derive(Debug)]
pub struct InstanceGuard {
    instance_id: Uuid,
    _guard: OwnedMutexGuard<()>,
}

impl InstanceGuard {
    pub fn instance_id(&self) -> Uuid {
        self.instance_id
    }
}

impl InstanceLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Wait for exclusive access to an instance
    pub async fn acquire(&self, instance_id: Uuid) -> InstanceGuard {
        // Clone the Arc out so the map shard is not held across the await.
        let mutex = Arc::clone(self.locks.entry(instance_id).or_default().value());
        let guard = mutex.lock_owned().await;
        InstanceGuard {
            instance_id,
            _guard: guard,
        }
    }

    /// Check whether an instance is currently locked
    pub fn is_locked(&self, instance_id: Uuid) -> bool {
        self.locks
            .get(&instance_id)
            .map(|m| m.try_lock().is_err())
            .unwrap_or(false)
    }

    /// Drop entries nobody holds or waits on
    pub fn prune(&self) {
        self.locks.retain(|_, mutex| Arc::strong_count(mutex) > 1);
    }

    /// Number of tracked instances
    pub fn len(&self) -> usize {
        self.locks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.locks.is_empty()
    }
}
