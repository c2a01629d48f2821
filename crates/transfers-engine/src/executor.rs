//! Worker pools and in-flight cancellation
//!
//! Parents run on a flat pool. Children are grouped by a hash of their top task
//! id, so the children of one transfer share a bounded group while different
//! transfers proceed in parallel.

use std::collections::hash_map::DefaultHasher;
use std::collections::HashMap;
use std::hash::{Hash, Hasher};
use std::sync::{Arc, Mutex};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio_util::sync::CancellationToken;
use tracing::debug;
use transfers_config::WorkersConfig;
use transfers_types::{Error, Result};
use uuid::Uuid;

/// Concurrency limits of one worker process
#[derive(Debug)]
pub struct WorkerPools {
    parent_capacity: Arc<Semaphore>,
    parent_workers: Arc<Semaphore>,
    child_groups: Vec<Arc<Semaphore>>,
}

impl WorkerPools {
    /// Size the pools from the worker settings
    pub fn new(config: &WorkersConfig) -> Self {
        let group_size = config.child_group_size.max(1);
        Self {
            parent_capacity: Arc::new(Semaphore::new(config.parent_capacity().max(1))),
            parent_workers: Arc::new(Semaphore::new(config.parent_pool_size.max(1))),
            child_groups: (0..config.child_group_count.max(1))
                .map(|_| Arc::new(Semaphore::new(group_size)))
                .collect(),
        }
    }

    /// Reserve an in-flight parent slot, waiting while the capacity is used up
    pub async fn reserve_parent(&self) -> Result<OwnedSemaphorePermit> {
        Arc::clone(&self.parent_capacity)
            .acquire_owned()
            .await
            .map_err(|_| Error::other("parent pool closed"))
    }

    /// Free in-flight parent slots, used to throttle scheduler polls
    pub fn parent_slots_available(&self) -> usize {
        self.parent_capacity.available_permits()
    }

    /// Wait for a parent worker
    pub async fn parent_worker(&self) -> Result<OwnedSemaphorePermit> {
        Arc::clone(&self.parent_workers)
            .acquire_owned()
            .await
            .map_err(|_| Error::other("parent pool closed"))
    }

    /// Group that runs the children of `task_id`
    pub fn group_for(&self, task_id: Uuid) -> usize {
        let mut hasher = DefaultHasher::new();
        task_id.hash(&mut hasher);
        (hasher.finish() % self.child_groups.len() as u64) as usize
    }

    /// Wait for a slot in the child group of `task_id`
    pub async fn child_worker(&self, task_id: Uuid) -> Result<OwnedSemaphorePermit> {
        let group = self.group_for(task_id);
        Arc::clone(&self.child_groups[group])
            .acquire_owned()
            .await
            .map_err(|_| Error::other("child pool closed"))
    }
}

/// Cancellation tokens for the transfers with children in flight
#[derive(Debug, Default)]
pub struct CancelRegistry {
    tokens: Mutex<HashMap<Uuid, (CancellationToken, usize)>>,
}

impl CancelRegistry {
    /// Create an empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Register one in-flight child of `task_id`. The token is shared by every
    /// child of the transfer and forgotten when the last guard drops.
    pub fn register(self: &Arc<Self>, task_id: Uuid) -> CancelGuard {
        let token = match self.tokens.lock() {
            Ok(mut tokens) => {
                let entry = tokens
                    .entry(task_id)
                    .or_insert_with(|| (CancellationToken::new(), 0));
                entry.1 += 1;
                entry.0.clone()
            }
            Err(_) => CancellationToken::new(),
        };
        CancelGuard {
            registry: Arc::clone(self),
            task_id,
            token,
        }
    }

    /// Interrupt every in-flight child of `task_id`. Returns whether any was running.
    pub fn cancel(&self, task_id: Uuid) -> bool {
        let Ok(tokens) = self.tokens.lock() else {
            return false;
        };
        match tokens.get(&task_id) {
            Some((token, _)) => {
                debug!(%task_id, "Cancelling in-flight children");
                token.cancel();
                true
            }
            None => false,
        }
    }

    /// Transfers with children in flight
    pub fn active(&self) -> usize {
        self.tokens.lock().map(|t| t.len()).unwrap_or(0)
    }

    fn release(&self, task_id: Uuid) {
        if let Ok(mut tokens) = self.tokens.lock() {
            if let Some(entry) = tokens.get_mut(&task_id) {
                entry.1 = entry.1.saturating_sub(1);
                if entry.1 == 0 {
                    tokens.remove(&task_id);
                }
            }
        }
    }
}

/// Keeps a transfer's token registered while a child runs
#[derive(Debug)]
pub struct CancelGuard {
    registry: Arc<CancelRegistry>,
    task_id: Uuid,
    token: CancellationToken,
}

impl CancelGuard {
    /// Token fired when the transfer is cancelled
    pub fn token(&self) -> &CancellationToken {
        &self.token
    }
}

impl Drop for CancelGuard {
    fn drop(&mut self) {
        self.registry.release(self.task_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn workers(groups: usize, size: usize) -> WorkersConfig {
        WorkersConfig {
            child_group_count: groups,
            child_group_size: size,
            parent_pool_size: 2,
            capacity_multiplier: 2,
            ..WorkersConfig::default()
        }
    }

    #[test]
    fn test_group_is_stable_per_transfer() {
        let pools = WorkerPools::new(&workers(8, 2));
        let task_id = Uuid::new_v4();
        let group = pools.group_for(task_id);
        assert!(group < 8);
        assert_eq!(pools.group_for(task_id), group);
    }

    #[tokio::test]
    async fn test_children_of_one_transfer_are_bounded() {
        let pools = WorkerPools::new(&workers(1, 2));
        let task_id = Uuid::new_v4();
        let first = pools.child_worker(task_id).await.unwrap();
        let _second = pools.child_worker(task_id).await.unwrap();

        let mut third = tokio_test::task::spawn(pools.child_worker(task_id));
        tokio_test::assert_pending!(third.poll());
        drop(first);
        assert!(third.is_woken());
        tokio_test::assert_ready_ok!(third.poll());
    }

    #[tokio::test]
    async fn test_parent_capacity() {
        let pools = WorkerPools::new(&workers(1, 1));
        assert_eq!(pools.parent_slots_available(), 4);
        let held = pools.reserve_parent().await.unwrap();
        assert_eq!(pools.parent_slots_available(), 3);
        drop(held);
        assert_eq!(pools.parent_slots_available(), 4);
    }

    #[test]
    fn test_cancel_reaches_every_guard() {
        let registry = Arc::new(CancelRegistry::new());
        let task_id = Uuid::new_v4();
        let first = registry.register(task_id);
        let second = registry.register(task_id);

        assert!(registry.cancel(task_id));
        assert!(first.token().is_cancelled());
        assert!(second.token().is_cancelled());

        drop(first);
        assert_eq!(registry.active(), 1);
        drop(second);
        assert_eq!(registry.active(), 0);
        assert!(!registry.cancel(task_id));
    }
}
