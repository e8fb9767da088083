//! Concurrency slot pools.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

use ferrum_core::Message;

use crate::cooldown::{BucketKey, BucketScope};
use crate::error::{CommandError, CommandResult};

/// Pools above this count get pruned of idle entries.
const PRUNE_THRESHOLD: usize = 1024;

/// Bounds in-flight invocations of one command per bucket.
#[derive(Debug)]
pub struct MaxConcurrency {
    limit: usize,
    scope: BucketScope,
    wait: bool,
    pools: Mutex<HashMap<BucketKey, Arc<Semaphore>>>,
}

/// A held slot. Dropping it frees the slot.
#[derive(Debug)]
pub struct ConcurrencyPermit {
    _permit: OwnedSemaphorePermit,
}

impl MaxConcurrency {
    /// With `wait` set, a saturated pool suspends the caller instead of failing.
    pub fn new(limit: usize, scope: BucketScope, wait: bool) -> Self {
        Self {
            limit: limit.max(1),
            scope,
            wait,
            pools: Mutex::new(HashMap::new()),
        }
    }

    pub fn limit(&self) -> usize {
        self.limit
    }

    pub fn scope(&self) -> BucketScope {
        self.scope
    }

    pub fn waits(&self) -> bool {
        self.wait
    }

    fn pool(&self, message: &Message) -> Arc<Semaphore> {
        let mut pools = self.pools.lock();
        if pools.len() > PRUNE_THRESHOLD {
            let limit = self.limit;
            // Held permits and pending acquisitions keep their own clone.
            pools.retain(|_, pool| {
                Arc::strong_count(pool) > 1 || pool.available_permits() != limit
            });
        }
        pools
            .entry(self.scope.key(message))
            .or_insert_with(|| Arc::new(Semaphore::new(self.limit)))
            .clone()
    }

    fn saturated(&self) -> CommandError {
        CommandError::MaxConcurrencyReached {
            limit: self.limit,
            scope: self.scope,
        }
    }

    /// Takes a slot for the message's bucket.
    pub async fn acquire(&self, message: &Message) -> CommandResult<ConcurrencyPermit> {
        let pool = self.pool(message);
        let permit = if self.wait {
            pool.acquire_owned().await.map_err(|_| self.saturated())?
        } else {
            pool.try_acquire_owned().map_err(|_| self.saturated())?
        };
        Ok(ConcurrencyPermit { _permit: permit })
    }

    /// Free slots in the message's bucket.
    pub fn available(&self, message: &Message) -> usize {
        self.pool(message).available_permits()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::message_from;
    use tokio_test::{assert_pending, assert_ready, task};

    #[tokio::test]
    async fn test_non_blocking_rejects_when_full() {
        let limit = MaxConcurrency::new(1, BucketScope::Global, false);
        let msg = message_from(1, 1, None);

        let held = limit.acquire(&msg).await.unwrap();
        assert!(matches!(
            limit.acquire(&msg).await,
            Err(CommandError::MaxConcurrencyReached { limit: 1, .. })
        ));

        drop(held);
        assert_eq!(limit.available(&msg), 1);
        assert!(limit.acquire(&msg).await.is_ok());
    }

    #[tokio::test]
    async fn test_blocking_waits_for_release() {
        let limit = MaxConcurrency::new(1, BucketScope::User, true);
        let msg = message_from(1, 1, None);

        let held = limit.acquire(&msg).await.unwrap();
        let mut waiting = task::spawn(limit.acquire(&msg));
        assert_pending!(waiting.poll());

        drop(held);
        assert!(waiting.is_woken());
        let permit = assert_ready!(waiting.poll());
        assert!(permit.is_ok());
    }

    #[tokio::test]
    async fn test_scopes_have_separate_pools() {
        let limit = MaxConcurrency::new(1, BucketScope::User, false);
        let _a = limit.acquire(&message_from(1, 1, None)).await.unwrap();
        assert!(limit.acquire(&message_from(2, 1, None)).await.is_ok());
    }

    #[tokio::test]
    async fn test_idle_pools_are_pruned() {
        let limit = MaxConcurrency::new(1, BucketScope::User, false);
        let busy = message_from(0, 1, None);
        let held = limit.acquire(&busy).await.unwrap();

        for user in 1..=3 * PRUNE_THRESHOLD as u64 {
            let permit = limit.acquire(&message_from(user, 1, None)).await.unwrap();
            drop(permit);
        }
        assert!(limit.pools.lock().len() <= PRUNE_THRESHOLD + 1);

        // The busy pool survived pruning with its slot still taken.
        assert!(limit.acquire(&busy).await.is_err());
        drop(held);
        assert_eq!(limit.available(&busy), 1);
    }
}
