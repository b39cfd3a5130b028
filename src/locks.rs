//! Per-environment write exclusion
//!
//! At most one clone, backup or restore holds write access to an
//! environment at a time. Holders keep an [`EnvironmentLease`]; dropping it
//! releases the environment, and the last one out removes its map entry.

use crate::error::AppError;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};
use tracing::debug;
use uuid::Uuid;

type LockMap = Arc<Mutex<HashMap<Uuid, Arc<AsyncMutex<()>>>>>;

#[derive(Default)]
pub struct EnvironmentLocks {
    locks: LockMap,
}

/// Exclusive write access to one environment
#[derive(Debug)]
pub struct EnvironmentLease {
    environment_id: Uuid,
    guard: Option<OwnedMutexGuard<()>>,
    locks: LockMap,
}

impl Drop for EnvironmentLease {
    fn drop(&mut self) {
        drop(self.guard.take());
        let mut locks = self.locks.lock();
        // Waiters hold their own clone, so a count of one means nobody is queued
        if locks.get(&self.environment_id).map_or(false, |lock| Arc::strong_count(lock) == 1) {
            locks.remove(&self.environment_id);
        }
    }
}

impl EnvironmentLease {
    pub fn environment_id(&self) -> Uuid {
        self.environment_id
    }

    /// Fail unless this lease covers `environment_id`
    pub fn ensure_covers(&self, environment_id: Uuid) -> Result<(), AppError> {
        if self.environment_id == environment_id {
            Ok(())
        } else {
            Err(AppError::Internal(format!(
                "Lease for environment {} used for {}",
                self.environment_id, environment_id
            )))
        }
    }
}

impl EnvironmentLocks {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock_for(&self, environment_id: Uuid) -> Arc<AsyncMutex<()>> {
        self.locks
            .lock()
            .entry(environment_id)
            .or_insert_with(|| Arc::new(AsyncMutex::new(())))
            .clone()
    }

    fn lease(&self, environment_id: Uuid, guard: OwnedMutexGuard<()>) -> EnvironmentLease {
        EnvironmentLease {
            environment_id,
            guard: Some(guard),
            locks: self.locks.clone(),
        }
    }

    #[cfg(test)]
    fn tracked(&self) -> usize {
        self.locks.lock().len()
    }

    /// Wait until the environment is free
    pub async fn acquire(&self, environment_id: Uuid) -> EnvironmentLease {
        let guard = self.lock_for(environment_id).lock_owned().await;
        debug!("Acquired write lease on environment {}", environment_id);
        self.lease(environment_id, guard)
    }

    /// Take the lease only if nobody holds it
    pub fn try_acquire(&self, environment_id: Uuid) -> Result<EnvironmentLease, AppError> {
        let lock = self.lock_for(environment_id);
        match lock.try_lock_owned() {
            Ok(guard) => Ok(self.lease(environment_id, guard)),
            Err(_) => Err(AppError::Conflict(format!(
                "Environment {} is busy with another clone, backup or restore",
                environment_id
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_lease_excludes_second_holder_until_dropped() {
        let locks = Arc::new(EnvironmentLocks::new());
        let env = Uuid::new_v4();

        let lease = locks.acquire(env).await;
        assert!(matches!(locks.try_acquire(env), Err(AppError::Conflict(_))));
        assert!(locks.try_acquire(Uuid::new_v4()).is_ok());

        let waiter = {
            let locks = locks.clone();
            tokio::spawn(async move { locks.acquire(env).await.environment_id() })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!waiter.is_finished());

        drop(lease);
        assert_eq!(waiter.await.unwrap(), env);
    }

    #[tokio::test]
    async fn test_released_environments_leave_no_entry_behind() {
        let locks = Arc::new(EnvironmentLocks::new());
        for _ in 0..50 {
            let lease = locks.acquire(Uuid::new_v4()).await;
            drop(lease);
        }
        assert_eq!(locks.tracked(), 0);

        let env = Uuid::new_v4();
        let lease = locks.acquire(env).await;
        assert!(locks.try_acquire(env).is_err());
        let waiter = {
            let locks = locks.clone();
            tokio::spawn(async move { locks.acquire(env).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;

        // The queued waiter keeps the entry alive past the first release
        drop(lease);
        let second = waiter.await.unwrap();
        assert_eq!(locks.tracked(), 1);
        assert!(locks.try_acquire(env).is_err());

        drop(second);
        assert_eq!(locks.tracked(), 0);
    }

    #[tokio::test]
    async fn test_lease_covers_only_its_environment() {
        let locks = EnvironmentLocks::new();
        let env = Uuid::new_v4();
        let lease = locks.acquire(env).await;
        assert!(lease.ensure_covers(env).is_ok());
        assert!(lease.ensure_covers(Uuid::new_v4()).is_err());
    }
}
