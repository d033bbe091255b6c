//! Distributed lock on top of a coordination service
//!
//! Each contender creates an ephemeral sequential node under
//! `/locks/<name>`. The contender owning the lowest sequence holds the lock;
//! every other contender watches only its immediate predecessor, so a release
//! wakes exactly one waiter. Session loss deletes the node and releases the
//! lock implicitly.

use std::sync::Arc;
use std::time::{Duration, Instant};

use md5::{Digest, Md5};

use crate::coordination::{
    CoordinationError, Coordinator, CreateMode, ensure_path, sort_by_sequence,
};

pub const LOCK_ROOT: &str = "/locks";
pub const LOCK_PREFIX: &str = "-lock";
pub const DEFAULT_LOCK_TIMEOUT: Duration = Duration::from_secs(30);

/// Lock name scoped to an account: `<account>-<md5("<prefix>-<value>")>`
pub fn lock_name(prefix: &str, account_id: &str, value: &str) -> String {
    let digest = Md5::digest(format!("{prefix}-{value}").as_bytes());
    format!("{account_id}-{}", const_hex::encode(&digest[..]))
}

pub struct DistributedLock {
    coordinator: Arc<dyn Coordinator>,
    timeout: Duration,
}

impl DistributedLock {
    pub fn new(coordinator: Arc<dyn Coordinator>) -> Self {
        Self {
            coordinator,
            timeout: DEFAULT_LOCK_TIMEOUT,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Block until the lock is held or the timeout elapses.
    pub async fn acquire(&self, name: &str) -> Result<LockGuard, CoordinationError> {
        let started = Instant::now();
        let dir = format!("{LOCK_ROOT}/{name}");
        ensure_path(self.coordinator.as_ref(), &dir).await?;
        let node = self
            .coordinator
            .create(
                &format!("{dir}/{LOCK_PREFIX}"),
                Vec::new(),
                CreateMode::EphemeralSequential,
            )
            .await?;

        let waited = tokio::time::timeout(self.timeout, self.wait_turn(&dir, &node)).await;
        let result = match waited {
            Ok(Ok(())) => {
                metrics::histogram!("vigil_lock_wait_seconds")
                    .record(started.elapsed().as_secs_f64());
                tracing::debug!(lock = name, node = %node, "Lock acquired");
                return Ok(LockGuard {
                    coordinator: self.coordinator.clone(),
                    node,
                    released: false,
                });
            }
            Ok(Err(e)) => e,
            Err(_) => CoordinationError::LockTimeout(name.to_string()),
        };

        metrics::counter!("vigil_lock_failures_total").increment(1);
        match self.coordinator.delete(&node).await {
            Ok(()) | Err(CoordinationError::NoNode(_)) => {}
            Err(e) => tracing::warn!(node = %node, error = %e, "Failed to withdraw lock request"),
        }
        Err(result)
    }

    async fn wait_turn(&self, dir: &str, node: &str) -> Result<(), CoordinationError> {
        let own = node.rsplit('/').next().unwrap_or(node);
        loop {
            let mut children: Vec<String> = self
                .coordinator
                .get_children(dir)
                .await?
                .into_iter()
                .filter(|c| c.starts_with(LOCK_PREFIX))
                .collect();
            sort_by_sequence(&mut children);

            let position = children
                .iter()
                .position(|c| c == own)
                .ok_or_else(|| CoordinationError::NoNode(node.to_string()))?;
            if position == 0 {
                return Ok(());
            }

            let predecessor = format!("{dir}/{}", children[position - 1]);
            if let Some(watch) = self.coordinator.exists_watch(&predecessor).await? {
                watch.fired().await;
            }
        }
    }
}

/// Held lock; release it with [`LockGuard::release`]
pub struct LockGuard {
    coordinator: Arc<dyn Coordinator>,
    node: String,
    released: bool,
}

impl LockGuard {
    pub fn node(&self) -> &str {
        &self.node
    }

    pub async fn release(mut self) -> Result<(), CoordinationError> {
        self.released = true;
        match self.coordinator.delete(&self.node).await {
            Ok(()) | Err(CoordinationError::NoNode(_)) => Ok(()),
            Err(e) => Err(e),
        }
    }
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        // Dropped without release, e.g. the holder was cancelled
        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            let coordinator = self.coordinator.clone();
            let node = std::mem::take(&mut self.node);
            handle.spawn(async move {
                if let Err(e) = coordinator.delete(&node).await {
                    tracing::warn!(node = %node, error = %e, "Failed to release dropped lock");
                }
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::coordination::MemoryCoordination;

    #[test]
    fn test_lock_name() {
        let name = lock_name("ops-create-service", "acc1", "api");
        let (account, digest) = name.split_once('-').unwrap();
        assert_eq!(account, "acc1");
        assert_eq!(digest.len(), 32);
        assert_eq!(name, lock_name("ops-create-service", "acc1", "api"));
        assert_ne!(name, lock_name("ops-create-service", "acc1", "db"));
    }

    #[tokio::test]
    async fn test_acquire_release() {
        let ensemble = MemoryCoordination::new();
        let session: Arc<dyn Coordinator> = Arc::new(ensemble.session());
        let lock = DistributedLock::new(session.clone());

        let guard = lock.acquire("alpha").await.unwrap();
        assert!(guard.node().starts_with("/locks/alpha/-lock"));
        guard.release().await.unwrap();
        assert!(session.get_children("/locks/alpha").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_timeout_withdraws_request() {
        let ensemble = MemoryCoordination::new();
        let holder: Arc<dyn Coordinator> = Arc::new(ensemble.session());
        let waiter: Arc<dyn Coordinator> = Arc::new(ensemble.session());

        let held = DistributedLock::new(holder).acquire("beta").await.unwrap();
        let err = DistributedLock::new(waiter.clone())
            .with_timeout(Duration::from_millis(50))
            .acquire("beta")
            .await
            .err()
            .unwrap();
        assert_eq!(err, CoordinationError::LockTimeout("beta".to_string()));
        assert_eq!(waiter.get_children("/locks/beta").await.unwrap().len(), 1);
        held.release().await.unwrap();
    }

    #[tokio::test]
    async fn test_waiter_proceeds_after_holder_session_expires() {
        let ensemble = MemoryCoordination::new();
        let holder = Arc::new(ensemble.session());
        let waiter: Arc<dyn Coordinator> = Arc::new(ensemble.session());

        let _held = DistributedLock::new(holder.clone()).acquire("gamma").await.unwrap();
        let pending = tokio::spawn(async move {
            DistributedLock::new(waiter)
                .with_timeout(Duration::from_secs(5))
                .acquire("gamma")
                .await
                .map(|g| g.node().to_string())
        });
        tokio::time::sleep(Duration::from_millis(20)).await;
        holder.expire();
        let node = pending.await.unwrap().unwrap();
        assert!(node.ends_with("0000000001"));
    }
}
