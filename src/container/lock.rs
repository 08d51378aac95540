use std::sync::Arc;
use std::time::Duration;

use dashmap::DashSet;
use rand::Rng;
use tokio_util::sync::CancellationToken;

use super::ContainerID;

const INITIAL_BACKOFF_MS: u64 = 32;
const MAX_BACKOFF_MS: u64 = 2048;

/// Makes sure only one operation works on a container at a time.
#[derive(Debug, Default, Clone)]
pub struct ContainerLocks {
    held: Arc<DashSet<ContainerID>>,
}

/// Releases the container lock when dropped.
#[derive(Debug)]
pub struct ContainerLockGuard {
    held: Arc<DashSet<ContainerID>>,
    id: ContainerID,
}

impl ContainerLockGuard {
    pub fn id(&self) -> &ContainerID {
        &self.id
    }
}

impl Drop for ContainerLockGuard {
    fn drop(&mut self) {
        self.held.remove(&self.id);
    }
}

impl ContainerLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Takes the lock for `id` if nobody holds it.
    pub fn try_lock(&self, id: &ContainerID) -> Option<ContainerLockGuard> {
        if !self.held.insert(id.clone()) {
            return None;
        }
        Some(ContainerLockGuard {
            held: Arc::clone(&self.held),
            id: id.clone(),
        })
    }

    pub fn is_locked(&self, id: &ContainerID) -> bool {
        self.held.contains(id)
    }

    /// Retries [`ContainerLocks::try_lock`] with randomized exponential backoff.
    ///
    /// Sleeps a random duration below a window that starts at 32ms and doubles up to
    /// 2048ms between attempts. Returns `None` once `cancel` fires.
    pub async fn lock_with_retry(
        &self,
        id: &ContainerID,
        cancel: &CancellationToken,
    ) -> Option<ContainerLockGuard> {
        let mut window = INITIAL_BACKOFF_MS;
        loop {
            if let Some(guard) = self.try_lock(id) {
                return Some(guard);
            }

            let delay = Duration::from_millis(rand::rng().random_range(0..window));
            tokio::select! {
                _ = cancel.cancelled() => {
                    log::debug!("gave up waiting for lock on container {}", id);
                    return None;
                }
                _ = tokio::time::sleep(delay) => {}
            }

            if window < MAX_BACKOFF_MS {
                window <<= 1;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn id(s: &str) -> ContainerID {
        ContainerID::new(s).unwrap()
    }

    #[test]
    fn test_try_lock_is_exclusive() {
        let locks = ContainerLocks::new();
        let guard = locks.try_lock(&id("c1")).unwrap();
        assert!(locks.try_lock(&id("c1")).is_none());
        assert!(locks.try_lock(&id("c2")).is_some());

        drop(guard);
        assert!(!locks.is_locked(&id("c1")));
        assert!(locks.try_lock(&id("c1")).is_some());
    }

    #[tokio::test]
    async fn test_lock_with_retry_waits_for_release() {
        let locks = ContainerLocks::new();
        let guard = locks.try_lock(&id("c1")).unwrap();

        let release = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            drop(guard);
        });

        let cancel = CancellationToken::new();
        let acquired = locks.lock_with_retry(&id("c1"), &cancel).await;
        assert!(acquired.is_some());
        release.await.unwrap();
    }

    #[tokio::test]
    async fn test_lock_with_retry_cancelled() {
        let locks = ContainerLocks::new();
        let _guard = locks.try_lock(&id("c1")).unwrap();

        let cancel = CancellationToken::new();
        let canceller = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            canceller.cancel();
        });

        assert!(locks.lock_with_retry(&id("c1"), &cancel).await.is_none());
        assert!(locks.is_locked(&id("c1")));
    }
}
