//! Distributed lock
//!
//! A lock is nothing more than a key in the store: whoever creates it holds
//! the lock. Every acquired lock gets a TTL so a crashed holder cannot block
//! others forever.
//!
//! [`LockManager::lock`] and [`LockManager::unlock`] are cooperative: any
//! caller that knows the key can release it. [`LockManager::lock_with_token`]
//! stores a random token instead, and [`LockManager::unlock_with_token`]
//! deletes the key only while it still holds that token.

use crate::backend::{AtomicOp, Backend, redis::RedisBackend};
use crate::command::Command;
use crate::error::{KvError, Result};
use crate::kv::KvStore;
use crate::pool::Pool;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, warn};
use uuid::Uuid;

const DEFAULT_MAX_RETRY: u32 = 5;
const DEFAULT_EXPIRE_SECS: u64 = 3600;
const RETRY_INTERVAL: Duration = Duration::from_millis(100);
const LOCK_VALUE: &str = "1";

/// Proof of a token-guarded acquisition
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LockToken {
    key: String,
    token: String,
}

impl LockToken {
    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn token(&self) -> &str {
        &self.token
    }
}

/// Distributed lock interface
pub struct LockManager<B: Backend = RedisBackend> {
    pool: Pool<B>,
    kv: KvStore<B>,
}

impl<B: Backend> LockManager<B> {
    /// Create a new Lock manager interface
    pub(crate) fn new(pool: Pool<B>) -> Self {
        Self {
            kv: pool.kv(),
            pool,
        }
    }

    /// Acquire `key` with a bounded number of attempts
    ///
    /// `max_retry == 0` means 5 attempts, `expire_secs == 0` means one hour.
    /// Attempts are spaced 100 ms apart when more than two are allowed.
    ///
    /// # Example
    /// ```no_run
    /// # use kvguard::{Pool, PoolConfig, ServerDescriptor};
    /// # #[tokio::main]
    /// # async fn main() -> Result<(), Box<dyn std::error::Error>> {
    /// # let pool = Pool::connect(PoolConfig::new(vec![ServerDescriptor::new("localhost", 6379)])).await?;
    /// pool.lock().lock("report:daily", 3, 10).await?;
    /// // ... critical section ...
    /// pool.lock().unlock("report:daily").await?;
    /// # Ok(())
    /// # }
    /// ```
    pub async fn lock(&self, key: &str, max_retry: u32, expire_secs: u64) -> Result<()> {
        let max_retry = if max_retry == 0 {
            DEFAULT_MAX_RETRY
        } else {
            max_retry
        };

        let mut acquired = false;
        for attempt in 1..=max_retry {
            if self.kv.set_nx(key, LOCK_VALUE).await? {
                acquired = true;
                break;
            }
            if max_retry > 2 && attempt < max_retry {
                tokio::time::sleep(RETRY_INTERVAL).await;
            }
        }
        if !acquired {
            return Err(KvError::LockFailed(key.to_string()));
        }

        self.arm_expiry(key, expire_secs).await;
        Ok(())
    }

    /// Acquire `key`, polling until `timeout` has elapsed
    ///
    /// The clock is read again on every attempt; there is no pause between
    /// attempts. `expire_secs == 0` means one hour.
    pub async fn lock_by_expire_time(
        &self,
        key: &str,
        timeout: Duration,
        expire_secs: u64,
    ) -> Result<()> {
        let start = Instant::now();
        loop {
            if start.elapsed() > timeout {
                return Err(KvError::LockTimeout(key.to_string()));
            }
            if self.kv.set_nx(key, LOCK_VALUE).await? {
                break;
            }
            tokio::task::yield_now().await;
        }

        self.arm_expiry(key, expire_secs).await;
        Ok(())
    }

    /// Release `key` whoever holds it
    pub async fn unlock(&self, key: &str) -> Result<()> {
        if key.is_empty() {
            return Err(KvError::EmptyLockKey);
        }
        self.kv.del(&[key]).await?;
        Ok(())
    }

    /// Whether `key` is currently held. A failed lookup counts as held.
    pub async fn check_locked(&self, key: &str) -> bool {
        !matches!(self.kv.get(key).await, Ok(None))
    }

    /// Acquire `key` with a random owner token, set atomically with its TTL
    pub async fn lock_with_token(
        &self,
        key: &str,
        max_retry: u32,
        expire_secs: u64,
    ) -> Result<LockToken> {
        let max_retry = if max_retry == 0 {
            DEFAULT_MAX_RETRY
        } else {
            max_retry
        };
        let expire_secs = if expire_secs == 0 {
            DEFAULT_EXPIRE_SECS
        } else {
            expire_secs
        };
        let token = Uuid::new_v4().simple().to_string();
        let cmd = Command::new("SET")
            .arg(key)
            .arg(token.as_str())
            .arg("NX")
            .arg("EX")
            .arg(expire_secs);

        for attempt in 1..=max_retry {
            if !self.pool.execute(&cmd).await?.is_nil() {
                return Ok(LockToken {
                    key: key.to_string(),
                    token,
                });
            }
            if max_retry > 2 && attempt < max_retry {
                tokio::time::sleep(RETRY_INTERVAL).await;
            }
        }

        Err(KvError::LockFailed(key.to_string()))
    }

    /// Release a token-guarded lock. Returns false if the key expired or is
    /// now held by someone else.
    pub async fn unlock_with_token(&self, lock: &LockToken) -> Result<bool> {
        if lock.key.is_empty() {
            return Err(KvError::EmptyLockKey);
        }
        let op = AtomicOp::DeleteIfEquals {
            key: &lock.key,
            expected: lock.token.as_bytes(),
        };
        Ok(self.pool.execute_atomic(op).await?.as_int()? == 1)
    }

    /// Best effort: the lock stays acquired even if no TTL could be set
    async fn arm_expiry(&self, key: &str, expire_secs: u64) {
        let expire_secs = if expire_secs == 0 {
            DEFAULT_EXPIRE_SECS
        } else {
            expire_secs
        };

        if let Err(err) = self.kv.expire(key, expire_secs).await {
            debug!(key, error = %err, "lock expiry failed, retrying once");
            if let Err(err) = self.kv.expire(key, expire_secs).await {
                warn!(key, error = %err, "lock acquired without expiry");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::memory::MemoryBackend;
    use crate::failover::FailoverPolicy;

    async fn pool(backend: &MemoryBackend) -> Pool<MemoryBackend> {
        Pool::from_backends(vec![backend.clone()], FailoverPolicy::default())
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_lock_sets_default_expiry() {
        let pool = pool(&MemoryBackend::new("mem:0")).await;
        pool.lock().lock("job", 0, 0).await.unwrap();
        assert_eq!(pool.kv().ttl("job").await.unwrap(), 3600);
    }

    #[tokio::test(start_paused = true)]
    async fn test_lock_fails_after_budget() {
        let backend = MemoryBackend::new("mem:0");
        let pool = pool(&backend).await;
        pool.kv().set("busy", "1").await.unwrap();

        let served = backend.commands_served();
        let started = Instant::now();
        let err = pool.lock().lock("busy", 3, 10).await.unwrap_err();
        assert!(matches!(err, KvError::LockFailed(ref key) if key == "busy"));
        assert_eq!(err.to_string(), "lock failed busy");

        assert_eq!(backend.commands_served() - served, 3);
        // Two pauses between three attempts
        assert_eq!(started.elapsed(), Duration::from_millis(200));
    }

    #[tokio::test(start_paused = true)]
    async fn test_small_budget_does_not_pause() {
        let pool = pool(&MemoryBackend::new("mem:0")).await;
        pool.kv().set("busy", "1").await.unwrap();

        let started = Instant::now();
        assert!(pool.lock().lock("busy", 2, 10).await.is_err());
        assert_eq!(started.elapsed(), Duration::ZERO);
    }

    #[tokio::test]
    async fn test_lock_by_expire_time() {
        let pool = pool(&MemoryBackend::new("mem:0")).await;
        let lock = pool.lock();

        lock.lock_by_expire_time("res", Duration::from_millis(50), 5)
            .await
            .unwrap();
        assert_eq!(pool.kv().ttl("res").await.unwrap(), 5);

        let err = lock
            .lock_by_expire_time("res", Duration::from_millis(50), 5)
            .await
            .unwrap_err();
        assert!(matches!(err, KvError::LockTimeout(_)));
        assert_eq!(err.to_string(), "get res lock already expire");
    }

    #[tokio::test]
    async fn test_unlock_rejects_empty_key() {
        let pool = pool(&MemoryBackend::new("mem:0")).await;
        assert!(matches!(
            pool.lock().unlock("").await,
            Err(KvError::EmptyLockKey)
        ));
    }

    #[tokio::test]
    async fn test_check_locked_fails_closed() {
        let backend = MemoryBackend::new("mem:0");
        let pool = pool(&backend).await;
        let lock = pool.lock();

        assert!(!lock.check_locked("res").await);
        lock.lock("res", 1, 10).await.unwrap();
        assert!(lock.check_locked("res").await);
        lock.unlock("res").await.unwrap();
        assert!(!lock.check_locked("res").await);

        backend.set_reachable(false);
        assert!(lock.check_locked("res").await);
    }

    #[tokio::test]
    async fn test_token_lock_only_releases_own_acquisition() {
        let pool = pool(&MemoryBackend::new("mem:0")).await;
        let lock = pool.lock();

        let token = lock.lock_with_token("res", 1, 10).await.unwrap();
        assert_eq!(token.key(), "res");
        assert_eq!(pool.kv().ttl("res").await.unwrap(), 10);
        assert!(matches!(
            lock.lock_with_token("res", 1, 10).await,
            Err(KvError::LockFailed(_))
        ));

        let forged = LockToken {
            key: "res".into(),
            token: "someone-else".into(),
        };
        assert!(!lock.unlock_with_token(&forged).await.unwrap());
        assert!(lock.check_locked("res").await);

        assert!(lock.unlock_with_token(&token).await.unwrap());
        assert!(!lock.check_locked("res").await);
        // Already released
        assert!(!lock.unlock_with_token(&token).await.unwrap());
    }
}
