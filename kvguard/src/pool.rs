//! Pool manager
//!
//! Owns the ordered backend list and the shared [`HealthState`]. The pool
//! handle is cheap to clone; every clone talks to the same backends and the
//! same health prober.

use crate::backend::Backend;
use crate::backend::redis::RedisBackend;
use crate::config::PoolConfig;
use crate::error::{KvError, Result};
use crate::failover::{BackendStatus, FailoverEvent, FailoverPolicy, HealthState};
use crate::prober::Prober;
use crate::{
    HashManager, KvStore, ListManager, LockManager, QueueManager, SetManager, TransactionManager,
};
use futures::future::join_all;
use parking_lot::RwLock;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::{debug, info, warn};

pub(crate) struct PoolInner<B: Backend> {
    pub(crate) backends: Vec<B>,
    pub(crate) health: RwLock<HealthState>,
    policy: FailoverPolicy,
    prober: Prober,
    closed: AtomicBool,
}

impl<B: Backend> PoolInner<B> {
    pub(crate) fn all_down(&self) -> bool {
        self.health.read().all_down()
    }

    /// Apply a probe result. The liveness check is repeated under the write
    /// lock so a late probe cannot override a newer decision.
    pub(crate) fn apply_probe(&self, index: usize) -> bool {
        let mut health = self.health.write();
        if !health.all_down() {
            return false;
        }
        let switched = health.switch_to(index);
        drop(health);

        if switched {
            info!(
                backend = %self.backends[index].address(),
                "backend answered probe, service restored"
            );
        }
        switched
    }
}

/// Multi-backend connection pool with entropy-based failover
pub struct Pool<B: Backend = RedisBackend> {
    pub(crate) inner: Arc<PoolInner<B>>,
}

impl<B: Backend> Clone for Pool<B> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl Pool<RedisBackend> {
    /// Dial every configured server and keep the reachable ones
    ///
    /// # Example
    /// ```no_run
    /// # use kvguard::{Pool, PoolConfig, ServerDescriptor};
    /// # #[tokio::main]
    /// # async fn main() -> Result<(), Box<dyn std::error::Error>> {
    /// let config = PoolConfig::new(vec![
    ///     ServerDescriptor::new("10.0.0.1", 6379),
    ///     ServerDescriptor::new("10.0.0.2", 6379),
    /// ]);
    /// let pool = Pool::connect(config).await?;
    /// pool.kv().set("greeting", "hello").await?;
    /// # Ok(())
    /// # }
    /// ```
    pub async fn connect(config: PoolConfig) -> Result<Self> {
        if config.servers.is_empty() {
            return Err(KvError::ServersEmpty);
        }
        config.validate()?;

        let backends = config
            .servers
            .iter()
            .map(|server| RedisBackend::open(server, &config))
            .collect::<Result<Vec<_>>>()?;

        Self::from_backends(backends, config.policy()).await
    }
}

impl<B: Backend> Pool<B> {
    /// Build a pool over already constructed backends.
    ///
    /// Every backend is probed concurrently; the ones that do not answer are
    /// dropped, the rest keep their relative order. A pool may end up with no
    /// backend at all, in which case every call reports
    /// [`KvError::ServerUnavailable`].
    pub async fn from_backends(backends: Vec<B>, policy: FailoverPolicy) -> Result<Self> {
        if backends.is_empty() {
            return Err(KvError::ServersEmpty);
        }
        if policy.max_fail == 0 || policy.failure_retry == 0 {
            return Err(KvError::Config(
                "max_fail and failure_retry must be at least 1".into(),
            ));
        }

        let dials = join_all(backends.iter().map(|backend| backend.ping())).await;
        let reachable: Vec<B> = backends
            .into_iter()
            .zip(dials)
            .filter_map(|(backend, dial)| match dial {
                Ok(()) => Some(backend),
                Err(err) => {
                    warn!(backend = %backend.address(), error = %err, "dropping unreachable backend");
                    backend.close();
                    None
                }
            })
            .collect();

        debug!(backends = reachable.len(), "pool ready");

        let health = HealthState::new(reachable.len(), policy.max_fail);
        let inner = Arc::new_cyclic(|weak| PoolInner {
            backends: reachable,
            health: RwLock::new(health),
            policy,
            prober: Prober::spawn(weak.clone()),
            closed: AtomicBool::new(false),
        });

        Ok(Self { inner })
    }

    /// Number of backends retained at construction
    pub fn len(&self) -> usize {
        self.inner.backends.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.backends.is_empty()
    }

    pub fn policy(&self) -> FailoverPolicy {
        self.inner.policy
    }

    /// True iff every backend is marked dead
    pub fn all_down(&self) -> bool {
        self.inner.all_down()
    }

    pub fn active_index(&self) -> usize {
        self.inner.health.read().active()
    }

    /// Per-backend health snapshot
    pub fn status(&self) -> Vec<BackendStatus> {
        let health = self.inner.health.read();
        health.snapshot(self.inner.backends.iter().map(|backend| backend.address()))
    }

    /// Ask the prober to look for a live backend. Returns immediately; the
    /// probe only runs while every backend is marked dead.
    pub fn trigger_probe(&self) {
        self.inner.prober.trigger();
    }

    /// Close every backend pool and stop the prober
    pub fn close(&self) {
        if self.inner.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.inner.prober.shutdown();
        for backend in &self.inner.backends {
            backend.close();
        }
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::SeqCst)
    }

    /// Fail fast when closed or when no backend is alive
    pub(crate) fn ensure_available(&self) -> Result<()> {
        if self.is_closed() {
            return Err(KvError::Closed);
        }
        if self.all_down() {
            self.trigger_probe();
            return Err(KvError::ServerUnavailable);
        }
        Ok(())
    }

    pub(crate) fn backend(&self, index: usize) -> &B {
        &self.inner.backends[index]
    }

    /// Failure path of the failover policy
    pub(crate) fn record_failure(&self, index: usize) {
        let event = self.inner.health.write().record_failure(index);
        match event {
            FailoverEvent::Ignored => {}
            FailoverEvent::Degraded { index, entropy } => {
                debug!(
                    backend = %self.backend(index).address(),
                    entropy,
                    "connectivity failure"
                );
            }
            FailoverEvent::Switched { from, to } => {
                warn!(
                    from = %self.backend(from).address(),
                    to = %self.backend(to).address(),
                    "backend marked down, failing over"
                );
            }
        }
    }

    /// Recovery path of the failover policy
    pub(crate) fn record_success(&self, index: usize) {
        self.inner.health.write().record_success(index);
    }

    /// Get the string command interface
    pub fn kv(&self) -> KvStore<B> {
        KvStore::new(self.clone())
    }

    /// Get the hash command interface
    pub fn hash(&self) -> HashManager<B> {
        HashManager::new(self.clone())
    }

    /// Get the list command interface
    pub fn list(&self) -> ListManager<B> {
        ListManager::new(self.clone())
    }

    /// Get the set command interface
    pub fn set(&self) -> SetManager<B> {
        SetManager::new(self.clone())
    }

    /// Get the distributed lock interface
    pub fn lock(&self) -> LockManager<B> {
        LockManager::new(self.clone())
    }

    /// Get the reliable queue interface
    pub fn queue(&self) -> QueueManager<B> {
        QueueManager::new(self.clone())
    }

    /// Get the optimistic transaction interface
    pub fn transaction(&self) -> TransactionManager<B> {
        TransactionManager::new(self.clone())
    }
}
