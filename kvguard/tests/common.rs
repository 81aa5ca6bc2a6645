//! Common test utilities

use async_trait::async_trait;
use kvguard::backend::memory::MemoryConnection;
use kvguard::{
    AtomicOp, Backend, Command, Connection, FailoverPolicy, KvError, MemoryBackend, Pool,
    PoolConfig, Reply, Result, ServerDescriptor,
};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

/// Route library logs to the test harness (`RUST_LOG=kvguard=debug`)
#[allow(dead_code)] // Used by other test modules
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// `n` independent in-process servers named `mem:0`, `mem:1`, ...
#[allow(dead_code)]
pub fn memory_backends(n: usize) -> Vec<MemoryBackend> {
    (0..n)
        .map(|i| MemoryBackend::new(format!("mem:{i}")))
        .collect()
}

/// Pool over clones of `backends`, so the test keeps its failure switches
#[allow(dead_code)]
pub async fn setup_pool(backends: &[MemoryBackend]) -> Pool<MemoryBackend> {
    setup_pool_with(backends, FailoverPolicy::default()).await
}

#[allow(dead_code)]
pub async fn setup_pool_with(
    backends: &[MemoryBackend],
    policy: FailoverPolicy,
) -> Pool<MemoryBackend> {
    init_tracing();
    Pool::from_backends(backends.to_vec(), policy)
        .await
        .expect("Failed to create memory pool")
}

/// One attempt per call with a short backoff, so each call is one failure
#[allow(dead_code)]
pub fn single_attempt_policy() -> FailoverPolicy {
    FailoverPolicy {
        failure_retry: 1,
        retry_backoff: Duration::from_millis(1),
        ..Default::default()
    }
}

/// Configuration for S2S tests (requires running Redis)
#[allow(dead_code)] // Used by S2S test modules
pub fn setup_s2s_config() -> PoolConfig {
    let host = std::env::var("KVGUARD_REDIS_HOST").unwrap_or_else(|_| "127.0.0.1".to_string());
    let port = std::env::var("KVGUARD_REDIS_PORT")
        .ok()
        .and_then(|port| port.parse().ok())
        .unwrap_or(6379);
    PoolConfig::new(vec![ServerDescriptor::new(host, port)])
}

/// How a [`FlakyBackend`] misbehaves on its target command
#[allow(dead_code)]
#[derive(Debug, Clone, Copy)]
pub enum Fault {
    /// Answer with an error reply without applying the command
    Reject,
    /// Apply the command, then time out before the reply arrives
    LoseReply,
}

/// A [`MemoryBackend`] whose next `times` calls of one command misbehave
#[allow(dead_code)]
#[derive(Clone)]
pub struct FlakyBackend {
    inner: MemoryBackend,
    command: &'static str,
    fault: Fault,
    remaining: Arc<AtomicUsize>,
    seen: Arc<AtomicUsize>,
}

#[allow(dead_code)]
impl FlakyBackend {
    pub fn new(inner: MemoryBackend, command: &'static str, fault: Fault, times: usize) -> Self {
        Self {
            inner,
            command,
            fault,
            remaining: Arc::new(AtomicUsize::new(times)),
            seen: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// How many times the target command was sent, faulty or not
    pub fn seen(&self) -> usize {
        self.seen.load(Ordering::SeqCst)
    }
}

#[allow(dead_code)]
pub struct FlakyConnection {
    inner: MemoryConnection,
    backend: FlakyBackend,
}

#[async_trait]
impl Connection for FlakyConnection {
    async fn query(&mut self, cmd: &Command) -> Result<Reply> {
        if !cmd.name().eq_ignore_ascii_case(self.backend.command) {
            return self.inner.query(cmd).await;
        }
        self.backend.seen.fetch_add(1, Ordering::SeqCst);
        let faulty = self
            .backend
            .remaining
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if !faulty {
            return self.inner.query(cmd).await;
        }

        match self.backend.fault {
            Fault::Reject => Err(KvError::Server(format!("ERR {} rejected", cmd.name()))),
            Fault::LoseReply => {
                self.inner.query(cmd).await?;
                Err(KvError::Timeout)
            }
        }
    }

    async fn atomic(&mut self, op: AtomicOp<'_>) -> Result<Reply> {
        self.inner.atomic(op).await
    }
}

#[async_trait]
impl Backend for FlakyBackend {
    type Conn = FlakyConnection;

    fn address(&self) -> &str {
        self.inner.address()
    }

    async fn checkout(&self) -> Result<FlakyConnection> {
        Ok(FlakyConnection {
            inner: self.inner.checkout().await?,
            backend: self.clone(),
        })
    }
}

/// Pool over one flaky backend
#[allow(dead_code)]
pub async fn setup_flaky_pool(backend: &FlakyBackend, policy: FailoverPolicy) -> Pool<FlakyBackend> {
    init_tracing();
    Pool::from_backends(vec![backend.clone()], policy)
        .await
        .expect("Failed to create flaky pool")
}
