//! Command executor
//!
//! Runs one command against the active backend with a bounded number of
//! attempts. Connectivity failures feed the failover policy and schedule a
//! probe; anything else (error replies, malformed answers) is returned at
//! once and leaves backend health untouched.

use crate::backend::{AtomicOp, Backend, Connection};
use crate::command::{Command, Reply};
use crate::error::{KvError, Result};
use crate::pool::Pool;

#[derive(Debug, Clone, Copy)]
enum Request<'a> {
    Command(&'a Command),
    Atomic(AtomicOp<'a>),
}

impl<B: Backend> Pool<B> {
    /// Execute one command with failover-aware retry
    ///
    /// # Example
    /// ```no_run
    /// # use kvguard::{Command, Pool, PoolConfig, ServerDescriptor};
    /// # #[tokio::main]
    /// # async fn main() -> Result<(), Box<dyn std::error::Error>> {
    /// # let pool = Pool::connect(PoolConfig::new(vec![ServerDescriptor::new("localhost", 6379)])).await?;
    /// let reply = pool.execute(&Command::new("INCR").arg("visits")).await?;
    /// println!("visits: {}", reply.as_int()?);
    /// # Ok(())
    /// # }
    /// ```
    pub async fn execute(&self, cmd: &Command) -> Result<Reply> {
        self.run(Request::Command(cmd)).await
    }

    /// Execute one server-side atomic primitive with the same retry policy
    pub async fn execute_atomic(&self, op: AtomicOp<'_>) -> Result<Reply> {
        self.run(Request::Atomic(op)).await
    }

    async fn run(&self, request: Request<'_>) -> Result<Reply> {
        self.ensure_available()?;

        let policy = self.policy();
        let mut last_error = KvError::ServerUnavailable;
        for attempt in 1..=policy.failure_retry {
            let index = self.active_index();
            match self.attempt(index, request).await {
                Ok(reply) => {
                    self.record_success(index);
                    return Ok(reply);
                }
                Err(err) if err.is_connectivity() => {
                    self.record_failure(index);
                    self.trigger_probe();
                    last_error = err;
                    if attempt < policy.failure_retry {
                        tokio::time::sleep(policy.retry_backoff).await;
                    }
                }
                Err(err) => return Err(err),
            }
        }

        Err(last_error)
    }

    /// One checkout, one round trip; the connection goes back to its pool on return
    async fn attempt(&self, index: usize, request: Request<'_>) -> Result<Reply> {
        let mut conn = self.backend(index).checkout().await?;
        match request {
            Request::Command(cmd) => conn.query(cmd).await,
            Request::Atomic(op) => conn.atomic(op).await,
        }
    }
}
