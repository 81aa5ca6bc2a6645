//! Optimistic transaction executor
//!
//! A transaction WATCHes every key it touches, queues its commands between
//! MULTI and EXEC, and commits only if no watched key changed in between.
//! The whole WATCH→EXEC session runs on one connection held for its full
//! length, so it bypasses the per-command retry of [`Pool::execute`]. A
//! failed or aborted transaction is never retried here; the caller reissues
//! it.

use crate::backend::{Backend, Connection, redis::RedisBackend};
use crate::command::{Command, IntoArg, Reply};
use crate::error::{KvError, Result};
use crate::pool::Pool;

/// `name key value`, watching `key`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FixedCommand {
    pub key: String,
    pub name: String,
    pub value: Vec<u8>,
}

impl FixedCommand {
    pub fn new(name: impl Into<String>, key: impl Into<String>, value: impl IntoArg) -> Self {
        Self {
            key: key.into(),
            name: name.into(),
            value: value.into_arg(),
        }
    }
}

/// `name args...`, watching the first argument
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VariableCommand {
    pub name: String,
    pub args: Vec<Vec<u8>>,
}

impl VariableCommand {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            args: Vec::new(),
        }
    }

    pub fn arg(mut self, arg: impl IntoArg) -> Self {
        self.args.push(arg.into_arg());
        self
    }
}

/// Result of a transaction that reached EXEC
#[derive(Debug, Clone, PartialEq)]
pub enum TransactionOutcome {
    /// One reply per queued command, in order. A command that failed while
    /// EXEC applied it shows up as [`Reply::Error`]; the others still took
    /// effect.
    Committed(Vec<Reply>),
    /// A watched key changed; nothing was applied
    Aborted,
}

impl TransactionOutcome {
    pub fn is_committed(&self) -> bool {
        matches!(self, TransactionOutcome::Committed(_))
    }

    pub fn into_replies(self) -> Option<Vec<Reply>> {
        match self {
            TransactionOutcome::Committed(replies) => Some(replies),
            TransactionOutcome::Aborted => None,
        }
    }
}

/// Transaction interface
pub struct TransactionManager<B: Backend = RedisBackend> {
    pool: Pool<B>,
}

impl<B: Backend> TransactionManager<B> {
    /// Create a new Transaction manager interface
    pub(crate) fn new(pool: Pool<B>) -> Self {
        Self { pool }
    }

    /// Run fixed `name key value` commands as one optimistic transaction
    ///
    /// # Example
    /// ```no_run
    /// # use kvguard::{FixedCommand, Pool, PoolConfig, ServerDescriptor, TransactionOutcome};
    /// # #[tokio::main]
    /// # async fn main() -> Result<(), Box<dyn std::error::Error>> {
    /// # let pool = Pool::connect(PoolConfig::new(vec![ServerDescriptor::new("localhost", 6379)])).await?;
    /// let outcome = pool
    ///     .transaction()
    ///     .multi(&[
    ///         FixedCommand::new("SET", "order:1:state", "paid"),
    ///         FixedCommand::new("SET", "order:1:paid_at", "1700000000"),
    ///     ])
    ///     .await?;
    /// if outcome == TransactionOutcome::Aborted {
    ///     println!("order changed concurrently, try again");
    /// }
    /// # Ok(())
    /// # }
    /// ```
    pub async fn multi(&self, cmds: &[FixedCommand]) -> Result<TransactionOutcome> {
        if cmds.is_empty() {
            return Err(KvError::InvalidTransaction("no commands".into()));
        }
        if let Some(cmd) = cmds.iter().find(|cmd| cmd.name.is_empty() || cmd.key.is_empty()) {
            return Err(KvError::InvalidTransaction(format!(
                "param error: {cmd:?} needs a name and a key"
            )));
        }

        let watch: Vec<&[u8]> = cmds.iter().map(|cmd| cmd.key.as_bytes()).collect();
        let queued: Vec<Command> = cmds
            .iter()
            .map(|cmd| {
                Command::new(cmd.name.as_str())
                    .arg(cmd.key.as_str())
                    .arg(&cmd.value)
            })
            .collect();

        self.run(&watch, &queued).await
    }

    /// Run variable-arity commands as one optimistic transaction. The first
    /// argument of every command is watched.
    pub async fn multi_variable(&self, cmds: &[VariableCommand]) -> Result<TransactionOutcome> {
        if cmds.is_empty() {
            return Err(KvError::InvalidTransaction("no commands".into()));
        }
        let mut watch = Vec::with_capacity(cmds.len());
        for cmd in cmds {
            let Some(key) = cmd.args.first() else {
                return Err(KvError::InvalidTransaction(format!(
                    "param error: {} has no arguments",
                    cmd.name
                )));
            };
            if cmd.name.is_empty() {
                return Err(KvError::InvalidTransaction("param error: empty command name".into()));
            }
            watch.push(key.as_slice());
        }

        let queued: Vec<Command> = cmds
            .iter()
            .map(|cmd| Command::new(cmd.name.as_str()).args(cmd.args.iter()))
            .collect();

        self.run(&watch, &queued).await
    }

    async fn run(&self, watch: &[&[u8]], queued: &[Command]) -> Result<TransactionOutcome> {
        self.pool.ensure_available()?;

        let index = self.pool.active_index();
        let mut conn = match self.pool.backend(index).checkout().await {
            Ok(conn) => conn,
            Err(err) => return Err(self.fail(index, err)),
        };

        let mut in_multi = false;
        match session(&mut conn, watch, queued, &mut in_multi).await {
            Ok(outcome) => {
                self.pool.record_success(index);
                Ok(outcome)
            }
            Err(err) => {
                let reset = if in_multi { "DISCARD" } else { "UNWATCH" };
                let _ = conn.query(&Command::new(reset)).await;
                Err(self.fail(index, err))
            }
        }
    }

    /// Feed a connectivity failure to the failover policy, pass the error on
    fn fail(&self, index: usize, err: KvError) -> KvError {
        if err.is_connectivity() {
            self.pool.record_failure(index);
            self.pool.trigger_probe();
        }
        err
    }
}

async fn session<C: Connection>(
    conn: &mut C,
    watch: &[&[u8]],
    queued: &[Command],
    in_multi: &mut bool,
) -> Result<TransactionOutcome> {
    conn.query(&Command::new("WATCH").args(watch.iter().copied()))
        .await?;

    conn.query(&Command::new("MULTI")).await?;
    *in_multi = true;
    for cmd in queued {
        conn.query(cmd).await?;
    }

    match conn.query(&Command::new("EXEC")).await? {
        Reply::Nil => Ok(TransactionOutcome::Aborted),
        Reply::Array(replies) => Ok(TransactionOutcome::Committed(replies)),
        other => Err(KvError::WrongAnswer(format!("EXEC returned {other:?}"))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::AtomicOp;
    use crate::backend::memory::{MemoryBackend, MemoryConnection};
    use crate::failover::FailoverPolicy;
    use async_trait::async_trait;

    #[derive(Clone, Copy)]
    enum Meddle {
        /// Another client writes `balance` right before EXEC
        Conflict,
        /// The network drops right before EXEC
        Disconnect,
    }

    struct MeddlingBackend {
        inner: MemoryBackend,
        mode: Meddle,
    }

    struct MeddlingConnection {
        inner: MemoryConnection,
        backend: MemoryBackend,
        mode: Meddle,
    }

    #[async_trait]
    impl Connection for MeddlingConnection {
        async fn query(&mut self, cmd: &Command) -> Result<Reply> {
            if cmd.name() == "EXEC" {
                match self.mode {
                    Meddle::Conflict => {
                        let mut other = self.backend.checkout().await?;
                        other
                            .query(&Command::new("SET").arg("balance").arg("999"))
                            .await?;
                    }
                    Meddle::Disconnect => self.backend.set_reachable(false),
                }
            }
            self.inner.query(cmd).await
        }

        async fn atomic(&mut self, op: AtomicOp<'_>) -> Result<Reply> {
            self.inner.atomic(op).await
        }
    }

    #[async_trait]
    impl Backend for MeddlingBackend {
        type Conn = MeddlingConnection;

        fn address(&self) -> &str {
            self.inner.address()
        }

        async fn checkout(&self) -> Result<MeddlingConnection> {
            Ok(MeddlingConnection {
                inner: self.inner.checkout().await?,
                backend: self.inner.clone(),
                mode: self.mode,
            })
        }
    }

    async fn memory_pool(backend: &MemoryBackend) -> Pool<MemoryBackend> {
        Pool::from_backends(vec![backend.clone()], FailoverPolicy::default())
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_multi_commits() {
        let pool = memory_pool(&MemoryBackend::new("mem:0")).await;

        let outcome = pool
            .transaction()
            .multi(&[
                FixedCommand::new("SET", "a", "1"),
                FixedCommand::new("SET", "b", "2"),
            ])
            .await
            .unwrap();
        assert_eq!(
            outcome,
            TransactionOutcome::Committed(vec![
                Reply::Status("OK".into()),
                Reply::Status("OK".into())
            ])
        );
        assert_eq!(pool.kv().get_string("b").await.unwrap(), Some("2".into()));
    }

    #[tokio::test]
    async fn test_multi_variable_commits() {
        let pool = memory_pool(&MemoryBackend::new("mem:0")).await;

        let outcome = pool
            .transaction()
            .multi_variable(&[
                VariableCommand::new("HSET").arg("user:1").arg("name").arg("alice"),
                VariableCommand::new("RPUSH").arg("log").arg("e1").arg("e2"),
                VariableCommand::new("INCR").arg("version"),
            ])
            .await
            .unwrap();
        assert_eq!(
            outcome.into_replies().unwrap(),
            vec![Reply::Int(1), Reply::Int(2), Reply::Int(1)]
        );
    }

    #[tokio::test]
    async fn test_validation_happens_before_any_call() {
        let backend = MemoryBackend::new("mem:0");
        let pool = memory_pool(&backend).await;
        let served = backend.commands_served();

        let err = pool
            .transaction()
            .multi_variable(&[
                VariableCommand::new("INCR").arg("a"),
                VariableCommand::new("PING"),
            ])
            .await
            .unwrap_err();
        assert!(matches!(err, KvError::InvalidTransaction(_)));

        assert!(pool.transaction().multi(&[]).await.is_err());
        assert!(
            pool.transaction()
                .multi(&[FixedCommand::new("SET", "", "v")])
                .await
                .is_err()
        );
        assert_eq!(backend.commands_served(), served);
    }

    #[tokio::test]
    async fn test_conflicting_write_aborts() {
        let inner = MemoryBackend::new("mem:0");
        let backend = MeddlingBackend {
            inner: inner.clone(),
            mode: Meddle::Conflict,
        };
        let pool = Pool::from_backends(vec![backend], FailoverPolicy::default())
            .await
            .unwrap();

        let outcome = pool
            .transaction()
            .multi(&[FixedCommand::new("SET", "balance", "10")])
            .await
            .unwrap();
        assert_eq!(outcome, TransactionOutcome::Aborted);
        assert!(!outcome.is_committed());

        // The concurrent write survives, the transaction's does not
        assert_eq!(pool.kv().get_string("balance").await.unwrap(), Some("999".into()));
    }

    #[tokio::test]
    async fn test_disconnect_at_exec_feeds_failover() {
        let a = MemoryBackend::new("mem:a");
        let b = MemoryBackend::new("mem:b");
        let backends = vec![
            MeddlingBackend {
                inner: a.clone(),
                mode: Meddle::Disconnect,
            },
            MeddlingBackend {
                inner: b,
                mode: Meddle::Disconnect,
            },
        ];
        let pool = Pool::from_backends(backends, FailoverPolicy::default())
            .await
            .unwrap();

        let err = pool
            .transaction()
            .multi(&[FixedCommand::new("SET", "k", "v")])
            .await
            .unwrap_err();
        assert!(err.is_connectivity());
        assert_eq!(pool.status()[0].entropy, 1);
        assert_eq!(pool.active_index(), 0);

        a.set_reachable(true);
        assert_eq!(pool.kv().get("k").await.unwrap(), None);
    }
}
