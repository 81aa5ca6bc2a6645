//! Backend capability interface
//!
//! A [`Backend`] is one remote key-value server. It hands out exclusive
//! [`Connection`]s from its own connection pool; a connection is held for a
//! single command by the executor, or for a whole WATCH→EXEC session by the
//! transaction executor.

#[cfg(any(test, feature = "test-util"))]
pub mod memory;
pub mod redis;

use crate::command::{Command, Reply};
use crate::error::Result;
use async_trait::async_trait;

/// Server-side atomic primitives.
///
/// Each variant must execute as one indivisible step on the server (a script
/// on Redis), so no other client can interleave between its read and its
/// write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AtomicOp<'a> {
    /// Fetch a hash field and delete it; replies with the old value or nil
    HashTake { table: &'a str, field: &'a str },
    /// Delete `key` only if it currently holds `expected`; replies 1 or 0
    DeleteIfEquals { key: &'a str, expected: &'a [u8] },
}

/// An exclusive connection to one backend
#[async_trait]
pub trait Connection: Send {
    /// Send one command and wait for its reply
    async fn query(&mut self, cmd: &Command) -> Result<Reply>;

    /// Run one atomic primitive
    async fn atomic(&mut self, op: AtomicOp<'_>) -> Result<Reply>;
}

/// One remote key-value server
#[async_trait]
pub trait Backend: Send + Sync + 'static {
    type Conn: Connection + 'static;

    /// `host:port`, for status reports and logs
    fn address(&self) -> &str;

    /// Check a connection out of this backend's pool
    async fn checkout(&self) -> Result<Self::Conn>;

    /// Liveness probe
    async fn ping(&self) -> Result<()> {
        let mut conn = self.checkout().await?;
        conn.query(&Command::new("PING")).await?;
        Ok(())
    }

    /// Release pooled connections
    fn close(&self) {}
}
