//! Set commands

use crate::backend::{Backend, redis::RedisBackend};
use crate::command::{Command, IntoArg};
use crate::error::Result;
use crate::pool::Pool;

/// Set command interface (unordered unique members)
pub struct SetManager<B: Backend = RedisBackend> {
    pool: Pool<B>,
}

impl<B: Backend> SetManager<B> {
    /// Create a new Set manager interface
    pub(crate) fn new(pool: Pool<B>) -> Self {
        Self { pool }
    }

    /// Add members, returning how many were not present before
    pub async fn sadd<M: IntoArg>(&self, key: &str, members: impl IntoIterator<Item = M>) -> Result<i64> {
        self.pool
            .execute(&Command::new("SADD").arg(key).args(members))
            .await?
            .as_int()
    }

    /// Remove members, returning how many were present
    pub async fn srem<M: IntoArg>(&self, key: &str, members: impl IntoIterator<Item = M>) -> Result<i64> {
        self.pool
            .execute(&Command::new("SREM").arg(key).args(members))
            .await?
            .as_int()
    }

    pub async fn smembers(&self, key: &str) -> Result<Vec<String>> {
        self.pool
            .execute(&Command::new("SMEMBERS").arg(key))
            .await?
            .into_strings()
    }
}
