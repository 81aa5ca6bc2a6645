//! Hash commands
use crate::backend::{AtomicOp, Backend, redis::RedisBackend};
use crate::command::{Command, IntoArg};
use crate::error::Result;
use crate::pool::Pool;

/// Hash command interface
///
/// A hash is a field-value map stored under one key.
pub struct HashManager<B: Backend = RedisBackend> {
    pool: Pool<B>,
}

impl<B: Backend> HashManager<B> {
    /// Create a new Hash manager interface
    pub(crate) fn new(pool: Pool<B>) -> Self {
        Self { pool }
    }

    /// Set a field. Returns 1 if the field is new, 0 if it was overwritten.
    pub async fn hset(&self, key: &str, field: &str, value: impl IntoArg) -> Result<i64> {
        self.pool
            .execute(&Command::new("HSET").arg(key).arg(field).arg(value))
            .await?
            .as_int()
    }

    /// Set a field only if it does not exist yet
    pub async fn hset_nx(&self, key: &str, field: &str, value: impl IntoArg) -> Result<bool> {
        let reply = self
            .pool
            .execute(&Command::new("HSETNX").arg(key).arg(field).arg(value))
            .await?;
        Ok(reply.as_int()? == 1)
    }

    pub async fn hget(&self, key: &str, field: &str) -> Result<Option<Vec<u8>>> {
        self.pool
            .execute(&Command::new("HGET").arg(key).arg(field))
            .await?
            .into_bytes()
    }

    pub async fn hlen(&self, key: &str) -> Result<i64> {
        self.pool
            .execute(&Command::new("HLEN").arg(key))
            .await?
            .as_int()
    }

    pub async fn hkeys(&self, key: &str) -> Result<Vec<String>> {
        self.pool
            .execute(&Command::new("HKEYS").arg(key))
            .await?
            .into_strings()
    }

    /// Get several fields at once, `None` for each missing one
    pub async fn hmget(&self, key: &str, fields: &[&str]) -> Result<Vec<Option<Vec<u8>>>> {
        self.pool
            .execute(&Command::new("HMGET").arg(key).args(fields.iter().copied()))
            .await?
            .into_array()?
            .into_iter()
            .map(|item| item.into_bytes())
            .collect()
    }

    /// Atomically fetch a field and delete it
    ///
    /// Runs as one server-side step, so a concurrent writer cannot slip in
    /// between the read and the delete.
    pub async fn hpop(&self, key: &str, field: &str) -> Result<Option<Vec<u8>>> {
        self.pool
            .execute_atomic(AtomicOp::HashTake { table: key, field })
            .await?
            .into_bytes()
    }
}
