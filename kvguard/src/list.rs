//! List commands

use crate::backend::{Backend, redis::RedisBackend};
use crate::command::{Command, IntoArg};
use crate::error::Result;
use crate::pool::Pool;

/// List command interface
pub struct ListManager<B: Backend = RedisBackend> {
    pool: Pool<B>,
}

impl<B: Backend> ListManager<B> {
    /// Create a new List manager interface
    pub(crate) fn new(pool: Pool<B>) -> Self {
        Self { pool }
    }

    /// Push elements to the head. Returns the new length.
    pub async fn lpush<V: IntoArg>(&self, key: &str, values: impl IntoIterator<Item = V>) -> Result<i64> {
        self.pool
            .execute(&Command::new("LPUSH").arg(key).args(values))
            .await?
            .as_int()
    }

    /// Push elements to the tail. Returns the new length.
    pub async fn rpush<V: IntoArg>(&self, key: &str, values: impl IntoIterator<Item = V>) -> Result<i64> {
        self.pool
            .execute(&Command::new("RPUSH").arg(key).args(values))
            .await?
            .as_int()
    }

    pub async fn lpop(&self, key: &str) -> Result<Option<Vec<u8>>> {
        self.pool
            .execute(&Command::new("LPOP").arg(key))
            .await?
            .into_bytes()
    }

    pub async fn rpop(&self, key: &str) -> Result<Option<Vec<u8>>> {
        self.pool
            .execute(&Command::new("RPOP").arg(key))
            .await?
            .into_bytes()
    }

    pub async fn llen(&self, key: &str) -> Result<i64> {
        self.pool
            .execute(&Command::new("LLEN").arg(key))
            .await?
            .as_int()
    }

    /// Index of the first occurrence of `element`, if any
    pub async fn lpos(&self, key: &str, element: impl IntoArg) -> Result<Option<i64>> {
        let reply = self
            .pool
            .execute(&Command::new("LPOS").arg(key).arg(element))
            .await?;
        if reply.is_nil() {
            return Ok(None);
        }
        reply.as_int().map(Some)
    }

    /// Elements between `start` and `stop` inclusive; negative indexes count from the tail
    pub async fn lrange(&self, key: &str, start: i64, stop: i64) -> Result<Vec<String>> {
        self.pool
            .execute(&Command::new("LRANGE").arg(key).arg(start).arg(stop))
            .await?
            .into_strings()
    }
}
