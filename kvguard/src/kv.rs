//! String commands

use crate::backend::{Backend, redis::RedisBackend};
use crate::command::{Command, IntoArg};
use crate::error::{KvError, Result};
use crate::pool::Pool;
use std::time::Duration;

/// String command interface
pub struct KvStore<B: Backend = RedisBackend> {
    pool: Pool<B>,
}

impl<B: Backend> KvStore<B> {
    /// Create a new KV interface
    pub(crate) fn new(pool: Pool<B>) -> Self {
        Self { pool }
    }

    /// Get the raw value of a key; `None` if absent
    ///
    /// # Example
    /// ```no_run
    /// # use kvguard::{Pool, PoolConfig, ServerDescriptor};
    /// # #[tokio::main]
    /// # async fn main() -> Result<(), Box<dyn std::error::Error>> {
    /// # let pool = Pool::connect(PoolConfig::new(vec![ServerDescriptor::new("localhost", 6379)])).await?;
    /// let value: Option<Vec<u8>> = pool.kv().get("user:1").await?;
    /// # Ok(())
    /// # }
    /// ```
    pub async fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        self.pool
            .execute(&Command::new("GET").arg(key))
            .await?
            .into_bytes()
    }

    /// Get a value decoded as UTF-8
    pub async fn get_string(&self, key: &str) -> Result<Option<String>> {
        self.pool
            .execute(&Command::new("GET").arg(key))
            .await?
            .into_string()
    }

    /// Set a new value and return the previous one
    pub async fn getset(&self, key: &str, value: impl IntoArg) -> Result<Option<Vec<u8>>> {
        self.pool
            .execute(&Command::new("GETSET").arg(key).arg(value))
            .await?
            .into_bytes()
    }

    pub async fn set(&self, key: &str, value: impl IntoArg) -> Result<()> {
        self.pool
            .execute(&Command::new("SET").arg(key).arg(value))
            .await?;
        Ok(())
    }

    /// Set a value with a time-to-live in seconds
    pub async fn set_ex(&self, key: &str, value: impl IntoArg, ttl_secs: u64) -> Result<()> {
        self.pool
            .execute(&Command::new("SETEX").arg(key).arg(ttl_secs).arg(value))
            .await?;
        Ok(())
    }

    /// Set only if the key does not exist. Returns true if the key was set.
    pub async fn set_nx(&self, key: &str, value: impl IntoArg) -> Result<bool> {
        let reply = self
            .pool
            .execute(&Command::new("SETNX").arg(key).arg(value))
            .await?;
        Ok(reply.as_int()? == 1)
    }

    /// Set a TTL in seconds. Returns false if the key does not exist.
    pub async fn expire(&self, key: &str, ttl_secs: u64) -> Result<bool> {
        let reply = self
            .pool
            .execute(&Command::new("EXPIRE").arg(key).arg(ttl_secs))
            .await?;
        Ok(reply.as_int()? == 1)
    }

    /// Delete keys, returning how many existed
    pub async fn del(&self, keys: &[&str]) -> Result<i64> {
        self.pool
            .execute(&Command::new("DEL").args(keys.iter().copied()))
            .await?
            .as_int()
    }

    /// Remaining TTL in seconds. `-1` means no expiry, `-2` means no such key.
    pub async fn ttl(&self, key: &str) -> Result<i64> {
        self.pool
            .execute(&Command::new("TTL").arg(key))
            .await?
            .as_int()
    }

    pub async fn incr(&self, key: &str) -> Result<i64> {
        self.pool
            .execute(&Command::new("INCR").arg(key))
            .await?
            .as_int()
    }

    /// Server clock as time since the Unix epoch
    pub async fn time(&self) -> Result<Duration> {
        let parts = self.pool.execute(&Command::new("TIME")).await?.into_strings()?;
        let [secs, micros] = parts.as_slice() else {
            return Err(KvError::WrongAnswer(format!("TIME returned {parts:?}")));
        };
        let parse = |part: &String| {
            part.parse::<u64>()
                .map_err(|_| KvError::WrongAnswer(format!("TIME returned {parts:?}")))
        };
        Ok(Duration::from_secs(parse(secs)?) + Duration::from_micros(parse(micros)?))
    }
}
