//! Reliable queue
//!
//! A queue named `jobs` lives in two structures: the list `jobs` holds keys
//! in FIFO order and the hash `jobs_htable` maps each key to its payload.
//! Re-enqueuing a key that is still waiting only replaces its payload; it
//! keeps its place in line.
//!
//! Delivery is at-least-once. A consumer that crashes after dequeue loses
//! the entry, but an entry is never dropped by the queue itself.

use crate::backend::{Backend, redis::RedisBackend};
use crate::error::{KvError, Result};
use crate::hash::HashManager;
use crate::list::ListManager;
use crate::pool::Pool;
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::time::Duration;
use tracing::warn;

const TABLE_SUFFIX: &str = "_htable";
const RELIABLE_RETRY_INTERVAL: Duration = Duration::from_secs(1);

/// Admission thresholds on the order list length
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueueLimits {
    /// Log a warning at or above this many waiting entries
    pub warn_len: i64,
    /// Reject new keys at or above this many waiting entries
    pub max_len: i64,
}

impl Default for QueueLimits {
    fn default() -> Self {
        Self {
            warn_len: 100,
            max_len: 1000,
        }
    }
}

/// One dequeued entry
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueEntry {
    pub key: String,
    /// `None` when the payload was already gone. The key is still delivered;
    /// callers decide how to recover.
    pub payload: Option<Vec<u8>>,
}

/// Reliable queue interface
pub struct QueueManager<B: Backend = RedisBackend> {
    hash: HashManager<B>,
    list: ListManager<B>,
    limits: Option<QueueLimits>,
}

impl<B: Backend> QueueManager<B> {
    /// Create a new Queue manager interface
    pub(crate) fn new(pool: Pool<B>) -> Self {
        Self {
            hash: pool.hash(),
            list: pool.list(),
            limits: None,
        }
    }

    /// Enable admission control
    pub fn with_limits(mut self, limits: QueueLimits) -> Self {
        self.limits = Some(limits);
        self
    }

    /// Add `key` to the tail of `queue`, or update its payload if it is
    /// already waiting
    ///
    /// # Example
    /// ```no_run
    /// # use kvguard::{Pool, PoolConfig, ServerDescriptor};
    /// # #[tokio::main]
    /// # async fn main() -> Result<(), Box<dyn std::error::Error>> {
    /// # let pool = Pool::connect(PoolConfig::new(vec![ServerDescriptor::new("localhost", 6379)])).await?;
    /// pool.queue().enqueue("thumbnails", "img:42", b"{\"w\":128}").await?;
    /// # Ok(())
    /// # }
    /// ```
    pub async fn enqueue(&self, queue: &str, key: &str, data: impl AsRef<[u8]>) -> Result<()> {
        self.store(queue, key, data.as_ref(), false).await
    }

    /// Enqueue, retrying every second until it succeeds
    ///
    /// Blocks for as long as the backends stay unavailable. An invalid key or
    /// a closed pool is returned at once since retrying cannot fix either.
    pub async fn enqueue_reliably(
        &self,
        queue: &str,
        key: &str,
        data: impl AsRef<[u8]>,
    ) -> Result<()> {
        let data = data.as_ref();
        let mut repair = false;
        loop {
            match self.store(queue, key, data, repair).await {
                Ok(()) => return Ok(()),
                Err(err @ (KvError::InvalidQueueKey { .. } | KvError::Closed)) => return Err(err),
                Err(err) => {
                    warn!(queue, key, error = %err, "enqueue failed, retrying");
                    tokio::time::sleep(RELIABLE_RETRY_INTERVAL).await;
                }
            }
            // The failed attempt may have stored the payload without
            // queueing the key
            repair = true;
        }
    }

    /// Write the payload, then queue the key if it is new. With `repair`, an
    /// existing payload whose key is missing from the order list gets queued
    /// too.
    async fn store(&self, queue: &str, key: &str, data: &[u8], repair: bool) -> Result<()> {
        if key.is_empty() {
            return Err(KvError::InvalidQueueKey {
                queue: queue.to_string(),
                key: key.to_string(),
            });
        }
        if let Some(limits) = self.limits {
            self.admit(queue, key, limits).await?;
        }

        let created = self.hash.hset(&table_name(queue), key, data).await?;
        if created == 0 && (!repair || self.list.lpos(queue, key).await?.is_some()) {
            return Ok(());
        }

        self.list.rpush(queue, [key]).await?;
        Ok(())
    }

    /// Take the entry at the head of `queue`; `None` when the queue is empty
    ///
    /// If the payload cannot be taken after the key was popped, the key is
    /// pushed back to the head and [`KvError::PayloadTakeFailed`] names it,
    /// so a caller can recover it when the push back failed too.
    pub async fn dequeue(&self, queue: &str) -> Result<Option<QueueEntry>> {
        let Some(key) = self.list.lpop(queue).await? else {
            return Ok(None);
        };
        let key = String::from_utf8_lossy(&key).into_owned();

        match self.hash.hpop(&table_name(queue), &key).await {
            Ok(payload) => Ok(Some(QueueEntry { key, payload })),
            Err(err) => {
                // Put the key back in front so the entry is not lost
                let requeued = match self.list.lpush(queue, [key.as_str()]).await {
                    Ok(_) => true,
                    Err(push_err) => {
                        warn!(queue, key, error = %push_err, "could not requeue key");
                        false
                    }
                };
                Err(KvError::PayloadTakeFailed {
                    queue: queue.to_string(),
                    key,
                    requeued,
                    source: Box::new(err),
                })
            }
        }
    }

    /// Enqueue a payload serialized as JSON
    pub async fn enqueue_json<T: Serialize>(&self, queue: &str, key: &str, value: &T) -> Result<()> {
        let data = serde_json::to_vec(value)?;
        self.enqueue(queue, key, data).await
    }

    /// Dequeue and decode a JSON payload
    pub async fn dequeue_json<T: DeserializeOwned>(
        &self,
        queue: &str,
    ) -> Result<Option<(String, Option<T>)>> {
        let Some(entry) = self.dequeue(queue).await? else {
            return Ok(None);
        };
        let value = match entry.payload {
            Some(data) => Some(serde_json::from_slice(&data)?),
            None => None,
        };
        Ok(Some((entry.key, value)))
    }

    /// Number of entries waiting
    pub async fn len(&self, queue: &str) -> Result<i64> {
        self.list.llen(queue).await
    }

    async fn admit(&self, queue: &str, key: &str, limits: QueueLimits) -> Result<()> {
        let len = self.list.llen(queue).await?;
        if len < limits.warn_len.min(limits.max_len) {
            return Ok(());
        }
        if len >= limits.warn_len {
            warn!(queue, len, "queue is backing up");
        }
        if len >= limits.max_len {
            // Updating a waiting entry does not grow the queue
            if self.hash.hget(&table_name(queue), key).await?.is_none() {
                return Err(KvError::QueueFull {
                    queue: queue.to_string(),
                    len,
                });
            }
        }
        Ok(())
    }
}

fn table_name(queue: &str) -> String {
    format!("{queue}{TABLE_SUFFIX}")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::memory::MemoryBackend;
    use crate::failover::FailoverPolicy;
    use serde::Deserialize;

    async fn pool() -> Pool<MemoryBackend> {
        Pool::from_backends(vec![MemoryBackend::new("mem:0")], FailoverPolicy::default())
            .await
            .unwrap()
    }

    #[test]
    fn test_table_name() {
        assert_eq!(table_name("jobs"), "jobs_htable");
    }

    #[tokio::test]
    async fn test_enqueue_rejects_empty_key() {
        let queue = pool().await.queue();
        let err = queue.enqueue("jobs", "", b"p").await.unwrap_err();
        assert!(matches!(err, KvError::InvalidQueueKey { .. }));
        // No retry loop for a key that can never be valid
        assert!(queue.enqueue_reliably("jobs", "", b"p").await.is_err());
    }

    #[tokio::test]
    async fn test_missing_payload_still_delivers_key() {
        let pool = pool().await;
        let queue = pool.queue();
        queue.enqueue("jobs", "k1", b"p1").await.unwrap();
        pool.hash().hpop("jobs_htable", "k1").await.unwrap();

        let entry = queue.dequeue("jobs").await.unwrap().unwrap();
        assert_eq!(entry.key, "k1");
        assert_eq!(entry.payload, None);
        assert_eq!(queue.dequeue("jobs").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_json_payloads() {
        #[derive(Debug, Serialize, Deserialize, PartialEq)]
        struct Job {
            id: u32,
            url: String,
        }

        let queue = pool().await.queue();
        let job = Job {
            id: 7,
            url: "https://example.com/a.png".into(),
        };
        queue.enqueue_json("jobs", "job:7", &job).await.unwrap();

        let (key, decoded) = queue.dequeue_json::<Job>("jobs").await.unwrap().unwrap();
        assert_eq!(key, "job:7");
        assert_eq!(decoded, Some(job));
        assert!(queue.dequeue_json::<Job>("jobs").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_limits_reject_new_keys_only() {
        let queue = pool().await.queue().with_limits(QueueLimits {
            warn_len: 1,
            max_len: 2,
        });

        queue.enqueue("jobs", "k1", b"a").await.unwrap();
        queue.enqueue("jobs", "k2", b"b").await.unwrap();
        let err = queue.enqueue("jobs", "k3", b"c").await.unwrap_err();
        assert!(matches!(err, KvError::QueueFull { len: 2, .. }));

        // Payload update of a waiting key passes
        queue.enqueue("jobs", "k2", b"b2").await.unwrap();
        assert_eq!(queue.len("jobs").await.unwrap(), 2);

        queue.dequeue("jobs").await.unwrap();
        queue.enqueue("jobs", "k3", b"c").await.unwrap();
    }
}
