//! # KVGuard
//!
//! Fault-tolerant client layer over Redis-compatible key-value servers.
//!
//! ## Features
//!
//! - **Failover pool**: ordered backend list with entropy-based failover and
//!   background health probing
//! - **Bounded retry**: connectivity failures are retried, data errors are not
//! - **Distributed lock**: SETNX + TTL, with an optional owner-token variant
//! - **Reliable queue**: at-least-once FIFO queue over a list and a hash
//! - **Optimistic transactions**: WATCH/MULTI/EXEC on one held connection
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use kvguard::{Pool, PoolConfig, ServerDescriptor};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = PoolConfig::new(vec![
//!         ServerDescriptor::new("10.0.0.1", 6379),
//!         ServerDescriptor::new("10.0.0.2", 6379).with_auth("secret"),
//!     ]);
//!     let pool = Pool::connect(config).await?;
//!
//!     pool.lock().lock("report", 3, 10).await?;
//!     pool.queue().enqueue("jobs", "k1", b"payload").await?;
//!     pool.lock().unlock("report").await?;
//!
//!     if let Some(entry) = pool.queue().dequeue("jobs").await? {
//!         println!("{} -> {:?}", entry.key, entry.payload);
//!     }
//!     Ok(())
//! }
//! ```

pub mod backend;
pub mod command;
pub mod config;
pub mod error;
mod executor;
pub mod failover;
pub mod hash;
pub mod kv;
pub mod list;
pub mod lock;
pub mod pool;
mod prober;
pub mod queue;
pub mod set;
pub mod transaction;

#[cfg(any(test, feature = "test-util"))]
pub use backend::memory::MemoryBackend;
pub use backend::redis::RedisBackend;
pub use backend::{AtomicOp, Backend, Connection};
pub use command::{Command, IntoArg, Reply};
pub use config::{PoolConfig, ServerDescriptor};
pub use error::{KvError, Result};
pub use failover::{BackendStatus, FailoverEvent, FailoverPolicy, HealthState};
pub use hash::HashManager;
pub use kv::KvStore;
pub use list::ListManager;
pub use lock::{LockManager, LockToken};
pub use pool::Pool;
pub use queue::{QueueEntry, QueueLimits, QueueManager};
pub use set::SetManager;
pub use transaction::{FixedCommand, TransactionManager, TransactionOutcome, VariableCommand};
