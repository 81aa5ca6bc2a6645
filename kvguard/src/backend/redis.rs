//! Production backend over `redis` + `deadpool-redis`

use super::{AtomicOp, Backend, Connection};
use crate::command::{Command, Reply};
use crate::config::{PoolConfig, ServerDescriptor};
use crate::error::{KvError, Result};
use async_trait::async_trait;
use ::redis::aio::ConnectionLike;
use deadpool_redis::{Config, PoolError, Runtime};
use std::sync::LazyLock;
use std::time::Duration;

/// Fetch-and-delete of one hash field
const HASH_TAKE_SCRIPT: &str = r#"
local v = redis.call("HGET", KEYS[1], ARGV[1])
redis.call("HDEL", KEYS[1], ARGV[1])
return v
"#;

/// Delete a key only while it still holds the caller's token
const DELETE_IF_EQUALS_SCRIPT: &str = r#"
if redis.call("GET", KEYS[1]) == ARGV[1] then
    return redis.call("DEL", KEYS[1])
end
return 0
"#;

static HASH_TAKE: LazyLock<::redis::Script> =
    LazyLock::new(|| ::redis::Script::new(HASH_TAKE_SCRIPT));
static DELETE_IF_EQUALS: LazyLock<::redis::Script> =
    LazyLock::new(|| ::redis::Script::new(DELETE_IF_EQUALS_SCRIPT));

impl From<::redis::RedisError> for KvError {
    fn from(err: ::redis::RedisError) -> Self {
        if err.is_timeout() {
            KvError::Timeout
        } else if err.is_io_error() || err.is_connection_dropped() || err.is_connection_refusal()
        {
            KvError::Connection(err.to_string())
        } else {
            KvError::Server(err.to_string())
        }
    }
}

impl From<PoolError> for KvError {
    fn from(err: PoolError) -> Self {
        match err {
            PoolError::Backend(err) => err.into(),
            PoolError::Timeout(_) => KvError::Timeout,
            other => KvError::Connection(other.to_string()),
        }
    }
}

/// Decode one reply. Error elements nested in an array stay values, so a
/// committed EXEC keeps the replies of the commands that did succeed.
fn decode(value: ::redis::Value) -> Result<Reply> {
    use ::redis::Value;

    let reply = match value {
        Value::Nil => Reply::Nil,
        Value::Int(value) => Reply::Int(value),
        Value::BulkString(data) => Reply::Bulk(data),
        Value::SimpleString(status) => Reply::Status(status),
        Value::Okay => Reply::Status("OK".to_string()),
        Value::VerbatimString { text, .. } => Reply::Bulk(text.into_bytes()),
        Value::Array(items) | Value::Set(items) => Reply::Array(
            items
                .into_iter()
                .map(|item| match item {
                    Value::ServerError(err) => {
                        Ok(Reply::Error(::redis::RedisError::from(err).to_string()))
                    }
                    item => decode(item),
                })
                .collect::<Result<_>>()?,
        ),
        Value::Boolean(flag) => Reply::Int(i64::from(flag)),
        Value::Double(value) => Reply::Bulk(value.to_string().into_bytes()),
        Value::Attribute { data, .. } => decode(*data)?,
        Value::ServerError(err) => return Err(::redis::RedisError::from(err).into()),
        other => {
            return Err(KvError::WrongAnswer(format!(
                "unsupported reply type: {other:?}"
            )));
        }
    };
    Ok(reply)
}

/// One Redis server with its own connection pool
pub struct RedisBackend {
    address: String,
    pool: deadpool_redis::Pool,
    request_timeout: Duration,
}

impl RedisBackend {
    /// Build the connection pool for one server. No connection is opened yet.
    pub fn open(server: &ServerDescriptor, config: &PoolConfig) -> Result<Self> {
        let mut cfg = Config::from_url(server.url()?.as_str());
        let mut pool_config = deadpool_redis::PoolConfig::new(config.max_connections);
        pool_config.timeouts.wait = Some(config.connect_timeout());
        pool_config.timeouts.create = Some(config.connect_timeout());
        pool_config.timeouts.recycle = Some(config.connect_timeout());
        cfg.pool = Some(pool_config);

        let pool = cfg
            .create_pool(Some(Runtime::Tokio1))
            .map_err(|e| KvError::Config(format!("{}: {}", server.address(), e)))?;

        Ok(Self {
            address: server.address(),
            pool,
            request_timeout: config.write_timeout() + config.read_timeout(),
        })
    }
}

#[async_trait]
impl Backend for RedisBackend {
    type Conn = RedisConnection;

    fn address(&self) -> &str {
        &self.address
    }

    async fn checkout(&self) -> Result<RedisConnection> {
        let conn = self.pool.get().await?;
        Ok(RedisConnection {
            conn,
            request_timeout: self.request_timeout,
        })
    }

    fn close(&self) {
        self.pool.close();
    }
}

/// A pooled Redis connection; returned to its pool on drop
pub struct RedisConnection {
    conn: deadpool_redis::Connection,
    request_timeout: Duration,
}

/// Bound one round trip by the configured read+write deadline
async fn bounded<F>(timeout: Duration, request: F) -> Result<::redis::Value>
where
    F: std::future::Future<Output = ::redis::RedisResult<::redis::Value>>,
{
    match tokio::time::timeout(timeout, request).await {
        Ok(result) => Ok(result?),
        Err(_) => Err(KvError::Timeout),
    }
}

#[async_trait]
impl Connection for RedisConnection {
    async fn query(&mut self, cmd: &Command) -> Result<Reply> {
        let mut redis_cmd = ::redis::cmd(cmd.name());
        for arg in cmd.arguments() {
            redis_cmd.arg(arg.as_slice());
        }

        // Raw request: `query_async` would turn one failed element of an
        // EXEC array into an error for the whole transaction
        let value = bounded(self.request_timeout, self.conn.req_packed_command(&redis_cmd)).await?;
        decode(value)
    }

    async fn atomic(&mut self, op: AtomicOp<'_>) -> Result<Reply> {
        let mut invocation = match op {
            AtomicOp::HashTake { .. } => HASH_TAKE.prepare_invoke(),
            AtomicOp::DeleteIfEquals { .. } => DELETE_IF_EQUALS.prepare_invoke(),
        };
        match op {
            AtomicOp::HashTake { table, field } => invocation.key(table).arg(field),
            AtomicOp::DeleteIfEquals { key, expected } => invocation.key(key).arg(expected),
        };

        decode(bounded(self.request_timeout, invocation.invoke_async(&mut self.conn)).await?)
    }
}
