//! Error types for KVGuard

use thiserror::Error;

/// Result type alias for KVGuard operations
pub type Result<T> = std::result::Result<T, KvError>;

/// KVGuard error types
#[derive(Error, Debug)]
pub enum KvError {
    /// No backend was configured
    #[error("servers is empty")]
    ServersEmpty,

    /// Every backend is marked dead; a background probe has been scheduled
    #[error("server non available")]
    ServerUnavailable,

    /// The pool was closed
    #[error("pool is closed")]
    Closed,

    /// Network-level failure talking to a backend
    #[error("connection error: {0}")]
    Connection(String),

    /// Connect, read or write deadline exceeded
    #[error("operation timeout")]
    Timeout,

    /// The store answered with an error reply
    #[error("server error: {0}")]
    Server(String),

    /// The reply did not have the expected shape
    #[error("get wrong answer: {0}")]
    WrongAnswer(String),

    /// The reply was empty where a value was required
    #[error("get empty answer")]
    EmptyAnswer,

    /// Lock retry budget exhausted
    #[error("lock failed {0}")]
    LockFailed(String),

    /// Lock acquisition deadline exceeded
    #[error("get {0} lock already expire")]
    LockTimeout(String),

    /// Unlock called with an empty key
    #[error("unlocked key is empty")]
    EmptyLockKey,

    /// Enqueue called with an unusable key
    #[error("queue {queue} using invalid key: {key:?}")]
    InvalidQueueKey { queue: String, key: String },

    /// Admission control rejected a new entry
    #[error("queue {queue} is full ({len} entries)")]
    QueueFull { queue: String, len: i64 },

    /// A dequeued key left the order list but its payload could not be taken
    #[error("queue {queue}: taking payload of {key:?} failed (requeued: {requeued}): {source}")]
    PayloadTakeFailed {
        queue: String,
        key: String,
        requeued: bool,
        #[source]
        source: Box<KvError>,
    },

    /// Transaction parameters failed validation
    #[error("invalid transaction: {0}")]
    InvalidTransaction(String),

    /// Invalid configuration
    #[error("configuration error: {0}")]
    Config(String),

    /// Invalid backend URL
    #[error("Invalid URL: {0}")]
    InvalidUrl(#[from] url::ParseError),

    /// YAML configuration error
    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    /// JSON payload serialization/deserialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Local I/O error (configuration files)
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl KvError {
    /// Whether this failure says something about backend reachability.
    ///
    /// Only connectivity failures move entropy and trigger failover; error
    /// replies and malformed answers are data problems and leave health alone.
    pub fn is_connectivity(&self) -> bool {
        match self {
            Self::Connection(_) | Self::Timeout => true,
            Self::PayloadTakeFailed { source, .. } => source.is_connectivity(),
            _ => false,
        }
    }
}
