//! Pool configuration

use crate::error::{KvError, Result};
use crate::failover::FailoverPolicy;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use std::time::Duration;
use url::Url;

/// One backend key-value server
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerDescriptor {
    pub host: String,
    pub port: u16,
    /// AUTH credential; empty or `"nil"` disables AUTH
    #[serde(default)]
    pub auth: Option<String>,
    /// SELECT index
    #[serde(default)]
    pub db: Option<u32>,
}

impl ServerDescriptor {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            auth: None,
            db: None,
        }
    }

    pub fn with_auth(mut self, auth: impl Into<String>) -> Self {
        self.auth = Some(auth.into());
        self
    }

    pub fn with_db(mut self, db: u32) -> Self {
        self.db = Some(db);
        self
    }

    /// `host:port`
    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    fn credential(&self) -> Option<&str> {
        self.auth
            .as_deref()
            .filter(|auth| !auth.is_empty() && *auth != "nil")
    }

    /// Connection URL, credentials percent-encoded
    pub fn url(&self) -> Result<Url> {
        let mut url = Url::parse(&format!("redis://{}", self.address()))?;
        if let Some(auth) = self.credential() {
            url.set_password(Some(auth))
                .map_err(|_| KvError::Config(format!("cannot set credential for {}", self.host)))?;
        }
        if let Some(db) = self.db {
            url.set_path(&format!("/{db}"));
        }
        Ok(url)
    }
}

/// Main pool configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolConfig {
    /// Ordered backend list; index 0 is active first
    pub servers: Vec<ServerDescriptor>,
    /// Entropy ceiling per backend
    pub max_fail: u32,
    /// Attempts per executed command
    pub failure_retry: u32,
    pub retry_backoff_ms: u64,
    pub connect_timeout_ms: u64,
    pub read_timeout_ms: u64,
    pub write_timeout_ms: u64,
    /// Connections per backend
    pub max_connections: usize,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            servers: Vec::new(),
            max_fail: 6,
            failure_retry: 3,
            retry_backoff_ms: 100,
            connect_timeout_ms: 1000,
            read_timeout_ms: 2000,
            write_timeout_ms: 2000,
            max_connections: 500,
        }
    }
}

impl PoolConfig {
    /// Create a configuration for the given servers with default tunables
    pub fn new(servers: Vec<ServerDescriptor>) -> Self {
        Self {
            servers,
            ..Default::default()
        }
    }

    /// Load configuration from YAML file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = fs::read_to_string(path)?;
        Self::from_yaml_str(&content)
    }

    /// Parse configuration from a YAML document
    pub fn from_yaml_str(content: &str) -> Result<Self> {
        let config: PoolConfig = serde_yaml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn with_max_fail(mut self, max_fail: u32) -> Self {
        self.max_fail = max_fail;
        self
    }

    pub fn with_failure_retry(mut self, failure_retry: u32) -> Self {
        self.failure_retry = failure_retry;
        self
    }

    pub fn with_retry_backoff(mut self, backoff: Duration) -> Self {
        self.retry_backoff_ms = backoff.as_millis() as u64;
        self
    }

    pub fn with_max_connections(mut self, max_connections: usize) -> Self {
        self.max_connections = max_connections;
        self
    }

    /// Reject tunables the failover policy cannot work with.
    ///
    /// An empty server list is not rejected here; connecting reports it as
    /// [`KvError::ServersEmpty`].
    pub fn validate(&self) -> Result<()> {
        if self.max_fail == 0 {
            return Err(KvError::Config("max_fail must be at least 1".into()));
        }
        if self.failure_retry == 0 {
            return Err(KvError::Config("failure_retry must be at least 1".into()));
        }
        if self.connect_timeout_ms == 0 || self.read_timeout_ms == 0 || self.write_timeout_ms == 0
        {
            return Err(KvError::Config("timeouts must be non-zero".into()));
        }
        if self.max_connections == 0 {
            return Err(KvError::Config("max_connections must be at least 1".into()));
        }
        Ok(())
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn read_timeout(&self) -> Duration {
        Duration::from_millis(self.read_timeout_ms)
    }

    pub fn write_timeout(&self) -> Duration {
        Duration::from_millis(self.write_timeout_ms)
    }

    /// Failover tunables injected into the pool
    pub fn policy(&self) -> FailoverPolicy {
        FailoverPolicy {
            max_fail: self.max_fail,
            failure_retry: self.failure_retry,
            retry_backoff: Duration::from_millis(self.retry_backoff_ms),
        }
    }
}
