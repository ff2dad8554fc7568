//! Ingestor Configuration
//!
//! Where to find the node's ZMQ publisher, where to keep the database, and the
//! timing knobs of the receive loop.

use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

/// Default host of the node's ZMQ publisher
pub const DEFAULT_ZMQ_HOST: &str = "127.0.0.1";

/// Default port of the node's ZMQ publisher
pub const DEFAULT_ZMQ_PORT: u16 = 28332;

/// Default database location
pub const DEFAULT_DB_PATH: &str = "~/.zmqfeed/ingestor.sqlite";

/// Connection timeout in milliseconds
pub const CONNECTION_TIMEOUT_MS: u64 = 5000;

/// Bounded wait of a single receive; also the worst-case latency of a stop request
pub const RECV_TIMEOUT_MS: u64 = 1000;

/// Capacity of each decoded-record queue. 1 keeps delivery a near-synchronous handoff.
pub const QUEUE_CAPACITY: usize = 1;

/// Emit a transaction count every this many processed events
pub const STATS_INTERVAL: u64 = 100;

/// Errors that can occur when validating configuration
#[derive(Error, Debug, PartialEq, Eq)]
pub enum ConfigError {
    #[error("ZMQ host cannot be empty")]
    EmptyHost,

    #[error("ZMQ port cannot be 0")]
    InvalidPort,

    #[error("Database path cannot be empty")]
    EmptyDbPath,

    #[error("{0} must be greater than zero")]
    Zero(&'static str),
}

/// Configuration for the ingestion daemon
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IngestorConfig {
    pub zmq_host: String,
    pub zmq_port: u16,
    /// Path to the SQLite database, `~/` is expanded
    pub db_path: String,
    /// Give up connecting to the publisher after this long
    pub connect_timeout_ms: u64,
    pub recv_timeout_ms: u64,
    pub queue_capacity: usize,
    pub stats_interval: u64,
}

impl Default for IngestorConfig {
    fn default() -> Self {
        Self {
            zmq_host: DEFAULT_ZMQ_HOST.to_string(),
            zmq_port: DEFAULT_ZMQ_PORT,
            db_path: DEFAULT_DB_PATH.to_string(),
            connect_timeout_ms: CONNECTION_TIMEOUT_MS,
            recv_timeout_ms: RECV_TIMEOUT_MS,
            queue_capacity: QUEUE_CAPACITY,
            stats_interval: STATS_INTERVAL,
        }
    }
}

impl IngestorConfig {
    /// Set the publisher's host and port
    pub fn with_zmq(mut self, host: impl Into<String>, port: u16) -> Self {
        self.zmq_host = host.into();
        self.zmq_port = port;
        self
    }

    /// Set the database path
    pub fn with_db_path(mut self, db_path: impl Into<String>) -> Self {
        self.db_path = db_path.into();
        self
    }

    /// Set the connection timeout
    pub fn with_connect_timeout_ms(mut self, connect_timeout_ms: u64) -> Self {
        self.connect_timeout_ms = connect_timeout_ms;
        self
    }

    /// Set the bounded wait of each receive
    pub fn with_recv_timeout_ms(mut self, recv_timeout_ms: u64) -> Self {
        self.recv_timeout_ms = recv_timeout_ms;
        self
    }

    /// Set the capacity of each decoded-record queue
    pub fn with_queue_capacity(mut self, queue_capacity: usize) -> Self {
        self.queue_capacity = queue_capacity;
        self
    }

    /// ZMQ endpoint, `tcp://<host>:<port>`
    pub fn endpoint(&self) -> String {
        format!("tcp://{}:{}", self.zmq_host, self.zmq_port)
    }

    /// Connection timeout as a [`Duration`]
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    /// Receive timeout as a [`Duration`]
    pub fn recv_timeout(&self) -> Duration {
        Duration::from_millis(self.recv_timeout_ms)
    }

    /// Database path with a leading `~/` expanded
    pub fn expanded_db_path(&self) -> PathBuf {
        PathBuf::from(expand_path(&self.db_path))
    }

    /// Check that every field holds a usable value
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.zmq_host.trim().is_empty() {
            return Err(ConfigError::EmptyHost);
        }
        if self.zmq_port == 0 {
            return Err(ConfigError::InvalidPort);
        }
        if self.db_path.trim().is_empty() {
            return Err(ConfigError::EmptyDbPath);
        }
        if self.connect_timeout_ms == 0 {
            return Err(ConfigError::Zero("connection timeout"));
        }
        if self.recv_timeout_ms == 0 {
            return Err(ConfigError::Zero("receive timeout"));
        }
        if self.queue_capacity == 0 {
            return Err(ConfigError::Zero("queue capacity"));
        }
        if self.stats_interval == 0 {
            return Err(ConfigError::Zero("stats interval"));
        }
        Ok(())
    }
}

/// Expand ~ to home directory in path
pub fn expand_path(path: &str) -> String {
    if path.starts_with("~/") {
        if let Some(home) = dirs::home_dir() {
            return path.replacen('~', &home.to_string_lossy(), 1);
        }
    }
    path.to_string()
}
