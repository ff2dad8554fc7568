//! ZmqFeed Ingestor Library
//!
//! This crate provides components for ingesting a Bitcoin node's ZMQ feed:
//! decoding raw transactions and blocks, and persisting them to SQLite.

pub mod codec;
pub mod config;
pub mod daemon;
pub mod store;
pub mod subscriber;
pub mod types;

// Re-export commonly used types
pub use codec::{decode_block, decode_transaction, CodecError};
pub use config::{ConfigError, IngestorConfig};
pub use daemon::{Daemon, DaemonError, DaemonState};
pub use store::{Query, Store, StoreError};
pub use subscriber::{FeedSocket, Subscriber, SubscriberError, SubscriberQueues, ZmqFeed};
pub use types::{Block, Hash32, StoredBlock, StoredTransaction, Transaction};
