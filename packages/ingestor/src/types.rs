//! Domain Records
//!
//! Transactions and blocks as decoded from the node's feed, plus the stored
//! variants returned by the store's query helpers.

use std::fmt;
use std::str::FromStr;

use bitcoin::hashes::Hash;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use thiserror::Error;

/// Errors that can occur when parsing a [`Hash32`] from text
#[derive(Error, Debug, PartialEq, Eq)]
pub enum HashParseError {
    #[error("Invalid hex: {0}")]
    InvalidHex(String),

    #[error("Expected 32 bytes, got {0}")]
    InvalidLength(usize),
}

/// A 32-byte identifier (transaction id or block hash).
///
/// Bytes are kept in wire order. Display and serde use the reversed hex form
/// that node RPC interfaces and block explorers print.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct Hash32([u8; 32]);

impl Hash32 {
    /// All-zero hash
    pub const ZERO: Self = Self([0u8; 32]);

    /// Wrap bytes already in wire order
    pub const fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    /// Build from a slice, returning `None` unless it is exactly 32 bytes long
    pub fn from_slice(bytes: &[u8]) -> Option<Self> {
        <[u8; 32]>::try_from(bytes).ok().map(Self)
    }

    /// Raw bytes in wire order
    pub const fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }
}

impl From<[u8; 32]> for Hash32 {
    fn from(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }
}

impl From<bitcoin::Txid> for Hash32 {
    fn from(txid: bitcoin::Txid) -> Self {
        Self(txid.to_byte_array())
    }
}

impl From<bitcoin::BlockHash> for Hash32 {
    fn from(hash: bitcoin::BlockHash) -> Self {
        Self(hash.to_byte_array())
    }
}

impl fmt::Display for Hash32 {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut reversed = self.0;
        reversed.reverse();
        f.write_str(&hex::encode(reversed))
    }
}

impl fmt::Debug for Hash32 {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Hash32({self})")
    }
}

impl FromStr for Hash32 {
    type Err = HashParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut bytes = hex::decode(s).map_err(|e| HashParseError::InvalidHex(e.to_string()))?;
        bytes.reverse();
        Self::from_slice(&bytes).ok_or(HashParseError::InvalidLength(bytes.len()))
    }
}

impl Serialize for Hash32 {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for Hash32 {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

/// A mempool transaction as seen on the feed
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Transaction {
    pub txid: Hash32,
    /// Capture time at receipt
    pub first_seen: DateTime<Utc>,
    /// When the transaction left the mempool. Not populated by the ingestion pipeline.
    pub last_removed: Option<DateTime<Utc>>,
    /// Fee in satoshis
    pub fee: u64,
    /// BIP141 weight units
    pub weight: u64,
    /// Confirmation height. Not populated by the ingestion pipeline.
    pub block_height: Option<u32>,
    /// Position in the confirming block. Not populated by the ingestion pipeline.
    pub index_in_block: Option<u32>,
}

impl Transaction {
    /// Create an unconfirmed transaction record
    pub fn new(txid: Hash32, first_seen: DateTime<Utc>, fee: u64, weight: u64) -> Self {
        Self {
            txid,
            first_seen,
            last_removed: None,
            fee,
            weight,
            block_height: None,
            index_in_block: None,
        }
    }

    /// Fee rate in satoshis per virtual byte
    pub fn fee_rate(&self) -> f64 {
        if self.weight == 0 {
            return 0.0;
        }
        self.fee as f64 / (self.weight as f64 / 4.0)
    }
}

/// A block as seen on the feed
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Block {
    pub hash: Hash32,
    pub parent: Hash32,
    pub first_seen: DateTime<Utc>,
    /// Timestamp from the block header
    pub encoded_time: DateTime<Utc>,
    pub height: u32,
    /// Always true: the feed only publishes the tip, so competing blocks are never observed.
    pub is_best: bool,
    /// Transaction ids in on-chain order
    pub txids: Vec<Hash32>,
}

/// A transaction row together with its internal storage id.
///
/// The storage id is not part of the record's identity and is never serialized.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredTransaction {
    #[serde(skip)]
    pub db_id: i64,
    #[serde(flatten)]
    pub transaction: Transaction,
}

/// A block row together with its internal storage id
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StoredBlock {
    #[serde(skip)]
    pub db_id: i64,
    pub hash: Hash32,
    pub parent: Option<Hash32>,
    pub first_seen: DateTime<Utc>,
    pub height: u32,
    pub is_best: bool,
}
