//! SQLite Store
//!
//! Durable storage for transactions and blocks seen on the feed.
//!
//! The store has a single writer: the daemon's event loop. It therefore owns a
//! plain [`Connection`] without any locking.
//!
//! ## Schema (version 5)
//! ```sql
//! CREATE TABLE config (version INTEGER);
//! CREATE TABLE "transaction" (
//!     id INTEGER PRIMARY KEY, txid BLOB UNIQUE NOT NULL,
//!     first_seen INTEGER, last_removed INTEGER, fee INTEGER, weight INTEGER
//! );
//! CREATE TABLE "block" (
//!     id INTEGER PRIMARY KEY, hash BLOB(32) UNIQUE NOT NULL, parent BLOB(32),
//!     first_seen INTEGER, height INTEGER, is_best INTEGER
//! );
//! CREATE TABLE transaction_block (transaction_id, block_id, block_index);
//! ```
//! Timestamps are unix milliseconds.

use std::io::ErrorKind;
use std::path::Path;

use chrono::{DateTime, Utc};
use rusqlite::types::{FromSql, FromSqlError, FromSqlResult, ToSqlOutput, ValueRef};
use rusqlite::{params, Connection, OptionalExtension, Row, ToSql};
use thiserror::Error;
use tracing::{debug, info};

use crate::types::{Block, Hash32, StoredBlock, StoredTransaction, Transaction};

/// Schema version written by this build
pub const CURRENT_VERSION: i64 = 5;

const CREATE_SCHEMA: &str = r#"
    CREATE TABLE config (
        version INTEGER
    );

    CREATE TABLE "transaction" (
        id           INTEGER PRIMARY KEY UNIQUE NOT NULL,
        txid         BLOB UNIQUE NOT NULL,
        first_seen   INTEGER,
        last_removed INTEGER,
        fee          INTEGER,
        weight       INTEGER
    );

    CREATE TABLE "block" (
        id         INTEGER PRIMARY KEY UNIQUE NOT NULL,
        hash       BLOB (32) UNIQUE NOT NULL,
        parent     BLOB (32),
        first_seen INTEGER,
        height     INTEGER,
        is_best    INTEGER
    );

    CREATE TABLE transaction_block (
        -- internal transaction id
        transaction_id INTEGER REFERENCES "transaction" (id) NOT NULL,
        -- internal block id
        block_id       INTEGER REFERENCES "block" (id) NOT NULL,
        -- position of the transaction in the block
        block_index    INTEGER NOT NULL
    );
"#;

const TRANSACTION_FIELDS: &[&str] = &[
    "id",
    "txid",
    "first_seen",
    "last_removed",
    "fee",
    "weight",
    r#"(SELECT b.height FROM transaction_block tb JOIN "block" b ON b.id = tb.block_id
        WHERE tb.transaction_id = "transaction".id AND b.is_best = 1
        ORDER BY b.height DESC LIMIT 1)"#,
    r#"(SELECT tb.block_index FROM transaction_block tb JOIN "block" b ON b.id = tb.block_id
        WHERE tb.transaction_id = "transaction".id AND b.is_best = 1
        ORDER BY b.height DESC LIMIT 1)"#,
];

const BLOCK_FIELDS: &[&str] = &["id", "hash", "parent", "first_seen", "height", "is_best"];

/// Errors that can occur in the store
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Could not initialize the database: {0}")]
    StorageInit(String),

    #[error("Could not migrate the database: {0}")]
    Migration(String),

    #[error("Duplicate key: {0}")]
    DuplicateKey(Hash32),

    #[error("Storage error: {0}")]
    Storage(#[from] rusqlite::Error),
}

impl StoreError {
    /// True if the insert collided with an existing txid or block hash
    pub fn is_duplicate(&self) -> bool {
        matches!(self, Self::DuplicateKey(_))
    }
}

/// Filter, order and limit for the query helpers.
///
/// Clauses are SQL fragments inserted verbatim and must never carry untrusted input.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Query {
    where_clause: Option<String>,
    order: Option<String>,
    limit: Option<usize>,
}

impl Query {
    /// Match every row
    pub fn all() -> Self {
        Self::default()
    }

    /// SQL condition placed after `WHERE`
    pub fn filter(mut self, where_clause: impl Into<String>) -> Self {
        self.where_clause = Some(where_clause.into());
        self
    }

    /// SQL ordering placed after `ORDER BY`
    pub fn order_by(mut self, order: impl Into<String>) -> Self {
        self.order = Some(order.into());
        self
    }

    /// A limit of 0 means no limit
    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = (limit > 0).then_some(limit);
        self
    }

    fn format(&self, fields: &[&str], table: &str) -> String {
        let mut query = format!(r#"SELECT {} FROM "{}""#, fields.join(", "), table);
        if let Some(where_clause) = self.where_clause.as_deref().filter(|w| !w.is_empty()) {
            query.push_str(" WHERE ");
            query.push_str(where_clause);
        }
        if let Some(order) = self.order.as_deref().filter(|o| !o.is_empty()) {
            query.push_str(" ORDER BY ");
            query.push_str(order);
        }
        if let Some(limit) = self.limit {
            query.push_str(&format!(" LIMIT {limit}"));
        }
        query
    }
}

/// SQLite-backed store
#[derive(Debug)]
pub struct Store {
    conn: Connection,
}

impl Store {
    /// Open the database at `path`, creating a fresh schema if nothing exists there
    ///
    /// Missing parent directories of a fresh database are created.
    ///
    /// An existing database must carry [`CURRENT_VERSION`]; any other version
    /// fails with [`StoreError::Migration`] without touching the data.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let path = path.as_ref();
        let fresh = match std::fs::metadata(path) {
            Ok(_) => false,
            Err(e) if e.kind() == ErrorKind::NotFound => true,
            Err(e) => {
                return Err(StoreError::StorageInit(format!(
                    "could not stat {}: {e}",
                    path.display()
                )))
            }
        };

        if fresh {
            if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
                std::fs::create_dir_all(parent).map_err(|e| {
                    StoreError::StorageInit(format!(
                        "could not create directory {}: {e}",
                        parent.display()
                    ))
                })?;
            }
        }

        let conn = Connection::open(path).map_err(|e| {
            StoreError::StorageInit(format!("could not open {}: {e}", path.display()))
        })?;
        let mut store = Self { conn };

        if fresh {
            store.initialize(CURRENT_VERSION).map_err(|e| {
                StoreError::StorageInit(format!("at path {}: {e}", path.display()))
            })?;
        } else {
            let version = store
                .schema_version()
                .map_err(|e| StoreError::Migration(format!("could not read schema version: {e}")))?;
            store.migrate(version)?;
        }

        info!("Opened database at {} (version {})", path.display(), CURRENT_VERSION);
        Ok(store)
    }

    /// Open a fresh in-memory database (tests and ephemeral runs)
    pub fn open_in_memory() -> Result<Self, StoreError> {
        let conn = Connection::open_in_memory().map_err(|e| {
            StoreError::StorageInit(format!("could not open in-memory database: {e}"))
        })?;
        let mut store = Self { conn };
        store
            .initialize(CURRENT_VERSION)
            .map_err(|e| StoreError::StorageInit(e.to_string()))?;
        Ok(store)
    }

    /// Create all tables and record `version`. Runs in one transaction.
    fn initialize(&mut self, version: i64) -> Result<(), rusqlite::Error> {
        debug!("Initializing a new database with version {}", version);

        let tx = self.conn.transaction()?;
        tx.execute_batch(CREATE_SCHEMA)?;
        tx.execute("INSERT INTO config (version) VALUES (?1)", params![version])?;
        tx.commit()
    }

    fn migrate(&self, from_version: i64) -> Result<(), StoreError> {
        if from_version == CURRENT_VERSION {
            return Ok(());
        }
        // No migration steps exist yet.
        Err(StoreError::Migration(format!(
            "cannot migrate from version {from_version} to {CURRENT_VERSION}"
        )))
    }

    /// Schema version recorded in the `config` table
    pub fn schema_version(&self) -> Result<i64, StoreError> {
        let version = self
            .conn
            .query_row("SELECT version FROM config", [], |row| row.get(0))?;
        Ok(version)
    }

    /// Insert a new transaction
    ///
    /// Fails with [`StoreError::DuplicateKey`] if the txid is already stored.
    pub fn add_transaction(&mut self, tx: &Transaction) -> Result<i64, StoreError> {
        self.conn
            .execute(
                r#"INSERT INTO "transaction" (txid, first_seen, last_removed, fee, weight)
                   VALUES (?1, ?2, ?3, ?4, ?5)"#,
                params![
                    tx.txid,
                    tx.first_seen.timestamp_millis(),
                    tx.last_removed.map(|t| t.timestamp_millis()),
                    to_sql_int(tx.fee)?,
                    to_sql_int(tx.weight)?,
                ],
            )
            .map_err(|e| map_insert_error(e, tx.txid))?;
        Ok(self.conn.last_insert_rowid())
    }

    /// Insert a block and link every already-known transaction it contains
    ///
    /// Returns the number of stored transactions linked to the block.
    pub fn add_block(&mut self, block: &Block) -> Result<usize, StoreError> {
        let db_tx = self.conn.transaction()?;
        db_tx
            .execute(
                r#"INSERT INTO "block" (hash, parent, first_seen, height, is_best)
                   VALUES (?1, ?2, ?3, ?4, ?5)"#,
                params![
                    block.hash,
                    block.parent,
                    block.first_seen.timestamp_millis(),
                    block.height,
                    block.is_best,
                ],
            )
            .map_err(|e| map_insert_error(e, block.hash))?;
        let block_id = db_tx.last_insert_rowid();

        let mut linked = 0;
        {
            let mut lookup =
                db_tx.prepare_cached(r#"SELECT id FROM "transaction" WHERE txid = ?1"#)?;
            let mut link = db_tx.prepare_cached(
                "INSERT INTO transaction_block (transaction_id, block_id, block_index)
                 VALUES (?1, ?2, ?3)",
            )?;
            for (index, txid) in block.txids.iter().enumerate() {
                let transaction_id: Option<i64> =
                    lookup.query_row(params![txid], |row| row.get(0)).optional()?;
                if let Some(transaction_id) = transaction_id {
                    link.execute(params![transaction_id, block_id, index as i64])?;
                    linked += 1;
                }
            }
        }
        db_tx.commit()?;

        debug!(hash = %block.hash, height = block.height, linked, "Stored block");
        Ok(linked)
    }

    /// Number of stored transactions.
    ///
    /// Full-table aggregate; keep it off hot paths.
    pub fn tx_count(&self) -> Result<u64, StoreError> {
        let count: i64 = self
            .conn
            .query_row(r#"SELECT COUNT(txid) FROM "transaction""#, [], |row| row.get(0))?;
        Ok(u64::try_from(count).unwrap_or_default())
    }

    /// Transactions matching `query`, with confirmation data from the best chain
    pub fn query_transactions(&self, query: &Query) -> Result<Vec<StoredTransaction>, StoreError> {
        let sql = query.format(TRANSACTION_FIELDS, "transaction");
        let mut stmt = self.conn.prepare(&sql)?;
        let rows = stmt.query_map([], stored_transaction_from_row)?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }

    /// Blocks matching `query`
    pub fn query_blocks(&self, query: &Query) -> Result<Vec<StoredBlock>, StoreError> {
        let sql = query.format(BLOCK_FIELDS, "block");
        let mut stmt = self.conn.prepare(&sql)?;
        let rows = stmt.query_map([], stored_block_from_row)?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }

    /// Look up a single transaction by txid
    pub fn transaction(&self, txid: &Hash32) -> Result<Option<StoredTransaction>, StoreError> {
        let sql = Query::all().filter("txid = ?1").format(TRANSACTION_FIELDS, "transaction");
        let found = self
            .conn
            .query_row(&sql, params![txid], stored_transaction_from_row)
            .optional()?;
        Ok(found)
    }

    /// Release the underlying connection
    pub fn close(self) -> Result<(), StoreError> {
        self.conn.close().map_err(|(_, e)| StoreError::Storage(e))
    }
}

impl ToSql for Hash32 {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        Ok(ToSqlOutput::from(self.as_bytes().as_slice()))
    }
}

impl FromSql for Hash32 {
    fn column_result(value: ValueRef<'_>) -> FromSqlResult<Self> {
        let bytes = value.as_blob()?;
        Hash32::from_slice(bytes).ok_or(FromSqlError::InvalidBlobSize {
            expected_size: 32,
            blob_size: bytes.len(),
        })
    }
}

fn map_insert_error(err: rusqlite::Error, key: Hash32) -> StoreError {
    match &err {
        rusqlite::Error::SqliteFailure(e, _)
            if e.extended_code == rusqlite::ffi::SQLITE_CONSTRAINT_UNIQUE
                || e.extended_code == rusqlite::ffi::SQLITE_CONSTRAINT_PRIMARYKEY =>
        {
            StoreError::DuplicateKey(key)
        }
        _ => StoreError::Storage(err),
    }
}

fn to_sql_int(value: u64) -> Result<i64, StoreError> {
    i64::try_from(value)
        .map_err(|e| StoreError::Storage(rusqlite::Error::ToSqlConversionFailure(Box::new(e))))
}

fn u64_column(row: &Row<'_>, idx: usize) -> rusqlite::Result<u64> {
    let value: i64 = row.get(idx)?;
    u64::try_from(value).map_err(|_| rusqlite::Error::IntegralValueOutOfRange(idx, value))
}

fn timestamp_column(row: &Row<'_>, idx: usize) -> rusqlite::Result<Option<DateTime<Utc>>> {
    let Some(millis) = row.get::<_, Option<i64>>(idx)? else {
        return Ok(None);
    };
    DateTime::from_timestamp_millis(millis)
        .map(Some)
        .ok_or(rusqlite::Error::IntegralValueOutOfRange(idx, millis))
}

fn required_timestamp(row: &Row<'_>, idx: usize) -> rusqlite::Result<DateTime<Utc>> {
    timestamp_column(row, idx)?.ok_or(rusqlite::Error::InvalidColumnType(
        idx,
        "first_seen".to_string(),
        rusqlite::types::Type::Null,
    ))
}

fn stored_transaction_from_row(row: &Row<'_>) -> rusqlite::Result<StoredTransaction> {
    Ok(StoredTransaction {
        db_id: row.get(0)?,
        transaction: Transaction {
            txid: row.get(1)?,
            first_seen: required_timestamp(row, 2)?,
            last_removed: timestamp_column(row, 3)?,
            fee: u64_column(row, 4)?,
            weight: u64_column(row, 5)?,
            block_height: row.get(6)?,
            index_in_block: row.get(7)?,
        },
    })
}

fn stored_block_from_row(row: &Row<'_>) -> rusqlite::Result<StoredBlock> {
    Ok(StoredBlock {
        db_id: row.get(0)?,
        hash: row.get(1)?,
        parent: row.get(2)?,
        first_seen: required_timestamp(row, 3)?,
        height: row.get(4)?,
        is_best: row.get(5)?,
    })
}
