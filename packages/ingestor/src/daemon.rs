//! Ingestion Daemon
//!
//! Owns one [`Subscriber`] and one [`Store`]. The event loop is the only place
//! the store is written while the pipeline runs, so the store needs no locking.

use thiserror::Error;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::{ConfigError, IngestorConfig};
use crate::store::{Store, StoreError};
use crate::subscriber::{FeedSocket, Subscriber, SubscriberError, SubscriberQueues, ZmqFeed};
use crate::types::{Block, Transaction};

/// Errors that can occur while running the daemon
#[derive(Error, Debug)]
pub enum DaemonError {
    #[error("Invalid configuration: {0}")]
    Config(#[from] ConfigError),

    #[error("Subscriber error: {0}")]
    Subscriber(#[from] SubscriberError),

    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Subscriber task failed: {0}")]
    Task(String),

    #[error("Daemon has already been run")]
    AlreadyRun,

    #[error("Failed to close store: {0}")]
    Close(StoreError),
}

/// Lifecycle of a [`Daemon`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DaemonState {
    Starting,
    Running,
    Stopping,
    Stopped,
}

/// Composition root of the ingestion pipeline
#[derive(Debug)]
pub struct Daemon<S: FeedSocket = ZmqFeed> {
    subscriber: Option<Subscriber<S>>,
    queues: SubscriberQueues,
    store: Store,
    stop: CancellationToken,
    state: DaemonState,
    stats_interval: u64,
    events: u64,
}

impl Daemon<ZmqFeed> {
    /// Open the store and connect the subscriber described by `config`
    pub async fn connect(config: &IngestorConfig) -> Result<Self, DaemonError> {
        config.validate()?;

        let db_path = config.expanded_db_path();
        let store = Store::open(&db_path)?;
        info!(path = %db_path.display(), "Store opened");

        let (subscriber, queues) = match Subscriber::connect(
            &config.endpoint(),
            config.connect_timeout(),
            config.recv_timeout(),
            config.queue_capacity,
        )
        .await
        {
            Ok(parts) => parts,
            Err(e) => {
                if let Err(close_err) = store.close() {
                    warn!("Failed to close store after connection error: {}", close_err);
                }
                return Err(e.into());
            }
        };

        Ok(Self::new(subscriber, queues, store).with_stats_interval(config.stats_interval))
    }
}

impl<S: FeedSocket> Daemon<S> {
    /// Assemble a daemon from an already connected subscriber and an open store
    pub fn new(subscriber: Subscriber<S>, queues: SubscriberQueues, store: Store) -> Self {
        Self {
            subscriber: Some(subscriber),
            queues,
            store,
            stop: CancellationToken::new(),
            state: DaemonState::Starting,
            stats_interval: crate::config::STATS_INTERVAL,
            events: 0,
        }
    }

    /// Log the stored transaction count every `interval` events
    pub fn with_stats_interval(mut self, interval: u64) -> Self {
        self.stats_interval = interval.max(1);
        self
    }

    /// Token that ends [`Daemon::run`] when cancelled. Safe to hand to other tasks.
    pub fn stop_token(&self) -> CancellationToken {
        self.stop.clone()
    }

    /// Request the event loop to end after its current iteration
    pub fn stop(&self) {
        self.stop.cancel();
    }

    /// Current lifecycle state
    pub fn state(&self) -> DaemonState {
        self.state
    }

    /// Read access to the store, e.g. for counts after a run
    pub fn store(&self) -> &Store {
        &self.store
    }

    /// Run the pipeline until stopped or until a component fails.
    ///
    /// A store failure takes precedence over the subscriber's own result, since it
    /// is what ended the loop. Can only be called once.
    pub async fn run(&mut self) -> Result<(), DaemonError> {
        let subscriber = self.subscriber.take().ok_or(DaemonError::AlreadyRun)?;
        let feed_stop = subscriber.stop_token();
        let mut feed: JoinHandle<Result<(), SubscriberError>> = tokio::spawn(subscriber.run());
        let mut feed_result = None;

        self.state = DaemonState::Running;
        info!("Daemon running");

        let stop = self.stop.clone();
        let loop_result: Result<(), DaemonError> = loop {
            tokio::select! {
                _ = stop.cancelled() => {
                    info!("Stop requested");
                    break Ok(());
                }
                joined = &mut feed => {
                    feed_result = Some(joined);
                    break Ok(());
                }
                Some(tx) = self.queues.transactions.recv() => {
                    if let Err(e) = self.process_transaction(&tx) {
                        error!(txid = %tx.txid, "Failed to store transaction: {}", e);
                        break Err(e.into());
                    }
                }
                Some(block) = self.queues.blocks.recv() => {
                    self.process_block(&block);
                }
            }
        };

        self.state = DaemonState::Stopping;
        feed_stop.cancel();
        let feed_result = match feed_result {
            Some(joined) => joined,
            None => feed.await,
        };
        self.state = DaemonState::Stopped;

        let feed_result = feed_result
            .map_err(|e| DaemonError::Task(e.to_string()))
            .and_then(|r| r.map_err(DaemonError::from));

        match (loop_result, feed_result) {
            (Err(e), _) => Err(e),
            (Ok(()), Err(e)) => Err(e),
            (Ok(()), Ok(())) => {
                info!("Daemon stopped");
                Ok(())
            }
        }
    }

    /// Release the store. Reports its own failure without touching any run error.
    pub fn close(self) -> Result<(), DaemonError> {
        self.store.close().map_err(DaemonError::Close)?;
        info!("Store closed");
        Ok(())
    }

    fn process_transaction(&mut self, tx: &Transaction) -> Result<(), StoreError> {
        let id = self.store.add_transaction(tx)?;
        debug!(txid = %tx.txid, fee = tx.fee, weight = tx.weight, id, "Stored transaction");
        self.record_event();
        Ok(())
    }

    // Confirmation tracking and reorg reconciliation are not implemented; blocks are only logged.
    fn process_block(&mut self, block: &Block) {
        info!(
            hash = %block.hash,
            height = block.height,
            txs = block.txids.len(),
            "Block received"
        );
        self.record_event();
    }

    fn record_event(&mut self) {
        self.events += 1;
        if self.events % self.stats_interval == 0 {
            self.dump_stats();
        }
    }

    fn dump_stats(&self) {
        match self.store.tx_count() {
            Ok(count) => info!(events = self.events, tx_count = count, "Ingestion progress"),
            Err(e) => warn!("Could not count transactions: {}", e),
        }
    }
}
