//! ZMQ Feed Subscriber
//!
//! Subscribes to the node's `rawtxwithfee` and `rawblock` topics, decodes every
//! message on its own task and hands the records to two bounded queues.
//!
//! The receive loop never blocks indefinitely: each receive is bounded by a
//! timeout, and the stop token is checked between receives. The socket is only
//! ever touched by the loop itself and is closed exactly once when it exits.
//!
//! Decode failures are reported through a single-slot error channel. The first
//! error wins and ends the loop at its next iteration; later concurrent failures
//! are logged and dropped so that no decode task can block on reporting.

use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use zeromq::{Socket, SocketRecv, SubSocket};

use crate::codec::{decode_block, decode_transaction, CodecError};
use crate::types::{Block, Transaction};

/// Topic carrying raw transactions with an 8-byte fee trailer
pub const TOPIC_RAW_TX_WITH_FEE: &str = "rawtxwithfee";

/// Topic carrying raw blocks
pub const TOPIC_RAW_BLOCK: &str = "rawblock";

/// Every topic the subscriber registers for
pub const TOPICS: [&str; 2] = [TOPIC_RAW_TX_WITH_FEE, TOPIC_RAW_BLOCK];

/// Errors that can occur while subscribing to the feed
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SubscriberError {
    #[error("Connection failed: {0}")]
    Connection(String),

    #[error(transparent)]
    Malformed(#[from] CodecError),

    #[error("Unknown topic: {0}")]
    UnknownTopic(String),

    #[error("Could not deliver {0}: queue closed")]
    Delivery(&'static str),

    #[error("Could not receive message: {0}")]
    Receive(String),
}

/// The receiving end of a pub/sub socket.
///
/// `recv_frames` must be cancel-safe: the subscriber drops it when the receive
/// timeout elapses.
#[async_trait]
pub trait FeedSocket: Send + 'static {
    /// Wait for the next multipart message, topic frame first
    async fn recv_frames(&mut self) -> Result<Vec<Bytes>, SubscriberError>;

    /// Release the socket
    async fn close(&mut self) -> Result<(), SubscriberError>;
}

/// ZMQ SUB socket connected to a node's publisher
pub struct ZmqFeed {
    socket: Option<SubSocket>,
    endpoint: String,
}

impl std::fmt::Debug for ZmqFeed {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ZmqFeed")
            .field("endpoint", &self.endpoint)
            .field("open", &self.socket.is_some())
            .finish()
    }
}

impl ZmqFeed {
    /// Subscribe to [`TOPICS`] and connect to `endpoint` (`tcp://host:port`)
    ///
    /// The socket retries a refused connection on its own, so the attempt is
    /// abandoned with [`SubscriberError::Connection`] once `connect_timeout` elapses.
    pub async fn connect(
        endpoint: &str,
        connect_timeout: Duration,
    ) -> Result<Self, SubscriberError> {
        let mut socket = SubSocket::new();
        for topic in TOPICS {
            socket.subscribe(topic).await.map_err(|e| {
                SubscriberError::Connection(format!("could not subscribe to '{topic}': {e}"))
            })?;
        }

        match timeout(connect_timeout, socket.connect(endpoint)).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                return Err(SubscriberError::Connection(format!(
                    "could not connect ZMQ subscriber to '{endpoint}': {e}"
                )))
            }
            Err(_) => {
                warn!("Timed out connecting to {} after {:?}", endpoint, connect_timeout);
                return Err(SubscriberError::Connection(format!(
                    "connection to '{endpoint}' timed out after {}ms",
                    connect_timeout.as_millis()
                )));
            }
        }

        info!("ZMQ subscriber successfully connected to {}", endpoint);

        Ok(Self {
            socket: Some(socket),
            endpoint: endpoint.to_string(),
        })
    }
}

#[async_trait]
impl FeedSocket for ZmqFeed {
    async fn recv_frames(&mut self) -> Result<Vec<Bytes>, SubscriberError> {
        let socket = self
            .socket
            .as_mut()
            .ok_or_else(|| SubscriberError::Receive("socket is closed".to_string()))?;
        let message = socket
            .recv()
            .await
            .map_err(|e| SubscriberError::Receive(e.to_string()))?;
        Ok(message.into_vec())
    }

    async fn close(&mut self) -> Result<(), SubscriberError> {
        let Some(socket) = self.socket.take() else {
            return Ok(());
        };
        let errors = socket.close().await;
        if errors.is_empty() {
            Ok(())
        } else {
            let joined = errors.iter().map(|e| e.to_string()).collect::<Vec<_>>().join("; ");
            Err(SubscriberError::Connection(format!("close failed: {joined}")))
        }
    }
}

/// Receiving ends of the decoded-record queues
#[derive(Debug)]
pub struct SubscriberQueues {
    pub transactions: mpsc::Receiver<Transaction>,
    pub blocks: mpsc::Receiver<Block>,
}

/// Feed subscriber driving a [`FeedSocket`]
#[derive(Debug)]
pub struct Subscriber<S: FeedSocket> {
    socket: S,
    tx_sender: mpsc::Sender<Transaction>,
    block_sender: mpsc::Sender<Block>,
    stop: CancellationToken,
    recv_timeout: Duration,
}

impl Subscriber<ZmqFeed> {
    /// Connect a [`ZmqFeed`] to `endpoint` and wrap it
    pub async fn connect(
        endpoint: &str,
        connect_timeout: Duration,
        recv_timeout: Duration,
        queue_capacity: usize,
    ) -> Result<(Self, SubscriberQueues), SubscriberError> {
        let socket = ZmqFeed::connect(endpoint, connect_timeout).await?;
        Ok(Self::new(socket, recv_timeout, queue_capacity))
    }
}

impl<S: FeedSocket> Subscriber<S> {
    /// Wrap an already connected socket
    ///
    /// # Arguments
    /// * `recv_timeout` - Bounded wait of each receive, the worst-case stop latency
    /// * `queue_capacity` - Capacity of each output queue (at least 1)
    pub fn new(
        socket: S,
        recv_timeout: Duration,
        queue_capacity: usize,
    ) -> (Self, SubscriberQueues) {
        let (tx_sender, transactions) = mpsc::channel(queue_capacity.max(1));
        let (block_sender, blocks) = mpsc::channel(queue_capacity.max(1));
        let subscriber = Self {
            socket,
            tx_sender,
            block_sender,
            stop: CancellationToken::new(),
            recv_timeout,
        };
        (subscriber, SubscriberQueues { transactions, blocks })
    }

    /// Token that stops the receive loop when cancelled
    pub fn stop_token(&self) -> CancellationToken {
        self.stop.clone()
    }

    /// Request the receive loop to end. Takes effect within one receive timeout.
    pub fn stop(&self) {
        self.stop.cancel();
    }

    /// Run the receive loop until stopped or until a message fails.
    ///
    /// Returns `Ok(())` on a clean stop, or the first error otherwise. The socket
    /// is closed on every exit path.
    pub async fn run(mut self) -> Result<(), SubscriberError> {
        let result = self.receive_loop().await;

        if let Err(e) = self.socket.close().await {
            warn!("ZMQ subscriber socket closed with error (ignored): {}", e);
        }

        match &result {
            Ok(()) => info!("ZMQ subscriber stopped"),
            Err(e) => error!("ZMQ subscriber failed: {}", e),
        }
        result
    }

    async fn receive_loop(&mut self) -> Result<(), SubscriberError> {
        let (error_slot, mut pending_error) = mpsc::channel::<SubscriberError>(1);

        while !self.stop.is_cancelled() {
            if let Ok(err) = pending_error.try_recv() {
                return Err(err);
            }

            let frames = match timeout(self.recv_timeout, self.socket.recv_frames()).await {
                Err(_) => {
                    debug!("No ZMQ message received in the last {:?}", self.recv_timeout);
                    continue;
                }
                Ok(frames) => frames?,
            };
            let captured_at = Utc::now();

            let Some((topic, payload)) = frames.split_first() else {
                return Err(CodecError::MalformedPayload("empty message".to_string()).into());
            };
            let topic = String::from_utf8_lossy(topic).into_owned();
            let payload = payload.to_vec();
            debug!("ZMQ subscriber received topic {}", topic);

            let tx_sender = self.tx_sender.clone();
            let block_sender = self.block_sender.clone();
            let error_slot = error_slot.clone();
            // Decoded on a separate task so the receive loop never waits on a slow consumer
            tokio::spawn(async move {
                if let Err(err) =
                    process_message(&topic, &payload, captured_at, &tx_sender, &block_sender).await
                {
                    let _ = report_error(&error_slot, err);
                }
            });
        }

        Ok(())
    }
}

/// Put `err` in the single error slot. The first error wins.
///
/// A full slot means another failure is already pending; a closed slot means
/// the loop has already exited, which is routine after a stop.
fn report_error(
    slot: &mpsc::Sender<SubscriberError>,
    err: SubscriberError,
) -> Result<(), TrySendError<SubscriberError>> {
    let result = slot.try_send(err);
    match &result {
        Ok(()) => {}
        Err(TrySendError::Full(dropped)) => {
            warn!("Dropping additional subscriber error: {}", dropped);
        }
        Err(TrySendError::Closed(dropped)) => {
            debug!("Subscriber already stopped, discarding: {}", dropped);
        }
    }
    result
}

/// Decode one message by topic and deliver the record to its queue
pub async fn process_message(
    topic: &str,
    payload: &[Bytes],
    captured_at: DateTime<Utc>,
    tx_sender: &mpsc::Sender<Transaction>,
    block_sender: &mpsc::Sender<Block>,
) -> Result<(), SubscriberError> {
    match topic {
        TOPIC_RAW_TX_WITH_FEE => {
            let tx = decode_transaction(captured_at, payload)?;
            tx_sender
                .send(tx)
                .await
                .map_err(|_| SubscriberError::Delivery("transaction"))
        }
        TOPIC_RAW_BLOCK => {
            let block = decode_block(captured_at, payload)?;
            block_sender
                .send(block)
                .await
                .map_err(|_| SubscriberError::Delivery("block"))
        }
        other => Err(SubscriberError::UnknownTopic(other.to_string())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::time::Instant;

    use bitcoin::absolute::LockTime;
    use bitcoin::consensus::encode::serialize;
    use bitcoin::hashes::Hash;
    use bitcoin::transaction::Version;
    use bitcoin::{Amount, OutPoint, ScriptBuf, Sequence, TxIn, TxOut, Txid, Witness};

    const WAIT: Duration = Duration::from_millis(50);

    /// Socket replaying scripted messages, then idling forever
    struct ScriptedSocket {
        messages: VecDeque<Vec<Bytes>>,
        closes: Arc<AtomicUsize>,
    }

    impl ScriptedSocket {
        fn new(messages: Vec<Vec<Bytes>>) -> (Self, Arc<AtomicUsize>) {
            let closes = Arc::new(AtomicUsize::new(0));
            let socket = Self {
                messages: messages.into(),
                closes: closes.clone(),
            };
            (socket, closes)
        }
    }

    #[async_trait]
    impl FeedSocket for ScriptedSocket {
        async fn recv_frames(&mut self) -> Result<Vec<Bytes>, SubscriberError> {
            match self.messages.pop_front() {
                Some(frames) => Ok(frames),
                None => std::future::pending().await,
            }
        }

        async fn close(&mut self) -> Result<(), SubscriberError> {
            self.closes.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    fn raw_tx_message(seed: u8, fee: u64) -> Vec<Bytes> {
        let tx = bitcoin::Transaction {
            version: Version::TWO,
            lock_time: LockTime::ZERO,
            input: vec![TxIn {
                previous_output: OutPoint {
                    txid: Txid::from_byte_array([seed; 32]),
                    vout: 1,
                },
                script_sig: ScriptBuf::new(),
                sequence: Sequence::MAX,
                witness: Witness::new(),
            }],
            output: vec![TxOut {
                value: Amount::from_sat(1_000),
                script_pubkey: ScriptBuf::new(),
            }],
        };
        let mut blob = serialize(&tx);
        blob.extend_from_slice(&fee.to_le_bytes());
        vec![
            Bytes::from_static(TOPIC_RAW_TX_WITH_FEE.as_bytes()),
            Bytes::from(blob),
            Bytes::from_static(&[0, 0, 0, 0]),
        ]
    }

    #[tokio::test]
    async fn test_delivers_decoded_transactions() {
        let messages = vec![raw_tx_message(1, 500), raw_tx_message(2, 700)];
        let (socket, closes) = ScriptedSocket::new(messages);
        let (subscriber, mut queues) = Subscriber::new(socket, WAIT, 1);
        let stop = subscriber.stop_token();
        let handle = tokio::spawn(subscriber.run());

        let mut fees = vec![
            queues.transactions.recv().await.unwrap().fee,
            queues.transactions.recv().await.unwrap().fee,
        ];
        fees.sort_unstable();
        assert_eq!(fees, vec![500, 700]);

        stop.cancel();
        assert_eq!(handle.await.unwrap(), Ok(()));
        assert_eq!(closes.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_stop_while_idle_returns_within_wait() {
        let (socket, closes) = ScriptedSocket::new(vec![]);
        let (subscriber, _queues) = Subscriber::new(socket, WAIT, 1);
        let stop = subscriber.stop_token();
        let handle = tokio::spawn(subscriber.run());

        tokio::time::sleep(Duration::from_millis(20)).await;
        let stopped_at = Instant::now();
        stop.cancel();

        let result = handle.await.unwrap();
        assert_eq!(result, Ok(()));
        assert!(stopped_at.elapsed() < WAIT * 4, "stop took {:?}", stopped_at.elapsed());
        assert_eq!(closes.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_stop_before_run_closes_socket() {
        let (socket, closes) = ScriptedSocket::new(vec![raw_tx_message(5, 1)]);
        let (subscriber, _queues) = Subscriber::new(socket, WAIT, 1);

        subscriber.stop();

        assert_eq!(subscriber.run().await, Ok(()));
        assert_eq!(closes.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_malformed_transaction_ends_loop() {
        let bad = vec![
            Bytes::from_static(TOPIC_RAW_TX_WITH_FEE.as_bytes()),
            Bytes::from_static(&[1, 2, 3]),
        ];
        let (socket, closes) = ScriptedSocket::new(vec![bad]);
        let (subscriber, _queues) = Subscriber::new(socket, WAIT, 1);

        let result = subscriber.run().await;

        assert!(matches!(result, Err(SubscriberError::Malformed(CodecError::MalformedPayload(_)))));
        assert_eq!(closes.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_malformed_block_ends_loop() {
        let bad = vec![
            Bytes::from_static(TOPIC_RAW_BLOCK.as_bytes()),
            Bytes::from_static(&[0xff; 12]),
            Bytes::from_static(&[0, 0, 0, 0]),
        ];
        let (socket, closes) = ScriptedSocket::new(vec![bad]);
        let (subscriber, _queues) = Subscriber::new(socket, WAIT, 1);

        assert!(matches!(subscriber.run().await, Err(SubscriberError::Malformed(_))));
        assert_eq!(closes.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_unknown_topic_ends_loop() {
        let odd = vec![Bytes::from_static(b"hashtx"), Bytes::from_static(&[0; 32])];
        let (socket, closes) = ScriptedSocket::new(vec![odd]);
        let (subscriber, _queues) = Subscriber::new(socket, WAIT, 1);

        assert_eq!(
            subscriber.run().await,
            Err(SubscriberError::UnknownTopic("hashtx".to_string()))
        );
        assert_eq!(closes.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_concurrent_failures_report_one_error() {
        let bad = |n: u8| {
            vec![
                Bytes::from_static(TOPIC_RAW_TX_WITH_FEE.as_bytes()),
                Bytes::from(vec![n; 4]),
            ]
        };
        let (socket, closes) = ScriptedSocket::new((0..5).map(bad).collect());
        let (subscriber, _queues) = Subscriber::new(socket, WAIT, 1);

        let result = tokio::time::timeout(Duration::from_secs(5), subscriber.run())
            .await
            .expect("subscriber did not stop");

        assert!(matches!(result, Err(SubscriberError::Malformed(_))));
        assert_eq!(closes.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_closed_queue_is_a_delivery_error() {
        let (socket, _closes) = ScriptedSocket::new(vec![raw_tx_message(3, 1)]);
        let (subscriber, queues) = Subscriber::new(socket, WAIT, 1);
        drop(queues);

        assert_eq!(subscriber.run().await, Err(SubscriberError::Delivery("transaction")));
    }

    #[tokio::test]
    async fn test_empty_message_is_malformed() {
        let (socket, closes) = ScriptedSocket::new(vec![vec![]]);
        let (subscriber, _queues) = Subscriber::new(socket, WAIT, 1);

        assert!(matches!(subscriber.run().await, Err(SubscriberError::Malformed(_))));
        assert_eq!(closes.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_process_message_routes_by_topic() {
        let (tx_sender, mut tx_rx) = mpsc::channel(1);
        let (block_sender, _block_rx) = mpsc::channel(1);
        let message = raw_tx_message(4, 42);

        process_message(
            TOPIC_RAW_TX_WITH_FEE,
            &message[1..],
            Utc::now(),
            &tx_sender,
            &block_sender,
        )
        .await
        .unwrap();

        assert_eq!(tx_rx.recv().await.unwrap().fee, 42);
    }

    #[test]
    fn test_report_error_first_error_wins() {
        let (slot, mut pending) = mpsc::channel(1);

        assert!(report_error(&slot, SubscriberError::UnknownTopic("a".into())).is_ok());
        let second = report_error(&slot, SubscriberError::UnknownTopic("b".into()));

        assert!(matches!(second, Err(TrySendError::Full(_))));
        assert_eq!(
            pending.try_recv().unwrap(),
            SubscriberError::UnknownTopic("a".into())
        );
    }

    #[test]
    fn test_report_error_after_loop_exit_is_closed() {
        let (slot, pending) = mpsc::channel(1);
        drop(pending);

        let result = report_error(&slot, SubscriberError::Delivery("transaction"));

        assert!(matches!(
            result,
            Err(TrySendError::Closed(SubscriberError::Delivery("transaction")))
        ));
    }

    #[tokio::test]
    async fn test_late_delivery_failure_after_stop() {
        let messages = vec![raw_tx_message(6, 1), raw_tx_message(7, 2)];
        let (socket, closes) = ScriptedSocket::new(messages);
        let (subscriber, queues) = Subscriber::new(socket, WAIT, 1);
        let stop = subscriber.stop_token();
        let handle = tokio::spawn(subscriber.run());

        tokio::time::sleep(WAIT).await;
        stop.cancel();
        assert_eq!(handle.await.unwrap(), Ok(()));

        // Decode tasks still waiting on the full queue now fail into a closed slot
        drop(queues);
        tokio::time::sleep(WAIT).await;
        assert_eq!(closes.load(Ordering::SeqCst), 1);
    }
}
