//! Wire Payload Codec
//!
//! Decodes the binary payloads published on the node's `rawtxwithfee` and
//! `rawblock` topics into [`Transaction`] and [`Block`] records.
//! Pure functions: no I/O, no state.

use bitcoin::consensus::encode::deserialize;
use bitcoin::script::Instruction;
use bitcoin::Script;
use chrono::{DateTime, Utc};
use thiserror::Error;

use crate::types::{Block, Hash32, Transaction};

/// Payload frames expected after the topic frame on both topics
pub const PAYLOAD_FRAME_COUNT: usize = 2;

/// Width of the little-endian fee trailer appended to `rawtxwithfee` payloads
pub const FEE_TRAILER_LEN: usize = 8;

/// Data pushes expected in a coinbase unlocking script: the height and the extra nonce
pub const COINBASE_PUSH_COUNT: usize = 2;

/// Maximum width of the height push
pub const MAX_HEIGHT_PUSH_LEN: usize = 4;

/// Errors that can occur during payload decoding
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CodecError {
    #[error("Malformed payload: {0}")]
    MalformedPayload(String),
}

impl CodecError {
    fn malformed(reason: impl Into<String>) -> Self {
        CodecError::MalformedPayload(reason.into())
    }
}

/// Decode a `rawtxwithfee` payload
///
/// # Arguments
/// * `captured_at` - Time the message was received
/// * `payload` - The frames following the topic frame: the raw transaction with an
///   8-byte little-endian fee appended, and a sequence number (ignored)
pub fn decode_transaction<B: AsRef<[u8]>>(
    captured_at: DateTime<Utc>,
    payload: &[B],
) -> Result<Transaction, CodecError> {
    if payload.len() != PAYLOAD_FRAME_COUNT {
        return Err(CodecError::malformed(format!(
            "expected {} transaction frames (rawtxwithfee, sequence), got {}",
            PAYLOAD_FRAME_COUNT,
            payload.len()
        )));
    }

    let blob = payload[0].as_ref();
    let (raw_tx, fee_bytes) = split_fee_trailer(blob)?;

    let tx: bitcoin::Transaction = deserialize(raw_tx)
        .map_err(|e| CodecError::malformed(format!("could not deserialize raw transaction: {e}")))?;

    let fee = u64::from_le_bytes(fee_bytes);
    let weight = transaction_weight(&tx);

    Ok(Transaction::new(tx.compute_txid().into(), captured_at, fee, weight))
}

/// Decode a `rawblock` payload
///
/// The block height is taken from the coinbase unlocking script; a block
/// without a decodable coinbase height is rejected.
///
/// # Arguments
/// * `captured_at` - Time the message was received
/// * `payload` - The frames following the topic frame: the raw block and a counter (ignored)
pub fn decode_block<B: AsRef<[u8]>>(
    captured_at: DateTime<Utc>,
    payload: &[B],
) -> Result<Block, CodecError> {
    if payload.len() != PAYLOAD_FRAME_COUNT {
        return Err(CodecError::malformed(format!(
            "expected {} block frames (rawblock, counter), got {}",
            PAYLOAD_FRAME_COUNT,
            payload.len()
        )));
    }

    let block: bitcoin::Block = deserialize(payload[0].as_ref())
        .map_err(|e| CodecError::malformed(format!("could not deserialize raw block: {e}")))?;

    let mut height = None;
    let mut txids = Vec::with_capacity(block.txdata.len());
    for (index, tx) in block.txdata.iter().enumerate() {
        if index == 0 && tx.is_coinbase() {
            let parsed = coinbase_height(&tx.input[0].script_sig)
                .map_err(|e| CodecError::malformed(format!("error parsing coinbase: {e}")))?;
            height = Some(parsed);
        }
        txids.push(Hash32::from(tx.compute_txid()));
    }

    let height = height.ok_or_else(|| CodecError::malformed("height not found"))?;

    let encoded_time = DateTime::from_timestamp(i64::from(block.header.time), 0)
        .ok_or_else(|| {
            CodecError::malformed(format!("invalid header time {}", block.header.time))
        })?;

    Ok(Block {
        hash: block.block_hash().into(),
        parent: block.header.prev_blockhash.into(),
        first_seen: captured_at,
        encoded_time,
        height,
        // The feed only publishes the tip; competing chains are never observed.
        is_best: true,
        txids,
    })
}

/// Extract the block height from a coinbase unlocking script
///
/// Exactly [`COINBASE_PUSH_COUNT`] data pushes are expected; the first holds the
/// height as up to 4 little-endian bytes. Non-push opcodes are skipped.
pub fn coinbase_height(script_sig: &Script) -> Result<u32, CodecError> {
    let mut pushes = Vec::with_capacity(COINBASE_PUSH_COUNT);
    for instruction in script_sig.instructions() {
        let instruction = instruction
            .map_err(|e| CodecError::malformed(format!("unparseable script: {e}")))?;
        if let Instruction::PushBytes(data) = instruction {
            pushes.push(data.as_bytes());
        }
    }

    if pushes.len() != COINBASE_PUSH_COUNT {
        return Err(CodecError::malformed(format!("unexpected push count {}", pushes.len())));
    }

    let height_le = pushes[0];
    if height_le.len() > MAX_HEIGHT_PUSH_LEN {
        return Err(CodecError::malformed(format!(
            "height push of {} bytes exceeds {}",
            height_le.len(),
            MAX_HEIGHT_PUSH_LEN
        )));
    }

    let mut padded = [0u8; MAX_HEIGHT_PUSH_LEN];
    padded[..height_le.len()].copy_from_slice(height_le);
    Ok(u32::from_le_bytes(padded))
}

/// BIP141 weight: 3 × stripped size + full size
pub fn transaction_weight(tx: &bitcoin::Transaction) -> u64 {
    (tx.base_size() * 3 + tx.total_size()) as u64
}

fn split_fee_trailer(blob: &[u8]) -> Result<(&[u8], [u8; FEE_TRAILER_LEN]), CodecError> {
    if blob.len() <= FEE_TRAILER_LEN {
        return Err(CodecError::malformed(format!(
            "unexpected rawtxwithfee length {}",
            blob.len()
        )));
    }
    let (raw_tx, trailer) = blob.split_at(blob.len() - FEE_TRAILER_LEN);
    let mut fee_bytes = [0u8; FEE_TRAILER_LEN];
    fee_bytes.copy_from_slice(trailer);
    Ok((raw_tx, fee_bytes))
}
