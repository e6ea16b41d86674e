//! Signature extraction
//!
//! A producer thread walks the block store in height order, parses the
//! leading scriptSig push of every non-coinbase input as a DER ECDSA
//! signature, and streams one [`SigRecord`] per signature over a bounded
//! channel. Records arrive strictly ordered by (height, tx, txin).
//!
//! Per-input parse failures are expected (non-standard scripts, loose
//! pre-BIP66 encodings) and go to the error diary; a block that cannot
//! be fetched or decoded aborts the walk.

use crate::block::reader::BlockReader;
use crate::block::script::pop_push;
use crate::errlog::ErrorLog;
use crate::storage::tx_index::TxIndex;
use anyhow::{Context, Result};
use bitcoin::secp256k1::ecdsa::Signature;
use bitcoin::Block;
use crossbeam_channel::Sender;
use num_bigint::BigUint;
use std::ops::Range;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

/// Bound on the in-flight record queue between producer and consumer.
pub const CHANNEL_BOUND: usize = 256;

/// One extracted signature, reduced to what the detector needs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SigRecord {
    /// Fixed-width big-endian encoding of the signature's r value.
    pub r: [u8; 32],
    pub height: u32,
    pub tx_index: u32,
    pub txin_index: u32,
}

impl SigRecord {
    /// Decimal string form of r, the duplicate-map key.
    pub fn r_decimal(&self) -> String {
        BigUint::from_bytes_be(&self.r).to_string()
    }
}

/// Extract every signature record from one block.
pub fn block_signatures(block: &Block, height: u32, errlog: &ErrorLog) -> Vec<SigRecord> {
    let block_sha = block.block_hash();
    let mut records = Vec::new();

    for (tx_index, tx) in block.txdata.iter().enumerate() {
        if tx.is_coinbase() {
            continue;
        }

        for (txin_index, txin) in tx.input.iter().enumerate() {
            let payload = match pop_push(txin.script_sig.as_bytes()) {
                Ok((payload, _)) => payload,
                Err(e) => {
                    errlog.input_error(height, &block_sha, tx_index, txin_index, "pop_push", &e);
                    continue;
                }
            };

            // The last payload byte is the hashtype, not part of the DER body.
            let sig = match Signature::from_der(&payload[..payload.len() - 1]) {
                Ok(sig) => sig,
                Err(e) => {
                    errlog.input_error(height, &block_sha, tx_index, txin_index, "parse_der", &e);
                    continue;
                }
            };

            let compact = sig.serialize_compact();
            let mut r = [0u8; 32];
            r.copy_from_slice(&compact[..32]);

            records.push(SigRecord {
                r,
                height,
                tx_index: tx_index as u32,
                txin_index: txin_index as u32,
            });
        }
    }

    records
}

fn run(
    reader: &BlockReader,
    mut tx_index: Option<&mut TxIndex>,
    errlog: &ErrorLog,
    heights: Range<u32>,
    skip_bad_blocks: bool,
    stop: &AtomicBool,
    sender: &Sender<SigRecord>,
) -> Result<bool> {
    for height in heights {
        if stop.load(Ordering::SeqCst) {
            return Ok(false);
        }

        let fetched = reader
            .read_block(height)
            .and_then(|b| b.with_context(|| format!("no block at height {}", height)));
        let block = match fetched {
            Ok(block) => block,
            Err(e) if skip_bad_blocks => {
                errlog.line(&format!("block {} skipped: {:#}", height, e));
                continue;
            }
            Err(e) => return Err(e),
        };

        if let Some(index) = tx_index.as_deref_mut() {
            index.put_block(height, &block)?;
        }

        for record in block_signatures(&block, height, errlog) {
            if sender.send(record).is_err() {
                // Consumer hung up; nothing left to produce for.
                return Ok(false);
            }
        }
    }

    Ok(true)
}

/// Start the producer thread for one extraction pass.
///
/// The thread owns the block reader (and, during pass 1, the tx index)
/// and hands both back when joined so the next pass can reuse them.
pub fn spawn(
    reader: BlockReader,
    tx_index: Option<TxIndex>,
    errlog: ErrorLog,
    heights: Range<u32>,
    skip_bad_blocks: bool,
    stop: Arc<AtomicBool>,
    sender: Sender<SigRecord>,
) -> JoinHandle<Result<(BlockReader, Option<TxIndex>)>> {
    thread::spawn(move || {
        let mut tx_index = tx_index;
        let completed = run(
            &reader,
            tx_index.as_mut(),
            &errlog,
            heights.clone(),
            skip_bad_blocks,
            &stop,
            &sender,
        )?;

        if completed && heights.end > heights.start {
            if let Some(index) = tx_index.as_mut() {
                index.set_last_height(heights.end - 1)?;
            }
        }

        Ok((reader, tx_index))
    })
}
