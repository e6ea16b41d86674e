//! End-to-end detection runs over synthetic chains.

mod common;

use bitcoin::OutPoint;
use common::*;
use noncescan::detect::SearchOutcome;
use noncescan::{BlockReader, Detector, ErrorLog, ScalableBloom, TxIndex};
use std::path::{Path, PathBuf};
use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use tempfile::TempDir;

struct Workspace {
    blocks_dir: PathBuf,
    output: PathBuf,
}

fn workspace(tmp: &TempDir, blocks: &[bitcoin::Block]) -> Workspace {
    let blocks_dir = tmp.path().join("blocks");
    write_blk_file(&blocks_dir, blocks);
    let output = tmp.path().join("output");
    std::fs::create_dir_all(&output).unwrap();
    Workspace { blocks_dir, output }
}

fn search(ws: &Workspace, end_height: u32) -> SearchOutcome {
    search_with_bloom(ws, end_height, |path| {
        ScalableBloom::open(path, 1000, 0.005).unwrap()
    })
}

fn search_with_bloom(
    ws: &Workspace,
    end_height: u32,
    open_bloom: impl FnOnce(&Path) -> ScalableBloom,
) -> SearchOutcome {
    let reader = BlockReader::new(&ws.blocks_dir).unwrap();
    let errlog = ErrorLog::create(&ws.output.join("errors.log")).unwrap();
    let bloom = open_bloom(&ws.output.join("bloom.bin"));
    let tx_index = TxIndex::open(&ws.output.join("txindex.rocksdb")).unwrap();

    let detector = Detector {
        bloom,
        errlog,
        heights: 0..end_height,
        stop: Arc::new(AtomicBool::new(false)),
        info: Arc::new(AtomicBool::new(false)),
    };
    detector.search(reader, tx_index).unwrap()
}

/// Genesis funds two P2PKH outputs for one key; both spends reuse the
/// same nonce.
fn reused_nonce_chain() -> Vec<bitcoin::Block> {
    let d = scalar(1);
    let k = scalar(2);
    let pubkey = pubkey_bytes(&d, true);
    let script = p2pkh_script(&pubkey);

    let funding = coinbase_paying(
        0xaa,
        vec![p2pkh_output(50_000, &pubkey), p2pkh_output(60_000, &pubkey)],
    );
    let funding_txid = funding.compute_txid();

    let mut spend_a = unsigned_spend(OutPoint { txid: funding_txid, vout: 0 }, 40_000);
    finalize_spend(&mut spend_a, &script, &pubkey, &d, &k);

    let mut spend_b = unsigned_spend(OutPoint { txid: funding_txid, vout: 1 }, 50_000);
    finalize_spend(&mut spend_b, &script, &pubkey, &d, &k);

    build_chain(vec![
        vec![funding],
        vec![coinbase_paying(0xbb, vec![p2pkh_output(1, &pubkey)]), spend_a],
        vec![coinbase_paying(0xcc, vec![p2pkh_output(1, &pubkey)]), spend_b],
    ])
}

#[test]
fn detects_reused_r_in_chain_order() {
    let tmp = TempDir::new().unwrap();
    let ws = workspace(&tmp, &reused_nonce_chain());

    let SearchOutcome::Finished {
        duplicates,
        signatures_seen,
        candidates,
        partial,
        ..
    } = search(&ws, 3)
    else {
        panic!("scan aborted");
    };

    assert!(!partial);
    assert_eq!(signatures_seen, 2);
    assert_eq!(candidates, 1);
    assert_eq!(duplicates.len(), 1);

    let occurrences = duplicates.values().next().unwrap();
    assert_eq!(occurrences.len(), 2);
    // Chain order, and never a coinbase position.
    assert_eq!(
        (occurrences[0].height, occurrences[0].tx_index, occurrences[0].txin_index),
        (1, 1, 0)
    );
    assert_eq!(
        (occurrences[1].height, occurrences[1].tx_index, occurrences[1].txin_index),
        (2, 1, 0)
    );
}

#[test]
fn unique_nonces_produce_empty_map() {
    let d = scalar(1);
    let pubkey = pubkey_bytes(&d, true);
    let script = p2pkh_script(&pubkey);

    let funding = coinbase_paying(
        0xaa,
        vec![p2pkh_output(50_000, &pubkey), p2pkh_output(60_000, &pubkey)],
    );
    let funding_txid = funding.compute_txid();

    let mut spend_a = unsigned_spend(OutPoint { txid: funding_txid, vout: 0 }, 40_000);
    finalize_spend(&mut spend_a, &script, &pubkey, &d, &scalar(2));

    let mut spend_b = unsigned_spend(OutPoint { txid: funding_txid, vout: 1 }, 50_000);
    finalize_spend(&mut spend_b, &script, &pubkey, &d, &scalar(3));

    let chain = build_chain(vec![
        vec![funding],
        vec![coinbase_paying(0xbb, vec![p2pkh_output(1, &pubkey)]), spend_a, spend_b],
    ]);

    let tmp = TempDir::new().unwrap();
    let ws = workspace(&tmp, &chain);

    let SearchOutcome::Finished {
        duplicates,
        signatures_seen,
        candidates,
        ..
    } = search(&ws, 2)
    else {
        panic!("scan aborted");
    };

    assert_eq!(signatures_seen, 2);
    assert_eq!(candidates, 0);
    assert!(duplicates.is_empty());
}

/// A Bloom collision on a once-only r shortlists it in pass 1, but the
/// pass-2 post-filter drops the singleton. A pre-seeded filter stands in
/// for the hash collision.
#[test]
fn false_positive_singleton_is_dropped() {
    let d = scalar(1);
    let k = scalar(5);
    let pubkey = pubkey_bytes(&d, true);
    let script = p2pkh_script(&pubkey);

    let funding = coinbase_paying(0xaa, vec![p2pkh_output(50_000, &pubkey)]);
    let funding_txid = funding.compute_txid();

    let mut spend = unsigned_spend(OutPoint { txid: funding_txid, vout: 0 }, 40_000);
    let r = finalize_spend(&mut spend, &script, &pubkey, &d, &k);

    let chain = build_chain(vec![
        vec![funding],
        vec![coinbase_paying(0xbb, vec![p2pkh_output(1, &pubkey)]), spend],
    ]);

    let tmp = TempDir::new().unwrap();
    let ws = workspace(&tmp, &chain);

    // Seed the persistent filter with the r this chain will produce.
    {
        let mut bloom = ScalableBloom::open(&ws.output.join("bloom.bin"), 1000, 0.005).unwrap();
        bloom.add(&r).unwrap();
        bloom.flush().unwrap();
    }

    let SearchOutcome::Finished {
        duplicates,
        candidates,
        signatures_seen,
        ..
    } = search(&ws, 2)
    else {
        panic!("scan aborted");
    };

    assert_eq!(signatures_seen, 1);
    assert_eq!(candidates, 1);
    assert!(duplicates.is_empty());
}

#[test]
fn tx_index_covers_every_indexed_block() {
    let tmp = TempDir::new().unwrap();
    let chain = reused_nonce_chain();
    let funding_txid = chain[0].txdata[0].compute_txid();
    let spend_txid = chain[1].txdata[1].compute_txid();
    let ws = workspace(&tmp, &chain);

    search(&ws, 3);

    let tx_index = TxIndex::open(&ws.output.join("txindex.rocksdb")).unwrap();
    assert_eq!(tx_index.last_height().unwrap(), Some(2));

    let funding_loc = tx_index.get(&funding_txid).unwrap().unwrap();
    assert_eq!((funding_loc.height, funding_loc.tx_index), (0, 0));

    let spend_loc = tx_index.get(&spend_txid).unwrap().unwrap();
    assert_eq!((spend_loc.height, spend_loc.tx_index), (1, 1));
}
