//! Synthetic chain construction shared by the integration tests.
//!
//! Builds tiny deterministic chains (real consensus encoding, fake
//! proof-of-work) in blk00000.dat format, with P2PKH spends signed
//! using explicit nonces so r collisions can be staged.

use bitcoin::absolute::LockTime;
use bitcoin::block::{Header, Version};
use bitcoin::consensus::encode::serialize;
use bitcoin::hashes::Hash;
use bitcoin::pow::CompactTarget;
use bitcoin::secp256k1::{ecdsa, Secp256k1, SecretKey};
use bitcoin::sighash::SighashCache;
use bitcoin::transaction::Version as TxVersion;
use bitcoin::{
    Amount, Block, BlockHash, OutPoint, ScriptBuf, Sequence, Transaction, TxIn, TxMerkleNode,
    TxOut, Witness,
};
use k256::elliptic_curve::ff::PrimeField;
use k256::elliptic_curve::ops::Reduce;
use k256::elliptic_curve::sec1::ToEncodedPoint;
use k256::{ProjectivePoint, Scalar, U256};
use noncescan::recover::hash160;
use noncescan::MAINNET_MAGIC;
use std::io::Write;
use std::path::Path;

pub fn scalar(v: u64) -> Scalar {
    Scalar::from(v)
}

pub fn secret_key(d: &Scalar) -> SecretKey {
    SecretKey::from_slice(&d.to_bytes()).expect("valid secret scalar")
}

pub fn pubkey_bytes(d: &Scalar, compressed: bool) -> Vec<u8> {
    let pk = secret_key(d).public_key(&Secp256k1::new());
    if compressed {
        pk.serialize().to_vec()
    } else {
        pk.serialize_uncompressed().to_vec()
    }
}

/// OP_DUP OP_HASH160 <hash160(pubkey)> OP_EQUALVERIFY OP_CHECKSIG
pub fn p2pkh_script(pubkey: &[u8]) -> ScriptBuf {
    let mut bytes = vec![0x76, 0xa9, 20];
    bytes.extend_from_slice(&hash160(pubkey));
    bytes.push(0x88);
    bytes.push(0xac);
    ScriptBuf::from_bytes(bytes)
}

pub fn coinbase_paying(tag: u8, outputs: Vec<TxOut>) -> Transaction {
    Transaction {
        version: TxVersion::ONE,
        lock_time: LockTime::ZERO,
        input: vec![TxIn {
            previous_output: OutPoint::null(),
            script_sig: ScriptBuf::from_bytes(vec![2, tag, 0x01]),
            sequence: Sequence::MAX,
            witness: Witness::new(),
        }],
        output: outputs,
    }
}

pub fn p2pkh_output(value: u64, pubkey: &[u8]) -> TxOut {
    TxOut {
        value: Amount::from_sat(value),
        script_pubkey: p2pkh_script(pubkey),
    }
}

/// An unsigned single-input spend of `prev`, paying to an empty script.
pub fn unsigned_spend(prev: OutPoint, value: u64) -> Transaction {
    Transaction {
        version: TxVersion::ONE,
        lock_time: LockTime::ZERO,
        input: vec![TxIn {
            previous_output: prev,
            script_sig: ScriptBuf::new(),
            sequence: Sequence::MAX,
            witness: Witness::new(),
        }],
        output: vec![TxOut {
            value: Amount::from_sat(value),
            script_pubkey: ScriptBuf::new(),
        }],
    }
}

/// Textbook ECDSA over the input's legacy SIGHASH_ALL digest with an
/// explicit nonce. Returns the DER signature with the hashtype byte
/// appended.
pub fn sign_input_with_nonce(
    tx: &Transaction,
    input_index: usize,
    script_pubkey: &ScriptBuf,
    d: &Scalar,
    k: &Scalar,
) -> Vec<u8> {
    let cache = SighashCache::new(tx);
    let digest: [u8; 32] = cache
        .legacy_signature_hash(input_index, script_pubkey, 1)
        .expect("valid input index")
        .to_byte_array();

    let point = (ProjectivePoint::GENERATOR * k).to_affine();
    let r = <Scalar as Reduce<U256>>::reduce_bytes(point.to_encoded_point(false).x().expect("x"));
    let z = <Scalar as Reduce<U256>>::reduce_bytes(&digest.into());
    let k_inv = Option::<Scalar>::from(k.invert()).expect("nonzero nonce");
    let s = k_inv * (z + r * d);

    let mut compact = [0u8; 64];
    compact[..32].copy_from_slice(&r.to_bytes());
    compact[32..].copy_from_slice(&s.to_bytes());

    let mut sig = ecdsa::Signature::from_compact(&compact)
        .expect("r and s in range")
        .serialize_der()
        .to_vec();
    sig.push(0x01); // SIGHASH_ALL
    sig
}

/// <sig-with-hashtype> <pubkey>
pub fn p2pkh_script_sig(sig_with_hashtype: &[u8], pubkey: &[u8]) -> ScriptBuf {
    let mut bytes = vec![sig_with_hashtype.len() as u8];
    bytes.extend_from_slice(sig_with_hashtype);
    bytes.push(pubkey.len() as u8);
    bytes.extend_from_slice(pubkey);
    ScriptBuf::from_bytes(bytes)
}

/// Sign input 0 of `tx` against `script_pubkey` and install the final
/// P2PKH scriptSig. Returns the big-endian r bytes of the signature.
pub fn finalize_spend(
    tx: &mut Transaction,
    script_pubkey: &ScriptBuf,
    pubkey: &[u8],
    d: &Scalar,
    k: &Scalar,
) -> [u8; 32] {
    let sig = sign_input_with_nonce(tx, 0, script_pubkey, d, k);

    let der = &sig[..sig.len() - 1];
    let compact = ecdsa::Signature::from_der(der)
        .expect("own signature")
        .serialize_compact();
    let mut r = [0u8; 32];
    r.copy_from_slice(&compact[..32]);

    tx.input[0].script_sig = p2pkh_script_sig(&sig, pubkey);
    r
}

/// Chain the given per-block transaction lists from a zero prev-hash
/// genesis.
pub fn build_chain(per_block_txs: Vec<Vec<Transaction>>) -> Vec<Block> {
    let mut blocks = Vec::with_capacity(per_block_txs.len());
    let mut prev = BlockHash::from_byte_array([0u8; 32]);
    let mut time = 1_231_006_505u32;

    for txdata in per_block_txs {
        let block = Block {
            header: Header {
                version: Version::ONE,
                prev_blockhash: prev,
                merkle_root: TxMerkleNode::from_byte_array([0u8; 32]),
                time,
                bits: CompactTarget::from_consensus(0x1d00ffff),
                nonce: 0,
            },
            txdata,
        };
        prev = block.block_hash();
        time += 600;
        blocks.push(block);
    }

    blocks
}

/// Serialize the chain into a single blk00000.dat under `dir`.
pub fn write_blk_file(dir: &Path, blocks: &[Block]) {
    std::fs::create_dir_all(dir).expect("blocks dir");
    let mut file = std::fs::File::create(dir.join("blk00000.dat")).expect("blk file");

    for block in blocks {
        let bytes = serialize(block);
        file.write_all(&MAINNET_MAGIC.to_le_bytes()).expect("magic");
        file.write_all(&(bytes.len() as u32).to_le_bytes())
            .expect("size");
        file.write_all(&bytes).expect("block bytes");
    }
}
