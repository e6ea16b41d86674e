//! Bitcoin mainnet ECDSA nonce-reuse scanner
//!
//! This library scans a full block database for ECDSA signatures whose
//! per-signature nonce parameter r was reused, then recovers the signer's
//! private key where the reuse happened under a single public key:
//! - a streaming signature extractor over the raw `blk*.dat` store
//! - a two-pass duplicate detector backed by a scalable Bloom filter
//! - a script-replay driver that reconstructs each sighash and applies
//!   the nonce-reuse algebra

pub mod block;
pub mod detect;
pub mod errlog;
pub mod extractor;
pub mod recover;
pub mod stats;
pub mod storage;

pub use block::reader::BlockReader;
pub use detect::{Detector, DuplicateMap, SigLocation};
pub use errlog::ErrorLog;
pub use extractor::SigRecord;
pub use stats::ScanStats;
pub use storage::bloom::ScalableBloom;
pub use storage::tx_index::TxIndex;

/// Magic bytes for Bitcoin mainnet
pub const MAINNET_MAGIC: u32 = 0xD9B4BEF9;
