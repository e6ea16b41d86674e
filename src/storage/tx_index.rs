//! RocksDB transaction index
//!
//! Key: txid (32 raw bytes)
//! Value: TxLocation - 8 bytes
//!
//! Populated while pass 1 walks the chain and queried by the recovery
//! stage to resolve the funding transaction of each duplicate input.

use anyhow::{Context, Result};
use bitcoin::hashes::Hash;
use bitcoin::{Block, Txid};
use byteorder::{ByteOrder, LittleEndian};
use rocksdb::{Options, WriteBatch, DB};
use std::path::Path;

const LAST_HEIGHT_KEY: &[u8] = b"__meta__last_height";

/// Where a transaction sits in the chain.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TxLocation {
    pub height: u32,
    /// Position of the transaction within its block.
    pub tx_index: u32,
}

impl TxLocation {
    fn to_bytes(self) -> [u8; 8] {
        let mut bytes = [0u8; 8];
        LittleEndian::write_u32(&mut bytes[0..4], self.height);
        LittleEndian::write_u32(&mut bytes[4..8], self.tx_index);
        bytes
    }

    fn from_bytes(data: &[u8]) -> Result<Self> {
        if data.len() != 8 {
            anyhow::bail!("invalid tx location length: expected 8, got {}", data.len());
        }
        Ok(Self {
            height: LittleEndian::read_u32(&data[0..4]),
            tx_index: LittleEndian::read_u32(&data[4..8]),
        })
    }
}

/// RocksDB-backed index from txid to chain location.
pub struct TxIndex {
    db: DB,
}

impl TxIndex {
    /// Open or create the index database.
    pub fn open(path: &Path) -> Result<Self> {
        let mut opts = Options::default();
        opts.create_if_missing(true);
        opts.set_max_open_files(256);
        opts.set_write_buffer_size(64 * 1024 * 1024);
        opts.set_max_write_buffer_number(3);
        opts.set_target_file_size_base(64 * 1024 * 1024);
        opts.set_level_zero_file_num_compaction_trigger(4);
        opts.set_compression_type(rocksdb::DBCompressionType::Lz4);

        let db = DB::open(&opts, path)
            .with_context(|| format!("failed to open tx index at {:?}", path))?;

        Ok(Self { db })
    }

    /// Record every transaction of a block in one write batch.
    pub fn put_block(&mut self, height: u32, block: &Block) -> Result<()> {
        let mut batch = WriteBatch::default();

        for (tx_index, tx) in block.txdata.iter().enumerate() {
            let location = TxLocation {
                height,
                tx_index: tx_index as u32,
            };
            batch.put(tx.compute_txid().to_byte_array(), location.to_bytes());
        }

        self.db.write(batch)?;
        Ok(())
    }

    /// Look up the chain location of a transaction.
    pub fn get(&self, txid: &Txid) -> Result<Option<TxLocation>> {
        match self.db.get(txid.to_byte_array())? {
            Some(data) => Ok(Some(TxLocation::from_bytes(&data)?)),
            None => Ok(None),
        }
    }

    /// Highest block height whose transactions have been indexed.
    pub fn last_height(&self) -> Result<Option<u32>> {
        match self.db.get(LAST_HEIGHT_KEY)? {
            Some(data) if data.len() == 4 => Ok(Some(LittleEndian::read_u32(&data))),
            Some(_) => anyhow::bail!("corrupt last-height marker"),
            None => Ok(None),
        }
    }

    pub fn set_last_height(&mut self, height: u32) -> Result<()> {
        let mut bytes = [0u8; 4];
        LittleEndian::write_u32(&mut bytes, height);
        self.db.put(LAST_HEIGHT_KEY, bytes)?;
        Ok(())
    }
}
