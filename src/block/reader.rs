//! Block reader for blk*.dat files
//!
//! Reads Bitcoin blocks directly from the raw block files using memory
//! mapping. An index `height -> file location` is built once at startup
//! by decoding every block header and following the prev-hash chain from
//! genesis, which is all the "block database" surface the scanner needs.

use anyhow::{bail, Context, Result};
use bitcoin::block::Header;
use bitcoin::consensus::Decodable;
use bitcoin::hashes::Hash;
use bitcoin::{Block, BlockHash};
use byteorder::{LittleEndian, ReadBytesExt};
use log::{debug, warn};
use memmap2::Mmap;
use std::cell::RefCell;
use std::collections::HashMap;
use std::fs::File;
use std::io::Cursor;
use std::path::{Path, PathBuf};

use crate::MAINNET_MAGIC;

/// Location of one serialized block inside the blk*.dat set.
#[derive(Debug, Clone)]
struct BlockLocation {
    file_num: u32,
    offset: usize,
    size: usize,
}

/// Height-indexed view over a directory of blk*.dat files.
pub struct BlockReader {
    blocks_dir: PathBuf,
    /// Memory-mapped blk files (interior mutability for caching)
    mmap_cache: RefCell<HashMap<u32, Mmap>>,
    height_index: HashMap<u32, BlockLocation>,
    max_height: u32,
}

impl BlockReader {
    pub fn new(blocks_dir: &Path) -> Result<Self> {
        let blocks_dir = blocks_dir.to_path_buf();
        let (height_index, max_height) = Self::build_height_index(&blocks_dir)?;

        if height_index.is_empty() {
            bail!("no blocks found under {:?}", blocks_dir);
        }

        Ok(Self {
            blocks_dir,
            mmap_cache: RefCell::new(HashMap::new()),
            height_index,
            max_height,
        })
    }

    /// Height of the newest indexed block.
    pub fn max_height(&self) -> u32 {
        self.max_height
    }

    /// Read and decode the block at the given height.
    pub fn read_block(&self, height: u32) -> Result<Option<Block>> {
        let location = match self.height_index.get(&height) {
            Some(loc) => loc.clone(),
            None => return Ok(None),
        };

        self.ensure_mmap_loaded(location.file_num)?;

        let cache = self.mmap_cache.borrow();
        let mmap = cache.get(&location.file_num).expect("mapped above");

        let end = location.offset + location.size;
        if end > mmap.len() {
            bail!(
                "block at height {} runs past the end of blk{:05}.dat",
                height,
                location.file_num
            );
        }

        let mut cursor = Cursor::new(&mmap[location.offset..end]);
        let block = Block::consensus_decode(&mut cursor)
            .with_context(|| format!("failed to decode block at height {}", height))?;

        Ok(Some(block))
    }

    fn ensure_mmap_loaded(&self, file_num: u32) -> Result<()> {
        let mut cache = self.mmap_cache.borrow_mut();

        if !cache.contains_key(&file_num) {
            let file_path = self.blk_file_path(file_num);
            let file = File::open(&file_path)
                .with_context(|| format!("failed to open {:?}", file_path))?;
            let mmap = unsafe { Mmap::map(&file)? };
            cache.insert(file_num, mmap);
        }

        Ok(())
    }

    fn blk_file_path(&self, file_num: u32) -> PathBuf {
        self.blocks_dir.join(format!("blk{:05}.dat", file_num))
    }

    /// Scan every blk*.dat file, decode headers, and chain blocks from
    /// genesis to assign heights.
    fn build_height_index(blocks_dir: &Path) -> Result<(HashMap<u32, BlockLocation>, u32)> {
        // hash -> (location, prev hash)
        let mut blocks_by_hash: HashMap<BlockHash, (BlockLocation, BlockHash)> = HashMap::new();
        let mut genesis: Option<BlockHash> = None;
        let mut file_num = 0u32;

        loop {
            let file_path = blocks_dir.join(format!("blk{:05}.dat", file_num));
            if !file_path.exists() {
                break;
            }

            debug!("scanning {:?}", file_path);

            let file = File::open(&file_path)?;
            let mmap = unsafe { Mmap::map(&file)? };

            let mut offset = 0usize;
            while offset + 8 <= mmap.len() {
                let mut cursor = Cursor::new(&mmap[offset..offset + 8]);
                let magic = cursor.read_u32::<LittleEndian>()?;
                if magic != MAINNET_MAGIC {
                    // Preallocated zero space at the tail of a file, or
                    // torn writes. Resynchronize byte by byte.
                    offset += 1;
                    continue;
                }
                let block_size = cursor.read_u32::<LittleEndian>()? as usize;

                let block_start = offset + 8;
                if block_start + block_size > mmap.len() {
                    warn!(
                        "truncated block record in {:?} at offset {}",
                        file_path, offset
                    );
                    break;
                }

                if block_size >= 80 {
                    let mut header_cursor = Cursor::new(&mmap[block_start..block_start + 80]);
                    match Header::consensus_decode(&mut header_cursor) {
                        Ok(header) => {
                            let hash = header.block_hash();
                            if header.prev_blockhash == BlockHash::from_byte_array([0u8; 32]) {
                                genesis = Some(hash);
                            }
                            let location = BlockLocation {
                                file_num,
                                offset: block_start,
                                size: block_size,
                            };
                            blocks_by_hash.insert(hash, (location, header.prev_blockhash));
                        }
                        Err(e) => warn!(
                            "undecodable header in {:?} at offset {}: {}",
                            file_path, offset, e
                        ),
                    }
                }

                offset = block_start + block_size;
            }

            file_num += 1;
        }

        // prev hash -> successors, then walk forward from genesis. Forks
        // keep the first-seen branch; the scanner only needs a single
        // linear history.
        let mut next_blocks: HashMap<BlockHash, Vec<BlockHash>> = HashMap::new();
        for (hash, (_, prev)) in &blocks_by_hash {
            next_blocks.entry(*prev).or_default().push(*hash);
        }

        let mut index = HashMap::new();
        let mut max_height = 0u32;

        if let Some(genesis_hash) = genesis {
            let mut current = genesis_hash;
            let mut height = 0u32;

            while let Some((location, _)) = blocks_by_hash.get(&current) {
                index.insert(height, location.clone());
                max_height = height;

                match next_blocks.get(&current).and_then(|c| c.first()) {
                    Some(next) => {
                        current = *next;
                        height += 1;
                    }
                    None => break,
                }
            }
        }

        debug!("indexed {} blocks up to height {}", index.len(), max_height);

        Ok((index, max_height))
    }
}
