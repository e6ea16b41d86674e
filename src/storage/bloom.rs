//! Scalable Bloom filter over a memory-mapped backing file
//!
//! Approximate-membership filter for the 32-byte r-values seen during
//! pass 1. The filter is layered: each layer is a plain Bloom filter and
//! a new, larger, tighter layer is appended once the newest one reaches
//! its target capacity, keeping the compound false-positive rate bounded.
//! The bit arrays live in a memory-mapped file so a finished pass (or an
//! interrupted run) can be reused by the next invocation.
//!
//! Binary format (little-endian):
//!
//! Header (32 bytes):
//!   magic: u32 = 0x53424C4D ("SBLM")
//!   version: u32 = 1
//!   capacity: u64       (layer-0 target capacity)
//!   fp_rate: f64        (layer-0 false-positive rate)
//!   layer_count: u32
//!   padding: u32
//!
//! Then per layer:
//!   count: u64          (elements inserted into this layer)
//!   bit_size: u64
//!   num_hashes: u32
//!   padding: u32
//!   bits: [u8; bit_size / 8]

use anyhow::{bail, Context, Result};
use byteorder::{ByteOrder, LittleEndian};
use memmap2::MmapMut;
use sha2::{Digest, Sha256};
use std::fs::OpenOptions;
use std::path::Path;

const BLOOM_MAGIC: u32 = 0x53424C4D; // "SBLM"
const BLOOM_VERSION: u32 = 1;

const HEADER_LEN: usize = 32;
const LAYER_META_LEN: usize = 24;

/// Growth factor for successive layer capacities.
const LAYER_GROWTH: u32 = 2;
/// Tightening ratio for successive layer false-positive rates.
const LAYER_TIGHTENING: f64 = 0.5;

#[derive(Debug, Clone)]
struct Layer {
    /// Offset of the layer metadata within the file.
    offset: usize,
    capacity: u64,
    bit_size: u64,
    num_hashes: u32,
}

impl Layer {
    fn data_offset(&self) -> usize {
        self.offset + LAYER_META_LEN
    }

    fn segment_len(&self) -> usize {
        LAYER_META_LEN + (self.bit_size / 8) as usize
    }
}

/// Layered Bloom filter backed by a memory-mapped file.
pub struct ScalableBloom {
    file: std::fs::File,
    mmap: MmapMut,
    capacity: u64,
    fp_rate: f64,
    layers: Vec<Layer>,
}

/// Optimal parameters for the layer at `index`.
///
/// m = -n * ln(p) / ln(2)^2, rounded up to a byte boundary
/// k = ceil(log2(1 / p))
fn layer_params(capacity: u64, fp_rate: f64, index: u32) -> (u64, u64, u32) {
    let n = (capacity << index) as f64;
    let p = fp_rate * LAYER_TIGHTENING.powi(index as i32);

    let ln2 = std::f64::consts::LN_2;
    let m = (-n * p.ln() / (ln2 * ln2)).ceil() as u64;
    let m = m.div_ceil(8) * 8;
    let k = (1.0 / p).log2().ceil() as u32;

    (capacity << index, m.max(8), k.max(1))
}

impl ScalableBloom {
    /// Open (or create) the backing file.
    ///
    /// An existing file is reused as-is; its recorded parameters must
    /// match the requested ones.
    pub fn open(path: &Path, capacity: u64, fp_rate: f64) -> Result<Self> {
        if capacity == 0 || !(fp_rate > 0.0 && fp_rate < 1.0) {
            bail!(
                "invalid Bloom parameters: capacity {}, fp rate {}",
                capacity,
                fp_rate
            );
        }

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)
            .with_context(|| format!("failed to open Bloom backing file {:?}", path))?;

        let existing = file.metadata()?.len();
        if existing == 0 {
            let (cap0, bit_size, num_hashes) = layer_params(capacity, fp_rate, 0);
            let first = Layer {
                offset: HEADER_LEN,
                capacity: cap0,
                bit_size,
                num_hashes,
            };
            file.set_len((HEADER_LEN + first.segment_len()) as u64)?;

            let mut mmap = unsafe { MmapMut::map_mut(&file)? };
            LittleEndian::write_u32(&mut mmap[0..4], BLOOM_MAGIC);
            LittleEndian::write_u32(&mut mmap[4..8], BLOOM_VERSION);
            LittleEndian::write_u64(&mut mmap[8..16], capacity);
            LittleEndian::write_f64(&mut mmap[16..24], fp_rate);
            LittleEndian::write_u32(&mut mmap[24..28], 1);
            Self::write_layer_meta(&mut mmap, &first, 0);

            return Ok(Self {
                file,
                mmap,
                capacity,
                fp_rate,
                layers: vec![first],
            });
        }

        let mmap = unsafe { MmapMut::map_mut(&file)? };
        if mmap.len() < HEADER_LEN {
            bail!("Bloom backing file {:?} is too short", path);
        }

        let magic = LittleEndian::read_u32(&mmap[0..4]);
        if magic != BLOOM_MAGIC {
            bail!("bad Bloom file magic: 0x{:08X}", magic);
        }
        let version = LittleEndian::read_u32(&mmap[4..8]);
        if version != BLOOM_VERSION {
            bail!("unsupported Bloom file version: {}", version);
        }
        let file_capacity = LittleEndian::read_u64(&mmap[8..16]);
        let file_fp_rate = LittleEndian::read_f64(&mmap[16..24]);
        if file_capacity != capacity || file_fp_rate.to_bits() != fp_rate.to_bits() {
            bail!(
                "Bloom file {:?} was built with capacity {} / fp rate {}; \
                 requested {} / {}",
                path,
                file_capacity,
                file_fp_rate,
                capacity,
                fp_rate
            );
        }
        let layer_count = LittleEndian::read_u32(&mmap[24..28]);

        let mut layers = Vec::with_capacity(layer_count as usize);
        let mut offset = HEADER_LEN;
        for index in 0..layer_count {
            let (cap, bit_size, num_hashes) = layer_params(capacity, fp_rate, index);
            if offset + LAYER_META_LEN > mmap.len() {
                bail!("Bloom file {:?} is truncated at layer {}", path, index);
            }
            let recorded_bits = LittleEndian::read_u64(&mmap[offset + 8..offset + 16]);
            if recorded_bits != bit_size {
                bail!(
                    "Bloom file layer {} has {} bits, expected {}",
                    index,
                    recorded_bits,
                    bit_size
                );
            }
            let layer = Layer {
                offset,
                capacity: cap,
                bit_size,
                num_hashes,
            };
            offset += layer.segment_len();
            if offset > mmap.len() {
                bail!("Bloom file {:?} is truncated at layer {}", path, index);
            }
            layers.push(layer);
        }

        Ok(Self {
            file,
            mmap,
            capacity,
            fp_rate,
            layers,
        })
    }

    /// Test whether the element might have been inserted before.
    ///
    /// Never false-negative: once `add(key)` succeeds, every later
    /// `check(key)` returns true.
    pub fn check(&self, key: &[u8]) -> bool {
        let (h1, h2) = hash_pair(key);
        self.layers
            .iter()
            .any(|layer| self.layer_contains(layer, h1, h2))
    }

    /// Insert an element into the newest layer, growing the filter first
    /// if that layer is at capacity.
    ///
    /// Returns true if the element was probably new in the layer, false
    /// if every target bit was already set.
    pub fn add(&mut self, key: &[u8]) -> Result<bool> {
        if self.layer_count(self.layers.len() - 1) >= self.layers.last().expect("nonempty").capacity
        {
            self.grow()?;
        }

        let (h1, h2) = hash_pair(key);
        let layer = self.layers.last().expect("nonempty").clone();

        let mut probably_new = false;
        for i in 0..layer.num_hashes {
            let bit = bit_index(h1, h2, i, layer.bit_size);
            let byte = layer.data_offset() + (bit / 8) as usize;
            let mask = 1u8 << (bit % 8);
            if self.mmap[byte] & mask == 0 {
                probably_new = true;
                self.mmap[byte] |= mask;
            }
        }

        if probably_new {
            self.bump_layer_count(&layer);
        }
        Ok(probably_new)
    }

    /// Total number of elements inserted across all layers.
    pub fn len(&self) -> u64 {
        (0..self.layers.len()).map(|i| self.layer_count(i)).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn size_mb(&self) -> f64 {
        self.mmap.len() as f64 / 1024.0 / 1024.0
    }

    /// Flush the mapped bits back to disk.
    pub fn flush(&self) -> Result<()> {
        self.mmap.flush().context("failed to flush Bloom backing file")
    }

    fn layer_contains(&self, layer: &Layer, h1: u64, h2: u64) -> bool {
        (0..layer.num_hashes).all(|i| {
            let bit = bit_index(h1, h2, i, layer.bit_size);
            let byte = layer.data_offset() + (bit / 8) as usize;
            self.mmap[byte] & (1u8 << (bit % 8)) != 0
        })
    }

    fn layer_count(&self, index: usize) -> u64 {
        let offset = self.layers[index].offset;
        LittleEndian::read_u64(&self.mmap[offset..offset + 8])
    }

    fn bump_layer_count(&mut self, layer: &Layer) {
        let count = LittleEndian::read_u64(&self.mmap[layer.offset..layer.offset + 8]);
        LittleEndian::write_u64(&mut self.mmap[layer.offset..layer.offset + 8], count + 1);
    }

    /// Append a fresh, larger, tighter layer to the backing file.
    fn grow(&mut self) -> Result<()> {
        let index = self.layers.len() as u32;
        let (cap, bit_size, num_hashes) = layer_params(self.capacity, self.fp_rate, index);
        let layer = Layer {
            offset: self.mmap.len(),
            capacity: cap,
            bit_size,
            num_hashes,
        };

        self.mmap.flush()?;
        self.file
            .set_len((layer.offset + layer.segment_len()) as u64)?;
        self.mmap = unsafe { MmapMut::map_mut(&self.file)? };

        Self::write_layer_meta(&mut self.mmap, &layer, 0);
        LittleEndian::write_u32(&mut self.mmap[24..28], index + 1);
        self.layers.push(layer);

        log::info!(
            "Bloom filter grew to layer {} ({} bits, {} hashes)",
            index,
            bit_size,
            num_hashes
        );
        Ok(())
    }

    fn write_layer_meta(mmap: &mut MmapMut, layer: &Layer, count: u64) {
        let o = layer.offset;
        LittleEndian::write_u64(&mut mmap[o..o + 8], count);
        LittleEndian::write_u64(&mut mmap[o + 8..o + 16], layer.bit_size);
        LittleEndian::write_u32(&mut mmap[o + 16..o + 20], layer.num_hashes);
        LittleEndian::write_u32(&mut mmap[o + 20..o + 24], 0);
    }
}

/// Two 64-bit hashes for double hashing, from a single SHA-256.
fn hash_pair(key: &[u8]) -> (u64, u64) {
    let hash = Sha256::digest(key);
    let h1 = u64::from_le_bytes(hash[0..8].try_into().expect("8 bytes"));
    let h2 = u64::from_le_bytes(hash[8..16].try_into().expect("8 bytes"));
    (h1, h2)
}

/// h(i) = h1 + i * h2, reduced to the layer's bit space.
fn bit_index(h1: u64, h2: u64, i: u32, bit_size: u64) -> u64 {
    h1.wrapping_add((i as u64).wrapping_mul(h2)) % bit_size
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn key(i: u64) -> [u8; 32] {
        let mut k = [0u8; 32];
        k[24..].copy_from_slice(&i.to_be_bytes());
        k
    }

    #[test]
    fn test_check_add_monotonic() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("bloom.bin");
        let mut bloom = ScalableBloom::open(&path, 1000, 0.005).unwrap();

        for i in 0..100 {
            bloom.add(&key(i)).unwrap();
            for j in 0..=i {
                assert!(bloom.check(&key(j)), "no false negatives allowed");
            }
        }
    }

    #[test]
    fn test_growth_keeps_members() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("bloom.bin");
        // Tiny capacity forces several layer additions.
        let mut bloom = ScalableBloom::open(&path, 8, 0.01).unwrap();

        for i in 0..100 {
            bloom.add(&key(i)).unwrap();
        }
        for i in 0..100 {
            assert!(bloom.check(&key(i)));
        }
    }

    #[test]
    fn test_persists_across_reopen() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("bloom.bin");

        {
            let mut bloom = ScalableBloom::open(&path, 64, 0.01).unwrap();
            for i in 0..200 {
                bloom.add(&key(i)).unwrap();
            }
            bloom.flush().unwrap();
        }

        let bloom = ScalableBloom::open(&path, 64, 0.01).unwrap();
        for i in 0..200 {
            assert!(bloom.check(&key(i)));
        }
        assert!(bloom.len() > 0);
    }

    #[test]
    fn test_parameter_mismatch_rejected() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("bloom.bin");

        {
            ScalableBloom::open(&path, 64, 0.01).unwrap();
        }

        assert!(ScalableBloom::open(&path, 128, 0.01).is_err());
        assert!(ScalableBloom::open(&path, 64, 0.02).is_err());
    }

    #[test]
    fn test_add_reports_probably_new() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("bloom.bin");
        let mut bloom = ScalableBloom::open(&path, 1000, 0.005).unwrap();

        assert!(bloom.add(&key(1)).unwrap());
        // Re-adding the identical element hits only set bits.
        assert!(!bloom.add(&key(1)).unwrap());
    }
}
