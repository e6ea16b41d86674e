//! Two-pass duplicate detection
//!
//! Keeping full context for every signature on the chain would need
//! hundreds of millions of map entries, so detection runs twice over the
//! extractor stream:
//!
//! - **pass 1** pushes every r into the Bloom filter and shortlists the
//!   values the filter already contained (true duplicates plus Bloom
//!   false positives);
//! - **pass 2** re-extracts and collects the full record list for every
//!   shortlisted r.
//!
//! Values whose pass-2 list has fewer than two entries were false
//! positives and are dropped, leaving the authoritative duplicate map.
//!
//! A terminate signal during pass 1 aborts with no output; during pass 2
//! it returns the partial map collected so far. An info signal forces an
//! immediate progress line, which otherwise appears every ~10 seconds.

use crate::errlog::ErrorLog;
use crate::extractor::{self, SigRecord, CHANNEL_BOUND};
use crate::stats::ScanStats;
use crate::storage::bloom::ScalableBloom;
use crate::storage::tx_index::TxIndex;
use crate::BlockReader;
use anyhow::{anyhow, Context, Result};
use crossbeam_channel::{bounded, select, tick};
use indicatif::{ProgressBar, ProgressStyle};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::fs::File;
use std::io::{BufReader, BufWriter};
use std::ops::Range;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Seconds between unsolicited progress lines.
const TICK_SECS: u64 = 10;

/// Chain coordinates of one extracted signature.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SigLocation {
    #[serde(rename = "H")]
    pub height: u32,
    #[serde(rename = "Tx")]
    pub tx_index: u32,
    #[serde(rename = "TxIn")]
    pub txin_index: u32,
}

impl From<&SigRecord> for SigLocation {
    fn from(rec: &SigRecord) -> Self {
        Self {
            height: rec.height,
            tx_index: rec.tx_index,
            txin_index: rec.txin_index,
        }
    }
}

/// Duplicate map: decimal r value to its occurrences in chain order.
pub type DuplicateMap = BTreeMap<String, Vec<SigLocation>>;

/// Result of a full detection run.
pub enum SearchOutcome {
    /// Terminated during pass 1; nothing usable was collected.
    Aborted,
    Finished {
        duplicates: DuplicateMap,
        signatures_seen: u64,
        candidates: u64,
        /// True when pass 2 was cut short and the map covers a prefix
        /// of the chain only.
        partial: bool,
        bloom_size_mb: f64,
    },
}

#[derive(PartialEq)]
enum PassEnd {
    Completed,
    Interrupted,
}

/// Configuration and accumulators for one detection run.
pub struct Detector {
    pub bloom: ScalableBloom,
    pub errlog: ErrorLog,
    pub heights: Range<u32>,
    /// Set by SIGINT/SIGTERM: finish up and return what is safe.
    pub stop: Arc<AtomicBool>,
    /// Set by the info signal: log progress now.
    pub info: Arc<AtomicBool>,
}

impl Detector {
    /// Run both passes and return the duplicate map.
    ///
    /// The reader and the tx index are moved into the producer thread of
    /// each pass and recovered when it joins; pass 2 no longer needs the
    /// index.
    pub fn search(self, reader: BlockReader, tx_index: TxIndex) -> Result<SearchOutcome> {
        let Detector {
            mut bloom,
            errlog,
            heights,
            stop,
            info,
        } = self;

        let mut candidates: HashSet<String> = HashSet::new();

        let (end, signatures_seen, reader, tx_index) = run_pass(
            1,
            reader,
            Some(tx_index),
            &errlog,
            heights.clone(),
            &stop,
            &info,
            |rec| {
                if bloom.check(&rec.r) {
                    candidates.insert(rec.r_decimal());
                    Ok(true)
                } else {
                    if !bloom.add(&rec.r)? {
                        log::warn!("bloom add refused for r {}", rec.r_decimal());
                    }
                    Ok(false)
                }
            },
        )?;

        bloom.flush()?;
        drop(tx_index);

        if end == PassEnd::Interrupted {
            return Ok(SearchOutcome::Aborted);
        }

        log::info!("pass 1 shortlisted {} candidate r values", candidates.len());

        let mut duplicates: DuplicateMap = BTreeMap::new();

        let (end, _, _, _) = run_pass(
            2,
            reader,
            None,
            &errlog,
            heights,
            &stop,
            &info,
            |rec| {
                let key = rec.r_decimal();
                if candidates.contains(&key) {
                    duplicates.entry(key).or_default().push(SigLocation::from(rec));
                    Ok(true)
                } else {
                    Ok(false)
                }
            },
        )?;

        // Singletons are pass-1 false positives, not duplicates.
        duplicates.retain(|_, occurrences| occurrences.len() >= 2);

        Ok(SearchOutcome::Finished {
            duplicates,
            signatures_seen,
            candidates: candidates.len() as u64,
            partial: end == PassEnd::Interrupted,
            bloom_size_mb: bloom.size_mb(),
        })
    }
}

/// Drive one extraction pass: producer thread on the far side of a
/// bounded channel, progress tick and signal flags checked between
/// records.
fn run_pass(
    pass: u8,
    reader: BlockReader,
    tx_index: Option<TxIndex>,
    errlog: &ErrorLog,
    heights: Range<u32>,
    stop: &Arc<AtomicBool>,
    info: &AtomicBool,
    mut on_record: impl FnMut(&SigRecord) -> Result<bool>,
) -> Result<(PassEnd, u64, BlockReader, Option<TxIndex>)> {
    let (sender, receiver) = bounded(CHANNEL_BOUND);
    let skip_bad_blocks = pass == 2;
    let producer = extractor::spawn(
        reader,
        tx_index,
        errlog.clone(),
        heights.clone(),
        skip_bad_blocks,
        Arc::clone(stop),
        sender,
    );

    let ticker = tick(Duration::from_secs(TICK_SECS));
    let pb = ProgressBar::new(heights.end.saturating_sub(heights.start) as u64);
    pb.set_style(
        ProgressStyle::default_bar()
            .template("{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} blocks ({eta})")?
            .progress_chars("#>-"),
    );

    let mut stats = ScanStats::start();
    let mut end = PassEnd::Completed;

    loop {
        if stop.load(Ordering::SeqCst) {
            end = PassEnd::Interrupted;
            break;
        }
        if info.swap(false, Ordering::SeqCst) {
            stats.progress_line(pass, heights.end);
        }

        select! {
            recv(receiver) -> msg => match msg {
                Ok(rec) => {
                    stats.current_height = rec.height;
                    pb.set_position(rec.height.saturating_sub(heights.start) as u64);
                    if on_record(&rec)? {
                        stats.matches += 1;
                    }
                    stats.signatures += 1;
                }
                // Producer closed the channel: pass complete (or the
                // producer failed, surfaced by join below).
                Err(_) => break,
            },
            recv(ticker) -> _ => stats.progress_line(pass, heights.end),
        }
    }

    pb.finish_and_clear();

    // Dropping the receiver releases a producer blocked on a full queue.
    drop(receiver);
    let (reader, tx_index) = producer
        .join()
        .map_err(|_| anyhow!("extractor thread panicked"))?
        .with_context(|| format!("pass {} extraction failed", pass))?;

    match end {
        PassEnd::Completed => stats.pass_done(pass),
        PassEnd::Interrupted => log::info!("pass {} interrupted at block {}", pass, stats.current_height),
    }

    Ok((end, stats.signatures, reader, tx_index))
}

/// Write the duplicate map as JSON (decimal r keys, occurrence arrays).
pub fn save_duplicates(map: &DuplicateMap, path: &Path) -> Result<()> {
    let file = File::create(path)
        .with_context(|| format!("failed to create duplicate map {:?}", path))?;
    serde_json::to_writer(BufWriter::new(file), map)?;
    Ok(())
}

/// Read a duplicate map produced by [`save_duplicates`].
pub fn load_duplicates(path: &Path) -> Result<DuplicateMap> {
    let file =
        File::open(path).with_context(|| format!("failed to open duplicate map {:?}", path))?;
    Ok(serde_json::from_reader(BufReader::new(file))?)
}
