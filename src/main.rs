//! Bitcoin ECDSA nonce-reuse scanner CLI

use anyhow::{bail, Result};
use clap::{Parser, Subcommand};
use log::info;
use noncescan::detect::{self, SearchOutcome};
use noncescan::stats::ScanReport;
use noncescan::{recover, BlockReader, Detector, ErrorLog, ScalableBloom, TxIndex};
use signal_hook::consts::{SIGINT, SIGTERM, SIGUSR1};
use std::path::{Path, PathBuf};
use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use std::time::Instant;

#[derive(Parser)]
#[command(name = "noncescan")]
#[command(about = "Bitcoin ECDSA nonce-reuse scanner and private key recoverer")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Two-pass scan of the block store for duplicate r values
    Scan {
        /// Path to Bitcoin blocks directory (containing blk*.dat files)
        #[arg(short, long)]
        blocks_dir: PathBuf,

        /// Output directory for the duplicate map, Bloom file, tx index
        /// and error diary
        #[arg(short, long, default_value = "./output")]
        output: PathBuf,

        /// Start height (default: 0)
        #[arg(long, default_value = "0")]
        start_height: u32,

        /// End height, exclusive (default: newest indexed block)
        #[arg(long)]
        end_height: Option<u32>,

        /// Bloom filter target capacity
        #[arg(long, default_value = "100000000")]
        bloom_capacity: u64,

        /// Bloom filter target false-positive rate
        #[arg(long, default_value = "0.005")]
        bloom_fp_rate: f64,
    },

    /// Replay duplicate signatures and recover private keys
    Recover {
        /// Path to Bitcoin blocks directory
        #[arg(short, long)]
        blocks_dir: PathBuf,

        /// Output directory of a previous scan
        #[arg(short, long, default_value = "./output")]
        output: PathBuf,

        /// Duplicate map to process (default: <output>/duplicates.json)
        #[arg(long)]
        json: Option<PathBuf>,
    },

    /// Display statistics from the last scan
    Stats {
        /// Output directory
        #[arg(short, long, default_value = "./output")]
        output: PathBuf,
    },
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Scan {
            blocks_dir,
            output,
            start_height,
            end_height,
            bloom_capacity,
            bloom_fp_rate,
        } => run_scan(
            &blocks_dir,
            &output,
            start_height,
            end_height,
            bloom_capacity,
            bloom_fp_rate,
        ),
        Commands::Recover {
            blocks_dir,
            output,
            json,
        } => run_recover(&blocks_dir, &output, json),
        Commands::Stats { output } => run_stats(&output),
    }
}

/// SIGINT/SIGTERM request a graceful stop; SIGUSR1 requests an
/// immediate progress report.
fn register_signals() -> Result<(Arc<AtomicBool>, Arc<AtomicBool>)> {
    let stop = Arc::new(AtomicBool::new(false));
    signal_hook::flag::register(SIGINT, Arc::clone(&stop))?;
    signal_hook::flag::register(SIGTERM, Arc::clone(&stop))?;

    let info_flag = Arc::new(AtomicBool::new(false));
    signal_hook::flag::register(SIGUSR1, Arc::clone(&info_flag))?;

    Ok((stop, info_flag))
}

fn run_scan(
    blocks_dir: &Path,
    output: &Path,
    start_height: u32,
    end_height: Option<u32>,
    bloom_capacity: u64,
    bloom_fp_rate: f64,
) -> Result<()> {
    std::fs::create_dir_all(output)?;

    info!("indexing block files under {:?}", blocks_dir);
    let reader = BlockReader::new(blocks_dir)?;
    let end_height = end_height.unwrap_or_else(|| reader.max_height());
    if start_height >= end_height {
        bail!("empty height range {}..{}", start_height, end_height);
    }
    info!("scanning blocks {} to {}", start_height, end_height);

    let errlog = ErrorLog::create(&output.join("scan_errors.log"))?;
    let bloom = ScalableBloom::open(&output.join("bloom.bin"), bloom_capacity, bloom_fp_rate)?;
    if !bloom.is_empty() {
        info!("reusing Bloom backing file with {} prior inserts", bloom.len());
    }
    let tx_index = TxIndex::open(&output.join("txindex.rocksdb"))?;
    let (stop, info_flag) = register_signals()?;

    let started = Instant::now();
    let detector = Detector {
        bloom,
        errlog: errlog.clone(),
        heights: start_height..end_height,
        stop,
        info: info_flag,
    };

    let outcome = detector.search(reader, tx_index);
    errlog.flush();

    match outcome? {
        SearchOutcome::Aborted => bail!("interrupted during pass 1, no results kept"),
        SearchOutcome::Finished {
            duplicates,
            signatures_seen,
            candidates,
            partial,
            bloom_size_mb,
        } => {
            detect::save_duplicates(&duplicates, &output.join("duplicates.json"))?;

            let report = ScanReport {
                start_height,
                end_height,
                signatures_seen,
                candidates,
                duplicates: duplicates.len() as u64,
                interrupted: partial,
                bloom_size_mb,
                elapsed_secs: started.elapsed().as_secs(),
            };
            report.save(&output.join("stats.json"))?;

            info!(
                "scan {} - {} duplicate r values ({} candidates, {} signatures)",
                if partial { "interrupted" } else { "complete" },
                duplicates.len(),
                candidates,
                signatures_seen,
            );
        }
    }

    Ok(())
}

fn run_recover(blocks_dir: &Path, output: &Path, json: Option<PathBuf>) -> Result<()> {
    let json_path = json.unwrap_or_else(|| output.join("duplicates.json"));
    let duplicates = detect::load_duplicates(&json_path)?;
    info!(
        "loaded {} duplicate r values from {:?}",
        duplicates.len(),
        json_path
    );

    info!("indexing block files under {:?}", blocks_dir);
    let reader = BlockReader::new(blocks_dir)?;
    let tx_index = TxIndex::open(&output.join("txindex.rocksdb"))?;

    let stdout = std::io::stdout();
    let mut out = stdout.lock();
    let summary = recover::run(&reader, &tx_index, &duplicates, &mut out)?;

    info!(
        "emitted {} rows, recovered {} keys, skipped {} occurrences",
        summary.rows, summary.keys_recovered, summary.occurrences_skipped,
    );

    Ok(())
}

fn run_stats(output: &Path) -> Result<()> {
    let stats_path = output.join("stats.json");
    if !stats_path.exists() {
        bail!("stats file not found, run scan first");
    }

    let report = ScanReport::load(&stats_path)?;

    println!("=== Nonce reuse scan statistics ===");
    println!("Height range: {}..{}", report.start_height, report.end_height);
    println!("Signatures seen: {}", report.signatures_seen);
    println!("Bloom candidates: {}", report.candidates);
    println!("Duplicate r values: {}", report.duplicates);
    println!("Interrupted: {}", report.interrupted);
    println!("Bloom file: {:.2} MB", report.bloom_size_mb);
    println!("Elapsed: {} s", report.elapsed_secs);

    Ok(())
}
