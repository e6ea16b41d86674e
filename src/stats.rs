//! Scan statistics and progress reporting

use anyhow::Result;
use log::info;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Instant;

/// Running counters for one detection pass.
pub struct ScanStats {
    pub signatures: u64,
    pub matches: u64,
    pub current_height: u32,
    window_start: Instant,
    window_signatures: u64,
}

impl ScanStats {
    pub fn start() -> Self {
        Self {
            signatures: 0,
            matches: 0,
            current_height: 0,
            window_start: Instant::now(),
            window_signatures: 0,
        }
    }

    /// Log a progress line and reset the rate window.
    pub fn progress_line(&mut self, pass: u8, max_height: u32) {
        let window = self.window_start.elapsed().as_secs_f64();
        info!(
            "pass {} - {} sigs in {:.2}s, {} matches, {} total, block {} of {}",
            pass,
            self.signatures - self.window_signatures,
            window,
            self.matches,
            self.signatures,
            self.current_height,
            max_height,
        );
        self.window_start = Instant::now();
        self.window_signatures = self.signatures;
    }

    pub fn pass_done(&self, pass: u8) {
        info!(
            "pass {} done - {} signatures processed - {} matches",
            pass, self.signatures, self.matches
        );
    }
}

/// Summary of a completed scan, persisted next to the duplicate map.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScanReport {
    /// First height walked (inclusive).
    pub start_height: u32,
    /// End of the walked range (exclusive).
    pub end_height: u32,
    /// Signatures seen during pass 1.
    pub signatures_seen: u64,
    /// r values the Bloom filter flagged as possibly repeated.
    pub candidates: u64,
    /// r values with two or more occurrences after pass 2.
    pub duplicates: u64,
    /// Whether the scan was cut short by a terminate signal.
    pub interrupted: bool,
    pub bloom_size_mb: f64,
    pub elapsed_secs: u64,
}

impl ScanReport {
    pub fn save(&self, path: &Path) -> Result<()> {
        let json = serde_json::to_string_pretty(self)?;
        std::fs::write(path, json)?;
        Ok(())
    }

    pub fn load(path: &Path) -> Result<Self> {
        Ok(serde_json::from_str(&std::fs::read_to_string(path)?)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_report_roundtrip() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("stats.json");

        let report = ScanReport {
            start_height: 0,
            end_height: 100,
            signatures_seen: 12,
            candidates: 3,
            duplicates: 1,
            interrupted: false,
            bloom_size_mb: 1.5,
            elapsed_secs: 9,
        };
        report.save(&path).unwrap();

        let loaded = ScanReport::load(&path).unwrap();
        assert_eq!(loaded.duplicates, 1);
        assert_eq!(loaded.end_height, 100);
        assert!(!loaded.interrupted);
    }
}
