//! Per-run error diary
//!
//! Expected per-input failures (non-standard scripts, unparseable DER)
//! are far too numerous for the main log; they go to a dedicated
//! line-oriented file with enough context to find the input again.

use anyhow::{Context, Result};
use std::fmt::Display;
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::Path;
use std::sync::{Arc, Mutex};

/// Shared handle to the error diary file.
#[derive(Clone)]
pub struct ErrorLog {
    inner: Arc<Mutex<BufWriter<File>>>,
}

impl ErrorLog {
    pub fn create(path: &Path) -> Result<Self> {
        let file = File::create(path)
            .with_context(|| format!("failed to create error log {:?}", path))?;
        Ok(Self {
            inner: Arc::new(Mutex::new(BufWriter::new(file))),
        })
    }

    /// Record a per-input failure with its chain coordinates.
    pub fn input_error(
        &self,
        height: u32,
        block_sha: &impl Display,
        tx_index: usize,
        txin_index: usize,
        stage: &str,
        err: &impl Display,
    ) {
        self.line(&format!(
            "block {} ({}) tx {} txin {} [{}]: {}",
            height, block_sha, tx_index, txin_index, stage, err
        ));
    }

    /// Record a free-form diary line.
    pub fn line(&self, msg: &str) {
        let mut writer = self.inner.lock().expect("error log poisoned");
        if let Err(e) = writeln!(writer, "{}", msg) {
            log::warn!("error log write failed: {}", e);
        }
    }

    pub fn flush(&self) {
        let mut writer = self.inner.lock().expect("error log poisoned");
        if let Err(e) = writer.flush() {
            log::warn!("error log flush failed: {}", e);
        }
    }
}
