//! Training Metrics Log
//!
//! Writes one CSV row per evaluation and mirrors it to the `log` facade, so a
//! run can be plotted afterwards and followed live with `RUST_LOG=info`.
//!
//! ## CSV Format
//!
//! - `epoch`: 1-based epoch number
//! - `step`: global optimizer step
//! - `tokens_seen`: input tokens consumed so far
//! - `elapsed_seconds`: time since the logger was created
//! - `train_loss`, `val_loss`: mean cross-entropy
//! - `train_perplexity`, `val_perplexity`: exp(loss)
//! - `sample`: generated text, quoted (empty for most rows)
//!
//! ## Perplexity
//!
//! ```text
//! perplexity = exp(loss)
//! ```
//!
//! A model guessing uniformly over `V` ids has perplexity `V`; a perfect one
//! has perplexity 1.

use crate::loss::perplexity;
use log::info;
use std::fs::File;
use std::io::{self, BufWriter, Write};
use std::path::Path;
use std::time::Instant;

const HEADER: &str =
    "epoch,step,tokens_seen,elapsed_seconds,train_loss,val_loss,train_perplexity,val_perplexity,sample";

/// Losses measured at one evaluation point
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct EvalRecord {
    pub epoch: usize,
    pub step: usize,
    pub tokens_seen: usize,
    pub train_loss: f32,
    pub val_loss: f32,
}

/// CSV training log
pub struct TrainingLogger {
    out: BufWriter<File>,
    start_time: Instant,
    last_log_time: Instant,
}

impl TrainingLogger {
    /// Create (or truncate) the CSV file at `path` and write the header
    pub fn new<P: AsRef<Path>>(path: P) -> io::Result<Self> {
        let mut out = BufWriter::new(File::create(path)?);
        writeln!(out, "{HEADER}")?;
        out.flush()?;

        let now = Instant::now();
        Ok(Self {
            out,
            start_time: now,
            last_log_time: now,
        })
    }

    /// Append one row
    ///
    /// Every row is flushed, so a crashed run keeps what it measured.
    pub fn log(&mut self, record: &EvalRecord, sample: Option<&str>) -> io::Result<()> {
        let elapsed = self.start_time.elapsed().as_secs_f32();
        let train_ppl = perplexity(record.train_loss);
        let val_ppl = perplexity(record.val_loss);
        let sample_escaped = sample.map(|s| s.replace('"', "\"\"")).unwrap_or_default();

        writeln!(
            self.out,
            "{},{},{},{:.2},{:.4},{:.4},{:.2},{:.2},\"{}\"",
            record.epoch,
            record.step,
            record.tokens_seen,
            elapsed,
            record.train_loss,
            record.val_loss,
            train_ppl,
            val_ppl,
            sample_escaped
        )?;
        self.out.flush()?;

        let since_last = self.last_log_time.elapsed().as_secs_f32();
        info!(
            "step {:6} | {:7.1}s (+{:.1}s) | train {:.4} | val {:.4} | ppl {:.2}",
            record.step, elapsed, since_last, record.train_loss, record.val_loss, val_ppl
        );
        self.last_log_time = Instant::now();
        Ok(())
    }
}
