//! Counters for an ingestion run.
//!
//! Decompression and parse workers update these concurrently, so every counter
//! is an `AtomicU64` read with `Ordering::Relaxed`.

use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};

use crate::decompress::DecompressOutcome;
use crate::flusher::FlushOutcome;
use crate::parser::ParseStats;

/// Thread-safe counters for one pipeline run.
#[derive(Debug, Default)]
pub struct IngestMetrics {
    /// Feeds decompressed this run.
    files_decompressed: AtomicU64,
    /// Feeds whose decompressed sibling already existed.
    files_skipped: AtomicU64,
    /// Feeds dropped after a decompress or parse error.
    files_failed: AtomicU64,
    /// Feeds folded into the merger.
    files_merged: AtomicU64,
    /// Decompressed bytes written.
    bytes_decompressed: AtomicU64,
    /// Lines read across all feeds.
    lines_read: AtomicU64,
    /// Lines that passed validation.
    valid_lines: AtomicU64,
    /// Codes seen in two feeds.
    codes_confirmed: AtomicU64,
    /// Batches written to the store.
    batches_flushed: AtomicU64,
    /// Codes written to the store.
    codes_flushed: AtomicU64,
    /// Benign "already exists" filter responses.
    filter_duplicates: AtomicU64,
}

impl IngestMetrics {
    /// All counters at zero.
    #[inline]
    pub fn new() -> Self {
        Self::default()
    }

    /// Count one decompression, skipped or performed.
    #[inline]
    pub fn record_decompress(&self, outcome: DecompressOutcome) {
        match outcome {
            DecompressOutcome::Skipped => {
                self.files_skipped.fetch_add(1, Ordering::Relaxed);
            }
            DecompressOutcome::Decompressed { bytes } => {
                self.files_decompressed.fetch_add(1, Ordering::Relaxed);
                self.bytes_decompressed.fetch_add(bytes, Ordering::Relaxed);
            }
        }
    }

    /// Count one dropped or failing feed.
    #[inline]
    pub fn record_file_failed(&self) {
        self.files_failed.fetch_add(1, Ordering::Relaxed);
    }

    /// Add one feed's line counters.
    #[inline]
    pub fn record_parse(&self, stats: ParseStats) {
        self.lines_read.fetch_add(stats.lines, Ordering::Relaxed);
        self.valid_lines.fetch_add(stats.valid_lines, Ordering::Relaxed);
    }

    /// Count one merged feed and the codes it confirmed.
    #[inline]
    pub fn record_merged_file(&self, newly_confirmed: u64) {
        self.files_merged.fetch_add(1, Ordering::Relaxed);
        self.codes_confirmed.fetch_add(newly_confirmed, Ordering::Relaxed);
    }

    /// Count one flushed batch.
    #[inline]
    pub fn record_flush(&self, outcome: &FlushOutcome) {
        self.batches_flushed.fetch_add(1, Ordering::Relaxed);
        self.codes_flushed.fetch_add(outcome.codes as u64, Ordering::Relaxed);
        if outcome.filter_duplicate {
            self.filter_duplicates.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Point-in-time copy of every counter.
    pub fn snapshot(&self) -> MetricsSnapshot {
        let load = |c: &AtomicU64| c.load(Ordering::Relaxed);
        MetricsSnapshot {
            files_decompressed: load(&self.files_decompressed),
            files_skipped: load(&self.files_skipped),
            files_failed: load(&self.files_failed),
            files_merged: load(&self.files_merged),
            bytes_decompressed: load(&self.bytes_decompressed),
            lines_read: load(&self.lines_read),
            valid_lines: load(&self.valid_lines),
            codes_confirmed: load(&self.codes_confirmed),
            batches_flushed: load(&self.batches_flushed),
            codes_flushed: load(&self.codes_flushed),
            filter_duplicates: load(&self.filter_duplicates),
        }
    }
}

/// Serializable copy of [`IngestMetrics`].
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetricsSnapshot {
    /// Feeds decompressed this run
    pub files_decompressed: u64,
    /// Feeds whose sibling already existed
    pub files_skipped: u64,
    /// Feeds dropped or failing
    pub files_failed: u64,
    /// Feeds folded into the merge
    pub files_merged: u64,
    /// Decompressed bytes written
    pub bytes_decompressed: u64,
    /// Lines read across all feeds
    pub lines_read: u64,
    /// Lines that passed validation
    pub valid_lines: u64,
    /// Codes seen in at least two feeds
    pub codes_confirmed: u64,
    /// Batches written to the store
    pub batches_flushed: u64,
    /// Codes written to the store
    pub codes_flushed: u64,
    /// Batches whose filter add reported existing items
    pub filter_duplicates: u64,
}

impl MetricsSnapshot {
    /// Fraction of valid lines that ended up confirmed. 0.0 when nothing was valid.
    pub fn confirmation_ratio(&self) -> f64 {
        if self.valid_lines == 0 {
            0.0
        } else {
            self.codes_confirmed as f64 / self.valid_lines as f64
        }
    }
}
