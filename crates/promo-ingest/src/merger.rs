//! Single-consumer merge of per-file code sets.
//!
//! A code is confirmed the moment a second feed contains it. Confirmed codes
//! accumulate into a batch that is flushed synchronously whenever it reaches the
//! configured size, so a slow store applies backpressure to the merge loop.
//! All merge state is owned by the consumer; parse workers only send results.

use std::collections::hash_map::Entry;
use std::collections::{HashMap, HashSet};
use std::mem;

use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use crate::config::ErrorPolicy;
use crate::error::{IngestError, Result};
use crate::flusher::Flusher;
use crate::metrics::IngestMetrics;
use crate::parser::{CodeSet, ParsedFile};
use crate::source::SourceFile;
use crate::store::MembershipStore;

/// Number of distinct feeds that must contain a code before it is confirmed.
pub const CONFIRMATION_THRESHOLD: u8 = 2;

/// Parse result sent from a worker to the merger.
#[derive(Debug)]
pub struct FileResult {
    /// Feed the result belongs to
    pub file: SourceFile,
    /// Its code set, or why it could not be read
    pub result: Result<ParsedFile>,
}

/// Summary of a finished merge.
#[derive(Debug, Default)]
pub struct MergeOutcome {
    /// Every code confirmed during the run
    pub confirmed: HashSet<String>,
    /// Feeds folded in
    pub files_merged: usize,
    /// Feeds dropped under the tolerant policy
    pub files_failed: usize,
}

/// Cross-file occurrence counter and pending flush batch.
pub struct Merger {
    counts: HashMap<String, u8>,
    confirmed: HashSet<String>,
    batch: Vec<String>,
    batch_size: usize,
}

impl Merger {
    /// Empty merger flushing every `batch_size` confirmations (at least 1).
    pub fn new(batch_size: usize) -> Self {
        let batch_size = batch_size.max(1);
        Self {
            counts: HashMap::new(),
            confirmed: HashSet::new(),
            batch: Vec::with_capacity(batch_size),
            batch_size,
        }
    }

    /// Fold one feed's unique codes in. Returns how many codes this feed confirmed.
    ///
    /// Codes that are already confirmed are ignored so they are never batched twice.
    pub fn fold(&mut self, codes: CodeSet) -> usize {
        let mut newly_confirmed = 0;
        for code in codes {
            if self.confirmed.contains(&code) {
                continue;
            }
            match self.counts.entry(code) {
                Entry::Vacant(slot) => {
                    slot.insert(1);
                }
                Entry::Occupied(mut slot) => {
                    *slot.get_mut() += 1;
                    if *slot.get() >= CONFIRMATION_THRESHOLD {
                        let (code, _) = slot.remove_entry();
                        self.confirmed.insert(code.clone());
                        self.batch.push(code);
                        newly_confirmed += 1;
                    }
                }
            }
        }
        newly_confirmed
    }

    /// Split off exactly `batch_size` codes once that many are pending.
    pub fn take_full_batch(&mut self) -> Option<Vec<String>> {
        if self.batch.len() < self.batch_size {
            return None;
        }
        let rest = self.batch.split_off(self.batch_size);
        Some(mem::replace(&mut self.batch, rest))
    }

    /// Whatever is left in the batch, if anything.
    pub fn take_remaining(&mut self) -> Option<Vec<String>> {
        if self.batch.is_empty() {
            None
        } else {
            Some(mem::take(&mut self.batch))
        }
    }

    /// Codes seen in exactly one feed so far.
    pub fn unconfirmed(&self) -> usize {
        self.counts.len()
    }

    /// Codes confirmed so far.
    pub fn confirmed(&self) -> &HashSet<String> {
        &self.confirmed
    }

    /// Confirmed codes waiting for a flush.
    pub fn pending(&self) -> usize {
        self.batch.len()
    }

    /// Consume exactly `expected` results from `rx`, flushing as batches fill.
    ///
    /// Under [`ErrorPolicy::FailFast`] the first failed feed aborts the merge.
    /// Flush errors always abort. The final partial batch is flushed before
    /// returning.
    pub async fn run<S: MembershipStore + ?Sized>(
        mut self,
        mut rx: mpsc::Receiver<FileResult>,
        expected: usize,
        flusher: &Flusher<S>,
        policy: ErrorPolicy,
        metrics: &IngestMetrics,
    ) -> Result<MergeOutcome> {
        let mut files_merged = 0;
        let mut files_failed = 0;

        for received in 0..expected {
            let Some(FileResult { file, result }) = rx.recv().await else {
                return Err(IngestError::ChannelClosed {
                    missing: expected - received,
                });
            };

            match result {
                Ok(parsed) => {
                    metrics.record_parse(parsed.stats);
                    let unique = parsed.codes.len();
                    let confirmed = self.fold(parsed.codes);
                    metrics.record_merged_file(confirmed as u64);
                    files_merged += 1;
                    info!(
                        path = %file.decompressed.display(),
                        unique,
                        confirmed,
                        pending = self.pending(),
                        "merged feed"
                    );
                }
                Err(e) => {
                    metrics.record_file_failed();
                    match policy {
                        ErrorPolicy::FailFast => {
                            error!(path = %file.source.display(), error = %e, "feed failed, aborting");
                            return Err(e);
                        }
                        ErrorPolicy::Tolerate => {
                            warn!(path = %file.source.display(), error = %e, "feed failed, skipping");
                            files_failed += 1;
                            continue;
                        }
                    }
                }
            }

            while let Some(batch) = self.take_full_batch() {
                let outcome = flusher.flush(&batch).await?;
                metrics.record_flush(&outcome);
            }
        }

        if let Some(batch) = self.take_remaining() {
            let outcome = flusher.flush(&batch).await?;
            metrics.record_flush(&outcome);
        }

        debug!(
            confirmed = self.confirmed.len(),
            unconfirmed = self.unconfirmed(),
            "merge complete"
        );
        Ok(MergeOutcome {
            confirmed: self.confirmed,
            files_merged,
            files_failed,
        })
    }
}
