//! Ingest pipeline: decompress → parse (fan-out) → merge (fan-in) → flush

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tracing::{debug, info, instrument, warn};

use crate::cache::{content_hash, ContentCache, DigestParams};
use crate::config::{ErrorPolicy, IngestConfig, MAX_FILES};
use crate::decompress::{decompress_all, Decompressor};
use crate::error::{IngestError, Result};
use crate::flusher::Flusher;
use crate::merger::{FileResult, MergeOutcome, Merger};
use crate::metrics::{IngestMetrics, MetricsSnapshot};
use crate::parser::parse_file;
use crate::source::{find_duplicate, SourceFile};
use crate::store::MembershipStore;

/// Outcome of one successful run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IngestReport {
    /// Codes now guaranteed to be in the exact set
    pub confirmed: usize,
    /// Feeds dropped under the tolerant policy
    pub files_failed: usize,
    /// The content-hash cache matched and the merge was skipped
    pub cache_hit: bool,
    /// Wall time of the run in microseconds
    pub elapsed_us: u64,
    /// Counters at the end of the run
    pub metrics: MetricsSnapshot,
}

impl IngestReport {
    /// Wall time of the run.
    pub fn elapsed(&self) -> Duration {
        Duration::from_micros(self.elapsed_us)
    }
}

/// The ingest pipeline bound to one configuration and one membership store.
pub struct IngestPipeline<S: MembershipStore + ?Sized> {
    config: IngestConfig,
    flusher: Flusher<S>,
    decompressor: Arc<Decompressor>,
    metrics: IngestMetrics,
}

impl<S: MembershipStore + ?Sized> IngestPipeline<S> {
    /// Pipeline writing to `store` under `config`.
    pub fn new(config: IngestConfig, store: Arc<S>) -> Self {
        let flusher = Flusher::new(store, config.filter_key.clone(), config.set_key.clone());
        Self {
            config,
            flusher,
            decompressor: Arc::new(Decompressor::default()),
            metrics: IngestMetrics::new(),
        }
    }

    /// Configuration in use.
    pub fn config(&self) -> &IngestConfig {
        &self.config
    }

    /// Live counters.
    pub fn metrics(&self) -> &IngestMetrics {
        &self.metrics
    }

    /// Run over `sources`. On success every code that validated in two or more
    /// of them is in the store's exact set.
    #[instrument(skip(self, sources), fields(files = sources.len()))]
    pub async fn run(&self, sources: &[PathBuf]) -> Result<IngestReport> {
        let started = Instant::now();
        if sources.is_empty() || sources.len() > MAX_FILES {
            return Err(IngestError::Config(format!(
                "expected between 1 and {} feeds, got {}",
                MAX_FILES,
                sources.len()
            )));
        }
        let files = SourceFile::from_paths(sources, &self.config.source_ext, &self.config.dest_ext);
        if let Some(dup) = find_duplicate(&files) {
            return Err(IngestError::Config(format!(
                "feed {} is listed more than once",
                dup.source.display()
            )));
        }

        let cache = self.config.cache.as_ref().map(|c| ContentCache::new(&c.dir));
        let digest = if cache.is_some() {
            self.digest(sources).await
        } else {
            None
        };

        if let (Some(cache), Some(digest)) = (&cache, &digest) {
            if let Some(codes) = cache.load(digest) {
                info!(codes = codes.len(), "feeds unchanged, replaying cached set");
                self.replay(&codes).await?;
                return Ok(self.report(codes.len(), 0, true, started));
            }
        }

        let outcome = self.ingest(files).await?;

        if let (Some(cache), Some(digest)) = (&cache, &digest) {
            if outcome.files_failed > 0 {
                info!(
                    files_failed = outcome.files_failed,
                    "feeds were dropped, not caching a partial result"
                );
            } else if let Err(e) = cache.save(digest, &outcome.confirmed) {
                warn!(error = %e, "failed to write content cache");
            }
        }

        let report = self.report(outcome.confirmed.len(), outcome.files_failed, false, started);
        info!(
            confirmed = report.confirmed,
            files_failed = report.files_failed,
            elapsed_us = report.elapsed_us,
            "ingest complete"
        );
        Ok(report)
    }

    async fn ingest(&self, files: Vec<SourceFile>) -> Result<MergeOutcome> {
        let policy = self.config.error_policy();
        let total = files.len();
        let workers = self.config.effective_decompress_workers();

        let decompressed = decompress_all(self.decompressor.clone(), files, workers).await;
        let mut ready = Vec::with_capacity(decompressed.len());
        let mut first_error = None;
        for (file, result) in decompressed {
            match result {
                Ok(outcome) => {
                    self.metrics.record_decompress(outcome);
                    ready.push(file);
                }
                Err(e) => {
                    self.metrics.record_file_failed();
                    warn!(path = %file.source.display(), error = %e, "decompression failed");
                    if first_error.is_none() {
                        first_error = Some(e);
                    }
                }
            }
        }
        let dropped = total - ready.len();

        if let Some(e) = first_error {
            if policy == ErrorPolicy::FailFast {
                return Err(e);
            }
        }
        if ready.is_empty() {
            warn!("no feeds left to merge, nothing flushed");
            return Ok(MergeOutcome {
                files_failed: dropped,
                ..MergeOutcome::default()
            });
        }

        let expected = ready.len();
        let (tx, rx) = mpsc::channel(expected);
        // Dropping the set on an early return aborts parsers that have not started.
        let mut parsers = JoinSet::new();
        for file in ready {
            let tx = tx.clone();
            let rules = self.config.validation.clone();
            let max_line_bytes = self.config.max_line_bytes;
            parsers.spawn_blocking(move || {
                let result = parse_file(&file.decompressed, &rules, max_line_bytes);
                // The merger may already have aborted; nothing to report then.
                let _ = tx.blocking_send(FileResult { file, result });
            });
        }
        drop(tx);

        let merger = Merger::new(self.config.batch_size);
        let mut outcome = merger
            .run(rx, expected, &self.flusher, policy, &self.metrics)
            .await?;
        outcome.files_failed += dropped;

        while let Some(joined) = parsers.join_next().await {
            if let Err(e) = joined {
                debug!(error = %e, "parse worker ended abnormally");
            }
        }
        Ok(outcome)
    }

    /// Push a cached confirmed set back through the flusher.
    async fn replay(&self, codes: &[String]) -> Result<()> {
        for batch in codes.chunks(self.config.batch_size.max(1)) {
            let outcome = self.flusher.flush(batch).await?;
            self.metrics.record_flush(&outcome);
        }
        Ok(())
    }

    /// Content digest of the sources, or `None` when it cannot be computed.
    async fn digest(&self, sources: &[PathBuf]) -> Option<String> {
        let params = DigestParams::from_config(&self.config);
        let paths = sources.to_vec();
        let hashed = tokio::task::spawn_blocking(move || content_hash(&params, &paths)).await;
        match hashed {
            Ok(Ok(digest)) => Some(digest),
            Ok(Err(e)) => {
                warn!(error = %e, "could not hash feeds, cache disabled for this run");
                None
            }
            Err(e) => {
                warn!(error = %e, "hash task failed, cache disabled for this run");
                None
            }
        }
    }

    fn report(&self, confirmed: usize, files_failed: usize, cache_hit: bool, started: Instant) -> IngestReport {
        IngestReport {
            confirmed,
            files_failed,
            cache_hit,
            elapsed_us: started.elapsed().as_micros() as u64,
            metrics: self.metrics.snapshot(),
        }
    }
}

/// Run the pipeline once over `files` with `config` against `store`.
pub async fn process_coupons<S, P>(files: &[P], config: &IngestConfig, store: Arc<S>) -> Result<IngestReport>
where
    S: MembershipStore + ?Sized,
    P: AsRef<Path>,
{
    let sources: Vec<PathBuf> = files.iter().map(|p| p.as_ref().to_path_buf()).collect();
    IngestPipeline::new(config.clone(), store).run(&sources).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CacheConfig;
    use crate::error::StoreError;
    use crate::flusher::tests::FaultyStore;
    use crate::store::MemoryMembershipStore;
    use flate2::write::GzEncoder;
    use flate2::Compression;
    use std::collections::HashSet;
    use std::io::Write;
    use tempfile::TempDir;

    fn gz(dir: &Path, name: &str, lines: &[&str]) -> PathBuf {
        let path = dir.join(name);
        let mut enc = GzEncoder::new(std::fs::File::create(&path).unwrap(), Compression::default());
        for line in lines {
            writeln!(enc, "{line}").unwrap();
        }
        enc.finish().unwrap();
        path
    }

    fn config(files: &[PathBuf]) -> IngestConfig {
        IngestConfig {
            files: files.to_vec(),
            batch_size: 100,
            ..IngestConfig::default()
        }
    }

    fn set(items: &[&str]) -> HashSet<String> {
        items.iter().map(|s| s.to_string()).collect()
    }

    fn three_feeds(dir: &Path) -> Vec<PathBuf> {
        vec![
            gz(dir, "f1.gz", &["ABCD1234", "XXXX9999", "  ab  ", "XXXX9999"]),
            gz(dir, "f2.gz", &["ABCD1234", "YYYY0000", "THIS-CODE"]),
            gz(dir, "f3.gz", &["  ABCD1234\t", "YYYY0000", ""]),
        ]
    }

    #[tokio::test]
    async fn test_end_to_end() {
        let dir = TempDir::new().unwrap();
        let files = three_feeds(dir.path());
        let store = Arc::new(MemoryMembershipStore::new());

        let report = process_coupons(&files, &config(&files), store.clone()).await.unwrap();

        assert_eq!(store.members("promo:codes").await, set(&["ABCD1234", "YYYY0000"]));
        assert!(store.filter_contains("promo:bloom", "YYYY0000").await.unwrap());
        assert_eq!(report.confirmed, 2);
        assert!(!report.cache_hit);
        assert_eq!(report.metrics.files_decompressed, 3);
        assert_eq!(report.metrics.files_merged, 3);
        assert_eq!(report.metrics.codes_flushed, 2);
        assert!(dir.path().join("f1").exists());
    }

    #[tokio::test]
    async fn test_rerun_is_idempotent() {
        let dir = TempDir::new().unwrap();
        let files = three_feeds(dir.path());
        let store = Arc::new(MemoryMembershipStore::new());

        process_coupons(&files, &config(&files), store.clone()).await.unwrap();
        let second = process_coupons(&files, &config(&files), store.clone()).await.unwrap();

        assert_eq!(second.metrics.files_skipped, 3);
        assert_eq!(second.metrics.files_decompressed, 0);
        assert_eq!(store.members("promo:codes").await, set(&["ABCD1234", "YYYY0000"]));
    }

    #[tokio::test]
    async fn test_corrupt_feed_fails_without_tolerance() {
        let dir = TempDir::new().unwrap();
        let mut files = three_feeds(dir.path());
        let bad = dir.path().join("bad.gz");
        std::fs::write(&bad, b"definitely not gzip").unwrap();
        files[2] = bad;
        let store = Arc::new(MemoryMembershipStore::new());

        let err = process_coupons(&files, &config(&files), store.clone()).await.unwrap_err();
        assert!(matches!(err, IngestError::Decompress { .. }));
        assert_eq!(store.set_len("promo:codes").await, 0);
        assert!(!dir.path().join("bad").exists());
    }

    #[tokio::test]
    async fn test_corrupt_feed_dropped_with_tolerance() {
        let dir = TempDir::new().unwrap();
        let mut files = three_feeds(dir.path());
        let bad = dir.path().join("bad.gz");
        std::fs::write(&bad, b"definitely not gzip").unwrap();
        files[2] = bad;
        let store = Arc::new(MemoryMembershipStore::new());
        let mut cfg = config(&files);
        cfg.ignore_errors = true;

        let report = process_coupons(&files, &cfg, store.clone()).await.unwrap();
        assert_eq!(report.files_failed, 1);
        assert_eq!(store.members("promo:codes").await, set(&["ABCD1234"]));
    }

    #[tokio::test]
    async fn test_all_feeds_dropped_flushes_nothing() {
        let dir = TempDir::new().unwrap();
        let files = vec![dir.path().join("missing1.gz"), dir.path().join("missing2.gz")];
        let store = Arc::new(FaultyStore::new(None, None));
        let mut cfg = config(&files);
        cfg.ignore_errors = true;

        let report = process_coupons(&files, &cfg, store.clone()).await.unwrap();
        assert_eq!(report.confirmed, 0);
        assert_eq!(report.files_failed, 2);
        assert!(store.calls.lock().await.is_empty());
    }

    #[tokio::test]
    async fn test_oversized_line_fails_only_that_feed() {
        let dir = TempDir::new().unwrap();
        let long = "A".repeat(512);
        let files = vec![
            gz(dir.path(), "f1.gz", &["ABCD1234"]),
            gz(dir.path(), "f2.gz", &["ABCD1234"]),
            gz(dir.path(), "f3.gz", &["ABCD1234", &long]),
        ];
        let store = Arc::new(MemoryMembershipStore::new());
        let mut cfg = config(&files);
        cfg.max_line_bytes = 64;

        let err = process_coupons(&files, &cfg, store.clone()).await.unwrap_err();
        assert!(matches!(err, IngestError::LineTooLong { .. }));

        cfg.ignore_errors = true;
        let report = process_coupons(&files, &cfg, store.clone()).await.unwrap();
        assert_eq!(report.files_failed, 1);
        assert_eq!(store.members("promo:codes").await, set(&["ABCD1234"]));
    }

    #[tokio::test]
    async fn test_flush_error_is_fatal_even_when_tolerant() {
        let dir = TempDir::new().unwrap();
        let files = three_feeds(dir.path());
        let store = Arc::new(FaultyStore::new(None, Some(StoreError::Backend("READONLY".into()))));
        let mut cfg = config(&files);
        cfg.ignore_errors = true;

        let err = process_coupons(&files, &cfg, store).await.unwrap_err();
        assert!(matches!(err, IngestError::Flush { .. }));
    }

    #[tokio::test]
    async fn test_benign_filter_error_still_populates_set() {
        let dir = TempDir::new().unwrap();
        let files = three_feeds(dir.path());
        let store = Arc::new(FaultyStore::new(Some(StoreError::AlreadyExists), None));

        let report = process_coupons(&files, &config(&files), store.clone()).await.unwrap();
        assert_eq!(report.metrics.filter_duplicates, 1);
        assert_eq!(store.inner.members("promo:codes").await, set(&["ABCD1234", "YYYY0000"]));
    }

    #[tokio::test]
    async fn test_cache_hit_skips_merge_and_replays() {
        let dir = TempDir::new().unwrap();
        let files = three_feeds(dir.path());
        let mut cfg = config(&files);
        cfg.cache = Some(CacheConfig {
            dir: dir.path().join("cache"),
        });

        let first = process_coupons(&files, &cfg, Arc::new(MemoryMembershipStore::new()))
            .await
            .unwrap();
        assert!(!first.cache_hit);
        assert!(dir.path().join("cache").join(crate::cache::HASH_FILE).exists());

        let fresh = Arc::new(MemoryMembershipStore::new());
        let second = process_coupons(&files, &cfg, fresh.clone()).await.unwrap();
        assert!(second.cache_hit);
        assert_eq!(second.confirmed, 2);
        assert_eq!(second.metrics.files_merged, 0);
        assert_eq!(fresh.members("promo:codes").await, set(&["ABCD1234", "YYYY0000"]));
    }

    #[tokio::test]
    async fn test_cache_miss_after_feed_change() {
        let dir = TempDir::new().unwrap();
        let files = three_feeds(dir.path());
        let mut cfg = config(&files);
        cfg.cache = Some(CacheConfig {
            dir: dir.path().join("cache"),
        });
        process_coupons(&files, &cfg, Arc::new(MemoryMembershipStore::new()))
            .await
            .unwrap();

        gz(dir.path(), "f3.gz", &["ZZZZ7777"]);
        gz(dir.path(), "f2.gz", &["ZZZZ7777"]);
        std::fs::remove_file(dir.path().join("f2")).unwrap();
        std::fs::remove_file(dir.path().join("f3")).unwrap();

        let fresh = Arc::new(MemoryMembershipStore::new());
        let report = process_coupons(&files, &cfg, fresh.clone()).await.unwrap();
        assert!(!report.cache_hit);
        assert_eq!(fresh.members("promo:codes").await, set(&["ZZZZ7777"]));
    }

    #[tokio::test]
    async fn test_partial_run_is_not_cached() {
        let dir = TempDir::new().unwrap();
        let long = "A".repeat(512);
        let files = vec![
            gz(dir.path(), "f1.gz", &["ABCD1234", "EFGH5678"]),
            gz(dir.path(), "f2.gz", &["EFGH5678", &long]),
            gz(dir.path(), "f3.gz", &["ABCD1234"]),
        ];
        let cache_dir = dir.path().join("cache");
        let mut tolerant = config(&files);
        tolerant.ignore_errors = true;
        tolerant.max_line_bytes = 64;
        tolerant.cache = Some(CacheConfig {
            dir: cache_dir.clone(),
        });

        let first = process_coupons(&files, &tolerant, Arc::new(MemoryMembershipStore::new()))
            .await
            .unwrap();
        assert_eq!(first.confirmed, 1);
        assert_eq!(first.files_failed, 1);
        assert!(!cache_dir.join(crate::cache::HASH_FILE).exists());

        let mut strict = config(&files);
        strict.cache = tolerant.cache.clone();
        let fresh = Arc::new(MemoryMembershipStore::new());
        let second = process_coupons(&files, &strict, fresh.clone()).await.unwrap();
        assert!(!second.cache_hit);
        assert_eq!(fresh.members("promo:codes").await, set(&["ABCD1234", "EFGH5678"]));
    }

    #[tokio::test]
    async fn test_line_cap_change_misses_cache() {
        let dir = TempDir::new().unwrap();
        let files = three_feeds(dir.path());
        let mut cfg = config(&files);
        cfg.cache = Some(CacheConfig {
            dir: dir.path().join("cache"),
        });
        process_coupons(&files, &cfg, Arc::new(MemoryMembershipStore::new()))
            .await
            .unwrap();

        cfg.max_line_bytes = 1024;
        let report = process_coupons(&files, &cfg, Arc::new(MemoryMembershipStore::new()))
            .await
            .unwrap();
        assert!(!report.cache_hit);
    }

    #[tokio::test]
    async fn test_same_feed_listed_twice_is_rejected() {
        let dir = TempDir::new().unwrap();
        let solo = gz(dir.path(), "solo.gz", &["SOLO1234"]);
        let files = vec![solo.clone(), solo];
        let store = Arc::new(MemoryMembershipStore::new());

        let err = process_coupons(&files, &config(&files), store.clone()).await.unwrap_err();
        assert!(matches!(err, IngestError::Config(_)));
        assert_eq!(store.set_len("promo:codes").await, 0);
        assert!(!dir.path().join("solo").exists());
    }

    #[tokio::test]
    async fn test_rejects_too_many_feeds() {
        let files: Vec<PathBuf> = (0..4).map(|i| PathBuf::from(format!("/feeds/{i}.gz"))).collect();
        let store = Arc::new(MemoryMembershipStore::new());
        let err = process_coupons(&files, &IngestConfig::default(), store).await.unwrap_err();
        assert!(matches!(err, IngestError::Config(_)));
    }

    #[tokio::test]
    async fn test_batches_respect_batch_size() {
        let dir = TempDir::new().unwrap();
        let codes: Vec<String> = (0..250).map(|i| format!("CODE{i:05}")).collect();
        let refs: Vec<&str> = codes.iter().map(String::as_str).collect();
        let files = vec![gz(dir.path(), "f1.gz", &refs), gz(dir.path(), "f2.gz", &refs)];
        let store = Arc::new(FaultyStore::new(None, None));

        let report = process_coupons(&files, &config(&files), store.clone()).await.unwrap();
        let sizes: Vec<usize> = store.batches.lock().await.iter().map(Vec::len).collect();
        assert_eq!(sizes, vec![100, 100, 50]);
        assert_eq!(report.metrics.batches_flushed, 3);
    }
}
