//! Ingest configuration

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{IngestError, Result};
use crate::source::{find_duplicate, SourceFile};
use crate::validator::ValidationRules;

/// Maximum number of feed files a run may name.
pub const MAX_FILES: usize = 3;
/// Smallest accepted flush batch.
pub const MIN_BATCH_SIZE: usize = 100;
/// Largest accepted flush batch.
pub const MAX_BATCH_SIZE: usize = 10_000;
/// Default cap on a single feed line (4 MiB).
pub const DEFAULT_MAX_LINE_BYTES: usize = 4 * 1024 * 1024;
/// Largest accepted line cap (1 GiB).
pub const MAX_LINE_BYTES_LIMIT: usize = 1024 * 1024 * 1024;

/// Remote membership store connection settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct StoreConfig {
    /// Redis URL, e.g. `redis://127.0.0.1:6379/0`
    pub url: String,
    /// Connection attempts before giving up (at least 1)
    pub connect_retries: u32,
    /// Base delay between attempts; doubles each retry
    pub retry_interval_ms: u64,
    /// Deadline for every store call
    pub op_timeout_ms: u64,
}

impl StoreConfig {
    /// Base reconnect delay.
    pub fn retry_interval(&self) -> Duration {
        Duration::from_millis(self.retry_interval_ms)
    }

    /// Per-call deadline.
    pub fn op_timeout(&self) -> Duration {
        Duration::from_millis(self.op_timeout_ms)
    }
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            url: "redis://127.0.0.1:6379/0".to_string(),
            connect_retries: 3,
            retry_interval_ms: 500,
            op_timeout_ms: 5_000,
        }
    }
}

/// Content-hash cache location.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CacheConfig {
    /// Directory holding the digest and the cached confirmed set
    pub dir: PathBuf,
}

/// How decompress and parse failures of individual feeds are treated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorPolicy {
    /// First failure aborts the run
    FailFast,
    /// Failed feeds are logged and dropped; the run continues with the rest
    Tolerate,
}

impl ErrorPolicy {
    /// `Tolerate` when `ignore_errors` is set.
    pub fn from_ignore_errors(ignore_errors: bool) -> Self {
        if ignore_errors {
            ErrorPolicy::Tolerate
        } else {
            ErrorPolicy::FailFast
        }
    }
}

/// Log output format for the binary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// Human-readable lines
    #[default]
    Text,
    /// One JSON object per event
    Json,
}

/// Everything one ingest run needs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct IngestConfig {
    /// Gzip feeds, in order (1..=3 distinct entries)
    pub files: Vec<PathBuf>,
    /// Confirmed codes per flush (100..=10000)
    pub batch_size: usize,
    /// Rules every code must pass
    pub validation: ValidationRules,
    /// Drop failing feeds instead of aborting
    pub ignore_errors: bool,
    /// Store key of the probabilistic filter
    pub filter_key: String,
    /// Store key of the exact set
    pub set_key: String,
    /// Extension stripped from each source
    pub source_ext: String,
    /// Extension appended to each decompressed sibling
    pub dest_ext: String,
    /// Longest accepted line, terminator excluded
    pub max_line_bytes: usize,
    /// Override for the decompression worker limit
    pub decompress_workers: Option<usize>,
    /// Remote store connection
    pub store: StoreConfig,
    /// Optional content-hash cache
    pub cache: Option<CacheConfig>,
    /// Default log filter when `RUST_LOG` is unset
    pub log_level: String,
    /// Log output format
    pub log_format: LogFormat,
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self {
            files: Vec::new(),
            batch_size: 1_000,
            validation: ValidationRules::default(),
            ignore_errors: false,
            filter_key: "promo:bloom".to_string(),
            set_key: "promo:codes".to_string(),
            source_ext: ".gz".to_string(),
            dest_ext: String::new(),
            max_line_bytes: DEFAULT_MAX_LINE_BYTES,
            decompress_workers: None,
            store: StoreConfig::default(),
            cache: None,
            log_level: "info".to_string(),
            log_format: LogFormat::Text,
        }
    }
}

impl IngestConfig {
    /// Load and validate a config file. The decoder is chosen by extension.
    pub fn from_file(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        let ext = path
            .extension()
            .and_then(|e| e.to_str())
            .unwrap_or_default();

        let config: IngestConfig = match ext.to_lowercase().as_str() {
            "toml" => toml::from_str(&contents).map_err(|e| IngestError::Config(e.to_string()))?,
            "json" => {
                serde_json::from_str(&contents).map_err(|e| IngestError::Config(e.to_string()))?
            }
            "yaml" | "yml" => {
                serde_yaml::from_str(&contents).map_err(|e| IngestError::Config(e.to_string()))?
            }
            _ => {
                return Err(IngestError::Config(format!(
                    "unsupported config file extension: {:?}",
                    ext
                )))
            }
        };
        config.validate()?;
        Ok(config)
    }

    /// Policy derived from `ignore_errors`.
    pub fn error_policy(&self) -> ErrorPolicy {
        ErrorPolicy::from_ignore_errors(self.ignore_errors)
    }

    /// Bounded worker limit for decompression: `max(1, cores / 2)` unless overridden.
    pub fn effective_decompress_workers(&self) -> usize {
        match self.decompress_workers {
            Some(n) => n.max(1),
            None => default_decompress_workers(),
        }
    }

    /// Check every bound; the first violation is returned as [`IngestError::Config`].
    pub fn validate(&self) -> Result<()> {
        let invalid = |reason: String| Err(IngestError::Config(reason));

        if self.files.is_empty() || self.files.len() > MAX_FILES {
            return invalid(format!(
                "files must name between 1 and {} feeds, got {}",
                MAX_FILES,
                self.files.len()
            ));
        }
        let sources = SourceFile::from_paths(&self.files, &self.source_ext, &self.dest_ext);
        if let Some(dup) = find_duplicate(&sources) {
            return invalid(format!("feed {} is listed more than once", dup.source.display()));
        }
        if !(MIN_BATCH_SIZE..=MAX_BATCH_SIZE).contains(&self.batch_size) {
            return invalid(format!(
                "batch_size must be within {}..={}, got {}",
                MIN_BATCH_SIZE, MAX_BATCH_SIZE, self.batch_size
            ));
        }

        let rules = &self.validation;
        if rules.min_length < 1 {
            return invalid("validation.min_length must be at least 1".to_string());
        }
        if rules.min_length > rules.max_length {
            return invalid(format!(
                "validation.min_length ({}) cannot be greater than max_length ({})",
                rules.min_length, rules.max_length
            ));
        }
        if !rules.allowed_characters.is_recognized() {
            return invalid("validation.allowed_characters is not a known class".to_string());
        }

        if self.filter_key.is_empty() {
            return invalid("filter_key cannot be empty".to_string());
        }
        if self.set_key.is_empty() {
            return invalid("set_key cannot be empty".to_string());
        }
        if self.max_line_bytes == 0 || self.max_line_bytes > MAX_LINE_BYTES_LIMIT {
            return invalid(format!(
                "max_line_bytes must be within 1..={}, got {}",
                MAX_LINE_BYTES_LIMIT, self.max_line_bytes
            ));
        }
        if self.decompress_workers == Some(0) {
            return invalid("decompress_workers must be greater than 0".to_string());
        }
        if self.store.connect_retries < 1 {
            return invalid("store.connect_retries must be at least 1".to_string());
        }
        if self.store.op_timeout_ms == 0 {
            return invalid("store.op_timeout_ms must be greater than 0".to_string());
        }

        Ok(())
    }
}

/// `max(1, available_parallelism / 2)`
pub fn default_decompress_workers() -> usize {
    let cores = std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1);
    (cores / 2).max(1)
}
