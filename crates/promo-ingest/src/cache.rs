//! Content-hash guard that lets a rerun over unchanged feeds skip the merge.
//!
//! The digest covers every setting that can change which codes a feed yields
//! (validation rules, line cap, file extensions) and the raw bytes of every
//! source in configured order. Only runs that merged every feed are cached.
//! Two files live in the cache directory: the confirmed set
//! (`promo_cache.json`) and the digest it belongs to (`promo_hash.txt`).
//! The set is written before the digest, so a crash between the two leaves a
//! stale digest that simply misses.

use std::collections::HashSet;
use std::fs::{self, File};
use std::io::{self, BufReader, Write};
use std::path::{Path, PathBuf};

use serde::Serialize;
use sha2::{Digest, Sha256};
use tracing::{debug, warn};

use crate::config::IngestConfig;
use crate::error::{IngestError, Result};
use crate::validator::ValidationRules;

/// Digest file name inside the cache directory.
pub const HASH_FILE: &str = "promo_hash.txt";
/// Confirmed-set file name inside the cache directory.
pub const CODES_FILE: &str = "promo_cache.json";

/// Settings folded into the digest alongside the source bytes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DigestParams {
    /// Validation applied to every line
    pub rules: ValidationRules,
    /// Longest accepted line
    pub max_line_bytes: usize,
    /// Extension stripped from each source
    pub source_ext: String,
    /// Extension appended to each decompressed sibling
    pub dest_ext: String,
}

impl DigestParams {
    /// Take the digest inputs from a run configuration.
    pub fn from_config(config: &IngestConfig) -> Self {
        Self {
            rules: config.validation.clone(),
            max_line_bytes: config.max_line_bytes,
            source_ext: config.source_ext.clone(),
            dest_ext: config.dest_ext.clone(),
        }
    }
}

/// Hex SHA-256 over `params` and the contents of `sources`.
pub fn content_hash<P: AsRef<Path>>(params: &DigestParams, sources: &[P]) -> Result<String> {
    let mut hasher = Sha256::new();
    let params_json = serde_json::to_vec(params).map_err(|e| IngestError::Cache(e.to_string()))?;
    hasher.update((params_json.len() as u64).to_le_bytes());
    hasher.update(&params_json);

    for source in sources {
        let source = source.as_ref();
        let file = File::open(source)?;
        hasher.update(file.metadata()?.len().to_le_bytes());
        io::copy(&mut BufReader::new(file), &mut hasher)?;
    }
    Ok(hex::encode(hasher.finalize()))
}

/// Digest-keyed store for the last confirmed set.
#[derive(Debug, Clone)]
pub struct ContentCache {
    dir: PathBuf,
}

impl ContentCache {
    /// Cache rooted at `dir`. Nothing is touched until [`ContentCache::save`].
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    /// Path of the stored digest.
    pub fn hash_path(&self) -> PathBuf {
        self.dir.join(HASH_FILE)
    }

    /// Path of the stored confirmed set.
    pub fn codes_path(&self) -> PathBuf {
        self.dir.join(CODES_FILE)
    }

    /// Cached codes if the stored digest equals `hash`.
    ///
    /// Missing, unreadable or corrupt cache files are treated as a miss.
    pub fn load(&self, hash: &str) -> Option<Vec<String>> {
        let stored = match fs::read_to_string(self.hash_path()) {
            Ok(s) => s,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return None,
            Err(e) => {
                warn!(error = %e, "unreadable cache digest, ignoring cache");
                return None;
            }
        };
        if stored.trim() != hash {
            debug!("cache digest differs");
            return None;
        }

        let raw = match fs::read(self.codes_path()) {
            Ok(raw) => raw,
            Err(e) => {
                warn!(error = %e, "cache digest matches but codes are unreadable");
                return None;
            }
        };
        match serde_json::from_slice::<Vec<String>>(&raw) {
            Ok(codes) => Some(codes),
            Err(e) => {
                warn!(error = %e, "corrupt cached codes, ignoring cache");
                None
            }
        }
    }

    /// Persist `codes` then `hash`, each through an atomic rename.
    pub fn save(&self, hash: &str, codes: &HashSet<String>) -> Result<()> {
        fs::create_dir_all(&self.dir)
            .map_err(|e| IngestError::Cache(format!("create {}: {}", self.dir.display(), e)))?;

        let mut sorted: Vec<&String> = codes.iter().collect();
        sorted.sort_unstable();
        let body = serde_json::to_vec(&sorted).map_err(|e| IngestError::Cache(e.to_string()))?;

        self.write_atomic(CODES_FILE, &body)?;
        self.write_atomic(HASH_FILE, hash.as_bytes())?;
        debug!(codes = sorted.len(), dir = %self.dir.display(), "cache written");
        Ok(())
    }

    fn write_atomic(&self, name: &str, body: &[u8]) -> Result<()> {
        let wrap = |e: io::Error| IngestError::Cache(format!("write {}: {}", name, e));
        let mut tmp = tempfile::Builder::new()
            .prefix(".promo-cache-")
            .tempfile_in(&self.dir)
            .map_err(wrap)?;
        tmp.write_all(body).map_err(wrap)?;
        tmp.as_file().sync_all().map_err(wrap)?;
        tmp.persist(self.dir.join(name)).map_err(|e| wrap(e.error))?;
        Ok(())
    }
}
