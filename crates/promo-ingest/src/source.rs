//! Feed source files and their decompressed siblings.

use std::collections::HashSet;
use std::path::{Path, PathBuf};

use walkdir::WalkDir;

use crate::error::{IngestError, Result};

/// A gzip feed and the path its decompressed copy lives at.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SourceFile {
    /// Gzip-compressed feed
    pub source: PathBuf,
    /// Decompressed sibling in the same directory
    pub decompressed: PathBuf,
}

impl SourceFile {
    /// Derive the sibling by stripping `source_ext` (if present) and appending `dest_ext`.
    pub fn new(source: impl Into<PathBuf>, source_ext: &str, dest_ext: &str) -> Self {
        let source = source.into();
        let raw = source.as_os_str().to_string_lossy();
        let stem = if !source_ext.is_empty() && raw.ends_with(source_ext) {
            &raw[..raw.len() - source_ext.len()]
        } else {
            &raw[..]
        };
        let mut decompressed = stem.to_string();
        decompressed.push_str(dest_ext);
        if decompressed == raw {
            // Never decompress over the source itself.
            decompressed.push_str(".out");
        }
        Self {
            decompressed: PathBuf::from(decompressed),
            source,
        }
    }

    /// Build the ordered source list for a run.
    pub fn from_paths<P: AsRef<Path>>(paths: &[P], source_ext: &str, dest_ext: &str) -> Vec<Self> {
        paths
            .iter()
            .map(|p| Self::new(p.as_ref(), source_ext, dest_ext))
            .collect()
    }
}

/// First entry that names the same feed as an earlier one.
///
/// Sources are compared by canonical path (lexical when the file is missing)
/// and by decompressed target, so `a.gz` listed twice, or reached through
/// `..` or a symlink, counts as one feed.
pub fn find_duplicate(files: &[SourceFile]) -> Option<&SourceFile> {
    let mut sources = HashSet::new();
    let mut targets = HashSet::new();
    files.iter().find(|file| {
        let canonical = std::fs::canonicalize(&file.source).unwrap_or_else(|_| file.source.clone());
        let new_source = sources.insert(canonical);
        let new_target = targets.insert(file.decompressed.clone());
        !(new_source && new_target)
    })
}

/// Recursively collect every `.gz` file under `root`, sorted by path.
pub fn collect_gzip_files(root: &Path) -> Result<Vec<PathBuf>> {
    let mut files = Vec::new();
    for entry in WalkDir::new(root) {
        let entry = entry.map_err(|e| {
            IngestError::Io(
                e.into_io_error()
                    .unwrap_or_else(|| std::io::Error::other("directory walk failed")),
            )
        })?;
        if !entry.file_type().is_file() {
            continue;
        }
        let is_gz = entry
            .file_name()
            .to_string_lossy()
            .to_lowercase()
            .ends_with(".gz");
        if is_gz {
            files.push(entry.into_path());
        }
    }
    files.sort();
    Ok(files)
}
