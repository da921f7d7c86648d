//! Line-oriented parsing of decompressed feeds into per-file code sets.

use std::collections::HashSet;
use std::fs::File;
use std::io::{BufRead, BufReader, Read};
use std::path::Path;

use tracing::{debug, instrument};

use crate::error::{IngestError, Result};
use crate::validator::{is_valid, ValidationRules};

/// Unique valid codes found in one feed.
pub type CodeSet = HashSet<String>;

const READ_BUFFER_BYTES: usize = 64 * 1024;

/// Per-file parse counters.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ParseStats {
    /// Lines read, including blank and invalid ones
    pub lines: u64,
    /// Lines that passed validation (before intra-file dedup)
    pub valid_lines: u64,
}

/// Result of parsing one feed.
#[derive(Debug, Default)]
pub struct ParsedFile {
    /// Unique valid codes
    pub codes: CodeSet,
    /// Line counters
    pub stats: ParseStats,
}

/// Stream `path` line by line, trim each line, and keep those that pass `rules`.
///
/// A line longer than `max_line_bytes` (excluding its `\n` or `\r\n` terminator) fails the file.
#[instrument(skip(path, rules), fields(path = %path.display()))]
pub fn parse_file(path: &Path, rules: &ValidationRules, max_line_bytes: usize) -> Result<ParsedFile> {
    let file = File::open(path).map_err(|source| IngestError::Parse {
        path: path.to_path_buf(),
        source,
    })?;
    let parsed = parse_reader(BufReader::with_capacity(READ_BUFFER_BYTES, file), path, rules, max_line_bytes)?;
    debug!(
        lines = parsed.stats.lines,
        unique = parsed.codes.len(),
        "parsed feed"
    );
    Ok(parsed)
}

/// Parse from any buffered reader. `path` is used only for error context.
pub fn parse_reader<R: BufRead>(
    mut reader: R,
    path: &Path,
    rules: &ValidationRules,
    max_line_bytes: usize,
) -> Result<ParsedFile> {
    let mut parsed = ParsedFile::default();
    let mut line = Vec::with_capacity(256);
    // Room for a `\r\n` terminator on a line of exactly `max_line_bytes`.
    let limit = (max_line_bytes as u64).saturating_add(2);

    loop {
        line.clear();
        let n = reader
            .by_ref()
            .take(limit)
            .read_until(b'\n', &mut line)
            .map_err(|source| IngestError::Parse {
                path: path.to_path_buf(),
                source,
            })?;
        if n == 0 {
            break;
        }
        parsed.stats.lines += 1;

        if line.last() == Some(&b'\n') {
            line.pop();
            if line.last() == Some(&b'\r') {
                line.pop();
            }
        }
        if line.len() > max_line_bytes {
            return Err(IngestError::LineTooLong {
                path: path.to_path_buf(),
                line: parsed.stats.lines,
                limit: max_line_bytes,
            });
        }

        let text = String::from_utf8_lossy(&line);
        let code = text.trim();
        if is_valid(code, rules) {
            parsed.stats.valid_lines += 1;
            if !parsed.codes.contains(code) {
                parsed.codes.insert(code.to_owned());
            }
        }
    }

    Ok(parsed)
}
