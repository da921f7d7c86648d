//! Idempotent gzip decompression of feed files into sibling paths.
//!
//! Output is written to a temp file in the destination directory and renamed
//! into place, so a crash never leaves a partial file at the final path.

use std::fs::File;
use std::io::{BufReader, Read, Write};
use std::path::Path;
use std::sync::{Arc, Mutex};

use flate2::read::MultiGzDecoder;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, instrument, warn};

use crate::error::{IngestError, Result};
use crate::source::SourceFile;

/// Copy buffer size used per decompression (1 MiB).
pub const COPY_BUFFER_BYTES: usize = 1024 * 1024;
/// Read-ahead on the compressed source (4 MiB).
const SOURCE_READ_BUFFER_BYTES: usize = 4 * 1024 * 1024;

/// What `unzip` did for one source.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DecompressOutcome {
    /// Destination already existed; no work done
    Skipped,
    /// Decompressed this many bytes
    Decompressed {
        /// Bytes written to the destination
        bytes: u64,
    },
}

/// Allocation counters for a [`BufferPool`].
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct BufferPoolStats {
    /// Buffers freshly allocated
    pub alloc_count: u64,
    /// Buffers handed out again from the free list
    pub reuse_count: u64,
}

/// Free-list of copy buffers shared by decompression workers.
pub struct BufferPool {
    buffers: Mutex<Vec<Vec<u8>>>,
    stats: Mutex<BufferPoolStats>,
    buffer_size: usize,
    max_pooled: usize,
}

impl BufferPool {
    /// Pool of `buffer_size` buffers keeping at most `max_pooled` idle.
    pub fn new(buffer_size: usize, max_pooled: usize) -> Self {
        Self {
            buffers: Mutex::new(Vec::new()),
            stats: Mutex::new(BufferPoolStats::default()),
            buffer_size,
            max_pooled,
        }
    }

    /// Take an idle buffer or allocate a new one.
    pub fn acquire(&self) -> Vec<u8> {
        let reused = self
            .buffers
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .pop();
        let mut stats = self.stats.lock().unwrap_or_else(|e| e.into_inner());
        match reused {
            Some(buf) => {
                stats.reuse_count += 1;
                buf
            }
            None => {
                stats.alloc_count += 1;
                vec![0u8; self.buffer_size]
            }
        }
    }

    /// Return a buffer. Wrong-sized buffers and overflow beyond `max_pooled` are dropped.
    pub fn release(&self, buf: Vec<u8>) {
        if buf.len() != self.buffer_size {
            return;
        }
        let mut buffers = self.buffers.lock().unwrap_or_else(|e| e.into_inner());
        if buffers.len() < self.max_pooled {
            buffers.push(buf);
        }
    }

    /// Idle buffers currently held.
    pub fn pooled(&self) -> usize {
        self.buffers.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    /// Snapshot of the counters.
    pub fn stats(&self) -> BufferPoolStats {
        *self.stats.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// Gzip decompressor. Cheap to share behind an `Arc`.
pub struct Decompressor {
    pool: BufferPool,
}

impl Decompressor {
    /// `max_pooled` bounds how many idle copy buffers are kept.
    pub fn new(max_pooled: usize) -> Self {
        Self {
            pool: BufferPool::new(COPY_BUFFER_BYTES, max_pooled),
        }
    }

    /// Shared copy-buffer pool.
    pub fn pool(&self) -> &BufferPool {
        &self.pool
    }

    /// Decompress `file.source` into `file.decompressed` unless it already exists.
    #[instrument(skip(self), fields(path = %file.source.display()))]
    pub fn unzip(&self, file: &SourceFile) -> Result<DecompressOutcome> {
        let wrap = |source: std::io::Error| IngestError::Decompress {
            path: file.source.clone(),
            source,
        };

        if file.decompressed.try_exists().map_err(wrap)? {
            debug!(dest = %file.decompressed.display(), "destination exists, skipping");
            return Ok(DecompressOutcome::Skipped);
        }

        let bytes = self.unzip_atomic(&file.source, &file.decompressed).map_err(wrap)?;
        debug!(bytes, dest = %file.decompressed.display(), "decompressed");
        Ok(DecompressOutcome::Decompressed { bytes })
    }

    fn unzip_atomic(&self, src: &Path, dest: &Path) -> std::io::Result<u64> {
        let dir = match dest.parent() {
            Some(p) if !p.as_os_str().is_empty() => p,
            _ => Path::new("."),
        };
        let input = File::open(src)?;
        let mut decoder =
            MultiGzDecoder::new(BufReader::with_capacity(SOURCE_READ_BUFFER_BYTES, input));

        // Dropped (and unlinked) on any early return below.
        let mut tmp = tempfile::Builder::new()
            .prefix(".promo-")
            .suffix(".tmp")
            .tempfile_in(dir)?;

        let mut buf = self.pool.acquire();
        let copied = copy_with(&mut decoder, tmp.as_file_mut(), &mut buf);
        self.pool.release(buf);
        let bytes = copied?;

        tmp.as_file_mut().flush()?;
        tmp.as_file().sync_all()?;
        tmp.persist(dest).map_err(|e| e.error)?;
        Ok(bytes)
    }
}

impl Default for Decompressor {
    fn default() -> Self {
        Self::new(8)
    }
}

fn copy_with<R: Read, W: Write>(reader: &mut R, writer: &mut W, buf: &mut [u8]) -> std::io::Result<u64> {
    let mut total = 0u64;
    loop {
        let n = match reader.read(buf) {
            Ok(0) => return Ok(total),
            Ok(n) => n,
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        };
        writer.write_all(&buf[..n])?;
        total += n as u64;
    }
}

/// Decompress every file with at most `workers` running at once.
///
/// A failure never cancels other files; results come back in input order.
pub async fn decompress_all(
    decompressor: Arc<Decompressor>,
    files: Vec<SourceFile>,
    workers: usize,
) -> Vec<(SourceFile, Result<DecompressOutcome>)> {
    let permits = Arc::new(Semaphore::new(workers.max(1)));
    let mut tasks = JoinSet::new();

    for (idx, file) in files.iter().cloned().enumerate() {
        let permits = permits.clone();
        let decompressor = decompressor.clone();
        tasks.spawn(async move {
            let result = match permits.acquire_owned().await {
                Ok(_permit) => {
                    let job_file = file.clone();
                    tokio::task::spawn_blocking(move || decompressor.unzip(&job_file))
                        .await
                        .unwrap_or_else(|e| {
                            Err(IngestError::Decompress {
                                path: file.source.clone(),
                                source: std::io::Error::other(e.to_string()),
                            })
                        })
                }
                Err(_) => Err(IngestError::Decompress {
                    path: file.source.clone(),
                    source: std::io::Error::other("worker pool closed"),
                }),
            };
            (idx, result)
        });
    }

    let mut slots: Vec<Option<Result<DecompressOutcome>>> = files.iter().map(|_| None).collect();
    while let Some(joined) = tasks.join_next().await {
        match joined {
            Ok((idx, result)) => slots[idx] = Some(result),
            Err(e) => warn!(error = %e, "decompression task panicked"),
        }
    }

    files
        .into_iter()
        .zip(slots)
        .map(|(file, slot)| {
            let result = slot.unwrap_or_else(|| {
                Err(IngestError::Decompress {
                    path: file.source.clone(),
                    source: std::io::Error::other("decompression task did not complete"),
                })
            });
            (file, result)
        })
        .collect()
}
