#![warn(missing_docs)]

//! Promo code ingestion: gzip feeds are decompressed, validated and merged, and every
//! code found in at least two feeds is written to a Bloom filter plus an exact set.
//!
//! Data flow: Source (.gz) → Decompress → Parse/validate (per file) → Merge (single consumer) → Flush

pub mod cache;
pub mod cli;
pub mod config;
pub mod decompress;
pub mod error;
pub mod flusher;
pub mod merger;
pub mod metrics;
pub mod parser;
pub mod pipeline;
pub mod source;
pub mod store;
pub mod validator;

pub use cache::{content_hash, ContentCache, DigestParams};
pub use config::{ErrorPolicy, IngestConfig, StoreConfig, MAX_LINE_BYTES_LIMIT};
pub use decompress::{decompress_all, DecompressOutcome, Decompressor};
pub use error::{IngestError, Result, StoreError};
pub use flusher::{FlushOutcome, Flusher};
pub use merger::{MergeOutcome, Merger, CONFIRMATION_THRESHOLD};
pub use metrics::{IngestMetrics, MetricsSnapshot};
pub use parser::{parse_file, CodeSet, ParsedFile};
pub use pipeline::{process_coupons, IngestPipeline, IngestReport};
pub use source::{collect_gzip_files, find_duplicate, SourceFile};
pub use store::{check_code, MembershipStore, MemoryMembershipStore, RedisMembershipStore};
pub use validator::{is_valid, CharClass, ValidationRules};
