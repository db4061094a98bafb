//! Shared constants for the extraction and windowing pipeline.

/// Rows read from the edge stream per chunk.
pub const DEFAULT_CHUNK_SIZE: usize = 50_000;
/// Most recent records kept per entity per direction (K).
pub const DEFAULT_WINDOW_LEN: usize = 50;
/// Edge feature columns per record.
pub const DEFAULT_FEATURE_WIDTH: usize = 95;
/// Chunks between scan checkpoints.
pub const DEFAULT_SCAN_CHECKPOINT_EVERY: u64 = 1_000;
/// Entities between sequence checkpoints.
pub const DEFAULT_SEQUENCE_CHECKPOINT_EVERY: u64 = 10_000;
pub const DEFAULT_PROGRESS_EVERY_CHUNKS: u64 = 100;
pub const DEFAULT_PROGRESS_EVERY_ENTITIES: u64 = 10_000;

/// Inbound spools sampled when estimating the temporal key bound.
pub const DEFAULT_TEMPORAL_SAMPLE_SPOOLS: usize = 100;
/// Multiplicative safety margin applied to a sampled bound.
pub const DEFAULT_TEMPORAL_MARGIN: f64 = 1.1;
/// Bound used when sampling finds no records at all.
pub const FALLBACK_MAX_TEMPORAL_KEY: u64 = 800_000_000;

/// Spool files are spread over this many subdirectories per direction.
pub const SPOOL_SHARDS: u64 = 256;
/// Sequence bundles per output subdirectory.
pub const SEQUENCE_SHARD_WIDTH: u32 = 10_000;

pub const SPOOL_MAGIC: [u8; 4] = *b"ESP1";
pub const SPOOL_VERSION: u16 = 1;
/// `[magic: 4][version: 2][direction: 1][reserved: 1][feature_width: 4][entity: 8]`
pub const SPOOL_HEADER_SIZE: usize = 20;
/// Truncated blake3 digest stored after each spool record.
pub const SPOOL_RECORD_CHECKSUM_LEN: usize = 8;

pub const CHECKPOINT_MAGIC: [u8; 4] = *b"ECK1";
pub const CHECKPOINT_VERSION: u16 = 1;

pub const SPOOL_DIR: &str = "spools";
pub const CHECKPOINT_DIR: &str = "checkpoints";
pub const SEQUENCE_DIR: &str = "sequences";
pub const SCAN_CHECKPOINT_FILE: &str = "scan.ckpt";
pub const SEQUENCE_CHECKPOINT_FILE: &str = "sequence.ckpt";
pub const LOCK_FILE: &str = ".edgeseq.lock";
pub const SUMMARY_FILE: &str = "summary.json";
