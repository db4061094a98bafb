//! Builder-style configuration for a pipeline run.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::constants::{
    DEFAULT_CHUNK_SIZE, DEFAULT_FEATURE_WIDTH, DEFAULT_PROGRESS_EVERY_CHUNKS,
    DEFAULT_PROGRESS_EVERY_ENTITIES, DEFAULT_SCAN_CHECKPOINT_EVERY,
    DEFAULT_SEQUENCE_CHECKPOINT_EVERY, DEFAULT_TEMPORAL_MARGIN, DEFAULT_TEMPORAL_SAMPLE_SPOOLS,
    DEFAULT_WINDOW_LEN,
};
use crate::error::{PipelineError, Result};

fn default_true() -> bool {
    true
}

fn default_chunk_size() -> usize {
    DEFAULT_CHUNK_SIZE
}

fn default_window_len() -> usize {
    DEFAULT_WINDOW_LEN
}

fn default_feature_width() -> usize {
    DEFAULT_FEATURE_WIDTH
}

fn default_scan_checkpoint_every() -> u64 {
    DEFAULT_SCAN_CHECKPOINT_EVERY
}

fn default_sequence_checkpoint_every() -> u64 {
    DEFAULT_SEQUENCE_CHECKPOINT_EVERY
}

fn default_progress_every_chunks() -> u64 {
    DEFAULT_PROGRESS_EVERY_CHUNKS
}

fn default_progress_every_entities() -> u64 {
    DEFAULT_PROGRESS_EVERY_ENTITIES
}

/// How the global normalisation bound for `txId` is chosen.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "strategy", rename_all = "snake_case")]
pub enum TemporalKeyStrategy {
    /// A known upper bound on every `txId`.
    Fixed { max: u64 },
    /// Largest `txId` among the first `sample_spools` non-empty inbound spools
    /// (dense index order), times `margin`.
    Sampled { sample_spools: usize, margin: f64 },
    /// Largest `txId` routed during extraction, times `margin`.
    Observed { margin: f64 },
}

impl Default for TemporalKeyStrategy {
    fn default() -> Self {
        Self::Observed { margin: 1.0 }
    }
}

impl TemporalKeyStrategy {
    /// Sample the first 100 non-empty inbound spools with a 10% margin.
    #[must_use]
    pub fn sampled() -> Self {
        Self::Sampled {
            sample_spools: DEFAULT_TEMPORAL_SAMPLE_SPOOLS,
            margin: DEFAULT_TEMPORAL_MARGIN,
        }
    }
}

/// What to do when a `txId` exceeds the temporal key bound.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OverflowPolicy {
    /// Fail the entity; it is retried on the next run.
    #[default]
    Reject,
    /// Clamp the proxy to 1.0 and count it.
    Clamp,
}

/// Options for one pipeline run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineConfig {
    /// Edge stream: `src,dst,txId,feat_1..feat_F` with a header row.
    pub stream_path: PathBuf,
    /// Upstream entity index artifact; optional when the index is supplied in memory.
    #[serde(default)]
    pub index_path: Option<PathBuf>,
    /// Holds spools, checkpoints, sequences and the run summary.
    pub work_dir: PathBuf,
    #[serde(default = "default_chunk_size")]
    pub chunk_size: usize,
    #[serde(default = "default_window_len")]
    pub window_len: usize,
    #[serde(default = "default_feature_width")]
    pub feature_width: usize,
    /// Chunks between scan checkpoints. Up to `scan_checkpoint_every - 1` chunks are
    /// replayed after a crash; replays are de-duplicated on spool read.
    #[serde(default = "default_scan_checkpoint_every")]
    pub scan_checkpoint_every: u64,
    #[serde(default = "default_sequence_checkpoint_every")]
    pub sequence_checkpoint_every: u64,
    #[serde(default)]
    pub temporal_key: TemporalKeyStrategy,
    #[serde(default)]
    pub overflow_policy: OverflowPolicy,
    /// fsync spool appends before the checkpoint that covers them.
    #[serde(default = "default_true")]
    pub sync_spools: bool,
    /// Keep spools once their entity is finalized.
    #[serde(default = "default_true")]
    pub retain_spools: bool,
    #[serde(default = "default_progress_every_chunks")]
    pub progress_every_chunks: u64,
    #[serde(default = "default_progress_every_entities")]
    pub progress_every_entities: u64,
}

impl PipelineConfig {
    /// Start a fluent builder with every tunable at its default.
    pub fn builder<S: Into<PathBuf>, W: Into<PathBuf>>(
        stream_path: S,
        work_dir: W,
    ) -> PipelineConfigBuilder {
        PipelineConfigBuilder {
            inner: Self {
                stream_path: stream_path.into(),
                index_path: None,
                work_dir: work_dir.into(),
                chunk_size: DEFAULT_CHUNK_SIZE,
                window_len: DEFAULT_WINDOW_LEN,
                feature_width: DEFAULT_FEATURE_WIDTH,
                scan_checkpoint_every: DEFAULT_SCAN_CHECKPOINT_EVERY,
                sequence_checkpoint_every: DEFAULT_SEQUENCE_CHECKPOINT_EVERY,
                temporal_key: TemporalKeyStrategy::default(),
                overflow_policy: OverflowPolicy::default(),
                sync_spools: true,
                retain_spools: true,
                progress_every_chunks: DEFAULT_PROGRESS_EVERY_CHUNKS,
                progress_every_entities: DEFAULT_PROGRESS_EVERY_ENTITIES,
            },
        }
    }

    pub fn from_json_file(path: &Path) -> Result<Self> {
        let bytes = fs_err::read(path)?;
        let config: Self = serde_json::from_slice(&bytes)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        let invalid = |reason: &str| {
            Err(PipelineError::InvalidConfig {
                reason: reason.to_string(),
            })
        };
        if self.chunk_size == 0 {
            return invalid("chunk_size must be non-zero");
        }
        if self.window_len == 0 {
            return invalid("window_len must be non-zero");
        }
        if self.feature_width == 0 || self.feature_width > u32::MAX as usize {
            return invalid("feature_width must be non-zero and fit in u32");
        }
        if self.scan_checkpoint_every == 0 || self.sequence_checkpoint_every == 0 {
            return invalid("checkpoint cadences must be non-zero");
        }
        if self.progress_every_chunks == 0 || self.progress_every_entities == 0 {
            return invalid("progress cadences must be non-zero");
        }
        match self.temporal_key {
            TemporalKeyStrategy::Fixed { max: 0 } => invalid("fixed temporal key must be > 0"),
            TemporalKeyStrategy::Sampled { sample_spools: 0, .. } => {
                invalid("sampled temporal key needs at least one spool")
            }
            TemporalKeyStrategy::Sampled { margin, .. } | TemporalKeyStrategy::Observed { margin }
                if !(margin.is_finite() && margin >= 1.0) =>
            {
                invalid("temporal key margin must be finite and >= 1.0")
            }
            _ => Ok(()),
        }
    }
}

#[derive(Debug, Clone)]
pub struct PipelineConfigBuilder {
    inner: PipelineConfig,
}

impl PipelineConfigBuilder {
    pub fn index_path<P: Into<PathBuf>>(mut self, path: P) -> Self {
        self.inner.index_path = Some(path.into());
        self
    }

    #[must_use]
    pub fn chunk_size(mut self, rows: usize) -> Self {
        self.inner.chunk_size = rows;
        self
    }

    #[must_use]
    pub fn window_len(mut self, len: usize) -> Self {
        self.inner.window_len = len;
        self
    }

    #[must_use]
    pub fn feature_width(mut self, width: usize) -> Self {
        self.inner.feature_width = width;
        self
    }

    #[must_use]
    pub fn scan_checkpoint_every(mut self, chunks: u64) -> Self {
        self.inner.scan_checkpoint_every = chunks;
        self
    }

    #[must_use]
    pub fn sequence_checkpoint_every(mut self, entities: u64) -> Self {
        self.inner.sequence_checkpoint_every = entities;
        self
    }

    #[must_use]
    pub fn temporal_key(mut self, strategy: TemporalKeyStrategy) -> Self {
        self.inner.temporal_key = strategy;
        self
    }

    #[must_use]
    pub fn overflow_policy(mut self, policy: OverflowPolicy) -> Self {
        self.inner.overflow_policy = policy;
        self
    }

    #[must_use]
    pub fn sync_spools(mut self, enabled: bool) -> Self {
        self.inner.sync_spools = enabled;
        self
    }

    #[must_use]
    pub fn retain_spools(mut self, enabled: bool) -> Self {
        self.inner.retain_spools = enabled;
        self
    }

    #[must_use]
    pub fn progress_every(mut self, chunks: u64, entities: u64) -> Self {
        self.inner.progress_every_chunks = chunks;
        self.inner.progress_every_entities = entities;
        self
    }

    #[must_use]
    pub fn build(self) -> PipelineConfig {
        self.inner
    }
}
